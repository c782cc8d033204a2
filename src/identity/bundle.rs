//! X.509 identity bundle.

use std::fmt;
use std::io::BufReader;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use url::Url;
use x509_parser::extensions::GeneralName;

use crate::config::validation::check_spiffe_id;
use crate::identity::ProvisionError;

/// Certificate chain, key and trust anchors proving the workload identity.
///
/// The SPIFFE ID is read from the leaf certificate's URI SAN, never supplied
/// alongside it.
pub struct IdentityBundle {
    id: Url,
    expires_at: SystemTime,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    trust_bundle: Vec<CertificateDer<'static>>,
}

impl IdentityBundle {
    /// Assemble a bundle from DER parts.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        trust_bundle: Vec<CertificateDer<'static>>,
    ) -> Result<Self, ProvisionError> {
        let leaf = cert_chain
            .first()
            .ok_or_else(|| ProvisionError::Invalid("certificate chain is empty".into()))?;
        let (id, expires_at) = inspect_leaf(leaf)?;
        if trust_bundle.is_empty() {
            return Err(ProvisionError::Invalid("trust bundle is empty".into()));
        }
        Ok(Self {
            id,
            expires_at,
            cert_chain,
            private_key,
            trust_bundle,
        })
    }

    /// Parse a bundle from PEM documents.
    pub fn from_pem(
        cert_chain_pem: &[u8],
        private_key_pem: &[u8],
        trust_bundle_pem: &[u8],
    ) -> Result<Self, ProvisionError> {
        let cert_chain = parse_certs("certificate chain", cert_chain_pem)?;
        let trust_bundle = parse_certs("trust bundle", trust_bundle_pem)?;
        let private_key = rustls_pemfile::private_key(&mut BufReader::new(private_key_pem))
            .map_err(|e| ProvisionError::Invalid(format!("private key: {e}")))?
            .ok_or_else(|| ProvisionError::Invalid("no private key found in PEM".into()))?;

        Self::new(cert_chain, private_key, trust_bundle)
    }

    /// SPIFFE ID carried by the leaf certificate.
    pub fn id(&self) -> &Url {
        &self.id
    }

    /// `notAfter` of the leaf certificate.
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Private key of the leaf certificate.
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Trust anchors peers are verified against.
    pub fn trust_bundle(&self) -> &[CertificateDer<'static>] {
        &self.trust_bundle
    }
}

/// Extract the SPIFFE ID and expiry of an X.509 SVID leaf.
///
/// An SVID carries exactly one URI SAN and it must be a SPIFFE ID.
fn inspect_leaf(leaf: &CertificateDer<'_>) -> Result<(Url, SystemTime), ProvisionError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ProvisionError::Invalid(format!("leaf certificate: {e}")))?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| ProvisionError::Invalid(format!("leaf certificate SAN: {e}")))?;
    let uris: Vec<&str> = san
        .iter()
        .flat_map(|ext| ext.value.general_names.iter())
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .collect();

    let id = match uris.as_slice() {
        [] => {
            return Err(ProvisionError::Invalid(
                "leaf certificate carries no SPIFFE ID URI SAN".into(),
            ))
        }
        [uri] => check_spiffe_id(uri).map_err(ProvisionError::Invalid)?,
        _ => {
            return Err(ProvisionError::Invalid(format!(
                "leaf certificate carries {} URI SANs, expected one SPIFFE ID",
                uris.len()
            )))
        }
    };

    let not_after = u64::try_from(cert.validity().not_after.timestamp()).unwrap_or_default();
    Ok((id, UNIX_EPOCH + Duration::from_secs(not_after)))
}

impl fmt::Debug for IdentityBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityBundle")
            .field("id", &self.id.as_str())
            .field("expires_at", &self.expires_at)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("trust_bundle_len", &self.trust_bundle.len())
            .finish_non_exhaustive()
    }
}

fn parse_certs(what: &str, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, ProvisionError> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProvisionError::Invalid(format!("{what}: {e}")))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const ID: &str = "spiffe://example.org/ns/default/nsmgr";
    pub const SVID_PEM: &[u8] = include_bytes!("../../tests/fixtures/svid.pem");
    pub const SVID_KEY: &[u8] = include_bytes!("../../tests/fixtures/svid.key");
    pub const BUNDLE_PEM: &[u8] = include_bytes!("../../tests/fixtures/bundle.pem");

    pub const ROTATED_ID: &str = "spiffe://example.org/ns/default/nsmgr-rotated";
    pub const ROTATED_SVID_PEM: &[u8] = include_bytes!("../../tests/fixtures/svid_rotated.pem");
    pub const ROTATED_SVID_KEY: &[u8] = include_bytes!("../../tests/fixtures/svid_rotated.key");

    /// Leaf with a DNS SAN only.
    pub const DNS_ONLY_PEM: &[u8] = include_bytes!("../../tests/fixtures/svid_dns_only.pem");

    /// `notAfter` of the fixture SVID: 2126-09-24T11:59:21Z.
    pub const SVID_NOT_AFTER: u64 = 4_945_924_761;

    pub fn bundle() -> IdentityBundle {
        IdentityBundle::from_pem(SVID_PEM, SVID_KEY, BUNDLE_PEM).unwrap()
    }

    pub fn provider() -> crate::identity::StaticIdentityProvider {
        crate::identity::StaticIdentityProvider::from_pem(SVID_PEM, SVID_KEY, BUNDLE_PEM)
    }

    /// Identity source bootstrapped from the fixture bundle.
    pub async fn source() -> crate::identity::IdentitySource {
        crate::identity::IdentitySource::bootstrap(
            &crate::lifecycle::ProcessContext::new(),
            std::sync::Arc::new(provider()),
            &crate::config::IdentityConfig::default(),
        )
        .await
        .unwrap()
    }
}
