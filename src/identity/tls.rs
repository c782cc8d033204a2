//! Mutual TLS credentials derived from the identity source.
//!
//! # Responsibilities
//! - Build rustls server and client configs for mTLS
//! - Resolve the certificate presented on each handshake from the current bundle
//! - Verify peers against the current trust bundle, accepting any peer identity
//!
//! # Design Decisions
//! - Nothing here caches credentials; every handshake reads the live snapshot,
//!   so a renewal applies to the next connection
//! - Peer names are not checked ("authorize any"): a chain to the trust bundle is enough

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};

use crate::identity::{IdentityBundle, IdentitySource};

/// Errors raised while turning an identity bundle into TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("trust bundle rejected: {0}")]
    TrustBundle(String),
    #[error("private key rejected: {0}")]
    PrivateKey(#[source] rustls::Error),
    #[error("failed to build TLS config: {0}")]
    Config(#[source] rustls::Error),
    #[error("failed to build peer verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// The crypto provider used for every config and signing key.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    match CryptoProvider::get_default() {
        Some(provider) => Arc::clone(provider),
        None => Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    }
}

/// TLS material derived from one identity bundle.
pub(crate) struct TlsMaterial {
    pub(crate) certified_key: Arc<CertifiedKey>,
    pub(crate) client_verifier: Arc<dyn ClientCertVerifier>,
    pub(crate) server_verifier: Arc<WebPkiServerVerifier>,
}

impl TlsMaterial {
    pub(crate) fn build(
        bundle: &IdentityBundle,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(bundle.trust_bundle().iter().cloned());
        if added == 0 {
            return Err(TlsError::TrustBundle(format!(
                "none of the {ignored} certificates could be parsed"
            )));
        }
        let roots = Arc::new(roots);

        let signing_key = provider
            .key_provider
            .load_private_key(bundle.private_key().clone_key())
            .map_err(TlsError::PrivateKey)?;
        let certified_key = Arc::new(CertifiedKey::new(bundle.cert_chain().to_vec(), signing_key));

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(provider))
                .build()?;
        let server_verifier =
            WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(provider)).build()?;

        Ok(Self {
            certified_key,
            client_verifier,
            server_verifier,
        })
    }
}

/// Server config requiring client certificates chained to the trust bundle.
pub fn mtls_server_config(source: &IdentitySource) -> Result<Arc<ServerConfig>, TlsError> {
    let live = Arc::new(LiveIdentity(source.clone()));
    let mut config = ServerConfig::builder_with_provider(source.crypto())
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Config)?
        .with_client_cert_verifier(live.clone())
        .with_cert_resolver(live);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client config presenting the workload certificate and accepting any peer identity.
pub fn mtls_client_config(source: &IdentitySource) -> Result<Arc<ClientConfig>, TlsError> {
    let live = Arc::new(LiveIdentity(source.clone()));
    let config = ClientConfig::builder_with_provider(source.crypto())
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Config)?
        .dangerous()
        .with_custom_certificate_verifier(live.clone())
        .with_client_cert_resolver(live);
    Ok(Arc::new(config))
}

/// Resolves certificates and verifies peers from the identity source's current snapshot.
struct LiveIdentity(IdentitySource);

impl fmt::Debug for LiveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveIdentity").field(&self.0).finish()
    }
}

impl ResolvesServerCert for LiveIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0.material().certified_key))
    }
}

impl ResolvesClientCert for LiveIdentity {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0.material().certified_key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ClientCertVerifier for LiveIdentity {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Hints would borrow from a snapshot that may be replaced mid-handshake.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.0
            .material()
            .client_verifier
            .verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0
            .material()
            .client_verifier
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0
            .material()
            .client_verifier
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.material().client_verifier.supported_verify_schemes()
    }
}

impl ServerCertVerifier for LiveIdentity {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self.0.material().server_verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        match verified {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0
            .material()
            .server_verifier
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0
            .material()
            .server_verifier
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.material().server_verifier.supported_verify_schemes()
    }
}
