//! Per-request tokens bound to the workload identity.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rustls::pki_types::PrivateKeyDer;
use rustls::SignatureScheme;
use serde::{Deserialize, Serialize};

use crate::identity::IdentitySource;

/// Errors raised while issuing a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("identity key supports none of the token signature algorithms")]
    UnsupportedKey,
    #[error("failed to sign token: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
    #[error("token is not a valid header value: {0}")]
    Header(#[from] axum::http::header::InvalidHeaderValue),
}

/// A signed bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: SystemTime,
}

/// Issues tokens that prove the caller's identity to a peer.
pub trait TokenGenerator: Send + Sync + 'static {
    fn generate(&self) -> Result<Token, TokenError>;
}

/// Signs JWTs with the current SVID key.
///
/// Tokens never outlive the SVID: `exp` is the earlier of the leaf's
/// `notAfter` and `iat + max_lifetime`.
#[derive(Debug, Clone)]
pub struct IdentityTokenGenerator {
    source: IdentitySource,
    max_lifetime: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

const ALGORITHMS: [(SignatureScheme, Algorithm); 4] = [
    (SignatureScheme::ECDSA_NISTP256_SHA256, Algorithm::ES256),
    (SignatureScheme::ECDSA_NISTP384_SHA384, Algorithm::ES384),
    (SignatureScheme::ED25519, Algorithm::EdDSA),
    (SignatureScheme::RSA_PKCS1_SHA256, Algorithm::RS256),
];

impl IdentityTokenGenerator {
    pub fn new(source: IdentitySource, max_lifetime: Duration) -> Self {
        Self {
            source,
            max_lifetime,
        }
    }

    fn issue_at(&self, now: SystemTime) -> Result<Token, TokenError> {
        let bundle = self.source.bundle();
        let alg = self.algorithm()?;
        let key = encoding_key(alg, bundle.private_key())?;

        let expires_at = (now + self.max_lifetime).min(bundle.expires_at());
        let claims = Claims {
            sub: bundle.id().to_string(),
            iat: unix_secs(now),
            exp: unix_secs(expires_at),
        };
        let value = jsonwebtoken::encode(&Header::new(alg), &claims, &key)?;

        Ok(Token { value, expires_at })
    }

    /// JWT algorithm matching the SVID key.
    fn algorithm(&self) -> Result<Algorithm, TokenError> {
        let offered: Vec<_> = ALGORITHMS.iter().map(|(scheme, _)| *scheme).collect();
        let signer = self
            .source
            .material()
            .certified_key
            .key
            .choose_scheme(&offered)
            .ok_or(TokenError::UnsupportedKey)?;
        ALGORITHMS
            .iter()
            .find(|(scheme, _)| *scheme == signer.scheme())
            .map(|(_, alg)| *alg)
            .ok_or(TokenError::UnsupportedKey)
    }
}

impl TokenGenerator for IdentityTokenGenerator {
    fn generate(&self) -> Result<Token, TokenError> {
        self.issue_at(SystemTime::now())
    }
}

fn encoding_key(alg: Algorithm, key: &PrivateKeyDer<'_>) -> Result<EncodingKey, TokenError> {
    match (alg, key) {
        (Algorithm::ES256 | Algorithm::ES384, PrivateKeyDer::Pkcs8(der)) => {
            Ok(EncodingKey::from_ec_der(der.secret_pkcs8_der()))
        }
        (Algorithm::EdDSA, PrivateKeyDer::Pkcs8(der)) => {
            Ok(EncodingKey::from_ed_der(der.secret_pkcs8_der()))
        }
        (Algorithm::RS256, PrivateKeyDer::Pkcs1(der)) => {
            Ok(EncodingKey::from_rsa_der(der.secret_pkcs1_der()))
        }
        _ => Err(TokenError::UnsupportedKey),
    }
}

fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
