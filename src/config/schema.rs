//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the manager.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::endpoint::Endpoint;

/// Root configuration for the manager process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Name advertised in the manager record.
    pub name: String,

    /// Ordered listen endpoints. The first TCP entry becomes the public one.
    pub listen_on: Vec<Endpoint>,

    /// Registry address. Unset or empty runs the manager standalone.
    #[serde(deserialize_with = "empty_as_none")]
    pub registry_url: Option<Endpoint>,

    /// Upper bound on the lifetime of issued tokens, in seconds.
    pub max_token_lifetime_secs: u64,

    /// Registry dial settings.
    pub registry: RegistryConfig,

    /// Workload identity provisioning.
    pub identity: IdentityConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "nsmgr".to_string(),
            listen_on: vec![Endpoint::unix("/listen.on.socket")],
            registry_url: None,
            max_token_lifetime_secs: 24 * 60 * 60,
            registry: RegistryConfig::default(),
            identity: IdentityConfig::default(),
            shutdown: ShutdownConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Maximum lifetime of issued tokens.
    pub fn max_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_token_lifetime_secs)
    }
}

/// Registry dial configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Bound on the whole dial, including wait-for-ready retries, in seconds.
    pub dial_timeout_secs: u64,

    /// Base delay between dial attempts in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum delay between dial attempts in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 5,
            backoff_base_ms: 50,
            backoff_max_ms: 1000,
        }
    }
}

impl RegistryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Workload identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Pin the SPIFFE ID. When set, an SVID carrying any other ID is rejected.
    /// The ID itself is always read from the certificate.
    pub id: Option<String>,

    /// Path to the certificate chain (PEM), leaf first.
    pub cert_path: PathBuf,

    /// Path to the private key (PEM).
    pub key_path: PathBuf,

    /// Path to the trust bundle (PEM).
    pub bundle_path: PathBuf,

    /// Periodic re-fetch interval in seconds.
    pub refresh_interval_secs: u64,

    /// How long startup waits for the first bundle, in seconds.
    pub bootstrap_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: None,
            cert_path: PathBuf::from("/run/spire/svid.pem"),
            key_path: PathBuf::from("/run/spire/svid.key"),
            bundle_path: PathBuf::from("/run/spire/bundle.pem"),
            refresh_interval_secs: 60,
            bootstrap_timeout_secs: 30,
        }
    }
}

impl IdentityConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time given to open connections before listeners are aborted, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Endpoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(url) => url.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let config = ManagerConfig::default();
        assert_eq!(config.name, "nsmgr");
        assert_eq!(config.listen_on, vec![Endpoint::unix("/listen.on.socket")]);
        assert!(config.registry_url.is_none());
        assert_eq!(config.max_token_lifetime(), Duration::from_secs(86_400));
        assert_eq!(config.registry.dial_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn empty_registry_url_means_standalone() {
        let config: ManagerConfig = toml::from_str(r#"registry_url = """#).unwrap();
        assert!(config.registry_url.is_none());
    }

    #[test]
    fn parses_full_document() {
        let config: ManagerConfig = toml::from_str(
            r#"
            name = "nsmgr-node-1"
            listen_on = ["tcp://0.0.0.0:5001", "unix:///var/run/nsm.sock"]
            registry_url = "tcp://registry.nsm-system:5002"
            max_token_lifetime_secs = 600

            [identity]
            id = "spiffe://example.org/nsmgr"
            refresh_interval_secs = 5

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_on.len(), 2);
        assert_eq!(
            config.registry_url,
            Some(Endpoint::tcp("registry.nsm-system", 5002))
        );
        assert_eq!(config.identity.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.observability.log_format, LogFormat::Json);
        // Untouched sections keep their defaults.
        assert_eq!(config.shutdown.drain_timeout_secs, 10);
    }
}
