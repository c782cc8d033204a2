//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, non-empty endpoint list)
//! - Check the identity URI shape
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ManagerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use url::Url;

use crate::config::schema::ManagerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// Human readable description.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ManagerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(ValidationError::new("name", "must not be empty"));
    }

    if config.listen_on.is_empty() {
        errors.push(ValidationError::new(
            "listen_on",
            "at least one endpoint is required",
        ));
    }

    let positive = [
        ("max_token_lifetime_secs", config.max_token_lifetime_secs),
        ("registry.dial_timeout_secs", config.registry.dial_timeout_secs),
        ("registry.backoff_max_ms", config.registry.backoff_max_ms),
        (
            "identity.refresh_interval_secs",
            config.identity.refresh_interval_secs,
        ),
        (
            "identity.bootstrap_timeout_secs",
            config.identity.bootstrap_timeout_secs,
        ),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.registry.backoff_base_ms > config.registry.backoff_max_ms {
        errors.push(ValidationError::new(
            "registry.backoff_base_ms",
            "must not exceed registry.backoff_max_ms",
        ));
    }

    if let Some(id) = &config.identity.id {
        if let Err(reason) = check_spiffe_id(id) {
            errors.push(ValidationError::new("identity.id", reason));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that `id` is a `spiffe://<trust-domain>/...` URI.
pub(crate) fn check_spiffe_id(id: &str) -> Result<Url, String> {
    let url = Url::parse(id).map_err(|e| format!("{id:?} is not a URI: {e}"))?;
    if url.scheme() != "spiffe" {
        return Err(format!("{id:?} must use the spiffe scheme"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(format!("{id:?} has no trust domain"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(format!("{id:?} must not carry a query or fragment"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ManagerConfig::default()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ManagerConfig::default();
        config.name = " ".into();
        config.listen_on.clear();
        config.registry.dial_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["name", "listen_on", "registry.dial_timeout_secs"]
        );
    }

    #[test]
    fn rejects_non_spiffe_identity() {
        let mut config = ManagerConfig::default();
        config.identity.id = Some("https://example.org/nsmgr".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "identity.id");
    }

    #[test]
    fn accepts_spiffe_identity() {
        let url = check_spiffe_id("spiffe://example.org/ns/default/nsmgr").unwrap();
        assert_eq!(url.host_str(), Some("example.org"));
    }
}
