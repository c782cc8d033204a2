//! Configuration loading from disk and environment.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::endpoint::{Endpoint, EndpointParseError};
use crate::config::schema::ManagerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "NSM_";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load configuration: TOML file (if any), then `NSM_*` overrides, then validation.
pub fn load_config(path: Option<&Path>) -> Result<ManagerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => ManagerConfig::default(),
    };

    apply_env_overrides(&mut config, std::env::vars())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

fn read_file(path: &Path) -> Result<ManagerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `NSM_*` variables on top of `config`. Unknown variables are ignored.
pub fn apply_env_overrides<I>(config: &mut ManagerConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (var, value) in vars {
        let Some(key) = var.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let value = value.trim();

        match key {
            "NAME" => config.name = value.to_string(),
            "LISTEN_ON" => {
                config.listen_on = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::parse)
                    .collect::<Result<_, EndpointParseError>>()
                    .map_err(|e| env_error(&var, e))?;
            }
            "REGISTRY_URL" => {
                config.registry_url = if value.is_empty() {
                    None
                } else {
                    Some(value.parse::<Endpoint>().map_err(|e| env_error(&var, e))?)
                };
            }
            "MAX_TOKEN_LIFETIME_SECS" => {
                config.max_token_lifetime_secs = parse_secs(&var, value)?;
            }
            "REGISTRY_DIAL_TIMEOUT_SECS" => {
                config.registry.dial_timeout_secs = parse_secs(&var, value)?;
            }
            "IDENTITY_ID" => config.identity.id = Some(value.to_string()),
            "IDENTITY_CERT_PATH" => config.identity.cert_path = value.into(),
            "IDENTITY_KEY_PATH" => config.identity.key_path = value.into(),
            "IDENTITY_BUNDLE_PATH" => config.identity.bundle_path = value.into(),
            "LOG_LEVEL" => config.observability.log_level = value.to_lowercase(),
            _ => {}
        }
    }
    Ok(())
}

fn parse_secs(var: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|e| env_error(var, e))
}

fn env_error(var: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Env {
        var: var.to_string(),
        reason: reason.to_string(),
    }
}
