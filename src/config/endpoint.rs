//! Network and filesystem endpoints.
//!
//! # Responsibilities
//! - Parse `tcp://host:port`, `tcp://:port` and `unix:///path` URLs
//! - Render endpoints back to the same URL form
//! - Classify wildcard binds for public address resolution

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

/// URL scheme for TCP endpoints.
pub const TCP_SCHEME: &str = "tcp";
/// URL scheme for unix stream socket endpoints.
pub const UNIX_SCHEME: &str = "unix";

/// A listen or dial address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// Stream socket over TCP. An empty host binds every interface.
    Tcp { host: String, port: u16 },
    /// Stream socket bound to a filesystem path.
    Unix { path: PathBuf },
}

/// Error returned when an endpoint URL cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("invalid endpoint URL {url:?}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("unsupported endpoint scheme {scheme:?} in {url:?}")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("TCP endpoint {url:?} has no port")]
    MissingPort { url: String },
    #[error("unix endpoint {url:?} must name an absolute path")]
    RelativePath { url: String },
}

impl Endpoint {
    /// Build a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Build a unix socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// URL scheme of this endpoint.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => TCP_SCHEME,
            Self::Unix { .. } => UNIX_SCHEME,
        }
    }

    /// Whether this endpoint belongs to the TCP family.
    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    /// Port of a TCP endpoint.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            Self::Unix { .. } => None,
        }
    }

    /// Filesystem path of a unix endpoint.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Unix { path } => Some(path),
            Self::Tcp { .. } => None,
        }
    }

    /// True when the endpoint binds every interface rather than naming a host.
    pub fn is_wildcard(&self) -> bool {
        match self {
            Self::Tcp { host, .. } => {
                matches!(host.as_str(), "" | "0.0.0.0" | "::" | "[::]")
            }
            Self::Unix { .. } => false,
        }
    }

    /// Host and port in a form accepted by socket address resolution.
    pub(crate) fn socket_host(&self) -> Option<(String, u16)> {
        match self {
            Self::Tcp { host, port } => {
                let host = match host.as_str() {
                    "" => "0.0.0.0".to_string(),
                    bracketed if bracketed.starts_with('[') && bracketed.ends_with(']') => {
                        bracketed[1..bracketed.len() - 1].to_string()
                    }
                    other => other.to_string(),
                };
                Some((host, *port))
            }
            Self::Unix { .. } => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') && !host.starts_with('[') => {
                write!(f, "{TCP_SCHEME}://[{host}]:{port}")
            }
            Self::Tcp { host, port } => write!(f, "{TCP_SCHEME}://{host}:{port}"),
            Self::Unix { path } => write!(f, "{UNIX_SCHEME}://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();

        // `tcp://:5001` has an empty authority host, which `url` rejects.
        if let Some(port) = trimmed
            .strip_prefix("tcp://:")
            .map(|rest| rest.trim_end_matches('/'))
        {
            let port = port.parse().map_err(|_| EndpointParseError::Malformed {
                url: raw.to_string(),
                reason: format!("invalid port {port:?}"),
            })?;
            return Ok(Self::tcp("", port));
        }

        let url = Url::parse(trimmed).map_err(|e| EndpointParseError::Malformed {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            TCP_SCHEME => {
                let host = url.host_str().unwrap_or_default().to_string();
                let port = url.port().ok_or_else(|| EndpointParseError::MissingPort {
                    url: raw.to_string(),
                })?;
                Ok(Self::tcp(host, port))
            }
            UNIX_SCHEME => {
                let path = PathBuf::from(url.path());
                if url.host_str().is_some_and(|h| !h.is_empty()) || !path.is_absolute() {
                    return Err(EndpointParseError::RelativePath {
                        url: raw.to_string(),
                    });
                }
                Ok(Self::unix(path))
            }
            other => Err(EndpointParseError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}
