//! Public address selection.
//!
//! # Responsibilities
//! - Pick the endpoint to advertise (first TCP entry, else the first entry)
//! - Replace a wildcard bind host with a reachable IPv4 address
//! - Degrade to the configured URL when no such address exists

use std::io;
use std::net::{IpAddr, SocketAddrV4};

use crate::config::Endpoint;

/// Source of local interface addresses.
pub trait InterfaceAddrs: Send + Sync + 'static {
    fn addrs(&self) -> io::Result<Vec<IpAddr>>;
}

/// Interface addresses reported by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceAddrs for SystemInterfaces {
    fn addrs(&self) -> io::Result<Vec<IpAddr>> {
        let addrs = nix::ifaddrs::getifaddrs()?
            .filter_map(|ifaddr| {
                let storage = ifaddr.address?;
                let v4 = storage.as_sockaddr_in()?;
                Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()))
            })
            .collect();
        Ok(addrs)
    }
}

/// Fixed address list, for embedders that already know their interfaces.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<IpAddr>);

impl InterfaceAddrs for StaticInterfaces {
    fn addrs(&self) -> io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// The endpoint advertised by default: the first TCP entry, otherwise the first entry.
pub fn default_endpoint(endpoints: &[Endpoint]) -> Option<&Endpoint> {
    endpoints
        .iter()
        .find(|endpoint| endpoint.is_tcp())
        .or_else(|| endpoints.first())
}

/// URL under which this manager should be reached by peers.
///
/// Returns `None` only for an empty endpoint set.
pub fn resolve_public_url(endpoints: &[Endpoint], interfaces: &dyn InterfaceAddrs) -> Option<String> {
    let endpoint = default_endpoint(endpoints)?;
    let configured = endpoint.to_string();
    if !endpoint.is_wildcard() {
        return Some(configured);
    }
    let Some(port) = endpoint.port() else {
        return Some(configured);
    };

    let addrs = match interfaces.addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!(error = %e, url = %configured, "Failed to enumerate interfaces, advertising configured URL");
            return Some(configured);
        }
    };

    match addrs
        .into_iter()
        .find(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback()))
    {
        Some(ip) => Some(format!("{}://{ip}:{port}", endpoint.scheme())),
        None => {
            tracing::warn!(url = %configured, "No non-loopback IPv4 address found, advertising configured URL");
            Some(configured)
        }
    }
}
