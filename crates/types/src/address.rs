//! Overlay network addresses.
//!
//! Unlike plain socket addresses, a node address may name a Tor hidden
//! service, so the host is kept as a string and only resolved to a
//! [`SocketAddr`] when it is actually dialable.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An address a node can be reached at.
///
/// Equality and hashing consider only `host` and `port`; `last_connected`
/// is bookkeeping and must not split otherwise-identical addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    /// IPv4 or IPv6 literal, or a `.onion` hostname.
    pub host: String,
    pub port: u16,
    /// Unix timestamp (seconds) of the last successful handshake over this
    /// address, if any.
    pub last_connected: Option<u64>,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            last_connected: None,
        }
    }

    /// Whether this address points at a Tor hidden service.
    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }

    /// The address as a dialable socket address, if the host is an IP
    /// literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Same endpoint, ignoring connection bookkeeping.
    pub fn same_endpoint(&self, other: &NodeAddress) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.same_endpoint(other)
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An error parsing a `host:port` string.
#[derive(Debug, thiserror::Error)]
pub enum ParseAddressError {
    #[error("missing port in address `{0}`")]
    MissingPort(String),
    #[error("invalid port in address `{0}`")]
    InvalidPort(String),
    #[error("empty host in address `{0}`")]
    EmptyHost(String),
}

impl FromStr for NodeAddress {
    type Err = ParseAddressError;

    /// Parse `host:port`, `[v6]:port` or `name.onion:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(stripped) = s.strip_prefix('[') {
            let (host, rest) = stripped
                .split_once(']')
                .ok_or_else(|| ParseAddressError::MissingPort(s.into()))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| ParseAddressError::MissingPort(s.into()))?;
            (host, port)
        } else {
            s.rsplit_once(':')
                .ok_or_else(|| ParseAddressError::MissingPort(s.into()))?
        };

        if host.is_empty() {
            return Err(ParseAddressError::EmptyHost(s.into()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseAddressError::InvalidPort(s.into()))?;

        Ok(NodeAddress::new(host, port))
    }
}

/// Drop duplicate endpoints, keeping the first occurrence of each.
pub fn dedup(addresses: Vec<NodeAddress>) -> Vec<NodeAddress> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(addresses.len());

    for addr in addresses {
        if seen.insert((addr.host.clone(), addr.port)) {
            out.push(addr);
        }
    }
    out
}

/// Sort addresses most-recently-connected first. Never-connected addresses
/// keep their relative order at the tail.
pub fn sort_by_last_connected(addresses: &mut [NodeAddress]) {
    addresses.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_ipv6_and_onion() {
        let a: NodeAddress = "192.0.2.7:9735".parse().unwrap();
        assert_eq!((a.host.as_str(), a.port), ("192.0.2.7", 9735));
        assert!(a.socket_addr().is_some());

        let b: NodeAddress = "[2001:db8::1]:8885".parse().unwrap();
        assert_eq!((b.host.as_str(), b.port), ("2001:db8::1", 8885));
        assert!(b.socket_addr().is_some());

        let c: NodeAddress = "3g2upl4pq6kufc4m.onion:9735".parse().unwrap();
        assert!(c.is_onion());
        assert!(c.socket_addr().is_none());
    }

    #[test]
    fn rejects_malformed() {
        assert!("noport".parse::<NodeAddress>().is_err());
        assert!(":123".parse::<NodeAddress>().is_err());
        assert!("host:notaport".parse::<NodeAddress>().is_err());
        assert!("[2001:db8::1]".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn equality_ignores_last_connected() {
        let mut a = NodeAddress::new("10.0.0.1", 9735);
        let b = a.clone();
        a.last_connected = Some(1_700_000_000);

        assert_eq!(a, b);
        assert_eq!(dedup(vec![a, b]).len(), 1);
    }

    #[test]
    fn sorts_most_recent_first() {
        let mut addrs = vec![
            NodeAddress::new("10.0.0.1", 1),
            NodeAddress {
                last_connected: Some(200),
                ..NodeAddress::new("10.0.0.2", 2)
            },
            NodeAddress {
                last_connected: Some(100),
                ..NodeAddress::new("10.0.0.3", 3)
            },
        ];
        sort_by_last_connected(&mut addrs);

        assert_eq!(addrs[0].port, 2);
        assert_eq!(addrs[1].port, 3);
        assert_eq!(addrs[2].port, 1);
    }
}
