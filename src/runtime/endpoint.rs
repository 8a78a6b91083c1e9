//! Transport endpoints.
//!
//! Accepted forms:
//! - `tcp://host:port`
//! - `tcp://*:port` (listen on every interface)
//! - `host:port`
//!
//! IPv6 hosts use brackets: `tcp://[::1]:5555`.

use std::fmt;
use std::str::FromStr;

const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("unsupported transport in '{0}' (only tcp:// is supported)")]
    UnsupportedScheme(String),
    #[error("missing port in '{0}'")]
    MissingPort(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("missing host in '{0}'")]
    MissingHost(String),
}

/// A TCP endpoint to listen on or dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    #[cfg(test)]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[cfg(test)]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Endpoint on the given socket address.
    #[cfg(test)]
    pub fn from_addr(addr: std::net::SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// `host:port` string suitable for address resolution.
    ///
    /// The `*` wildcard resolves to the IPv4 unspecified address.
    pub fn authority(&self) -> String {
        let host = if self.host == "*" {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = match s.split_once("://") {
            Some(_) if s.starts_with(TCP_SCHEME) => &s[TCP_SCHEME.len()..],
            Some(_) => return Err(EndpointError::UnsupportedScheme(s.to_string())),
            None => s,
        };

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(EndpointError::MissingHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TCP_SCHEME, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_parse_tcp_url() {
        let ep: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 5555);
        assert_eq!(ep.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_parse_bare_authority() {
        let ep: Endpoint = "localhost:9000".parse().unwrap();
        assert_eq!(ep.authority(), "localhost:9000");
    }

    #[test]
    fn test_wildcard_host() {
        let ep: Endpoint = "tcp://*:7000".parse().unwrap();
        assert_eq!(ep.authority(), "0.0.0.0:7000");
    }

    #[test]
    fn test_ipv6_host() {
        let ep: Endpoint = "tcp://[::1]:7000".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.authority(), "[::1]:7000");
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(matches!(
            "ipc:///tmp/sock".parse::<Endpoint>(),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp://127.0.0.1".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            "tcp://127.0.0.1:http".parse::<Endpoint>(),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            "tcp://:80".parse::<Endpoint>(),
            Err(EndpointError::MissingHost(_))
        ));
    }

    #[test]
    fn test_from_addr() {
        let addr: SocketAddr = "127.0.0.1:4321".parse().unwrap();
        assert_eq!(Endpoint::from_addr(addr).to_string(), "tcp://127.0.0.1:4321");
    }
}
