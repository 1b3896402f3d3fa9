//! Endpoint value type.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::network::types::NetworkError;

/// Plaintext port of a consensus node.
pub const PORT_NODE_PLAIN: u16 = 50211;
/// TLS port of a consensus node.
pub const PORT_NODE_TLS: u16 = 50212;
/// Plaintext port of a mirror node.
pub const PORT_MIRROR_PLAIN: u16 = 5600;
/// TLS port of a mirror node.
pub const PORT_MIRROR_TLS: u16 = 443;

/// A remote server address. Immutable and compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    host: String,
    port: u16,
    transport_security: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, transport_security: bool) -> Self {
        Self {
            host: host.into(),
            port,
            transport_security,
        }
    }

    /// Parse `host:port` (or `[v6]:port`). The well-known TLS ports imply transport security.
    pub fn parse(address: &str) -> Result<Self, NetworkError> {
        let invalid = |reason: &str| NetworkError::InvalidEndpoint {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = address
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        let transport_security = matches!(port, PORT_NODE_TLS | PORT_MIRROR_TLS);
        Ok(Self::new(host, port, transport_security))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uses_transport_security(&self) -> bool {
        self.transport_security
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Same host on the matching TLS port.
    pub fn to_secure(&self) -> Self {
        let port = match self.port {
            PORT_NODE_PLAIN => PORT_NODE_TLS,
            PORT_MIRROR_PLAIN => PORT_MIRROR_TLS,
            other => other,
        };
        Self::new(self.host.clone(), port, true)
    }

    /// Same host on the matching plaintext port.
    pub fn to_insecure(&self) -> Self {
        let port = match self.port {
            PORT_NODE_TLS => PORT_NODE_PLAIN,
            PORT_MIRROR_TLS => PORT_MIRROR_PLAIN,
            other => other,
        };
        Self::new(self.host.clone(), port, false)
    }

    pub fn with_transport_security(&self, secure: bool) -> Self {
        if secure {
            self.to_secure()
        } else {
            self.to_insecure()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let ep: Endpoint = "node1.example.com:50211".parse().unwrap();
        assert_eq!(ep.host(), "node1.example.com");
        assert_eq!(ep.port(), 50211);
        assert!(!ep.uses_transport_security());

        let ep = Endpoint::parse("[::1]:50212").unwrap();
        assert_eq!(ep.host(), "::1");
        assert!(ep.uses_transport_security());
        assert_eq!(ep.to_string(), "[::1]:50212");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Endpoint::parse("no-port").is_err());
        assert!(Endpoint::parse(":50211").is_err());
        assert!(Endpoint::parse("host:99999").is_err());
    }

    #[test]
    fn test_secure_port_mapping() {
        let plain = Endpoint::parse("10.0.0.1:50211").unwrap();
        let secure = plain.to_secure();
        assert_eq!(secure.port(), PORT_NODE_TLS);
        assert!(secure.uses_transport_security());
        assert_eq!(secure.to_insecure(), plain);

        let mirror = Endpoint::parse("mirror:5600").unwrap();
        assert_eq!(mirror.to_secure().port(), PORT_MIRROR_TLS);

        let custom = Endpoint::new("h", 9000, false);
        assert_eq!(custom.to_secure().port(), 9000);
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(
            Endpoint::parse("h1:50211").unwrap(),
            Endpoint::new("h1", 50211, false)
        );
        assert_ne!(
            Endpoint::new("h1", 50211, false),
            Endpoint::new("h1", 50211, true)
        );
    }
}
