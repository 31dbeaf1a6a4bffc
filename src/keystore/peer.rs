//! Peer routing data.

use crate::crypto::Fingerprint;
use crate::utils::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a peer
///
/// Addresses are plain configuration and are never signed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl PeerAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, splitting on the last colon
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::InvalidAddress` for a missing host, an
    /// unparsable port or port 0
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || NetworkError::InvalidAddress {
            address: value.to_string(),
        };

        let (host, port) = value.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid().into());
        }

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid().into());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = crate::utils::EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    /// Peer fingerprint
    #[serde(serialize_with = "serialize_fingerprint")]
    pub fingerprint: Fingerprint,
    /// Where to reach the peer, if configured
    pub address: Option<PeerAddress>,
}

fn serialize_fingerprint<S: serde::Serializer>(
    fingerprint: &Fingerprint,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(fingerprint.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;

    #[test]
    fn test_parse_address() {
        let address = PeerAddress::parse("127.0.0.1:8000").unwrap();
        assert_eq!(address, PeerAddress::new("127.0.0.1", 8000));
        assert_eq!(address.to_string(), "127.0.0.1:8000");

        let address: PeerAddress = "bob.example.org:9100".parse().unwrap();
        assert_eq!(address.host, "bob.example.org");
        assert_eq!(address.port, 9100);
    }

    #[test]
    fn test_parse_ipv6_uses_last_colon() {
        let address = PeerAddress::parse("[::1]:8000").unwrap();
        assert_eq!(address.host, "::1");
        assert_eq!(address.port, 8000);
        assert_eq!(address.to_string(), "[::1]:8000");
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "localhost", ":8000", "host:0", "host:port", "host:70000"] {
            let err = PeerAddress::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Connection, "{bad}");
        }
    }
}
