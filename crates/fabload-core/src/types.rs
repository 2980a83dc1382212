use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// 32-byte transaction identifier (`H(nonce || creator)`).
pub type TxId = [u8; 32];

/// Length of the random nonce carried in every signature header.
pub const NONCE_LEN: usize = 24;

/// Random per-transaction nonce.
pub type Nonce = [u8; NONCE_LEN];

/// Network endpoint descriptor: dial address plus TLS/identity override name.
///
/// Immutable once loaded; every worker connecting to the endpoint shares it
/// read-only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: String,
    #[serde(default)]
    pub override_name: String,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, override_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            override_name: override_name.into(),
        }
    }

    /// Name presented to the remote side: the override name when set,
    /// otherwise the host part of `addr`.
    pub fn authority(&self) -> &str {
        if !self.override_name.trim().is_empty() {
            return self.override_name.trim();
        }
        match self.addr.rfind(':') {
            Some(idx) => &self.addr[..idx],
            None => &self.addr,
        }
    }

    /// Checks that `addr` has the `host:port` shape with a non-zero port.
    pub fn validate(&self) -> Result<(), CoreError> {
        let idx = self.addr.rfind(':').ok_or_else(|| CoreError::InvalidEndpoint {
            addr: self.addr.clone(),
            reason: "missing port",
        })?;
        if self.addr[..idx].trim().is_empty() {
            return Err(CoreError::InvalidEndpoint {
                addr: self.addr.clone(),
                reason: "missing host",
            });
        }
        match self.addr[idx + 1..].trim().parse::<u16>() {
            Ok(port) if port != 0 => Ok(()),
            _ => Err(CoreError::InvalidEndpoint {
                addr: self.addr.clone(),
                reason: "invalid port",
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.override_name.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}-{}", self.addr, self.override_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;

    #[test]
    fn authority_prefers_override_name() {
        let ep = Endpoint::new("10.0.0.1:7051", "peer0.org1.example.com");
        assert_eq!(ep.authority(), "peer0.org1.example.com");

        let ep = Endpoint::new("10.0.0.1:7051", "");
        assert_eq!(ep.authority(), "10.0.0.1");
    }

    #[test]
    fn validate_rejects_malformed_addresses() {
        assert!(Endpoint::new("127.0.0.1:7050", "").validate().is_ok());
        assert!(Endpoint::new("127.0.0.1", "").validate().is_err());
        assert!(Endpoint::new(":7050", "").validate().is_err());
        assert!(Endpoint::new("host:0", "").validate().is_err());
        assert!(Endpoint::new("host:http", "").validate().is_err());
    }

    #[test]
    fn deserializes_from_config_layout() {
        let ep: Endpoint = serde_json::from_str(
            r#"{"addr":"orderer:7050","override_name":"orderer.example.com"}"#,
        )
        .expect("endpoint should parse");
        assert_eq!(ep, Endpoint::new("orderer:7050", "orderer.example.com"));
        assert_eq!(ep.to_string(), "orderer:7050-orderer.example.com");

        let ep: Endpoint =
            serde_json::from_str(r#"{"addr":"peer:7051"}"#).expect("override is optional");
        assert!(ep.override_name.is_empty());
    }
}
