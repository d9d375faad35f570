//! Tunnel configuration.
//!
//! [`EngineConfig`] is the immutable set of connection parameters handed to
//! the packet pump at start. Changing any of it means tearing the pump down
//! and rebuilding it; an active pump is never patched in place.

use crate::keys::{KeyError, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

/// Network endpoint (IP + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn ipv4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Immutable tunnel connection parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Gateway identifier (the provider's name for the exit node).
    pub gateway_id: String,
    /// Gateway UDP endpoint.
    pub endpoint: Endpoint,
    /// Our private key.
    pub private_key: PrivateKey,
    /// The gateway's public key.
    pub peer_public_key: PublicKey,
    /// DNS server addressed inside the tunnel (the one the deny gate watches).
    pub dns: IpAddr,
    /// Label for the virtual device, used in logs.
    pub device_tag: String,
    /// Persistent keepalive interval in seconds.
    pub keepalive: Option<u16>,
    /// Whether the host runs us under a power-saving regime; changes how
    /// repeated permission revocation is reported.
    pub power_saving: bool,
}

impl EngineConfig {
    pub fn new(
        gateway_id: impl Into<String>,
        endpoint: Endpoint,
        private_key: PrivateKey,
        peer_public_key: PublicKey,
    ) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            endpoint,
            private_key,
            peer_public_key,
            dns: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            device_tag: "warden0".into(),
            keepalive: Some(25),
            power_saving: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.gateway_id.is_empty() {
            return Err(ConfigError::MissingGateway);
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let config = Self {
            gateway_id: file.gateway_id,
            endpoint: Endpoint::new(file.gateway_ip.parse()?, file.gateway_port),
            private_key: PrivateKey::from_base64(&file.private_key)?,
            peer_public_key: PublicKey::from_base64(&file.peer_public_key)?,
            dns: match file.dns {
                Some(dns) => dns.parse()?,
                None => IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            },
            device_tag: file.device_tag.unwrap_or_else(|| "warden0".into()),
            keepalive: file.keepalive,
            power_saving: file.power_saving.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }
}

/// On-disk TOML schema; keys are carried as base64 strings.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    gateway_id: String,
    gateway_ip: String,
    gateway_port: u16,
    private_key: String,
    peer_public_key: String,
    dns: Option<String>,
    device_tag: Option<String>,
    keepalive: Option<u16>,
    power_saving: Option<bool>,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway port")]
    InvalidPort,

    #[error("missing gateway id")]
    MissingGateway,

    #[error("invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("config file unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file malformed: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> String {
        let key = PrivateKey::generate();
        let peer = PrivateKey::generate().public_key();
        format!(
            r#"
gateway_id = "de-fra-01"
gateway_ip = "198.51.100.7"
gateway_port = 51820
private_key = "{}"
peer_public_key = "{}"
dns = "10.0.0.1"
keepalive = 25
"#,
            key.to_base64(),
            peer.to_base64()
        )
    }

    #[test]
    fn toml_roundtrip() {
        let config = EngineConfig::from_toml_str(&sample_toml()).unwrap();
        assert_eq!(config.gateway_id, "de-fra-01");
        assert_eq!(config.endpoint.port, 51820);
        assert_eq!(config.keepalive, Some(25));
        assert_eq!(config.device_tag, "warden0");
        assert!(!config.power_saving);
    }

    #[test]
    fn zero_port_is_rejected() {
        let text = sample_toml().replace("51820", "0");
        assert!(matches!(
            EngineConfig::from_toml_str(&text),
            Err(ConfigError::InvalidPort)
        ));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        let text = sample_toml().replace("peer_public_key = \"", "peer_public_key = \"bad");
        assert!(EngineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn load_reads_a_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.gateway_id, "de-fra-01");
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::ipv4(198, 51, 100, 7, 51820);
        assert_eq!(ep.to_string(), "198.51.100.7:51820");
        assert_eq!(ep.to_socket_addr().port(), 51820);
    }
}
