//! Configuration module for Shadowmux
//!
//! Supports JSON configuration plus command-line overrides.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::shadowsocks::{Cipher, CipherList};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// TCP listen address
    pub listen: SocketAddr,

    /// Prometheus metrics endpoint (omit to disable)
    #[serde(default)]
    pub metrics: Option<ApiConfig>,

    /// Access keys, in trial order. The position of an entry is its
    /// access-key identifier.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// Metrics API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the metrics endpoint (e.g. "127.0.0.1:9091")
    pub listen: SocketAddr,
}

/// One access key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// AEAD cipher method (e.g. "aes-256-gcm")
    pub cipher: String,

    /// Secret the master key is derived from
    pub secret: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create an example server configuration
    pub fn default_server() -> Self {
        Config {
            listen: SocketAddr::from(([0, 0, 0, 0], 8388)),
            metrics: Some(ApiConfig {
                listen: SocketAddr::from(([127, 0, 0, 1], 9091)),
            }),
            keys: vec![
                KeyConfig {
                    cipher: "aes-256-gcm".to_string(),
                    secret: "replace-with-a-strong-secret".to_string(),
                },
                KeyConfig {
                    cipher: "chacha20-ietf-poly1305".to_string(),
                    secret: "one-secret-per-user".to_string(),
                },
            ],
        }
    }

    /// Check the configuration without building the cipher list
    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return Err(Error::Config("At least one access key is required".to_string()));
        }
        self.build_ciphers().map(|_| ())
    }

    /// Build the ordered cipher list. A key naming a non-AEAD or unknown
    /// cipher is a fatal configuration error.
    pub fn build_ciphers(&self) -> Result<CipherList> {
        let ciphers = self
            .keys
            .iter()
            .map(|key| {
                let kind = crate::crypto::CipherKind::from_name(&key.cipher)?;
                Ok(Cipher::new(kind, &key.secret))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CipherList::new(ciphers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config_is_valid() {
        let config = Config::default_server();
        assert!(config.validate().is_ok());
        assert_eq!(config.build_ciphers().unwrap().len(), 2);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default_server();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.listen, config.listen);
        assert_eq!(parsed.keys.len(), config.keys.len());
    }

    #[test]
    fn test_parse_minimal() {
        let config = Config::from_json(
            r#"{
                "listen": "127.0.0.1:8388",
                "keys": [{"cipher": "aes-128-gcm", "secret": "s3cret"}]
            }"#,
        )
        .unwrap();

        assert!(config.metrics.is_none());
        assert_eq!(config.build_ciphers().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_keys_rejected() {
        let config = Config::from_json(r#"{"listen": "127.0.0.1:8388", "keys": []}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_aead_cipher_rejected() {
        let config = Config::from_json(
            r#"{
                "listen": "127.0.0.1:8388",
                "keys": [{"cipher": "aes-256-ctr", "secret": "s"}]
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
