//! Server configuration
//!
//! Read from an optional JSON file; every field has a default so a
//! partial file (or none at all) is valid. CLI flags override on top.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::protocol::validator::DEFAULT_PROTOCOL_VERSIONS;

/// 10 MiB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    #[serde(alias = "ws")]
    WebSocket,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "websocket" | "ws" => Ok(Self::WebSocket),
            other => Err(ConfigError::Invalid(format!("unknown transport: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub max_message_size: usize,
    /// Capacity of the bounded inbound queues
    pub queue_capacity: usize,
    pub batch_default_concurrency: usize,
    /// Grace period between closing a child's stdin and killing it
    pub process_grace_secs: u64,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub supported_protocol_versions: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_connections: 100,
            ping_interval_secs: 30,
            ping_timeout_secs: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            queue_capacity: 1000,
            batch_default_concurrency: 32,
            process_grace_secs: 5,
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            supported_protocol_versions: DEFAULT_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, falling back to defaults when no path is given or
    /// the file does not exist
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject zero limits, an empty version list and an unparsable bind address
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("maxConnections", self.max_connections as u64),
            ("pingIntervalSecs", self.ping_interval_secs),
            ("pingTimeoutSecs", self.ping_timeout_secs),
            ("maxMessageSize", self.max_message_size as u64),
            ("queueCapacity", self.queue_capacity as u64),
            ("batchDefaultConcurrency", self.batch_default_concurrency as u64),
            ("reconnectIntervalSecs", self.reconnect_interval_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        if self.supported_protocol_versions.is_empty() {
            return Err(ConfigError::Invalid(
                "supportedProtocolVersions must not be empty".to_string(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bad bind address {}:{}: {}", self.host, self.port, e)))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn process_grace(&self) -> Duration {
        Duration::from_secs(self.process_grace_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.port, 8765);
        assert_eq!(config.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.batch_default_concurrency, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::load(Some(&temp_dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.max_connections, 100);
    }

    #[test]
    fn test_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"transport": "websocket", "port": 9000, "pingIntervalSecs": 15}"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.transport, TransportKind::WebSocket);
        assert_eq!(config.port, 9000);
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.ping_timeout_secs, 10);
    }

    #[test]
    fn test_malformed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_and_bad_host() {
        let config = ServerConfig {
            queue_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ServerConfig {
            host: "not a host".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_transport_from_str() {
        assert_eq!("WS".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert!("http".parse::<TransportKind>().is_err());
    }
}
