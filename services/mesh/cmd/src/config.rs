//! Configuration handling for the bitmesh node.
//!
//! Settings come from an optional YAML file with `network:` and `logging:`
//! sections, then `BITMESH_*` environment variables, then command-line flags
//! (applied in `main`).

use anyhow::Result;
use mesh_network::NetworkConfig;
use mesh_wire::PeerId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Force colours on or off; detected from the terminal when unset
    pub color: Option<bool>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            color: None,
        }
    }
}

/// Node configuration (matches the YAML structure)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Transport settings
    pub network: NetworkConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(parsed) => {
                    info!("Loaded configuration from {:?}", path);
                    parsed
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.network.validate()?;

        info!(
            "Final node configuration: nickname={}, ttl={}, max_connections={}, log_level={}",
            config.network.nickname,
            config.network.ttl,
            config.network.max_connections,
            config.logging.level
        );
        Ok(config)
    }

    /// Apply `BITMESH_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nickname) = lookup("BITMESH_NICKNAME") {
            info!("Nickname overridden by environment: {}", nickname);
            self.network.nickname = nickname;
        }

        if let Some(peer_id) = lookup("BITMESH_PEER_ID") {
            match peer_id.parse::<PeerId>() {
                Ok(id) => {
                    info!("Peer ID overridden by environment: {}", id);
                    self.network.local_peer_id = Some(id);
                }
                Err(e) => warn!("Ignoring BITMESH_PEER_ID: {}", e),
            }
        }

        if let Some(ttl) = lookup("BITMESH_TTL") {
            match ttl.parse::<u8>() {
                Ok(ttl) => {
                    info!("TTL overridden by environment: {}", ttl);
                    self.network.ttl = ttl;
                }
                Err(_) => warn!("Ignoring invalid BITMESH_TTL: {}", ttl),
            }
        }

        if let Some(max) = lookup("BITMESH_MAX_CONNECTIONS") {
            match max.parse::<usize>() {
                Ok(max) => {
                    info!("Max connections overridden by environment: {}", max);
                    self.network.max_connections = max;
                }
                Err(_) => warn!("Ignoring invalid BITMESH_MAX_CONNECTIONS: {}", max),
            }
        }

        if let Some(level) = lookup("BITMESH_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network.ttl, 7);
        assert_eq!(config.network.max_connections, 10);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.color, None);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
network:
  nickname: alice
  ttl: 4
  fragment_size: 200
  compression: false
logging:
  level: debug
  color: false
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.network.nickname, "alice");
        assert_eq!(config.network.ttl, 4);
        assert_eq!(config.network.fragment_size, 200);
        assert!(!config.network.compression);
        assert_eq!(config.network.max_connections, 10);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.color, Some(false));
    }

    #[test]
    fn test_missing_or_invalid_file_falls_back_to_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/bitmesh.yaml").unwrap();
        assert_eq!(config.network.fragment_size, 500);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"network: [not, a, map]").unwrap();
        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.network.ttl, 7);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"network:\n  max_connections: 0\n")
            .unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("BITMESH_NICKNAME", "bob"),
            ("BITMESH_PEER_ID", "abc"),
            ("BITMESH_TTL", "3"),
            ("BITMESH_MAX_CONNECTIONS", "not-a-number"),
            ("BITMESH_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.nickname, "bob");
        assert_eq!(
            config.network.local_peer_id,
            Some("abc0000000000000".parse().unwrap())
        );
        assert_eq!(config.network.ttl, 3);
        assert_eq!(config.network.max_connections, 10);
        assert_eq!(config.logging.level, "trace");
    }
}
