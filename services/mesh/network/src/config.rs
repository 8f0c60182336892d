//! Transport configuration.
//!
//! Durations are stored as whole seconds or milliseconds so the struct maps
//! one-to-one onto the YAML `network:` section; typed accessors convert them.

use std::time::Duration;

use mesh_delivery::MessageQueueConfig;
use mesh_session::{ConnectionConfig, PoolConfig};
use mesh_wire::{PeerId, DEFAULT_TTL, FRAGMENT_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest usable fragment payload
pub const MIN_FRAGMENT_SIZE: usize = 32;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
    /// A required collaborator was not supplied
    #[error("missing {0}")]
    Missing(&'static str),
}

/// Network transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Display name attached to outgoing messages
    pub nickname: String,
    /// Fixed local peer id; random when unset
    pub local_peer_id: Option<PeerId>,
    /// Hop budget for originated messages
    pub ttl: u8,
    /// Maximum simultaneously admitted connections
    pub max_connections: usize,
    /// Connect attempts before a connection is failed
    pub max_connection_attempts: u32,
    /// Per-attempt connect timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Idle time before a connection is evicted (seconds)
    pub idle_timeout_secs: u64,
    /// Idle sweep period (seconds)
    pub cleanup_interval_secs: u64,
    /// Discovery scan period (seconds)
    pub scan_interval_secs: u64,
    /// Time after which an unseen peer is considered lost (seconds)
    pub peer_stale_timeout_secs: u64,
    /// Maximum bytes per fragment
    pub fragment_size: usize,
    /// Delay between consecutive fragments of one message (milliseconds)
    pub fragment_pacing_ms: u64,
    /// Per-connection outbound queue capacity
    pub connection_queue_capacity: usize,
    /// Delivery queue capacity
    pub delivery_queue_capacity: usize,
    /// Delivery attempts per message
    pub max_delivery_attempts: u32,
    /// Base retry interval (seconds)
    pub retry_base_secs: u64,
    /// Retry interval cap (seconds)
    pub max_retry_secs: u64,
    /// Duplicate suppression window (seconds)
    pub duplicate_timeout_secs: u64,
    /// Partial message lifetime (seconds)
    pub reassembly_timeout_secs: u64,
    /// Fragment and duplicate-window sweep period (seconds)
    pub sweep_interval_secs: u64,
    /// Time to wait for a pending handshake before re-initiating it (seconds)
    pub handshake_timeout_secs: u64,
    /// Single link write deadline (seconds)
    pub write_timeout_secs: u64,
    /// Deadline for every packet of a message to be written (seconds)
    pub send_timeout_secs: u64,
    /// Compress envelopes when it saves space
    pub compression: bool,
    /// Log transport counters periodically
    pub metrics_enabled: bool,
    /// Counter logging period (seconds)
    pub metrics_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            local_peer_id: None,
            ttl: DEFAULT_TTL,
            max_connections: 10,
            max_connection_attempts: 3,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            cleanup_interval_secs: 30,
            scan_interval_secs: 5,
            peer_stale_timeout_secs: 60,
            fragment_size: 500,
            fragment_pacing_ms: 10,
            connection_queue_capacity: 64,
            delivery_queue_capacity: 1024,
            max_delivery_attempts: 3,
            retry_base_secs: 1,
            max_retry_secs: 60,
            duplicate_timeout_secs: 300,
            reassembly_timeout_secs: 30,
            sweep_interval_secs: 10,
            handshake_timeout_secs: 5,
            write_timeout_secs: 5,
            send_timeout_secs: 30,
            compression: true,
            metrics_enabled: true,
            metrics_interval_secs: 60,
        }
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl NetworkConfig {
    /// Check every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nickname.is_empty() || self.nickname.len() > u8::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "nickname",
                reason: format!("length {} outside 1..=255", self.nickname.len()),
            });
        }
        positive("ttl", self.ttl as u64)?;
        positive("max_connections", self.max_connections as u64)?;
        positive("max_connection_attempts", self.max_connection_attempts as u64)?;
        positive("max_delivery_attempts", self.max_delivery_attempts as u64)?;
        positive("connection_queue_capacity", self.connection_queue_capacity as u64)?;
        positive("delivery_queue_capacity", self.delivery_queue_capacity as u64)?;
        positive("connect_timeout_secs", self.connect_timeout_secs)?;
        positive("cleanup_interval_secs", self.cleanup_interval_secs)?;
        positive("scan_interval_secs", self.scan_interval_secs)?;
        positive("sweep_interval_secs", self.sweep_interval_secs)?;
        positive("write_timeout_secs", self.write_timeout_secs)?;
        positive("send_timeout_secs", self.send_timeout_secs)?;
        positive("handshake_timeout_secs", self.handshake_timeout_secs)?;
        positive("reassembly_timeout_secs", self.reassembly_timeout_secs)?;
        if self.metrics_enabled {
            positive("metrics_interval_secs", self.metrics_interval_secs)?;
        }

        let max_fragment = MAX_PAYLOAD_SIZE - FRAGMENT_HEADER_SIZE;
        if self.fragment_size < MIN_FRAGMENT_SIZE || self.fragment_size > max_fragment {
            return Err(ConfigError::Invalid {
                field: "fragment_size",
                reason: format!(
                    "{} outside {}..={}",
                    self.fragment_size, MIN_FRAGMENT_SIZE, max_fragment
                ),
            });
        }
        if self.retry_base_secs > self.max_retry_secs {
            return Err(ConfigError::Invalid {
                field: "retry_base_secs",
                reason: format!("exceeds max_retry_secs ({})", self.max_retry_secs),
            });
        }
        Ok(())
    }

    /// Connect attempt timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Idle eviction threshold
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Idle sweep period
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Discovery scan period
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Peer staleness threshold
    pub fn peer_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_stale_timeout_secs)
    }

    /// Inter-fragment delay
    pub fn fragment_pacing(&self) -> Duration {
        Duration::from_millis(self.fragment_pacing_ms)
    }

    /// Duplicate window length
    pub fn duplicate_timeout(&self) -> Duration {
        Duration::from_secs(self.duplicate_timeout_secs)
    }

    /// Reassembly buffer lifetime
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Pending handshake lifetime
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Whole-message send deadline
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Counter logging period
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Pool settings derived from this config
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            connection: ConnectionConfig {
                connect_timeout: self.connect_timeout(),
                max_connection_attempts: self.max_connection_attempts,
                queue_capacity: self.connection_queue_capacity,
                write_timeout: Duration::from_secs(self.write_timeout_secs),
                ..ConnectionConfig::default()
            },
        }
    }

    /// Delivery queue settings derived from this config
    pub fn queue_config(&self) -> MessageQueueConfig {
        MessageQueueConfig {
            max_attempts: self.max_delivery_attempts,
            base_retry_interval: Duration::from_secs(self.retry_base_secs),
            max_retry_interval: Duration::from_secs(self.max_retry_secs),
            capacity: self.delivery_queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl, 7);
        assert_eq!(config.fragment_size, 500);
        assert_eq!(config.pool_config().max_connections, 10);
        assert_eq!(config.queue_config().capacity, 1024);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: NetworkConfig = serde_yaml::from_str(
            "nickname: alice\nttl: 3\nlocal_peer_id: \"0102030405060708\"\n",
        )
        .unwrap();
        assert_eq!(config.nickname, "alice");
        assert_eq!(config.ttl, 3);
        assert_eq!(
            config.local_peer_id,
            Some(PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]))
        );
        assert_eq!(config.max_connections, 10);
        assert!(config.compression);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NetworkConfig {
            ttl: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "ttl", .. })
        ));

        let config = NetworkConfig {
            fragment_size: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "fragment_size",
                ..
            })
        ));

        let config = NetworkConfig {
            retry_base_secs: 120,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
