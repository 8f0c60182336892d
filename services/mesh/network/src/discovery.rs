//! Peer discovery collaborator.
//!
//! The radio scanner lives outside this crate. It reports reachable peers
//! through [`Discovery::scan`]; [`StaticDiscovery`] serves a fixed, mutable
//! peer list for tests and simulations.

use std::sync::RwLock;

use async_trait::async_trait;
use mesh_session::PeerDescriptor;
use mesh_wire::PeerId;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Service advertised by compatible peers
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic carrying mesh packets
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Whether a device advertising `advertised` speaks the mesh protocol
pub fn is_compatible_peer(advertised: &[Uuid]) -> bool {
    advertised.contains(&SERVICE_UUID)
}

/// Discovery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Radio not available
    #[error("scanner unavailable: {0}")]
    Unavailable(String),
    /// Scan failed
    #[error("scan failed: {0}")]
    Scan(String),
}

/// Source of reachable peers
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Peers currently in range
    async fn scan(&self) -> Result<Vec<PeerDescriptor>, DiscoveryError>;
}

/// Fixed peer list
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    peers: RwLock<Vec<PeerDescriptor>>,
}

impl StaticDiscovery {
    /// Serve `peers`
    pub fn new(peers: Vec<PeerDescriptor>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Add or replace a peer
    pub fn add(&self, peer: PeerDescriptor) {
        if let Ok(mut peers) = self.peers.write() {
            peers.retain(|known| known.peer_id != peer.peer_id);
            peers.push(peer);
        }
    }

    /// Add a peer only if it advertises the mesh service
    pub fn add_advertised(&self, peer: PeerDescriptor, advertised: &[Uuid]) -> bool {
        if !is_compatible_peer(advertised) {
            debug!("ignoring incompatible device {}", peer.address);
            return false;
        }
        self.add(peer);
        true
    }

    /// Remove a peer
    pub fn remove(&self, peer_id: &PeerId) -> bool {
        match self.peers.write() {
            Ok(mut peers) => {
                let before = peers.len();
                peers.retain(|known| known.peer_id != *peer_id);
                peers.len() != before
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn scan(&self) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
        let peers = self
            .peers
            .read()
            .map_err(|_| DiscoveryError::Unavailable("peer list poisoned".to_string()))?;
        let now = Instant::now();
        Ok(peers
            .iter()
            .map(|peer| PeerDescriptor {
                last_seen: now,
                ..peer.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert!(is_compatible_peer(&[CHARACTERISTIC_UUID, SERVICE_UUID]));
        assert!(!is_compatible_peer(&[CHARACTERISTIC_UUID]));
        assert!(!is_compatible_peer(&[]));
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let a = PeerDescriptor::new(PeerId::new([1; 8]), "a");
        let b = PeerDescriptor::new(PeerId::new([2; 8]), "b");
        let discovery = StaticDiscovery::new(vec![a.clone()]);

        assert!(!discovery.add_advertised(b.clone(), &[Uuid::nil()]));
        assert_eq!(discovery.scan().await.unwrap().len(), 1);

        assert!(discovery.add_advertised(b.clone(), &[SERVICE_UUID]));
        let peers = discovery.scan().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|peer| peer.same_endpoint(&b)));

        assert!(discovery.remove(&a.peer_id));
        assert!(!discovery.remove(&a.peer_id));
        assert_eq!(discovery.scan().await.unwrap().len(), 1);
    }
}
