//! Link transport for mesh connections.
//!
//! The radio stack is abstracted behind [`LinkConnector`] and [`Link`]: the
//! pool asks a connector for a link to a discovered peer and writes whole
//! packets to it. Received packets flow the other way through an
//! `mpsc::Receiver<InboundPacket>` owned by the node. [`memory::MemoryHub`]
//! wires nodes together in-process for tests and simulations.

use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::PeerId;
use thiserror::Error;
use tokio::time::Instant;

/// Reachable peer as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Peer identity
    pub peer_id: PeerId,
    /// Transport address (radio address, or hub address for in-memory links)
    pub address: String,
    /// When the peer was last observed
    pub last_seen: Instant,
}

impl PeerDescriptor {
    /// Descriptor observed now
    pub fn new(peer_id: PeerId, address: impl Into<String>) -> Self {
        Self {
            peer_id,
            address: address.into(),
            last_seen: Instant::now(),
        }
    }

    /// Whether both descriptors point at the same endpoint
    pub fn same_endpoint(&self, other: &PeerDescriptor) -> bool {
        self.peer_id == other.peer_id && self.address == other.address
    }
}

/// Raw packet received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Neighbour the packet arrived from
    pub from: PeerId,
    /// Encoded packet
    pub bytes: Bytes,
}

/// Link-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Peer cannot be reached
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// Link already closed
    #[error("link closed")]
    Closed,
    /// Other transport failure
    #[error("link i/o: {0}")]
    Io(String),
}

/// An open link to one peer
#[async_trait]
pub trait Link: Send {
    /// Write one complete packet
    async fn write(&mut self, packet: Bytes) -> Result<(), LinkError>;

    /// Close the link
    async fn close(&mut self);
}

/// Opens links to peers
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Connect to `peer`
    async fn connect(&self, peer: &PeerDescriptor) -> Result<Box<dyn Link>, LinkError>;
}

/// In-process links for tests and simulations
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::debug;

    #[derive(Debug)]
    struct Endpoint {
        peer_id: PeerId,
        inbound: mpsc::Sender<InboundPacket>,
        reachable: bool,
        connect_delay: Duration,
        connects: Arc<AtomicU64>,
    }

    /// Switchboard connecting in-process nodes by address
    #[derive(Debug, Clone, Default)]
    pub struct MemoryHub {
        endpoints: Arc<DashMap<String, Endpoint>>,
    }

    impl MemoryHub {
        /// Create an empty hub
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a node at `address`; packets written to it arrive on the returned receiver
        pub fn register(
            &self,
            address: impl Into<String>,
            peer_id: PeerId,
            capacity: usize,
        ) -> mpsc::Receiver<InboundPacket> {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            self.endpoints.insert(
                address.into(),
                Endpoint {
                    peer_id,
                    inbound: tx,
                    reachable: true,
                    connect_delay: Duration::ZERO,
                    connects: Arc::new(AtomicU64::new(0)),
                },
            );
            rx
        }

        /// Remove a node
        pub fn unregister(&self, address: &str) {
            self.endpoints.remove(address);
        }

        /// Make a node (un)reachable; existing links start failing writes
        pub fn set_reachable(&self, address: &str, reachable: bool) {
            if let Some(mut endpoint) = self.endpoints.get_mut(address) {
                endpoint.reachable = reachable;
            }
        }

        /// Delay every connect to `address`
        pub fn set_connect_delay(&self, address: &str, delay: Duration) {
            if let Some(mut endpoint) = self.endpoints.get_mut(address) {
                endpoint.connect_delay = delay;
            }
        }

        /// Connect attempts made to `address`
        pub fn connect_count(&self, address: &str) -> u64 {
            self.endpoints
                .get(address)
                .map(|endpoint| endpoint.connects.load(Ordering::Relaxed))
                .unwrap_or(0)
        }

        /// Descriptor for a registered node
        pub fn descriptor(&self, address: &str) -> Option<PeerDescriptor> {
            self.endpoints
                .get(address)
                .map(|endpoint| PeerDescriptor::new(endpoint.peer_id, address))
        }

        /// Connector dialing out as `local_id`
        pub fn connector(&self, local_id: PeerId) -> MemoryConnector {
            MemoryConnector {
                hub: self.clone(),
                local_id,
            }
        }
    }

    /// [`LinkConnector`] over a [`MemoryHub`]
    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        hub: MemoryHub,
        local_id: PeerId,
    }

    #[async_trait]
    impl LinkConnector for MemoryConnector {
        async fn connect(&self, peer: &PeerDescriptor) -> Result<Box<dyn Link>, LinkError> {
            let (reachable, delay) = match self.hub.endpoints.get(&peer.address) {
                Some(endpoint) => {
                    endpoint.connects.fetch_add(1, Ordering::Relaxed);
                    (endpoint.reachable, endpoint.connect_delay)
                }
                None => return Err(LinkError::Unreachable(peer.address.clone())),
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !reachable {
                return Err(LinkError::Unreachable(peer.address.clone()));
            }

            debug!("memory link {} -> {}", self.local_id.short(), peer.address);
            Ok(Box::new(MemoryLink {
                hub: self.hub.clone(),
                address: peer.address.clone(),
                local_id: self.local_id,
                closed: false,
            }))
        }
    }

    /// One direction of an in-memory link
    #[derive(Debug)]
    pub struct MemoryLink {
        hub: MemoryHub,
        address: String,
        local_id: PeerId,
        closed: bool,
    }

    #[async_trait]
    impl Link for MemoryLink {
        async fn write(&mut self, packet: Bytes) -> Result<(), LinkError> {
            if self.closed {
                return Err(LinkError::Closed);
            }
            let inbound = match self.hub.endpoints.get(&self.address) {
                Some(endpoint) if endpoint.reachable => endpoint.inbound.clone(),
                _ => return Err(LinkError::Unreachable(self.address.clone())),
            };
            inbound
                .send(InboundPacket {
                    from: self.local_id,
                    bytes: packet,
                })
                .await
                .map_err(|_| LinkError::Closed)
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_write_reaches_registered_node() {
            let hub = MemoryHub::new();
            let a = PeerId::new([1; 8]);
            let b = PeerId::new([2; 8]);
            let mut rx = hub.register("b", b, 8);

            let descriptor = hub.descriptor("b").unwrap();
            assert_eq!(descriptor.peer_id, b);

            let mut link = hub.connector(a).connect(&descriptor).await.unwrap();
            link.write(Bytes::from_static(b"ping")).await.unwrap();

            let received = rx.recv().await.unwrap();
            assert_eq!(received.from, a);
            assert_eq!(&received.bytes[..], b"ping");
            assert_eq!(hub.connect_count("b"), 1);

            link.close().await;
            assert_eq!(
                link.write(Bytes::from_static(b"late")).await,
                Err(LinkError::Closed)
            );
        }

        #[tokio::test]
        async fn test_unreachable_peer() {
            let hub = MemoryHub::new();
            let b = PeerId::new([2; 8]);
            let _rx = hub.register("b", b, 8);
            let connector = hub.connector(PeerId::new([1; 8]));
            let descriptor = hub.descriptor("b").unwrap();

            let mut link = connector.connect(&descriptor).await.unwrap();
            hub.set_reachable("b", false);
            assert!(matches!(
                link.write(Bytes::from_static(b"x")).await,
                Err(LinkError::Unreachable(_))
            ));
            assert!(connector.connect(&descriptor).await.is_err());

            let unknown = PeerDescriptor::new(PeerId::new([3; 8]), "nowhere");
            assert!(connector.connect(&unknown).await.is_err());
        }
    }
}
