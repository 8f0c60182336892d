//! Network orchestrator for bitmesh.
//!
//! Ties the packet codec, fragmentation engine, connection pool and delivery
//! queue together into a running mesh node.
//!
//! ## Outbound
//!
//! `enqueue` → delivery queue → envelope (encrypted for private recipients
//! when a [`SecurityProvider`] is present) → optional compression → `Message`
//! packet → fragments when larger than `fragment_size` → pooled connection(s),
//! fragments paced and in index order.
//!
//! ## Inbound
//!
//! link → packet decode → reassembly → duplicate window → relay with one hop
//! less → decrypt → [`MessageStore`](mesh_storage::MessageStore) → message
//! handlers and [`TransportEvent`](mesh_delivery::TransportEvent) subscribers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_network::{MeshNetwork, NetworkConfig, StaticDiscovery};
//! use mesh_session::memory::MemoryHub;
//! use mesh_wire::PeerId;
//!
//! # async fn example() -> Result<(), mesh_network::NetworkError> {
//! let hub = MemoryHub::new();
//! let id = PeerId::random();
//! let inbound = hub.register("me", id, 256);
//!
//! let network = MeshNetwork::builder(NetworkConfig {
//!     local_peer_id: Some(id),
//!     ..Default::default()
//! })
//! .connector(Arc::new(hub.connector(id)))
//! .inbound(inbound)
//! .discovery(Arc::new(StaticDiscovery::default()))
//! .build()?;
//!
//! network.on_message_received(|message, sender| {
//!     println!("{}: {}", sender.short(), message.text().unwrap_or("<binary>"));
//! }).await;
//! network.start().await?;
//! network.send_text("hello mesh", None, None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
mod inbound;
pub mod orchestrator;
mod outbound;
pub mod security;

// Re-export main types
pub use config::{ConfigError, NetworkConfig, MIN_FRAGMENT_SIZE};
pub use discovery::{
    is_compatible_peer, Discovery, DiscoveryError, StaticDiscovery, CHARACTERISTIC_UUID,
    SERVICE_UUID,
};
pub use error::NetworkError;
pub use orchestrator::{MeshNetwork, MeshNetworkBuilder, TransportStats};
pub use security::{SecurityError, SecurityProvider};
