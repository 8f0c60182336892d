//! Per-peer connections and the bounded connection pool for bitmesh.
//!
//! This crate manages links to neighbouring peers over an unreliable,
//! frequently churning wireless transport. Each peer gets at most one pooled
//! connection with its own outbound FIFO and drain task; the pool bounds how
//! many connections may be active at once and queues the rest.
//!
//! ## Features
//!
//! - **Connection state machine**: Disconnected, Connecting, Connected, Error
//! - **Bounded outbound queues**: `QueueFull` back-pressure per peer
//! - **Connect retries**: per-attempt timeout with exponential backoff
//! - **Admission queue**: FIFO wait for a free pool slot
//! - **Idle eviction**: single-flight sweep of stale connections
//! - **Pluggable links**: [`LinkConnector`]/[`Link`] traits, in-memory hub for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use mesh_session::{memory::MemoryHub, ConnectionPool, PoolConfig};
//! use mesh_wire::PeerId;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = MemoryHub::new();
//! let remote = PeerId::random();
//! let _inbound = hub.register("remote", remote, 64);
//!
//! let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(hub.connector(PeerId::random())));
//! let descriptor = hub.descriptor("remote").expect("registered");
//! pool.connect(&descriptor).await?;
//! pool.send(&remote, Bytes::from_static(b"hello")).await?.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod pool;
pub mod transport;

// Re-export main types
pub use connection::{
    Connection, ConnectionConfig, ConnectionExit, ConnectionState, ConnectionStats, WriteReceipt,
};
pub use error::SessionError;
pub use pool::{ConnectionPool, PoolConfig, PoolEvent, PoolStats};
pub use transport::{memory, InboundPacket, Link, LinkConnector, LinkError, PeerDescriptor};
