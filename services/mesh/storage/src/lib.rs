//! Message storage and duplicate suppression for bitmesh.
//!
//! This crate holds the receiver-side state of the transport: the duplicate
//! window that keeps relayed messages from being delivered twice, and the
//! storage trait that completed inbound messages are handed to. Persistent
//! backends live outside this repository; an in-memory store is provided for
//! tests and simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod dedup;

use async_trait::async_trait;
use mesh_wire::{ChatMessage, PeerId};
use thiserror::Error;

pub use backend::mem::MemoryStore;
pub use dedup::{DuplicateWindow, DEFAULT_DUPLICATE_WINDOW};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Store refused the message
    #[error("Rejected: {0}")]
    Rejected(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A completed inbound message with its delivery context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Decoded (and decrypted) message
    pub message: ChatMessage,
    /// Peer that originated the packet
    pub sender_id: PeerId,
    /// Local receive time, milliseconds since the Unix epoch
    pub received_at_ms: u64,
}

/// Sink for completed inbound messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message
    async fn store(&self, message: &StoredMessage) -> Result<(), StorageError>;
}
