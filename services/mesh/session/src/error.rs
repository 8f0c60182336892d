//! Session and connection pool errors.

use mesh_wire::PeerId;
use thiserror::Error;

/// Errors surfaced by connections and the pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Every connection attempt failed
    #[error("connection to {peer} failed after {attempts} attempts")]
    ConnectionFailed {
        /// Target peer
        peer: PeerId,
        /// Attempts made
        attempts: u32,
    },

    /// Outbound queue is saturated
    #[error("outbound queue full for {0}")]
    QueueFull(PeerId),

    /// No pool entry for the peer
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    /// Connection was closed before the packet was written
    #[error("connection to {0} closed")]
    Closed(PeerId),

    /// Link write failed
    #[error("write to {peer} failed: {reason}")]
    Write {
        /// Target peer
        peer: PeerId,
        /// Link error text
        reason: String,
    },

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(&'static str),
}
