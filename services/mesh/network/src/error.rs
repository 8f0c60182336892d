//! Network orchestrator errors.

use mesh_delivery::EnqueueError;
use mesh_session::SessionError;
use mesh_wire::WireError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::security::SecurityError;

/// Errors surfaced by [`MeshNetwork`](crate::MeshNetwork)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Connection or pool failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Delivery queue refused a message
    #[error("enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    /// Security provider failure
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Discovery failure
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// `start` called while running
    #[error("network already running")]
    AlreadyRunning,

    /// `stop` called while stopped
    #[error("network not running")]
    NotRunning,

    /// No neighbour to send to
    #[error("no reachable peers")]
    NoPeers,
}
