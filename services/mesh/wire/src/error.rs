//! Wire protocol error types.

use thiserror::Error;

use crate::fragment::FragmentId;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer too short, or a declared length runs past the end of the buffer
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown packet type
    #[error("unknown type {0}")]
    UnknownType(u8),

    /// Hop budget is zero
    #[error("invalid ttl")]
    Ttl,

    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Fragment for a message that is not being reassembled
    #[error("orphan fragment {0}")]
    OrphanFragment(FragmentId),

    /// Fragment with inconsistent index/total
    #[error("invalid fragment: {0}")]
    InvalidFragment(&'static str),

    /// Chat envelope could not be parsed
    #[error("malformed envelope: {0}")]
    Envelope(&'static str),

    /// Compressed payload could not be restored
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Invalid peer identifier text
    #[error("invalid peer id: {0}")]
    PeerId(String),
}
