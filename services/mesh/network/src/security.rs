//! Security collaborator.
//!
//! Handshake cryptography is provided from outside. The transport only needs
//! opaque per-peer encryption plus a way to exchange handshake bytes, which
//! travel in `Control` packets.

use async_trait::async_trait;
use bytes::Bytes;
use mesh_wire::PeerId;
use thiserror::Error;

/// Security errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// No completed handshake with the peer
    #[error("no session established with {0}")]
    SessionNotEstablished(PeerId),
    /// Handshake message rejected
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Per-peer encryption and handshake
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    /// Encrypt `plaintext` for `peer`
    async fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Bytes, SecurityError>;

    /// Decrypt `ciphertext` received from `peer`
    async fn decrypt(&self, peer: PeerId, ciphertext: &[u8]) -> Result<Bytes, SecurityError>;

    /// First handshake message for `peer`
    async fn handshake_initiate(&self, peer: PeerId) -> Result<Bytes, SecurityError>;

    /// Whether a session with `peer` is established
    fn has_session(&self, peer: PeerId) -> bool;

    /// Process a handshake message from `peer`, returning the reply to send back, if any
    async fn handle_handshake(
        &self,
        _peer: PeerId,
        _message: &[u8],
    ) -> Result<Option<Bytes>, SecurityError> {
        Ok(None)
    }
}
