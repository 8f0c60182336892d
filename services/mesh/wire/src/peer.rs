//! Peer identifiers.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::WireError;

/// Size of a peer identifier on the wire
pub const PEER_ID_SIZE: usize = 8;

/// Opaque 8-byte peer identifier, rendered as 16 lowercase hex characters
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// Create a peer id from raw bytes
    pub const fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random peer id
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Short form used in logs (first 4 bytes)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    /// Parses hex text; inputs shorter than 16 characters are right-padded with `0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > PEER_ID_SIZE * 2 {
            return Err(WireError::PeerId(s.to_string()));
        }
        let padded = format!("{:0<width$}", s, width = PEER_ID_SIZE * 2);
        let mut bytes = [0u8; PEER_ID_SIZE];
        hex::decode_to_slice(&padded, &mut bytes).map_err(|_| WireError::PeerId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let id = PeerId::new([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(id.to_string(), "deadbeef00010203");
        assert_eq!("deadbeef00010203".parse::<PeerId>().unwrap(), id);
        assert_eq!(id.short(), "deadbeef");
    }

    #[test]
    fn test_short_input_is_padded() {
        let id: PeerId = "abc".parse().unwrap();
        assert_eq!(id.to_string(), "abc0000000000000");
    }

    #[test]
    fn test_invalid_input() {
        assert!("".parse::<PeerId>().is_err());
        assert!("zz".parse::<PeerId>().is_err());
        assert!("00112233445566778899".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0102030405060708\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
