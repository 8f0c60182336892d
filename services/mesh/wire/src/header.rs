//! Fixed packet header.
//!
//! Every packet starts with the same big-endian header. The header carries the
//! hop budget and the declared payload length so that relays can make
//! forwarding decisions without touching the payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes: version, type, ttl, timestamp, flags, payload length
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 8 + 1 + 2;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Default hop budget for locally originated packets
pub const DEFAULT_TTL: u8 = 7;

/// Packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Complete chat message
    Message = 0x04,
    /// First fragment of an oversized packet
    FragmentStart = 0x05,
    /// Middle fragment
    FragmentContinue = 0x06,
    /// Final fragment
    FragmentEnd = 0x07,
    /// Delivery acknowledgment
    Ack = 0x0A,
    /// Control traffic (handshake messages)
    Control = 0x10,
}

impl PacketType {
    /// Whether this type carries a fragment sub-payload
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x04 => Ok(PacketType::Message),
            0x05 => Ok(PacketType::FragmentStart),
            0x06 => Ok(PacketType::FragmentContinue),
            0x07 => Ok(PacketType::FragmentEnd),
            0x0A => Ok(PacketType::Ack),
            0x10 => Ok(PacketType::Control),
            _ => Err(crate::WireError::UnknownType(value)),
        }
    }
}

bitflags! {
    /// Packet flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Recipient id follows the sender id
        const HAS_RECIPIENT = 1 << 0;
        /// Channel name follows the peer ids
        const HAS_CHANNEL = 1 << 1;
        /// Payload is LZ4 compressed
        const COMPRESSED = 1 << 2;
    }
}

/// Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Protocol version (must be 1)
    pub version: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Origin timestamp, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Flags
    pub flags: Flags,
    /// Length of the payload section
    pub payload_len: u16,
}

impl PacketHeader {
    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.ttl);
        buf.put_u64(self.timestamp_ms);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.payload_len);
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::MalformedPacket("shorter than header"));
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let packet_type = PacketType::try_from(buf.get_u8())?;
        let ttl = buf.get_u8();
        if ttl == 0 {
            return Err(crate::WireError::Ttl);
        }

        let timestamp_ms = buf.get_u64();
        let flags = Flags::from_bits_retain(buf.get_u8());
        let payload_len = buf.get_u16();

        Ok(Self {
            version,
            packet_type,
            ttl,
            timestamp_ms,
            flags,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x04).unwrap(), PacketType::Message);
        assert_eq!(PacketType::try_from(0x07).unwrap(), PacketType::FragmentEnd);
        assert_eq!(PacketType::try_from(0x10).unwrap(), PacketType::Control);
        assert_eq!(
            PacketType::try_from(0xFF),
            Err(crate::WireError::UnknownType(0xFF))
        );
        assert!(PacketType::FragmentContinue.is_fragment());
        assert!(!PacketType::Ack.is_fragment());
    }

    #[test]
    fn test_flags() {
        let flags = Flags::HAS_RECIPIENT | Flags::COMPRESSED;
        assert!(flags.contains(Flags::HAS_RECIPIENT));
        assert!(!flags.contains(Flags::HAS_CHANNEL));
        assert_eq!(flags.bits(), 0b101);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = PacketHeader {
            version: WIRE_VERSION,
            packet_type: PacketType::Message,
            ttl: 3,
            timestamp_ms: 1_700_000_000_123,
            flags: Flags::HAS_CHANNEL,
            payload_len: 42,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut bytes = buf.freeze();
        assert_eq!(PacketHeader::decode(&mut bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_zero_ttl_and_bad_version() {
        let mut header = PacketHeader {
            version: WIRE_VERSION,
            packet_type: PacketType::Ack,
            ttl: 0,
            timestamp_ms: 0,
            flags: Flags::empty(),
            payload_len: 0,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            PacketHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::Ttl)
        );

        header.ttl = 1;
        header.version = 2;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            PacketHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::Version(2))
        );
    }
}
