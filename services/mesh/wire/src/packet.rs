//! Packet codec.
//!
//! Layout after the fixed header: `sender_id(8) | recipient_id(8)? |
//! channel_len(1) channel? | payload`. Recipient and channel are present only
//! when the matching flag is set. Bytes after the declared payload are
//! ignored, link layers are free to pad.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::header::{Flags, PacketHeader, PacketType, HEADER_SIZE, MAX_PAYLOAD_SIZE, WIRE_VERSION};
use crate::peer::{PeerId, PEER_ID_SIZE};
use crate::WireError;

/// Longest channel name the one-byte length prefix allows
pub const MAX_CHANNEL_LEN: usize = u8::MAX as usize;

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version
    pub version: u8,
    /// Packet type
    pub packet_type: PacketType,
    /// Remaining hop budget
    pub ttl: u8,
    /// Origin timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Flags
    pub flags: Flags,
    /// Originating peer
    pub sender_id: PeerId,
    /// Addressed peer, if any
    pub recipient_id: Option<PeerId>,
    /// Channel name, if any
    pub channel: Option<String>,
    /// Payload bytes (compressed when `Flags::COMPRESSED` is set)
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet stamped with the current time
    pub fn new(packet_type: PacketType, ttl: u8, sender_id: PeerId, payload: Bytes) -> Self {
        Self {
            version: WIRE_VERSION,
            packet_type,
            ttl,
            timestamp_ms: now_millis(),
            flags: Flags::empty(),
            sender_id,
            recipient_id: None,
            channel: None,
            payload,
        }
    }

    /// Address the packet to a single peer
    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self.flags |= Flags::HAS_RECIPIENT;
        self
    }

    /// Tag the packet with a channel name
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self.flags |= Flags::HAS_CHANNEL;
        self
    }

    /// Override the origin timestamp
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Mark the payload as compressed
    pub fn compressed(mut self) -> Self {
        self.flags |= Flags::COMPRESSED;
        self
    }

    /// Whether the payload is compressed
    pub fn is_compressed(&self) -> bool {
        self.flags.contains(Flags::COMPRESSED)
    }

    /// Number of bytes `encode` will produce
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + PEER_ID_SIZE
            + self.recipient_id.map_or(0, |_| PEER_ID_SIZE)
            + self.channel.as_ref().map_or(0, |c| 1 + c.len())
            + self.payload.len()
    }

    /// Decrement TTL for relaying; fails when no hops would remain
    pub fn decrement_ttl(&mut self) -> Result<(), WireError> {
        if self.ttl <= 1 {
            return Err(WireError::Ttl);
        }
        self.ttl -= 1;
        Ok(())
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.version != WIRE_VERSION {
            return Err(WireError::Version(self.version));
        }
        if self.ttl == 0 {
            return Err(WireError::Ttl);
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let mut flags = self.flags - (Flags::HAS_RECIPIENT | Flags::HAS_CHANNEL);
        if self.recipient_id.is_some() {
            flags |= Flags::HAS_RECIPIENT;
        }
        if let Some(channel) = &self.channel {
            if channel.len() > MAX_CHANNEL_LEN {
                return Err(WireError::MalformedPacket("channel name too long"));
            }
            flags |= Flags::HAS_CHANNEL;
        }

        let header = PacketHeader {
            version: self.version,
            packet_type: self.packet_type,
            ttl: self.ttl,
            timestamp_ms: self.timestamp_ms,
            flags,
            payload_len: self.payload.len() as u16,
        };

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        header.encode(&mut buf);
        buf.put_slice(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            buf.put_slice(recipient.as_bytes());
        }
        if let Some(channel) = &self.channel {
            buf.put_u8(channel.len() as u8);
            buf.put_slice(channel.as_bytes());
        }
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode from wire bytes
    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        let mut buf = bytes;
        let header = PacketHeader::decode(&mut buf)?;

        let sender_id = read_peer_id(&mut buf)?;

        let recipient_id = if header.flags.contains(Flags::HAS_RECIPIENT) {
            Some(read_peer_id(&mut buf)?)
        } else {
            None
        };

        let channel = if header.flags.contains(Flags::HAS_CHANNEL) {
            if buf.remaining() < 1 {
                return Err(WireError::MalformedPacket("missing channel length"));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(WireError::MalformedPacket("channel runs past end of buffer"));
            }
            let raw = buf.split_to(len);
            let name = String::from_utf8(raw.to_vec())
                .map_err(|_| WireError::MalformedPacket("channel is not utf-8"))?;
            Some(name)
        } else {
            None
        };

        let payload_len = header.payload_len as usize;
        if buf.remaining() < payload_len {
            return Err(WireError::MalformedPacket(
                "declared payload length exceeds buffer",
            ));
        }
        let payload = buf.split_to(payload_len);

        Ok(Self {
            version: header.version,
            packet_type: header.packet_type,
            ttl: header.ttl,
            timestamp_ms: header.timestamp_ms,
            flags: header.flags,
            sender_id,
            recipient_id,
            channel,
            payload,
        })
    }
}

/// Encode a packet from its parts
pub fn encode(
    packet_type: PacketType,
    ttl: u8,
    sender_id: PeerId,
    recipient_id: Option<PeerId>,
    payload: &[u8],
) -> Result<Bytes, WireError> {
    let mut packet = Packet::new(packet_type, ttl, sender_id, Bytes::copy_from_slice(payload));
    if let Some(recipient) = recipient_id {
        packet = packet.with_recipient(recipient);
    }
    packet.encode()
}

/// Decode a packet from a byte slice
pub fn decode(bytes: &[u8]) -> Result<Packet, WireError> {
    Packet::decode(Bytes::copy_from_slice(bytes))
}

fn read_peer_id(buf: &mut Bytes) -> Result<PeerId, WireError> {
    if buf.remaining() < PEER_ID_SIZE {
        return Err(WireError::MalformedPacket("peer id runs past end of buffer"));
    }
    let mut id = [0u8; PEER_ID_SIZE];
    buf.copy_to_slice(&mut id);
    Ok(PeerId::new(id))
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
