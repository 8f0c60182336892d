//! Packet framing, fragmentation and chat envelopes for bitmesh.
//!
//! This crate implements the on-air format spoken between mesh peers over
//! small-MTU wireless links: a compact fixed header, optional recipient and
//! channel sections, fragmentation of packets that do not fit one link write,
//! and the chat message envelope carried inside `Message` packets.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------+
//! | version (1)          | always 1                         |
//! | type (1)             | PacketType                       |
//! | ttl (1)              | remaining hop budget             |
//! | timestamp_ms (8)     | origin time                      |
//! | flags (1)            | recipient / channel / compressed |
//! | payload_length (2)   | bytes of payload                 |
//! +----------------------+----------------------------------+
//! | sender_id (8)        |                                  |
//! | recipient_id (8)     | iff HAS_RECIPIENT                |
//! | channel (1 + n)      | iff HAS_CHANNEL                  |
//! | payload              | payload_length bytes             |
//! +----------------------+----------------------------------+
//! ```
//!
//! All integers are big-endian. Fragment packets carry
//! `fragment_id(8) | index(2) | total(2) | original_type(1) | data` as payload.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compression;
pub mod error;
pub mod fragment;
pub mod header;
pub mod message;
pub mod packet;
pub mod peer;

// Re-export main types
pub use compression::{compress_if_beneficial, decompress, COMPRESSION_THRESHOLD};
pub use error::WireError;
pub use fragment::{
    fragment, Fragment, FragmentId, Reassembled, ReassemblyStats, Reassembler,
    DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_BUFFERS, DEFAULT_REASSEMBLY_TIMEOUT, FRAGMENT_HEADER_SIZE,
};
pub use header::{
    Flags, PacketHeader, PacketType, DEFAULT_TTL, HEADER_SIZE, MAX_PAYLOAD_SIZE, WIRE_VERSION,
};
pub use message::ChatMessage;
pub use packet::{decode, encode, now_millis, Packet, MAX_CHANNEL_LEN};
pub use peer::{PeerId, PEER_ID_SIZE};
