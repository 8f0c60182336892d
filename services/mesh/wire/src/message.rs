//! Chat message envelope carried in `Message` packets.
//!
//! ```text
//! flags(1) | timestamp_ms(8) | id_len(1) id | nick_len(1) nick |
//! content_len(2) content | recipient(8)? | channel_len(1) channel? |
//! mention_count(1) [len(1) mention]*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::packet::now_millis;
use crate::peer::{PeerId, PEER_ID_SIZE};
use crate::WireError;

const FLAG_PRIVATE: u8 = 0x01;
const FLAG_CHANNEL: u8 = 0x02;
const FLAG_ENCRYPTED: u8 = 0x04;
const FLAG_RECIPIENT: u8 = 0x08;

/// Application-level chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique id used for duplicate suppression
    pub id: String,
    /// Display name of the author
    pub sender_nickname: String,
    /// UTF-8 text, or ciphertext when `is_encrypted` is set
    pub content: Bytes,
    /// Creation time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Addressed peer for private messages
    pub recipient_id: Option<PeerId>,
    /// Channel name
    pub channel: Option<String>,
    /// Private (one-to-one) message
    pub is_private: bool,
    /// Content is encrypted for the recipient
    pub is_encrypted: bool,
    /// Mentioned nicknames
    pub mentions: Vec<String>,
}

impl ChatMessage {
    /// Create a public message with a fresh id
    pub fn new(sender_nickname: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_nickname: sender_nickname.into(),
            content: content.into(),
            timestamp_ms: now_millis(),
            recipient_id: None,
            channel: None,
            is_private: false,
            is_encrypted: false,
            mentions: Vec::new(),
        }
    }

    /// Turn into a private message for `recipient`
    pub fn to_peer(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self.is_private = true;
        self
    }

    /// Post to a channel
    pub fn in_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Content as text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Serialize the envelope
    pub fn encode(&self) -> Result<Bytes, WireError> {
        check_len(self.id.len(), u8::MAX as usize, "id too long")?;
        check_len(self.sender_nickname.len(), u8::MAX as usize, "nickname too long")?;
        check_len(self.content.len(), u16::MAX as usize, "content too long")?;
        check_len(self.mentions.len(), u8::MAX as usize, "too many mentions")?;

        let mut flags = 0u8;
        if self.is_private {
            flags |= FLAG_PRIVATE;
        }
        if self.channel.is_some() {
            flags |= FLAG_CHANNEL;
        }
        if self.is_encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.recipient_id.is_some() {
            flags |= FLAG_RECIPIENT;
        }

        let mut buf = BytesMut::with_capacity(16 + self.id.len() + self.content.len());
        buf.put_u8(flags);
        buf.put_u64(self.timestamp_ms);
        put_short_str(&mut buf, &self.id);
        put_short_str(&mut buf, &self.sender_nickname);
        buf.put_u16(self.content.len() as u16);
        buf.put_slice(&self.content);
        if let Some(recipient) = &self.recipient_id {
            buf.put_slice(recipient.as_bytes());
        }
        if let Some(channel) = &self.channel {
            check_len(channel.len(), u8::MAX as usize, "channel too long")?;
            put_short_str(&mut buf, channel);
        }
        buf.put_u8(self.mentions.len() as u8);
        for mention in &self.mentions {
            check_len(mention.len(), u8::MAX as usize, "mention too long")?;
            put_short_str(&mut buf, mention);
        }

        Ok(buf.freeze())
    }

    /// Parse an envelope
    pub fn decode(bytes: Bytes) -> Result<Self, WireError> {
        let mut buf = bytes;
        need(&buf, 1 + 8)?;
        let flags = buf.get_u8();
        let timestamp_ms = buf.get_u64();
        let id = get_short_str(&mut buf)?;
        let sender_nickname = get_short_str(&mut buf)?;

        need(&buf, 2)?;
        let content_len = buf.get_u16() as usize;
        need(&buf, content_len)?;
        let content = buf.split_to(content_len);

        let recipient_id = if flags & FLAG_RECIPIENT != 0 {
            need(&buf, PEER_ID_SIZE)?;
            let mut raw = [0u8; PEER_ID_SIZE];
            buf.copy_to_slice(&mut raw);
            Some(PeerId::new(raw))
        } else {
            None
        };

        let channel = if flags & FLAG_CHANNEL != 0 {
            Some(get_short_str(&mut buf)?)
        } else {
            None
        };

        // Older peers omit the mention list
        let mut mentions = Vec::new();
        if buf.has_remaining() {
            let count = buf.get_u8();
            for _ in 0..count {
                mentions.push(get_short_str(&mut buf)?);
            }
        }

        if id.is_empty() {
            return Err(WireError::Envelope("empty message id"));
        }

        Ok(Self {
            id,
            sender_nickname,
            content,
            timestamp_ms,
            recipient_id,
            channel,
            is_private: flags & FLAG_PRIVATE != 0,
            is_encrypted: flags & FLAG_ENCRYPTED != 0,
            mentions,
        })
    }
}

fn check_len(len: usize, max: usize, what: &'static str) -> Result<(), WireError> {
    if len > max {
        return Err(WireError::Envelope(what));
    }
    Ok(())
}

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Envelope("truncated"));
    }
    Ok(())
}

fn put_short_str(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn get_short_str(buf: &mut Bytes) -> Result<String, WireError> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Envelope("field is not utf-8"))
}
