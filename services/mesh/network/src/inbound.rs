//! Inbound path: decode, reassemble, deduplicate, relay, decrypt, store and dispatch.

use std::sync::Arc;

use bytes::Bytes;
use mesh_storage::StoredMessage;
use mesh_wire::{decompress, now_millis, ChatMessage, Fragment, Packet, PacketType, PeerId, WireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::orchestrator::NetworkInner;

impl NetworkInner {
    /// Process one raw packet received from neighbour `from`
    pub(crate) async fn handle_inbound(self: &Arc<Self>, from: PeerId, bytes: Bytes) {
        self.counters.add_bytes_received(bytes.len() as u64);
        self.pool.touch(&from).await;
        if let Some(mut neighbour) = self.peers.get_mut(&from) {
            neighbour.last_seen = Instant::now();
        }

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => return self.drop_packet(from, &e),
        };

        let packet = if packet.packet_type.is_fragment() {
            match self.collect_fragment(packet).await {
                Ok(Some(whole)) => whole,
                Ok(None) => return,
                Err(e) => return self.drop_packet(from, &e),
            }
        } else {
            packet
        };

        if packet.sender_id == self.local_id {
            debug!("ignoring own packet echoed by {}", from.short());
            return;
        }

        match packet.packet_type {
            PacketType::Message => self.handle_message(from, packet).await,
            PacketType::Control => self.handle_control(from, packet).await,
            PacketType::Ack => debug!("ack from {} ignored", packet.sender_id.short()),
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => {
                self.drop_packet(from, &WireError::InvalidFragment("nested fragment"))
            }
        }
    }

    fn drop_packet(&self, from: PeerId, error: &WireError) {
        self.counters.incr_dropped();
        match error {
            WireError::OrphanFragment(_) => debug!("dropping packet from {}: {}", from.short(), error),
            _ => warn!("dropping packet from {}: {}", from.short(), error),
        }
    }

    /// Feed a fragment to the reassembler, returning the rebuilt packet once complete
    async fn collect_fragment(&self, packet: Packet) -> Result<Option<Packet>, WireError> {
        let piece = Fragment::decode(packet.payload)?;
        let rebuilt = self.reassembler.lock().await.reassemble(piece)?;
        match rebuilt {
            Some(done) => {
                self.counters.incr_reassembled();
                debug!(
                    "reassembled {} bytes (fragment id {})",
                    done.data.len(),
                    done.fragment_id
                );
                Packet::decode(done.data).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn handle_message(self: &Arc<Self>, from: PeerId, packet: Packet) {
        let envelope = if packet.is_compressed() {
            match decompress(&packet.payload) {
                Ok(plain) => Bytes::from(plain),
                Err(e) => return self.drop_packet(from, &e),
            }
        } else {
            packet.payload.clone()
        };
        let mut message = match ChatMessage::decode(envelope) {
            Ok(message) => message,
            Err(e) => return self.drop_packet(from, &e),
        };

        if !self.dedup.check_and_insert(&message.id) {
            debug!("duplicate message {} via {}", message.id, from.short());
            self.counters.incr_duplicates();
            return;
        }

        let to_us = packet.recipient_id == Some(self.local_id);
        let for_us = packet.recipient_id.is_none() || to_us;
        if !to_us && packet.ttl > 1 {
            self.relay(from, packet.clone());
        }
        if !for_us {
            return;
        }

        let sender_id = packet.sender_id;
        if message.is_encrypted {
            let Some(security) = &self.security else {
                warn!("encrypted message {} but no security provider", message.id);
                self.counters.incr_dropped();
                return;
            };
            match security.decrypt(sender_id, &message.content).await {
                Ok(plain) => {
                    message.content = plain;
                    message.is_encrypted = false;
                }
                Err(e) => {
                    warn!(
                        "failed to decrypt message {} from {}: {}",
                        message.id,
                        sender_id.short(),
                        e
                    );
                    self.counters.incr_dropped();
                    return;
                }
            }
        }

        if let Some(store) = &self.store {
            let stored = StoredMessage {
                message: message.clone(),
                sender_id,
                received_at_ms: now_millis(),
            };
            if let Err(e) = store.store(&stored).await {
                warn!("failed to store message {}: {}", message.id, e);
            }
        }

        self.counters.incr_received();
        info!(
            "received message {} from {} ({} hops left)",
            message.id,
            sender_id.short(),
            packet.ttl
        );
        self.notifier.dispatch_message(message, sender_id).await;
    }

    async fn handle_control(self: &Arc<Self>, from: PeerId, packet: Packet) {
        let key = format!(
            "control:{}:{}:{}",
            packet.sender_id,
            packet.timestamp_ms,
            packet.payload.len()
        );
        if !self.dedup.check_and_insert(&key) {
            self.counters.incr_duplicates();
            return;
        }

        if packet.recipient_id != Some(self.local_id) {
            if packet.ttl > 1 {
                self.relay(from, packet);
            }
            return;
        }

        let Some(security) = self.security.clone() else {
            debug!("control packet from {} ignored", packet.sender_id.short());
            return;
        };
        let peer = packet.sender_id;
        match security.handle_handshake(peer, &packet.payload).await {
            Ok(Some(reply)) => {
                if let Err(e) = self.send_control(peer, reply) {
                    warn!("failed to answer handshake from {}: {}", peer.short(), e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("handshake from {} rejected: {}", peer.short(), e);
                self.counters.incr_dropped();
            }
        }
        if security.has_session(peer) && self.handshakes.remove(&peer).is_some() {
            info!("session established with {}", peer.short());
        }
    }

    /// Forward `packet` with one hop less to every neighbour except where it came from
    fn relay(self: &Arc<Self>, from: PeerId, mut packet: Packet) {
        if packet.decrement_ttl().is_err() {
            return;
        }
        let hops = self.next_hops(packet.recipient_id, &[from, packet.sender_id]);
        if hops.is_empty() {
            debug!("no neighbours to relay to");
            return;
        }
        let frames = match self.frames(&packet) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("failed to re-encode packet for relay: {}", e);
                return;
            }
        };

        self.counters.incr_relayed();
        debug!(
            "relaying packet from {} to {} neighbours (ttl {})",
            packet.sender_id.short(),
            hops.len(),
            packet.ttl
        );
        for hop in hops {
            self.forward(hop, frames.clone());
        }
    }
}
