//! Outbound path: envelope, encryption, compression, framing, fragmentation
//! and hand-off to pooled connections.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use mesh_delivery::{QueuedMessage, Target};
use mesh_session::{PeerDescriptor, SessionError, WriteReceipt};
use mesh_wire::{compress_if_beneficial, fragment, Packet, PacketType, PeerId};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::orchestrator::NetworkInner;
use crate::security::{SecurityError, SecurityProvider};

impl NetworkInner {
    /// One delivery attempt; returns how many neighbours accepted every packet
    pub(crate) async fn transmit(
        self: &Arc<Self>,
        queued: &QueuedMessage,
    ) -> Result<usize, NetworkError> {
        let mut message = queued.message.clone();
        let (recipient, channel) = match &queued.target {
            Target::Broadcast => (None, None),
            Target::Peer(peer) => (Some(*peer), None),
            Target::Channel(channel) => (None, Some(channel.clone())),
        };

        if let (Some(peer), Some(security)) = (recipient, &self.security) {
            self.ensure_session(security.as_ref(), peer).await?;
            if !message.is_encrypted {
                message.content = security.encrypt(peer, &message.content).await?;
                message.is_encrypted = true;
            }
        }

        let envelope = message.encode()?;
        let compressed = if self.config.compression {
            compress_if_beneficial(&envelope)
        } else {
            None
        };
        let mut packet = match compressed {
            Some(smaller) => {
                debug!(
                    "compressed message {} from {} to {} bytes",
                    message.id,
                    envelope.len(),
                    smaller.len()
                );
                Packet::new(
                    PacketType::Message,
                    self.config.ttl,
                    self.local_id,
                    Bytes::from(smaller),
                )
                .compressed()
            }
            None => Packet::new(PacketType::Message, self.config.ttl, self.local_id, envelope),
        };
        if let Some(peer) = recipient {
            packet = packet.with_recipient(peer);
        }
        if let Some(channel) = channel {
            packet = packet.with_channel(channel);
        }

        let frames = self.frames(&packet)?;
        let hops = self.next_hops(recipient, &[]);
        if hops.is_empty() {
            return Err(NetworkError::NoPeers);
        }

        let mut sends = JoinSet::new();
        for hop in hops {
            let inner = self.clone();
            let frames = frames.clone();
            sends.spawn(async move {
                let result = inner.send_frames(&hop, &frames).await;
                (hop.peer_id, result)
            });
        }

        let mut accepted = 0;
        let mut last_error = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => accepted += 1,
                Ok((peer_id, Err(e))) => {
                    warn!(
                        "message {} not delivered to {}: {}",
                        message.id,
                        peer_id.short(),
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => warn!("send task for message {} failed: {}", message.id, e),
            }
        }

        if accepted == 0 {
            return Err(last_error.unwrap_or(NetworkError::NoPeers));
        }
        Ok(accepted)
    }

    /// Encode `packet`, splitting it into fragment packets when it exceeds the fragment size
    pub(crate) fn frames(&self, packet: &Packet) -> Result<Vec<Bytes>, NetworkError> {
        let encoded = packet.encode()?;
        if encoded.len() <= self.config.fragment_size {
            return Ok(vec![encoded]);
        }

        let fragments = fragment(encoded, self.config.fragment_size, packet.packet_type)?;
        let mut frames = Vec::with_capacity(fragments.len());
        for piece in &fragments {
            let mut wrapper = Packet::new(
                piece.packet_type(),
                packet.ttl,
                packet.sender_id,
                piece.encode(),
            )
            .with_timestamp(packet.timestamp_ms);
            if let Some(recipient) = packet.recipient_id {
                wrapper = wrapper.with_recipient(recipient);
            }
            frames.push(wrapper.encode()?);
        }
        Ok(frames)
    }

    /// The recipient alone if it is a neighbour, otherwise every neighbour not excluded
    pub(crate) fn next_hops(
        &self,
        recipient: Option<PeerId>,
        exclude: &[PeerId],
    ) -> Vec<PeerDescriptor> {
        if let Some(peer) = recipient.filter(|peer| !exclude.contains(peer)) {
            if let Some(direct) = self.peers.get(&peer) {
                return vec![direct.clone()];
            }
        }
        self.peers
            .iter()
            .filter(|entry| !exclude.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queue `frames` on the connection to `hop` in order and wait for every write
    pub(crate) async fn send_frames(
        &self,
        hop: &PeerDescriptor,
        frames: &[Bytes],
    ) -> Result<(), NetworkError> {
        let conn = self.pool.get_connection(hop).await;
        let pacing = self.config.fragment_pacing();

        let deliver = async {
            let mut pending: VecDeque<WriteReceipt> = VecDeque::new();
            for (index, frame) in frames.iter().enumerate() {
                if index > 0 && !pacing.is_zero() {
                    sleep(pacing).await;
                }
                loop {
                    match conn.send(frame.clone()) {
                        Ok(receipt) => {
                            pending.push_back(receipt);
                            break;
                        }
                        // Wait for our oldest write to drain before queueing more
                        Err(SessionError::QueueFull(peer)) => match pending.pop_front() {
                            Some(oldest) => oldest.wait().await?,
                            None => return Err(SessionError::QueueFull(peer)),
                        },
                        Err(e) => return Err(e),
                    }
                }
            }
            for receipt in pending {
                receipt.wait().await?;
            }
            Ok::<(), SessionError>(())
        };

        timeout(self.config.send_timeout(), deliver)
            .await
            .map_err(|_| SessionError::Timeout("send confirmation"))??;

        let bytes: usize = frames.iter().map(Bytes::len).sum();
        self.counters.add_packets_sent(frames.len() as u64);
        self.counters.add_bytes_sent(bytes as u64);
        if frames.len() > 1 {
            self.counters.add_fragments_sent(frames.len() as u64);
        }
        Ok(())
    }

    /// Send `frames` to `hop` in the background until the current run stops
    pub(crate) fn forward(self: &Arc<Self>, hop: PeerDescriptor, frames: Vec<Bytes>) {
        let inner = self.clone();
        let cancel = self.run_token();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("forward to {} cancelled", hop.peer_id.short());
                }
                result = inner.send_frames(&hop, &frames) => {
                    if let Err(e) = result {
                        debug!("forward to {} failed: {}", hop.peer_id.short(), e);
                    }
                }
            }
        });
    }

    /// Send a `Control` packet addressed to `recipient`
    pub(crate) fn send_control(
        self: &Arc<Self>,
        recipient: PeerId,
        payload: Bytes,
    ) -> Result<(), NetworkError> {
        let packet = Packet::new(PacketType::Control, self.config.ttl, self.local_id, payload)
            .with_recipient(recipient);
        let frames = self.frames(&packet)?;
        let hops = self.next_hops(Some(recipient), &[]);
        if hops.is_empty() {
            return Err(NetworkError::NoPeers);
        }
        for hop in hops {
            self.forward(hop, frames.clone());
        }
        Ok(())
    }

    /// Fail with `SessionNotEstablished` until a session with `peer` exists,
    /// initiating (or re-initiating a timed-out) handshake along the way
    async fn ensure_session(
        self: &Arc<Self>,
        security: &dyn SecurityProvider,
        peer: PeerId,
    ) -> Result<(), NetworkError> {
        if security.has_session(peer) {
            self.handshakes.remove(&peer);
            return Ok(());
        }

        let now = Instant::now();
        let in_flight = self
            .handshakes
            .get(&peer)
            .map(|started| now.saturating_duration_since(*started) < self.config.handshake_timeout())
            .unwrap_or(false);
        if !in_flight {
            info!("initiating handshake with {}", peer.short());
            let hello = security.handshake_initiate(peer).await?;
            self.handshakes.insert(peer, now);
            self.send_control(peer, hello)?;
        }
        Err(SecurityError::SessionNotEstablished(peer).into())
    }
}
