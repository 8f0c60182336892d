//! Typed transport events and inbound message observers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mesh_wire::{ChatMessage, PeerId};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Events published by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message addressed to us (or broadcast) arrived
    MessageReceived {
        /// Decoded message
        message: ChatMessage,
        /// Originating peer
        sender_id: PeerId,
    },
    /// An outbound message was handed to at least one neighbour
    MessageDelivered {
        /// Message id
        message_id: String,
    },
    /// An outbound message exhausted its attempts
    MessageFailed {
        /// Message id
        message_id: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },
    /// Discovery reported a new peer
    PeerDiscovered {
        /// Peer
        peer_id: PeerId,
    },
    /// A peer was not seen for longer than the stale timeout
    PeerLost {
        /// Peer
        peer_id: PeerId,
    },
    /// Link to a peer established
    PeerConnected {
        /// Peer
        peer_id: PeerId,
    },
    /// Link to a peer torn down
    PeerDisconnected {
        /// Peer
        peer_id: PeerId,
    },
    /// Connecting to a peer failed after every attempt
    ConnectionFailed {
        /// Peer
        peer_id: PeerId,
        /// Attempts made
        attempts: u32,
    },
}

/// Observer for inbound messages
pub trait MessageHandler: Send + Sync {
    /// Called once per accepted inbound message
    fn on_message(&self, message: &ChatMessage, sender_id: PeerId);
}

impl<F> MessageHandler for F
where
    F: Fn(&ChatMessage, PeerId) + Send + Sync,
{
    fn on_message(&self, message: &ChatMessage, sender_id: PeerId) {
        self(message, sender_id)
    }
}

/// Fans transport events out to subscribers and message handlers
#[derive(Clone)]
pub struct EventNotifier {
    event_tx: broadcast::Sender<TransportEvent>,
    handlers: Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>,
    sequence_counter: Arc<AtomicU64>,
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("subscribers", &self.event_tx.receiver_count())
            .field("sequence", &self.sequence_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            event_tx,
            handlers: Arc::new(RwLock::new(Vec::new())),
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribe to every event
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Register an inbound message handler
    pub async fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Number of registered handlers
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Publish an event; returns its sequence number
    pub fn publish(&self, event: TransportEvent) -> u64 {
        let sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        match self.event_tx.send(event) {
            Ok(receivers) => debug!("published event seq={} to {} subscribers", sequence, receivers),
            Err(_) => debug!("published event seq={} with no subscribers", sequence),
        }
        sequence
    }

    /// Invoke every message handler, then publish `MessageReceived`
    pub async fn dispatch_message(&self, message: ChatMessage, sender_id: PeerId) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self.handlers.read().await.clone();
        for handler in &handlers {
            handler.on_message(&message, sender_id);
        }
        self.publish(TransportEvent::MessageReceived { message, sender_id });
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_handlers_and_subscribers_receive_messages() {
        let notifier = EventNotifier::default();
        let mut events = notifier.subscribe();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier
            .add_handler(Arc::new(move |message: &ChatMessage, sender: PeerId| {
                sink.lock()
                    .unwrap()
                    .push((message.text().unwrap_or_default().to_string(), sender));
            }))
            .await;
        assert_eq!(notifier.handler_count().await, 1);

        let sender = PeerId::new([4; 8]);
        let message = ChatMessage::new("alice", "hello");
        notifier.dispatch_message(message.clone(), sender).await;

        assert_eq!(seen.lock().unwrap().as_slice(), &[("hello".to_string(), sender)]);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::MessageReceived {
                message,
                sender_id: sender
            }
        );
    }

    #[tokio::test]
    async fn test_publish_sequence_increases() {
        let notifier = EventNotifier::new(8);
        let first = notifier.publish(TransportEvent::PeerLost {
            peer_id: PeerId::new([1; 8]),
        });
        let second = notifier.publish(TransportEvent::PeerLost {
            peer_id: PeerId::new([1; 8]),
        });
        assert!(second > first);
    }
}
