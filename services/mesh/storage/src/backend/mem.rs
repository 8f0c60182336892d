//! In-memory message store for development and testing

use crate::{MessageStore, StorageError, StoredMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::PeerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory message store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// message id -> (arrival order, message)
    messages: Arc<DashMap<String, (u64, StoredMessage)>>,
    next_order: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up a message by id
    pub fn get(&self, id: &str) -> Option<StoredMessage> {
        self.messages.get(id).map(|entry| entry.1.clone())
    }

    /// All messages in arrival order
    pub fn all(&self) -> Vec<StoredMessage> {
        let mut entries: Vec<(u64, StoredMessage)> = self
            .messages
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, message)| message).collect()
    }

    /// Messages originated by `peer`, in arrival order
    pub fn from_peer(&self, peer: PeerId) -> Vec<StoredMessage> {
        self.all()
            .into_iter()
            .filter(|stored| stored.sender_id == peer)
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store(&self, message: &StoredMessage) -> Result<(), StorageError> {
        debug!(
            "store message id={} from={}",
            message.message.id,
            message.sender_id.short()
        );
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        self.messages
            .entry(message.message.id.clone())
            .or_insert_with(|| (order, message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::ChatMessage;

    fn stored(text: &str, sender: PeerId) -> StoredMessage {
        StoredMessage {
            message: ChatMessage::new("tester", text.to_string()),
            sender_id: sender,
            received_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_store_and_query() {
        let store = MemoryStore::new();
        let a = PeerId::new([1; 8]);
        let b = PeerId::new([2; 8]);

        let first = stored("one", a);
        let second = stored("two", b);
        let third = stored("three", a);
        store.store(&first).await.unwrap();
        store.store(&second).await.unwrap();
        store.store(&third).await.unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(&second.message.id), Some(second.clone()));

        let texts: Vec<_> = store
            .all()
            .iter()
            .map(|s| s.message.text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(store.from_peer(a).len(), 2);
    }

    #[tokio::test]
    async fn test_same_id_stored_once() {
        let store = MemoryStore::new();
        let msg = stored("again", PeerId::new([3; 8]));
        store.store(&msg).await.unwrap();
        store.store(&msg).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
