//! Bounded connection pool.
//!
//! The pool keeps at most `max_connections` admitted connections. Requests
//! beyond that are parked in a FIFO admission queue and admitted as slots are
//! released. The connection table and the admission queue live behind one
//! lock so that lookup-then-insert is atomic; the lock is never held while a
//! link connects or writes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mesh_wire::PeerId;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionExit, ConnectionState, WriteReceipt,
};
use crate::error::SessionError;
use crate::transport::{LinkConnector, PeerDescriptor};

/// Pool configuration
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum simultaneously admitted connections
    pub max_connections: usize,
    /// Per-connection settings
    pub connection: ConnectionConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Connection lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Link established
    Connected {
        /// Peer
        peer_id: PeerId,
    },
    /// Link torn down
    Disconnected {
        /// Peer
        peer_id: PeerId,
    },
    /// Connect attempts exhausted
    ConnectionFailed {
        /// Peer
        peer_id: PeerId,
        /// Attempts made
        attempts: u32,
    },
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Entries in the table
    pub total: usize,
    /// Entries in `Connected`
    pub connected: usize,
    /// Entries in `Connecting`
    pub connecting: usize,
    /// Entries in `Error`
    pub error: usize,
    /// Entries waiting for a slot
    pub queued: usize,
    /// Configured slot count
    pub max_connections: usize,
}

#[derive(Default)]
struct PoolTable {
    connections: HashMap<PeerId, Arc<Connection>>,
    admission: VecDeque<PeerId>,
}

impl PoolTable {
    fn admitted(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.is_admitted())
            .count()
    }

    fn remove(&mut self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.admission.retain(|queued| queued != peer_id);
        self.connections.remove(peer_id)
    }

    fn admit_waiting(&mut self, max_connections: usize) {
        while self.admitted() < max_connections {
            let Some(peer_id) = self.admission.pop_front() else {
                break;
            };
            if let Some(conn) = self.connections.get(&peer_id) {
                info!("admitting queued connection to {}", peer_id.short());
                conn.admit();
            }
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn LinkConnector>,
    table: Mutex<PoolTable>,
    cleanup_running: AtomicBool,
    next_id: AtomicU64,
    events: broadcast::Sender<PoolEvent>,
    tracker: TaskTracker,
}

impl PoolShared {
    async fn on_exit(&self, conn: &Arc<Connection>, exit: ConnectionExit) {
        let mut table = self.table.lock().await;
        let current = table
            .connections
            .get(&conn.peer_id())
            .map(|c| c.id() == conn.id())
            .unwrap_or(false);
        if current {
            debug!(
                "removing connection to {} after {:?}",
                conn.peer_id().short(),
                exit
            );
            table.remove(&conn.peer_id());
            table.admit_waiting(self.config.max_connections);
        }
    }
}

/// Bounded pool of per-peer connections
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool dialing through `connector`
    pub fn new(config: PoolConfig, connector: Arc<dyn LinkConnector>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(PoolShared {
                config,
                connector,
                table: Mutex::new(PoolTable::default()),
                cleanup_running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                events,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Return the connection for `descriptor.peer_id`, creating it if needed.
    ///
    /// An existing connection is reused while its endpoint is unchanged and it
    /// has not failed; otherwise it is torn down and replaced. New connections
    /// are admitted immediately when a slot is free, or queued FIFO.
    pub async fn get_connection(&self, descriptor: &PeerDescriptor) -> Arc<Connection> {
        let peer_id = descriptor.peer_id;
        let max_connections = self.shared.config.max_connections;
        let mut table = self.shared.table.lock().await;

        if let Some(existing) = table.connections.get(&peer_id) {
            if existing.descriptor().same_endpoint(descriptor)
                && existing.state() != ConnectionState::Error
            {
                return existing.clone();
            }
            info!(
                "replacing connection to {} ({} -> {})",
                peer_id.short(),
                existing.descriptor().address,
                descriptor.address
            );
            if let Some(old) = table.remove(&peer_id) {
                old.shutdown();
            }
            table.admit_waiting(max_connections);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = Connection::new(
            id,
            descriptor.clone(),
            self.shared.config.connection.queue_capacity,
        );

        let shared = self.shared.clone();
        let task_conn = conn.clone();
        self.shared.tracker.spawn(async move {
            let exit = task_conn
                .clone()
                .run(
                    shared.connector.clone(),
                    shared.config.connection.clone(),
                    rx,
                    shared.events.clone(),
                )
                .await;
            shared.on_exit(&task_conn, exit).await;
        });

        if table.admitted() < max_connections {
            conn.admit();
        } else {
            table.admission.push_back(peer_id);
            info!(
                "pool full ({} slots), queued connection to {} at position {}",
                max_connections,
                peer_id.short(),
                table.admission.len()
            );
        }
        table.connections.insert(peer_id, conn.clone());
        conn
    }

    /// Get or create the connection and wait until it is connected
    pub async fn connect(&self, descriptor: &PeerDescriptor) -> Result<Arc<Connection>, SessionError> {
        let conn = self.get_connection(descriptor).await;
        conn.wait_connected().await?;
        Ok(conn)
    }

    /// Existing connection for `peer_id`
    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<Connection>> {
        self.shared.table.lock().await.connections.get(peer_id).cloned()
    }

    /// Queue a packet on the peer's connection
    pub async fn send(&self, peer_id: &PeerId, packet: Bytes) -> Result<WriteReceipt, SessionError> {
        let conn = self
            .get(peer_id)
            .await
            .ok_or(SessionError::NotConnected(*peer_id))?;
        conn.send(packet)
    }

    /// Record inbound activity from `peer_id`
    pub async fn touch(&self, peer_id: &PeerId) {
        if let Some(conn) = self.get(peer_id).await {
            conn.touch();
        }
    }

    /// Close and remove the connection, freeing its slot
    pub async fn release(&self, peer_id: &PeerId) -> bool {
        let removed = {
            let mut table = self.shared.table.lock().await;
            let removed = table.remove(peer_id);
            table.admit_waiting(self.shared.config.max_connections);
            removed
        };
        match removed {
            Some(conn) => {
                info!("released connection to {}", peer_id.short());
                conn.shutdown();
                true
            }
            None => false,
        }
    }

    /// Evict admitted connections idle for longer than `idle_timeout`.
    ///
    /// Only one sweep runs at a time; a concurrent call returns 0 immediately.
    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        if self.shared.cleanup_running.swap(true, Ordering::AcqRel) {
            debug!("idle cleanup already running");
            return 0;
        }
        let _guard = CleanupGuard(&self.shared.cleanup_running);

        let now = Instant::now();
        let evicted: Vec<Arc<Connection>> = {
            let mut table = self.shared.table.lock().await;
            let stale: Vec<PeerId> = table
                .connections
                .iter()
                .filter(|(_, conn)| {
                    conn.is_admitted()
                        && conn.state() != ConnectionState::Connecting
                        && now.saturating_duration_since(conn.last_seen()) > idle_timeout
                })
                .map(|(peer_id, _)| *peer_id)
                .collect();
            let evicted = stale
                .iter()
                .filter_map(|peer_id| table.remove(peer_id))
                .collect();
            table.admit_waiting(self.shared.config.max_connections);
            evicted
        };

        for conn in &evicted {
            info!(
                "evicting idle connection to {} ({})",
                conn.peer_id().short(),
                conn.state()
            );
            conn.shutdown();
        }
        evicted.len()
    }

    /// Peers with an established link
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let table = self.shared.table.lock().await;
        table
            .connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Connected)
            .map(|conn| conn.peer_id())
            .collect()
    }

    /// Occupancy snapshot
    pub async fn stats(&self) -> PoolStats {
        let table = self.shared.table.lock().await;
        let mut stats = PoolStats {
            total: table.connections.len(),
            queued: table.admission.len(),
            max_connections: self.shared.config.max_connections,
            ..Default::default()
        };
        for conn in table.connections.values() {
            match conn.state() {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Error => stats.error += 1,
                ConnectionState::Disconnected => {}
            }
        }
        stats
    }

    /// Close every connection and wait for their tasks to finish.
    ///
    /// The pool stays usable afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut table = self.shared.table.lock().await;
            table.admission.clear();
            table.connections.drain().map(|(_, conn)| conn).collect()
        };
        info!("shutting down {} connections", drained.len());
        for conn in &drained {
            conn.shutdown();
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.tracker.reopen();
    }
}

struct CleanupGuard<'a>(&'a AtomicBool);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use crate::transport::InboundPacket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const LOCAL: PeerId = PeerId::new([0xAA; 8]);

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 8])
    }

    fn pool_with(hub: &MemoryHub, max_connections: usize) -> ConnectionPool {
        let config = PoolConfig {
            max_connections,
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(1),
                retry_backoff: Duration::from_millis(10),
                queue_capacity: 4,
                ..Default::default()
            },
        };
        ConnectionPool::new(config, Arc::new(hub.connector(LOCAL)))
    }

    fn register(hub: &MemoryHub, n: u8) -> (PeerDescriptor, mpsc::Receiver<InboundPacket>) {
        let address = format!("node-{}", n);
        let rx = hub.register(address.clone(), peer(n), 16);
        (hub.descriptor(&address).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        let (descriptor, mut rx) = register(&hub, 1);
        let mut events = pool.subscribe();

        let conn = pool.connect(&descriptor).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::Connected { peer_id: peer(1) }
        );

        let receipt = pool.send(&peer(1), Bytes::from_static(b"one")).await.unwrap();
        receipt.wait().await.unwrap();
        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.from, LOCAL);
        assert_eq!(&packet.bytes[..], b"one");

        let stats = conn.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 3);
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test]
    async fn test_same_descriptor_reuses_connection() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        let (descriptor, _rx) = register(&hub, 1);

        let a = pool.connect(&descriptor).await.unwrap();
        let b = pool.get_connection(&descriptor).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.connect_count("node-1"), 1);
    }

    #[tokio::test]
    async fn test_changed_descriptor_replaces_connection() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        let (descriptor, _rx) = register(&hub, 1);
        let _rx_moved = hub.register("node-1-moved", peer(1), 16);

        let old = pool.connect(&descriptor).await.unwrap();
        let moved = PeerDescriptor::new(peer(1), "node-1-moved");
        let new = pool.connect(&moved).await.unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.descriptor().address, "node-1-moved");
        assert!(old.send(Bytes::from_static(b"x")).is_err());
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_packets_queued_before_connect_flush_in_order() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        let (descriptor, mut rx) = register(&hub, 1);
        hub.set_connect_delay("node-1", Duration::from_millis(50));

        let conn = pool.get_connection(&descriptor).await;
        let mut receipts = Vec::new();
        for i in 0..3u8 {
            receipts.push(conn.send(Bytes::from(vec![i])).unwrap());
        }
        for receipt in receipts {
            receipt.wait().await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(&rx.recv().await.unwrap().bytes[..], &[i]);
        }
    }

    #[tokio::test]
    async fn test_queue_full() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        let (descriptor, _rx) = register(&hub, 1);
        hub.set_connect_delay("node-1", Duration::from_secs(60));

        let conn = pool.get_connection(&descriptor).await;
        for _ in 0..4 {
            conn.send(Bytes::from_static(b"x")).unwrap();
        }
        assert_eq!(conn.queued(), 4);
        assert_eq!(
            conn.send(Bytes::from_static(b"x")).unwrap_err(),
            SessionError::QueueFull(peer(1))
        );
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 4);
        assert_eq!(
            pool.send(&peer(9), Bytes::new()).await.unwrap_err(),
            SessionError::NotConnected(peer(9))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_reports_error_and_frees_slot() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 1);
        let (descriptor, _rx) = register(&hub, 1);
        hub.set_reachable("node-1", false);
        let mut events = pool.subscribe();

        let conn = pool.get_connection(&descriptor).await;
        let receipt = conn.send(Bytes::from_static(b"lost")).unwrap();

        let err = pool.connect(&descriptor).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::ConnectionFailed {
                peer: peer(1),
                attempts: 3
            }
        );
        assert_eq!(hub.connect_count("node-1"), 3);
        assert!(matches!(
            receipt.wait().await,
            Err(SessionError::ConnectionFailed { .. })
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            PoolEvent::ConnectionFailed {
                peer_id: peer(1),
                attempts: 3
            }
        );

        // The failed entry is removed, so a new peer gets the only slot
        let (other, _rx2) = register(&hub, 2);
        timeout(Duration::from_secs(5), async {
            while pool.stats().await.total != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pool.connect(&other).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_counts_as_attempt() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 2);
        let (descriptor, _rx) = register(&hub, 1);
        hub.set_connect_delay("node-1", Duration::from_secs(30));

        let err = pool.connect(&descriptor).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_admission_queue_respects_capacity() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 2);
        let (d1, _r1) = register(&hub, 1);
        let (d2, _r2) = register(&hub, 2);
        let (d3, mut r3) = register(&hub, 3);

        pool.connect(&d1).await.unwrap();
        pool.connect(&d2).await.unwrap();
        let third = pool.get_connection(&d3).await;
        let receipt = third.send(Bytes::from_static(b"waiting")).unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.connected, 2);
        assert_eq!(stats.queued, 1);
        assert!(!third.is_admitted());
        assert_eq!(third.state(), ConnectionState::Disconnected);
        assert_eq!(hub.connect_count("node-3"), 0);

        assert!(pool.release(&peer(1)).await);
        third.wait_connected().await.unwrap();
        receipt.wait().await.unwrap();
        assert_eq!(&r3.recv().await.unwrap().bytes[..], b"waiting");

        let stats = pool.stats().await;
        assert_eq!(stats.queued, 0);
        assert!(stats.connected + stats.connecting <= 2);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 1);
        let (d1, _r1) = register(&hub, 1);
        let (d2, _r2) = register(&hub, 2);
        let (d3, _r3) = register(&hub, 3);

        pool.connect(&d1).await.unwrap();
        let second = pool.get_connection(&d2).await;
        let third = pool.get_connection(&d3).await;

        pool.release(&peer(1)).await;
        second.wait_connected().await.unwrap();
        assert!(!third.is_admitted());

        pool.release(&peer(2)).await;
        third.wait_connected().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_idle_evicts_and_admits() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 1);
        let (d1, _r1) = register(&hub, 1);
        let (d2, _r2) = register(&hub, 2);

        pool.connect(&d1).await.unwrap();
        let queued = pool.get_connection(&d2).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(pool.cleanup_idle(Duration::from_secs(30)).await, 0);

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(pool.cleanup_idle(Duration::from_secs(30)).await, 1);
        assert!(pool.get(&peer(1)).await.is_none());

        queued.wait_connected().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_connection_alive() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 2);
        let (d1, _r1) = register(&hub, 1);
        pool.connect(&d1).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        pool.touch(&peer(1)).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(pool.cleanup_idle(Duration::from_secs(30)).await, 0);
    }

    #[tokio::test]
    async fn test_write_failure_drops_connection() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 2);
        let (d1, _r1) = register(&hub, 1);
        let conn = pool.connect(&d1).await.unwrap();

        hub.set_reachable("node-1", false);
        let receipt = conn.send(Bytes::from_static(b"x")).unwrap();
        assert!(matches!(
            receipt.wait().await,
            Err(SessionError::Write { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Error);

        // Next request builds a fresh connection
        hub.set_reachable("node-1", true);
        let fresh = pool.connect(&d1).await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = MemoryHub::new();
        let pool = pool_with(&hub, 2);
        let (d1, _r1) = register(&hub, 1);
        let (d2, _r2) = register(&hub, 2);
        let c1 = pool.connect(&d1).await.unwrap();
        pool.connect(&d2).await.unwrap();

        pool.shutdown().await;
        assert_eq!(pool.stats().await.total, 0);
        assert_eq!(c1.state(), ConnectionState::Disconnected);
        assert!(c1.send(Bytes::new()).is_err());

        // Usable again after shutdown
        pool.connect(&d1).await.unwrap();
    }
}
