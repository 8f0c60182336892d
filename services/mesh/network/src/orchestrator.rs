//! Network orchestrator.
//!
//! [`MeshNetwork`] owns the connection pool, delivery queue, duplicate window
//! and reassembler, and runs the background loops that move messages between
//! them: discovery scans, queue processing, idle cleanup, sweeps, inbound
//! packets, pool event forwarding and metrics.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use mesh_delivery::{
    CounterSnapshot, DeliveryQueue, EnqueueError, EventNotifier, MessageHandler, MetricsReporter,
    Priority, QueueSnapshot, RetryOutcome, Target, TransportCounters, TransportEvent,
};
use mesh_session::{ConnectionPool, InboundPacket, LinkConnector, PeerDescriptor, PoolEvent};
use mesh_storage::{DuplicateWindow, MessageStore};
use mesh_wire::{ChatMessage, PeerId, Reassembler, ReassemblyStats};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, NetworkConfig};
use crate::discovery::{Discovery, StaticDiscovery};
use crate::error::NetworkError;
use crate::security::SecurityProvider;

/// How long the queue loop waits for work before re-checking cancellation
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Event buffer per subscriber
const EVENT_CAPACITY: usize = 1024;

/// State shared by the public handle and every background task
pub(crate) struct NetworkInner {
    pub(crate) config: NetworkConfig,
    pub(crate) local_id: PeerId,
    pub(crate) pool: ConnectionPool,
    pub(crate) queue: DeliveryQueue,
    pub(crate) dedup: Arc<DuplicateWindow>,
    pub(crate) reassembler: Mutex<Reassembler>,
    pub(crate) notifier: EventNotifier,
    pub(crate) counters: Arc<TransportCounters>,
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) security: Option<Arc<dyn SecurityProvider>>,
    pub(crate) store: Option<Arc<dyn MessageStore>>,
    /// Neighbours reported by discovery
    pub(crate) peers: DashMap<PeerId, PeerDescriptor>,
    /// Handshakes we initiated and are waiting on
    pub(crate) handshakes: DashMap<PeerId, Instant>,
    pub(crate) tasks: TaskTracker,
    /// Cancellation token of the current run
    pub(crate) run_token: std::sync::Mutex<CancellationToken>,
}

/// Builder for [`MeshNetwork`]
pub struct MeshNetworkBuilder {
    config: NetworkConfig,
    connector: Option<Arc<dyn LinkConnector>>,
    inbound: Option<mpsc::Receiver<InboundPacket>>,
    discovery: Option<Arc<dyn Discovery>>,
    security: Option<Arc<dyn SecurityProvider>>,
    store: Option<Arc<dyn MessageStore>>,
}

impl MeshNetworkBuilder {
    /// Start from `config`
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            connector: None,
            inbound: None,
            discovery: None,
            security: None,
            store: None,
        }
    }

    /// Link connector used by the pool (required)
    pub fn connector(mut self, connector: Arc<dyn LinkConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Channel the link layer delivers received packets on
    pub fn inbound(mut self, inbound: mpsc::Receiver<InboundPacket>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Peer discovery; defaults to an empty [`StaticDiscovery`]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Encryption and handshake provider for private messages
    pub fn security(mut self, security: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(security);
        self
    }

    /// Sink for received messages
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and build the network
    pub fn build(self) -> Result<MeshNetwork, NetworkError> {
        self.config.validate()?;
        let connector = self.connector.ok_or(ConfigError::Missing("link connector"))?;

        let config = self.config;
        let local_id = config.local_peer_id.unwrap_or_else(PeerId::random);
        let counters = Arc::new(TransportCounters::new());
        let dedup = Arc::new(DuplicateWindow::new(config.duplicate_timeout()));

        let inner = NetworkInner {
            pool: ConnectionPool::new(config.pool_config(), connector),
            queue: DeliveryQueue::new(config.queue_config(), dedup.clone(), counters.clone()),
            reassembler: Mutex::new(Reassembler::new(config.reassembly_timeout())),
            notifier: EventNotifier::new(EVENT_CAPACITY),
            discovery: self
                .discovery
                .unwrap_or_else(|| Arc::new(StaticDiscovery::default())),
            security: self.security,
            store: self.store,
            peers: DashMap::new(),
            handshakes: DashMap::new(),
            tasks: TaskTracker::new(),
            run_token: std::sync::Mutex::new(CancellationToken::new()),
            dedup,
            counters,
            local_id,
            config,
        };

        info!(
            "built mesh network node {} ({})",
            local_id, inner.config.nickname
        );
        Ok(MeshNetwork {
            inner: Arc::new(inner),
            inbound: Arc::new(Mutex::new(self.inbound)),
            running: Mutex::new(None),
        })
    }
}

/// Transport statistics
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    /// Local peer id
    pub local_peer_id: PeerId,
    /// Whether background loops are running
    pub running: bool,
    /// Neighbours known from discovery
    pub discovered_peers: usize,
    /// Pool entries, admitted or waiting
    pub active_connections: usize,
    /// Connections with an established link
    pub connected: usize,
    /// Connections currently connecting
    pub connecting: usize,
    /// Connections waiting for a pool slot
    pub queued_connections: usize,
    /// Messages in the delivery queue
    pub queue_depth: usize,
    /// Delivery queue depth per priority
    pub queue: QueueSnapshot,
    /// Partial messages being reassembled
    pub pending_fragments: usize,
    /// Reassembler counters
    pub reassembly: ReassemblyStats,
    /// Message ids in the duplicate window
    pub tracked_message_ids: usize,
    /// Transport counters
    pub counters: CounterSnapshot,
}

/// A mesh network node
pub struct MeshNetwork {
    inner: Arc<NetworkInner>,
    inbound: Arc<Mutex<Option<mpsc::Receiver<InboundPacket>>>>,
    running: Mutex<Option<CancellationToken>>,
}

impl MeshNetwork {
    /// Builder for a node using `config`
    pub fn builder(config: NetworkConfig) -> MeshNetworkBuilder {
        MeshNetworkBuilder::new(config)
    }

    /// Local peer id
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Active configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Whether background loops are running
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Launch the background loops
    pub async fn start(&self) -> Result<(), NetworkError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NetworkError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let inner = &self.inner;
        let tasks = &inner.tasks;
        inner.set_run_token(cancel.clone());

        tasks.spawn(inner.clone().scan_loop(cancel.clone()));
        tasks.spawn(inner.clone().queue_loop(cancel.clone()));
        tasks.spawn(inner.clone().cleanup_loop(cancel.clone()));
        tasks.spawn(inner.clone().sweep_loop(cancel.clone()));
        tasks.spawn(
            inner
                .clone()
                .pool_event_loop(inner.pool.subscribe(), cancel.clone()),
        );
        tasks.spawn(inner.clone().inbound_loop(self.inbound.clone(), cancel.clone()));
        if inner.config.metrics_enabled {
            let reporter = MetricsReporter::new(inner.counters.clone())
                .with_interval(inner.config.metrics_interval());
            tasks.spawn(reporter.run(cancel.clone()));
        }

        info!("mesh network {} started", inner.local_id.short());
        *running = Some(cancel);
        Ok(())
    }

    /// Cancel every loop, wait for them and close all connections
    pub async fn stop(&self) -> Result<(), NetworkError> {
        let cancel = self
            .running
            .lock()
            .await
            .take()
            .ok_or(NetworkError::NotRunning)?;

        info!("stopping mesh network {}", self.inner.local_id.short());
        cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();

        self.inner.pool.shutdown().await;
        self.inner.handshakes.clear();
        info!("mesh network {} stopped", self.inner.local_id.short());
        Ok(())
    }

    /// Queue a message for delivery.
    ///
    /// A recipient makes the message private; otherwise a channel scopes it,
    /// and with neither it is a broadcast.
    pub async fn enqueue(
        &self,
        mut message: ChatMessage,
        priority: Priority,
        recipient: Option<PeerId>,
        channel: Option<String>,
    ) -> Result<(), EnqueueError> {
        let target = match (recipient, channel) {
            (Some(peer), _) => {
                message = message.to_peer(peer);
                Target::Peer(peer)
            }
            (None, Some(channel)) => {
                message = message.in_channel(channel.clone());
                Target::Channel(channel)
            }
            (None, None) => Target::Broadcast,
        };
        self.inner.queue.enqueue(message, priority, target).await
    }

    /// Build a message from `content` with the local nickname and queue it.
    ///
    /// Private messages go out at high priority. Returns the message id.
    pub async fn send_text(
        &self,
        content: impl Into<Bytes>,
        recipient: Option<PeerId>,
        channel: Option<String>,
    ) -> Result<String, EnqueueError> {
        let message = ChatMessage::new(self.inner.config.nickname.clone(), content);
        let id = message.id.clone();
        let priority = if recipient.is_some() {
            Priority::High
        } else {
            Priority::Normal
        };
        self.enqueue(message, priority, recipient, channel).await?;
        Ok(id)
    }

    /// Call `handler` for every message delivered to this node
    pub async fn on_message_received<F>(&self, handler: F)
    where
        F: Fn(&ChatMessage, PeerId) + Send + Sync + 'static,
    {
        self.inner.notifier.add_handler(Arc::new(handler)).await;
    }

    /// Register a typed message handler
    pub async fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.notifier.add_handler(handler).await;
    }

    /// Subscribe to every transport event
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.notifier.subscribe()
    }

    /// Process a raw packet received from neighbour `from`
    pub async fn receive(&self, from: PeerId, bytes: Bytes) {
        self.inner.handle_inbound(from, bytes).await;
    }

    /// Run one discovery scan now
    pub async fn scan_now(&self) {
        self.inner.scan_once().await;
    }

    /// Neighbours known from discovery
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.inner
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Current statistics
    pub async fn get_stats(&self) -> TransportStats {
        let pool = self.inner.pool.stats().await;
        let queue = self.inner.queue.snapshot().await;
        let (pending_fragments, reassembly) = {
            let reassembler = self.inner.reassembler.lock().await;
            (reassembler.pending(), reassembler.stats())
        };

        TransportStats {
            local_peer_id: self.inner.local_id,
            running: self.is_running().await,
            discovered_peers: self.inner.peers.len(),
            active_connections: pool.total,
            connected: pool.connected,
            connecting: pool.connecting,
            queued_connections: pool.queued,
            queue_depth: queue.total(),
            queue,
            pending_fragments,
            reassembly,
            tracked_message_ids: self.inner.dedup.len(),
            counters: self.inner.counters.snapshot(),
        }
    }
}

impl NetworkInner {
    /// Token cancelled when the current run stops
    pub(crate) fn run_token(&self) -> CancellationToken {
        match self.run_token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_run_token(&self, token: CancellationToken) {
        match self.run_token.lock() {
            Ok(mut slot) => *slot = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    async fn scan_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.scan_once().await,
            }
        }
        debug!("scan loop stopped");
    }

    /// Merge discovery results into the neighbour table and expire stale peers
    pub(crate) async fn scan_once(&self) {
        match self.discovery.scan().await {
            Ok(found) => {
                for peer in found {
                    if peer.peer_id == self.local_id {
                        continue;
                    }
                    let peer_id = peer.peer_id;
                    if self.peers.insert(peer_id, peer).is_none() {
                        info!("discovered peer {}", peer_id.short());
                        self.notifier
                            .publish(TransportEvent::PeerDiscovered { peer_id });
                    }
                }
            }
            Err(e) => warn!("discovery scan failed: {}", e),
        }

        let now = Instant::now();
        let stale_after = self.config.peer_stale_timeout();
        let lost: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > stale_after)
            .map(|entry| *entry.key())
            .collect();
        for peer_id in lost {
            self.peers.remove(&peer_id);
            self.pool.release(&peer_id).await;
            info!("lost peer {}", peer_id.short());
            self.notifier.publish(TransportEvent::PeerLost { peer_id });
        }
    }

    async fn queue_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let popped = tokio::select! {
                _ = cancel.cancelled() => break,
                popped = self.queue.pop_timeout(QUEUE_POLL_INTERVAL) => popped,
            };
            let Some(queued) = popped else {
                continue;
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.transmit(&queued) => Some(result),
            };
            let message_id = queued.message.id.clone();
            match outcome {
                None => {
                    self.queue.requeue(queued).await;
                    break;
                }
                Some(Ok(hops)) => {
                    debug!("message {} sent to {} neighbours", message_id, hops);
                    self.queue.mark_delivered(&queued);
                    self.notifier
                        .publish(TransportEvent::MessageDelivered { message_id });
                }
                Some(Err(e)) => {
                    let reason = e.to_string();
                    // Encoding failures repeat on every attempt
                    let outcome = match e {
                        NetworkError::Wire(_) => self.queue.fail(queued),
                        _ => self.queue.retry(queued).await,
                    };
                    match outcome {
                        RetryOutcome::Scheduled { attempts, delay } => {
                            warn!(
                                "send of message {} failed (attempt {}): {}, retrying in {:?}",
                                message_id, attempts, reason, delay
                            );
                        }
                        RetryOutcome::Exhausted { attempts } => {
                            error!(
                                "giving up on message {} after {} attempts: {}",
                                message_id, attempts, reason
                            );
                            self.notifier.publish(TransportEvent::MessageFailed {
                                message_id,
                                attempts,
                                reason,
                            });
                        }
                    }
                }
            }
        }
        debug!("queue loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.cleanup_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.pool.cleanup_idle(self.config.idle_timeout()).await;
                    if evicted > 0 {
                        info!("evicted {} idle connections", evicted);
                    }
                    let now = Instant::now();
                    let handshake_timeout = self.config.handshake_timeout();
                    self.handshakes
                        .retain(|_, started| now.saturating_duration_since(*started) < handshake_timeout);
                }
            }
        }
        debug!("cleanup loop stopped");
    }

    async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.reassembler.lock().await.sweep();
                    if expired > 0 {
                        debug!("dropped {} incomplete messages", expired);
                        self.counters.add_reassembly_timeouts(expired as u64);
                    }
                    let forgotten = self.dedup.sweep();
                    if forgotten > 0 {
                        debug!("forgot {} message ids", forgotten);
                    }
                }
            }
        }
        debug!("sweep loop stopped");
    }

    async fn pool_event_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PoolEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(PoolEvent::Connected { peer_id }) => {
                    self.notifier
                        .publish(TransportEvent::PeerConnected { peer_id });
                }
                Ok(PoolEvent::Disconnected { peer_id }) => {
                    self.notifier
                        .publish(TransportEvent::PeerDisconnected { peer_id });
                }
                Ok(PoolEvent::ConnectionFailed { peer_id, attempts }) => {
                    warn!(
                        "connection to {} failed after {} attempts",
                        peer_id.short(),
                        attempts
                    );
                    self.notifier
                        .publish(TransportEvent::ConnectionFailed { peer_id, attempts });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("pool event forwarder lagged, missed {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("pool event loop stopped");
    }

    async fn inbound_loop(
        self: Arc<Self>,
        slot: Arc<Mutex<Option<mpsc::Receiver<InboundPacket>>>>,
        cancel: CancellationToken,
    ) {
        let Some(mut rx) = slot.lock().await.take() else {
            debug!("no inbound channel attached");
            return;
        };

        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                packet = rx.recv() => packet,
            };
            match packet {
                Some(packet) => self.handle_inbound(packet.from, packet.bytes).await,
                None => {
                    info!("inbound channel closed");
                    break;
                }
            }
        }

        // Hand the receiver back so a restarted node keeps listening
        *slot.lock().await = Some(rx);
        debug!("inbound loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_session::memory::MemoryHub;
    use mesh_wire::{Packet, PacketType};

    fn node(hub: &MemoryHub, address: &str) -> MeshNetwork {
        let id = PeerId::random();
        let inbound = hub.register(address, id, 64);
        MeshNetwork::builder(NetworkConfig {
            local_peer_id: Some(id),
            metrics_enabled: false,
            ..Default::default()
        })
        .connector(Arc::new(hub.connector(id)))
        .inbound(inbound)
        .build()
        .unwrap()
    }

    #[test]
    fn test_build_requires_connector() {
        let result = MeshNetwork::builder(NetworkConfig::default()).build();
        assert!(matches!(
            result,
            Err(NetworkError::Config(ConfigError::Missing(_)))
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let hub = MemoryHub::new();
        let result = MeshNetwork::builder(NetworkConfig {
            max_connections: 0,
            ..Default::default()
        })
        .connector(Arc::new(hub.connector(PeerId::random())))
        .build();
        assert!(matches!(result, Err(NetworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let hub = MemoryHub::new();
        let network = node(&hub, "a");

        assert_eq!(network.stop().await, Err(NetworkError::NotRunning));
        network.start().await.unwrap();
        assert!(network.is_running().await);
        assert_eq!(network.start().await, Err(NetworkError::AlreadyRunning));

        network.stop().await.unwrap();
        assert!(!network.is_running().await);

        // Restart picks the inbound channel back up
        network.start().await.unwrap();
        network.stop().await.unwrap();
        assert!(network.inbound.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_sets_target_and_rejects_duplicates() {
        let hub = MemoryHub::new();
        let network = node(&hub, "a");
        let peer = PeerId::new([9; 8]);

        let message = ChatMessage::new("alice", "hi").with_id("m-1");
        network
            .enqueue(message.clone(), Priority::High, Some(peer), None)
            .await
            .unwrap();
        assert_eq!(
            network
                .enqueue(message, Priority::High, Some(peer), None)
                .await,
            Err(EnqueueError::Duplicate("m-1".to_string()))
        );

        let queued = network.inner.queue.pop().await.unwrap();
        assert_eq!(queued.target, Target::Peer(peer));
        assert_eq!(queued.message.recipient_id, Some(peer));
        assert!(queued.message.is_private);

        let stats = network.get_stats().await;
        assert_eq!(stats.counters.messages_enqueued, 1);
        assert_eq!(stats.counters.duplicates_rejected, 1);
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_scan_discovers_and_expires_peers() {
        let hub = MemoryHub::new();
        let _remote = hub.register("b", PeerId::new([2; 8]), 8);
        let id = PeerId::random();
        let discovery = Arc::new(StaticDiscovery::new(vec![hub.descriptor("b").unwrap()]));
        let network = MeshNetwork::builder(NetworkConfig {
            local_peer_id: Some(id),
            peer_stale_timeout_secs: 1,
            ..Default::default()
        })
        .connector(Arc::new(hub.connector(id)))
        .discovery(discovery.clone())
        .build()
        .unwrap();
        let mut events = network.subscribe();

        network.scan_now().await;
        assert_eq!(network.peers().len(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::PeerDiscovered {
                peer_id: PeerId::new([2; 8])
            }
        );

        discovery.remove(&PeerId::new([2; 8]));
        if let Some(mut peer) = network.inner.peers.get_mut(&PeerId::new([2; 8])) {
            peer.last_seen = Instant::now() - Duration::from_secs(5);
        }
        network.scan_now().await;
        assert!(network.peers().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::PeerLost {
                peer_id: PeerId::new([2; 8])
            }
        );
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_pending_relay() {
        let hub = MemoryHub::new();
        let _slow = hub.register("slow", PeerId::new([4; 8]), 8);
        hub.set_connect_delay("slow", Duration::from_secs(60));
        let id = PeerId::random();
        let network = MeshNetwork::builder(NetworkConfig {
            local_peer_id: Some(id),
            send_timeout_secs: 8,
            metrics_enabled: false,
            ..Default::default()
        })
        .connector(Arc::new(hub.connector(id)))
        .discovery(Arc::new(StaticDiscovery::new(vec![hub
            .descriptor("slow")
            .unwrap()])))
        .build()
        .unwrap();
        network.scan_now().await;
        network.start().await.unwrap();

        let origin = PeerId::new([5; 8]);
        let envelope = ChatMessage::new("far", "pass it on").encode().unwrap();
        let packet = Packet::new(PacketType::Message, 3, origin, envelope)
            .encode()
            .unwrap();
        network.receive(PeerId::new([6; 8]), packet).await;
        assert_eq!(network.get_stats().await.counters.messages_relayed, 1);

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(2), network.stop())
            .await
            .expect("stop waited on the relay")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unencodable_message_fails_without_retry() {
        let hub = MemoryHub::new();
        let id = PeerId::random();
        let network = MeshNetwork::builder(NetworkConfig {
            local_peer_id: Some(id),
            compression: false,
            metrics_enabled: false,
            ..Default::default()
        })
        .connector(Arc::new(hub.connector(id)))
        .build()
        .unwrap();
        let mut events = network.subscribe();
        network.start().await.unwrap();

        let oversized = ChatMessage::new("alice", vec![0u8; u16::MAX as usize]).with_id("huge");
        network
            .enqueue(oversized, Priority::Normal, None, None)
            .await
            .unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(TransportEvent::MessageFailed {
                    message_id,
                    attempts,
                    ..
                }) = events.recv().await
                {
                    return (message_id, attempts);
                }
            }
        })
        .await
        .expect("message was retried instead of failed");
        assert_eq!(failed, ("huge".to_string(), 1));

        let stats = network.get_stats().await;
        assert_eq!(stats.counters.messages_failed, 1);
        assert_eq!(stats.counters.messages_retried, 0);
        network.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_inbound_is_counted_and_dropped() {
        let hub = MemoryHub::new();
        let network = node(&hub, "a");
        network
            .receive(PeerId::new([3; 8]), Bytes::from_static(&[1, 2, 3]))
            .await;
        let stats = network.get_stats().await;
        assert_eq!(stats.counters.packets_dropped, 1);
        assert_eq!(stats.counters.bytes_received, 3);
    }
}
