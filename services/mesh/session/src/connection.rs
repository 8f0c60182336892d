//! Per-peer connection state machine and outbound drain task.
//!
//! ```text
//! Disconnected --admitted--> Connecting --ok--> Connected
//!                                 |                 |
//!                       attempts exhausted    write failure
//!                                 v                 v
//!                               Error             Error
//! ```
//!
//! Each connection owns a bounded FIFO of outbound packets. A dedicated task
//! waits for a pool slot, establishes the link and then writes queued packets
//! in order. The link is owned by that task alone.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mesh_wire::PeerId;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::pool::PoolEvent;
use crate::transport::{Link, LinkConnector, PeerDescriptor};

/// Configuration for individual connections
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Deadline for a single connect attempt
    pub connect_timeout: Duration,
    /// Connect attempts before the connection enters `Error`
    pub max_connection_attempts: u32,
    /// Delay after the first failed attempt; doubles after each failure
    pub retry_backoff: Duration,
    /// Outbound packets buffered per connection
    pub queue_capacity: usize,
    /// Deadline for a single link write
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_connection_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            queue_capacity: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Not connected (waiting for a slot, or torn down)
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Link established
    Connected,
    /// Connect attempts exhausted or the link failed
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Per-connection counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Packets written to the link
    pub packets_sent: u64,
    /// Bytes written to the link
    pub bytes_sent: u64,
    /// Packets waiting in the outbound queue
    pub queued: usize,
    /// Connect attempts made
    pub attempts: u32,
}

/// Why a drain task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionExit {
    /// Released, evicted, replaced or shut down
    Closed,
    /// Connect attempts exhausted
    Failed,
    /// Link write failed
    LinkLost,
}

#[derive(Debug)]
pub(crate) struct OutboundFrame {
    bytes: Bytes,
    done: oneshot::Sender<Result<(), SessionError>>,
}

/// Resolves once a queued packet was written to the link (or dropped)
#[derive(Debug)]
pub struct WriteReceipt {
    peer_id: PeerId,
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl WriteReceipt {
    /// Wait for the write outcome
    pub async fn wait(self) -> Result<(), SessionError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Closed(self.peer_id)),
        }
    }
}

/// A pooled connection to one peer
#[derive(Debug)]
pub struct Connection {
    id: u64,
    descriptor: PeerDescriptor,
    state: watch::Sender<ConnectionState>,
    admitted: AtomicBool,
    admit_signal: Notify,
    attempts: AtomicU32,
    created_at: Instant,
    last_seen_ms: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        descriptor: PeerDescriptor,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Arc::new(Self {
            id,
            descriptor,
            state,
            admitted: AtomicBool::new(false),
            admit_signal: Notify::new(),
            attempts: AtomicU32::new(0),
            created_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            outbound,
            cancel: CancellationToken::new(),
        });
        (connection, rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Peer this connection talks to
    pub fn peer_id(&self) -> PeerId {
        self.descriptor.peer_id
    }

    /// Descriptor the connection was opened with
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection holds a pool slot
    pub fn is_admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    /// Connect attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Last successful write, connect, or inbound packet
    pub fn last_seen(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Record activity on this connection
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.created_at);
        self.last_seen_ms
            .fetch_max(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Packets waiting to be written
    pub fn queued(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Counters snapshot
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            queued: self.queued(),
            attempts: self.attempts(),
        }
    }

    /// Queue a packet for writing.
    ///
    /// Packets queued before the link is up are flushed in order once it is.
    pub fn send(&self, packet: Bytes) -> Result<WriteReceipt, SessionError> {
        let peer_id = self.peer_id();
        if self.cancel.is_cancelled() || self.state() == ConnectionState::Error {
            return Err(SessionError::Closed(peer_id));
        }

        let (done, rx) = oneshot::channel();
        match self.outbound.try_send(OutboundFrame {
            bytes: packet,
            done,
        }) {
            Ok(()) => Ok(WriteReceipt { peer_id, rx }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SessionError::QueueFull(peer_id)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::Closed(peer_id)),
        }
    }

    /// Wait until the connection is `Connected`, failing if it reaches `Error` or is closed
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.state.subscribe();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            state = rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Error)) => {
                state.ok().map(|s| *s)
            }
        };

        match outcome {
            Some(ConnectionState::Connected) => Ok(()),
            Some(_) => Err(SessionError::ConnectionFailed {
                peer: self.peer_id(),
                attempts: self.attempts(),
            }),
            None => Err(SessionError::Closed(self.peer_id())),
        }
    }

    pub(crate) fn admit(&self) {
        if !self.admitted.swap(true, Ordering::AcqRel) {
            self.admit_signal.notify_one();
        }
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                "connection {} {} -> {}",
                self.peer_id().short(),
                previous,
                state
            );
        }
    }

    /// Drain task body: wait for a slot, connect, then write queued packets in order.
    pub(crate) async fn run(
        self: Arc<Self>,
        connector: Arc<dyn LinkConnector>,
        config: ConnectionConfig,
        mut rx: mpsc::Receiver<OutboundFrame>,
        events: broadcast::Sender<PoolEvent>,
    ) -> ConnectionExit {
        let peer_id = self.peer_id();

        if !self.is_admitted() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    fail_pending(&mut rx, SessionError::Closed(peer_id));
                    return ConnectionExit::Closed;
                }
                _ = self.admit_signal.notified() => {}
            }
        }

        let mut link = match self.establish(connector.as_ref(), &config).await {
            Ok(link) => link,
            Err(err) => {
                let exit = match err {
                    SessionError::ConnectionFailed { attempts, .. } => {
                        let _ = events.send(PoolEvent::ConnectionFailed { peer_id, attempts });
                        ConnectionExit::Failed
                    }
                    _ => ConnectionExit::Closed,
                };
                fail_pending(&mut rx, err);
                return exit;
            }
        };
        let _ = events.send(PoolEvent::Connected { peer_id });

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ConnectionExit::Closed,
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        break ConnectionExit::Closed;
                    };
                    let len = frame.bytes.len() as u64;
                    match timeout(config.write_timeout, link.write(frame.bytes)).await {
                        Ok(Ok(())) => {
                            self.packets_sent.fetch_add(1, Ordering::Relaxed);
                            self.bytes_sent.fetch_add(len, Ordering::Relaxed);
                            self.touch();
                            let _ = frame.done.send(Ok(()));
                        }
                        Ok(Err(e)) => {
                            warn!("write to {} failed: {}", peer_id.short(), e);
                            self.set_state(ConnectionState::Error);
                            let _ = frame.done.send(Err(SessionError::Write {
                                peer: peer_id,
                                reason: e.to_string(),
                            }));
                            break ConnectionExit::LinkLost;
                        }
                        Err(_) => {
                            warn!("write to {} timed out", peer_id.short());
                            self.set_state(ConnectionState::Error);
                            let _ = frame.done.send(Err(SessionError::Timeout("link write")));
                            break ConnectionExit::LinkLost;
                        }
                    }
                }
            }
        };

        link.close().await;
        if exit != ConnectionExit::LinkLost {
            self.set_state(ConnectionState::Disconnected);
        }
        fail_pending(&mut rx, SessionError::Closed(peer_id));
        let _ = events.send(PoolEvent::Disconnected { peer_id });
        info!("connection to {} closed ({:?})", peer_id.short(), exit);
        exit
    }

    async fn establish(
        &self,
        connector: &dyn LinkConnector,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Link>, SessionError> {
        let peer_id = self.peer_id();
        let max_attempts = config.max_connection_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.attempts.store(attempt, Ordering::Relaxed);
            self.set_state(ConnectionState::Connecting);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Closed(peer_id)),
                result = timeout(config.connect_timeout, connector.connect(&self.descriptor)) => result,
            };

            match result {
                Ok(Ok(link)) => {
                    self.touch();
                    self.set_state(ConnectionState::Connected);
                    info!(
                        "connected to {} at {} (attempt {})",
                        peer_id.short(),
                        self.descriptor.address,
                        attempt
                    );
                    return Ok(link);
                }
                Ok(Err(e)) => warn!(
                    "connect attempt {}/{} to {} failed: {}",
                    attempt,
                    max_attempts,
                    peer_id.short(),
                    e
                ),
                Err(_) => warn!(
                    "connect attempt {}/{} to {} timed out after {:?}",
                    attempt,
                    max_attempts,
                    peer_id.short(),
                    config.connect_timeout
                ),
            }

            if attempt < max_attempts {
                let backoff = config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SessionError::Closed(peer_id)),
                    _ = sleep(backoff) => {}
                }
            }
        }

        self.set_state(ConnectionState::Error);
        Err(SessionError::ConnectionFailed {
            peer: peer_id,
            attempts: max_attempts,
        })
    }
}

fn fail_pending(rx: &mut mpsc::Receiver<OutboundFrame>, err: SessionError) {
    rx.close();
    while let Ok(frame) = rx.try_recv() {
        let _ = frame.done.send(Err(err.clone()));
    }
}
