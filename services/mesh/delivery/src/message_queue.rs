//! Priority delivery queue with retry backoff and duplicate rejection

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mesh_storage::DuplicateWindow;
use mesh_wire::{ChatMessage, PeerId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::metrics::TransportCounters;

/// Configuration for delivery queue behaviour
#[derive(Debug, Clone)]
pub struct MessageQueueConfig {
    /// Delivery attempts before a message is finally failed
    pub max_attempts: u32,
    /// Base retry interval (exponential backoff)
    pub base_retry_interval: Duration,
    /// Maximum retry interval
    pub max_retry_interval: Duration,
    /// Maximum queued messages, ready and delayed combined
    pub capacity: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            capacity: 1024,
        }
    }
}

/// Message urgency; lower values are sent first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Priority {
    /// Control traffic and urgent messages
    Critical = 1,
    /// Private messages
    High = 2,
    /// Regular chat
    Normal = 3,
    /// Background traffic
    Low = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(name)
    }
}

/// Where a message should go
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every reachable peer
    Broadcast,
    /// One peer, relayed if it is not a neighbour
    Peer(PeerId),
    /// A named channel
    Channel(String),
}

/// Why a message was not accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// Message id seen within the duplicate window
    #[error("duplicate message {0}")]
    Duplicate(String),
    /// Queue is at capacity
    #[error("delivery queue full")]
    QueueFull,
}

/// Outcome of reporting a failed delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Message rescheduled
    Scheduled {
        /// Attempts made so far
        attempts: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Attempts exhausted; message dropped
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
}

/// Queued message with retry information
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The message to deliver
    pub message: ChatMessage,
    /// Urgency
    pub priority: Priority,
    /// Destination
    pub target: Target,
    /// Failed attempts so far
    pub attempts: u32,
    /// When this message was first queued
    pub queued_at: Instant,
    /// Earliest time of the next attempt
    pub next_retry_at: Instant,
    seq: u64,
}

impl QueuedMessage {
    /// Message id
    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Ready heap entry: most urgent priority first, then FIFO
#[derive(Debug)]
struct Ready(QueuedMessage);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Delayed heap entry: earliest deadline first
#[derive(Debug)]
struct Delayed(QueuedMessage);

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .next_retry_at
            .cmp(&self.0.next_retry_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Delayed>,
    next_seq: u64,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .map(|entry| entry.0.next_retry_at <= now)
            .unwrap_or(false)
        {
            if let Some(Delayed(message)) = self.delayed.pop() {
                self.ready.push(Ready(message));
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|entry| entry.0.next_retry_at)
    }
}

/// Per-priority queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Ready critical messages
    pub critical: usize,
    /// Ready high-priority messages
    pub high: usize,
    /// Ready normal messages
    pub normal: usize,
    /// Ready low-priority messages
    pub low: usize,
    /// Messages waiting for their retry deadline
    pub delayed: usize,
}

impl QueueSnapshot {
    /// All queued messages
    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low + self.delayed
    }
}

/// Outbound delivery queue.
///
/// Messages are popped by priority, then in insertion order. Failed messages
/// are parked until their backoff deadline and then compete again with their
/// original sequence number.
#[derive(Debug)]
pub struct DeliveryQueue {
    config: MessageQueueConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    dedup: Arc<DuplicateWindow>,
    counters: Arc<TransportCounters>,
}

impl DeliveryQueue {
    /// Create a queue consulting `dedup` on enqueue
    pub fn new(
        config: MessageQueueConfig,
        dedup: Arc<DuplicateWindow>,
        counters: Arc<TransportCounters>,
    ) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            dedup,
            counters,
        }
    }

    /// Queue configuration
    pub fn config(&self) -> &MessageQueueConfig {
        &self.config
    }

    /// Accept a message unless it is a duplicate or the queue is full
    pub async fn enqueue(
        &self,
        message: ChatMessage,
        priority: Priority,
        target: Target,
    ) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().await;
        if inner.len() >= self.config.capacity {
            warn!("delivery queue full, rejecting message {}", message.id);
            return Err(EnqueueError::QueueFull);
        }
        if !self.dedup.check_and_insert(&message.id) {
            debug!("rejecting duplicate message {}", message.id);
            self.counters.incr_duplicates();
            return Err(EnqueueError::Duplicate(message.id));
        }

        let now = Instant::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(
            "queued message {} ({} priority, seq {})",
            message.id, priority, seq
        );
        inner.ready.push(Ready(QueuedMessage {
            message,
            priority,
            target,
            attempts: 0,
            queued_at: now,
            next_retry_at: now,
            seq,
        }));
        drop(inner);

        self.counters.incr_enqueued();
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the most urgent message that is due, without waiting
    pub async fn pop(&self) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock().await;
        inner.promote_due(Instant::now());
        inner.ready.pop().map(|Ready(message)| message)
    }

    /// Pop the most urgent due message, waiting up to `wait` for one
    pub async fn pop_timeout(&self, wait: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut inner = self.inner.lock().await;
                inner.promote_due(Instant::now());
                if let Some(Ready(message)) = inner.ready.pop() {
                    return Some(message);
                }
                inner.next_deadline()
            };

            if Instant::now() >= deadline {
                return None;
            }
            let wake_at = next_deadline.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Report a failed attempt; reschedules with backoff or finally fails the message
    pub async fn retry(&self, mut message: QueuedMessage) -> RetryOutcome {
        message.attempts += 1;
        if message.attempts >= self.config.max_attempts {
            warn!(
                "message {} failed after {} attempts",
                message.message.id, message.attempts
            );
            self.counters.incr_failed();
            return RetryOutcome::Exhausted {
                attempts: message.attempts,
            };
        }

        let delay = self.backoff(message.attempts);
        message.next_retry_at = Instant::now() + delay;
        let attempts = message.attempts;
        info!(
            "retrying message {} in {:?} (attempt {}/{})",
            message.message.id, delay, attempts, self.config.max_attempts
        );

        self.inner.lock().await.delayed.push(Delayed(message));
        self.counters.incr_retried();
        self.notify.notify_one();
        RetryOutcome::Scheduled { attempts, delay }
    }

    /// Fail a message that can never be sent; no further attempts are made
    pub fn fail(&self, message: QueuedMessage) -> RetryOutcome {
        let attempts = message.attempts + 1;
        warn!(
            "message {} failed permanently on attempt {}",
            message.message.id, attempts
        );
        self.counters.incr_failed();
        RetryOutcome::Exhausted { attempts }
    }

    /// Return an interrupted message to the queue without counting an attempt
    pub async fn requeue(&self, message: QueuedMessage) {
        debug!("requeued message {}", message.message.id);
        self.inner.lock().await.ready.push(Ready(message));
        self.notify.notify_one();
    }

    /// Record a successful delivery
    pub fn mark_delivered(&self, message: &QueuedMessage) {
        debug!(
            "message {} delivered after {} failed attempts",
            message.message.id, message.attempts
        );
        self.counters.incr_delivered();
    }

    /// Backoff before attempt number `attempts + 1`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts);
        self.config
            .base_retry_interval
            .saturating_mul(factor)
            .min(self.config.max_retry_interval)
    }

    /// Queued messages, ready and delayed
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether nothing is queued
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Per-priority depth
    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut snapshot = QueueSnapshot {
            delayed: inner.delayed.len(),
            ..Default::default()
        };
        for Ready(message) in inner.ready.iter() {
            match message.priority {
                Priority::Critical => snapshot.critical += 1,
                Priority::High => snapshot.high += 1,
                Priority::Normal => snapshot.normal += 1,
                Priority::Low => snapshot.low += 1,
            }
        }
        snapshot
    }

    /// Drop everything queued
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dropped = inner.len();
        inner.ready.clear();
        inner.delayed.clear();
        dropped
    }
}
