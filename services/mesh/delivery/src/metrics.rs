//! Transport counters and periodic metrics logging

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport-wide counters, updated lock-free from every task
#[derive(Debug, Default)]
pub struct TransportCounters {
    messages_enqueued: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
    messages_retried: AtomicU64,
    duplicates_rejected: AtomicU64,
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
    fragments_sent: AtomicU64,
    fragments_reassembled: AtomicU64,
    reassembly_timeouts: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of [`TransportCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Messages accepted into the delivery queue
    pub messages_enqueued: u64,
    /// Messages handed to at least one neighbour
    pub messages_delivered: u64,
    /// Messages that exhausted their attempts
    pub messages_failed: u64,
    /// Delivery attempts rescheduled after a failure
    pub messages_retried: u64,
    /// Messages rejected as duplicates (outbound and inbound)
    pub duplicates_rejected: u64,
    /// Inbound messages delivered to the application
    pub messages_received: u64,
    /// Inbound messages forwarded to other neighbours
    pub messages_relayed: u64,
    /// Packets written to links
    pub packets_sent: u64,
    /// Inbound packets dropped (malformed, orphaned, undecryptable)
    pub packets_dropped: u64,
    /// Fragment packets written
    pub fragments_sent: u64,
    /// Messages rebuilt from fragments
    pub fragments_reassembled: u64,
    /// Partial messages abandoned by the sweep
    pub reassembly_timeouts: u64,
    /// Bytes written to links
    pub bytes_sent: u64,
    /// Bytes received from links
    pub bytes_received: u64,
}

macro_rules! counter {
    ($incr:ident, $add:ident, $field:ident) => {
        /// Increment by one
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Increment by `n`
        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl TransportCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    counter!(incr_enqueued, add_enqueued, messages_enqueued);
    counter!(incr_delivered, add_delivered, messages_delivered);
    counter!(incr_failed, add_failed, messages_failed);
    counter!(incr_retried, add_retried, messages_retried);
    counter!(incr_duplicates, add_duplicates, duplicates_rejected);
    counter!(incr_received, add_received, messages_received);
    counter!(incr_relayed, add_relayed, messages_relayed);
    counter!(incr_packets_sent, add_packets_sent, packets_sent);
    counter!(incr_dropped, add_dropped, packets_dropped);
    counter!(incr_fragments_sent, add_fragments_sent, fragments_sent);
    counter!(incr_reassembled, add_reassembled, fragments_reassembled);
    counter!(incr_reassembly_timeouts, add_reassembly_timeouts, reassembly_timeouts);
    counter!(incr_bytes_sent, add_bytes_sent, bytes_sent);
    counter!(incr_bytes_received, add_bytes_received, bytes_received);

    /// Copy current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_enqueued: self.messages_enqueued.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            messages_retried: self.messages_retried.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_reassembled: self.fragments_reassembled.load(Ordering::Relaxed),
            reassembly_timeouts: self.reassembly_timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Periodically logs transport counters and warns on unhealthy ratios
#[derive(Debug)]
pub struct MetricsReporter {
    counters: Arc<TransportCounters>,
    interval: Duration,
}

impl MetricsReporter {
    /// Create a reporter logging every 60 seconds
    pub fn new(counters: Arc<TransportCounters>) -> Self {
        Self {
            counters,
            interval: Duration::from_secs(60),
        }
    }

    /// Set the reporting interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Report until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.tick().await;
        info!("Starting transport metrics reporter (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.counters.snapshot();
                    log_metrics(&snapshot);
                    check_health(&snapshot);
                }
            }
        }
        debug!("transport metrics reporter stopped");
    }
}

/// Log a counter snapshot
pub fn log_metrics(stats: &CounterSnapshot) {
    info!(
        "Transport Metrics - Enqueued: {}, Delivered: {}, Failed: {}, Retried: {}, Duplicates: {}, Received: {}, Relayed: {}, Dropped: {}, Fragments sent/reassembled: {}/{}, Bytes out/in: {}/{}",
        stats.messages_enqueued,
        stats.messages_delivered,
        stats.messages_failed,
        stats.messages_retried,
        stats.duplicates_rejected,
        stats.messages_received,
        stats.messages_relayed,
        stats.packets_dropped,
        stats.fragments_sent,
        stats.fragments_reassembled,
        stats.bytes_sent,
        stats.bytes_received
    );
}

/// Failure share of finished deliveries, in percent
pub fn failure_rate(stats: &CounterSnapshot) -> Option<f64> {
    let finished = stats.messages_delivered + stats.messages_failed;
    if finished == 0 {
        return None;
    }
    Some(stats.messages_failed as f64 / finished as f64 * 100.0)
}

/// Warn when delivery or reassembly failure rates look unhealthy
pub fn check_health(stats: &CounterSnapshot) {
    if let Some(rate) = failure_rate(stats) {
        if rate > 10.0 {
            warn!(
                "High delivery failure rate: {:.1}% ({}/{})",
                rate,
                stats.messages_failed,
                stats.messages_delivered + stats.messages_failed
            );
        }
    }

    let reassembly_total = stats.fragments_reassembled + stats.reassembly_timeouts;
    if reassembly_total > 0 {
        let timeout_rate = stats.reassembly_timeouts as f64 / reassembly_total as f64 * 100.0;
        if timeout_rate > 20.0 {
            warn!(
                "High reassembly timeout rate: {:.1}% ({}/{})",
                timeout_rate, stats.reassembly_timeouts, reassembly_total
            );
        }
    }
}
