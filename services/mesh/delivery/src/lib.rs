//! Outbound delivery for bitmesh.
//!
//! - [`DeliveryQueue`]: priority queue (critical, high, normal, low) with
//!   FIFO ordering inside a priority, exponential retry backoff and duplicate
//!   rejection through a shared [`DuplicateWindow`](mesh_storage::DuplicateWindow)
//! - [`EventNotifier`]: broadcast of [`TransportEvent`]s plus registered
//!   [`MessageHandler`] callbacks for inbound messages
//! - [`TransportCounters`]: lock-free counters with a periodic [`MetricsReporter`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event_notifier;
pub mod message_queue;
pub mod metrics;

// Re-export main types
pub use event_notifier::{EventNotifier, MessageHandler, TransportEvent};
pub use message_queue::{
    DeliveryQueue, EnqueueError, MessageQueueConfig, Priority, QueueSnapshot, QueuedMessage,
    RetryOutcome, Target,
};
pub use metrics::{check_health, failure_rate, log_metrics, CounterSnapshot, MetricsReporter, TransportCounters};
