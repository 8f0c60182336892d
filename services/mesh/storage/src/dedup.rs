//! Time-windowed duplicate suppression keyed by message id.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

/// Default time a message id is remembered
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(300);

/// Remembers recently seen message ids.
///
/// Check-and-insert is atomic per id, so two tasks racing on the same id see
/// exactly one acceptance.
#[derive(Debug)]
pub struct DuplicateWindow {
    seen: DashMap<String, Instant>,
    window: Duration,
}

impl DuplicateWindow {
    /// Create a window remembering ids for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    /// Configured window length
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `id`. Returns `true` if it was not seen within the window.
    pub fn check_and_insert(&self, id: &str) -> bool {
        self.check_and_insert_at(id, Instant::now())
    }

    /// Same as [`check_and_insert`](Self::check_and_insert) with an explicit clock reading
    pub fn check_and_insert_at(&self, id: &str, now: Instant) -> bool {
        match self.seen.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) < self.window {
                    debug!("duplicate message id {}", id);
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Whether `id` was seen within the window
    pub fn contains(&self, id: &str) -> bool {
        let now = Instant::now();
        self.seen
            .get(id)
            .map(|at| now.saturating_duration_since(*at) < self.window)
            .unwrap_or(false)
    }

    /// Forget ids older than the window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Same as [`sweep`](Self::sweep) with an explicit clock reading
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < self.window);
        before.saturating_sub(self.seen.len())
    }

    /// Number of remembered ids
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no ids are remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DuplicateWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_WINDOW)
    }
}
