//! User-key deduplication for index events.
//!
//! Events that omit the full user payload reference the user by key only;
//! an index event carrying the payload is emitted the first time a key is
//! seen within a window.  The deduplicator decides "first time or not".

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Gate for redundant inline-user payloads.
///
/// Touched only by the dispatcher task, so implementations need no
/// interior synchronization.
pub trait UserDeduplicator: Send {
    /// Preferred period for periodic [`flush`](Self::flush) calls, if any.
    /// `None` means dedup state persists until shutdown.
    fn flush_interval(&self) -> Option<Duration>;

    /// Record `key` and report whether it was unseen in the current window
    /// (true = the caller should emit an index event).  Seeing a known key
    /// refreshes its recency.
    fn process_user(&mut self, key: &str) -> bool;

    /// Mark `key` as seen without asking for an index event.  Used for
    /// identify events, which already carry the full user.
    fn notice_user(&mut self, key: &str);

    /// Reset the window: forget every key.
    fn flush(&mut self);
}

// ---------------------------------------------------------------------------
// Default implementation: bounded LRU set
// ---------------------------------------------------------------------------

/// Bounded set of recently seen user keys; oldest evicted at capacity.
#[derive(Debug)]
pub struct LruUserDeduplicator {
    capacity: usize,
    flush_interval: Option<Duration>,
    seen: HashSet<String>,
    /// Recency order, oldest at the front.  Parallel to `seen`.
    order: VecDeque<String>,
}

impl LruUserDeduplicator {
    pub fn new(capacity: usize, flush_interval: Option<Duration>) -> Self {
        LruUserDeduplicator {
            capacity: capacity.max(1),
            flush_interval,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
                self.order.push_back(key.to_owned());
            }
            return false;
        }
        if self.seen.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.to_owned());
        self.order.push_back(key.to_owned());
        true
    }
}

impl UserDeduplicator for LruUserDeduplicator {
    fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    fn process_user(&mut self, key: &str) -> bool {
        self.touch(key)
    }

    fn notice_user(&mut self, key: &str) {
        self.touch(key);
    }

    fn flush(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}
