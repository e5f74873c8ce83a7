//! Log throttling
//!
//! Limits how often the same message is recorded so a device that keeps
//! failing does not flood the log. Suppressed occurrences are counted and
//! reported with the next message that gets through.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Limits how often the same message key is logged
///
/// ```rust
/// use std::time::Duration;
/// use v4l2_relay::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("device_error"));
/// assert!(!throttler.should_log("device_error"));
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// `Some(n)` when the message should be logged now, `n` being how many
    /// occurrences were swallowed since the last one; `None` when throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed = entry.suppressed.saturating_add(1);
                None
            }
            Some(entry) => {
                entry.last = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Whether the message should be logged now
    pub fn should_log(&self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget `key` once its condition recovers, so the next occurrence is
    /// logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}
