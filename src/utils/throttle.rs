//! Rate limiting for repeated log messages
//!
//! A device that keeps failing would otherwise log the same error every
//! acquisition cycle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Limits how often a message with the same key is logged.
///
/// ```rust
/// use camstream::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("acquire_failed").is_some());
/// assert!(throttler.should_log("acquire_failed").is_none());
/// ```
#[derive(Debug)]
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

    /// `Some(n)` if the message should be logged now, where `n` is how many
    /// repeats were swallowed since it was last logged; `None` to stay quiet.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, so its next occurrence is logged immediately
    pub fn clear(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling_counts_suppressed() {
        let throttler = LogThrottler::new(Duration::from_millis(50));
        assert_eq!(throttler.should_log("k"), Some(0));
        assert_eq!(throttler.should_log("k"), None);
        assert_eq!(throttler.should_log("k"), None);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(throttler.should_log("k"), Some(2));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(5);
        assert!(throttler.should_log("a").is_some());
        assert!(throttler.should_log("b").is_some());
        assert!(throttler.should_log("a").is_none());
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(5);
        throttler.should_log("a");
        throttler.clear("a");
        assert_eq!(throttler.should_log("a"), Some(0));
        throttler.clear_all();
        assert_eq!(throttler.should_log("a"), Some(0));
    }
}
