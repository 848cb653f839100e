//! Rate limiting for hot-path log lines
//!
//! The capture, pump and encode loops run at frame rate. A condition such as
//! "write slot still busy" can repeat every frame, so those warnings are
//! routed through a [`LogThrottler`] keyed by a static message id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a message with the same key is emitted
pub struct LogThrottler {
    last_logged: Mutex<HashMap<&'static str, (Instant, u64)>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when the message should be logged now,
    /// where `suppressed` is how many occurrences were swallowed since the
    /// last emitted one.
    pub fn check(&self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get_mut(key) {
            Some((last, skipped)) if now.duration_since(*last) < self.interval => {
                *skipped += 1;
                None
            }
            Some(entry) => {
                let skipped = entry.1;
                *entry = (now, 0);
                Some(skipped)
            }
            None => {
                map.insert(key, (now, 0));
                Some(0)
            }
        }
    }

    /// Whether the message should be logged now
    pub fn should_log(&self, key: &'static str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key once its condition has recovered
    pub fn clear(&self, key: &'static str) {
        self.last_logged.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `tracing::debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}
