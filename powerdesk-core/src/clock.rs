//! Time sources for cache bookkeeping
//!
//! Timers elsewhere in the crate go through `tokio::time`, so a paused test
//! runtime drives them. The cache store reads time through [`Clock`] so it can
//! also be exercised without a runtime.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Longest span a TTL or timer period is taken at face value. Longer spans
/// (up to `Duration::MAX`) are clamped and mean "practically never".
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `delay` clamped to [`MAX_DELAY`]
pub fn bounded(delay: Duration) -> Duration {
    delay.min(MAX_DELAY)
}

/// `now + delay` that cannot overflow
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    let delay = bounded(delay);
    now.checked_add(delay)
        .or_else(|| now.checked_add(Duration::from_secs(60 * 60 * 24)))
        .unwrap_or(now)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Follows the tokio clock (virtual when the runtime is paused)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
