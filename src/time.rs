use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process-wide time source handed to the store at construction.
///
/// All engine timestamps are relative seconds since the clock was created;
/// expiry times are absolute unix seconds. The `advance` hook skews both
/// views forward and exists so age- and lock-based behavior can be driven
/// deterministically (the persistence pipeline gates on seconds-granularity
/// ages, not wall-clock instants).
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    epoch: Instant,
    unix_epoch: u64,
    skew: AtomicU64,
}

impl Clock {
    /// Creates a clock anchored at the current wall time.
    pub fn new() -> Self {
        let unix_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Clock {
            inner: Arc::new(ClockInner {
                epoch: Instant::now(),
                unix_epoch,
                skew: AtomicU64::new(0),
            }),
        }
    }

    /// Relative seconds since the clock was created.
    pub fn now(&self) -> u32 {
        let elapsed = self.inner.epoch.elapsed().as_secs() + self.inner.skew.load(Ordering::Relaxed);
        elapsed.min(u64::from(u32::MAX)) as u32
    }

    /// Converts a relative timestamp into absolute unix seconds.
    pub fn abs_time(&self, rel: u32) -> u64 {
        self.inner.unix_epoch + u64::from(rel)
    }

    /// Current absolute unix seconds.
    pub fn real_time(&self) -> u64 {
        self.abs_time(self.now())
    }

    /// Skews the clock forward by `secs`. Testing hook.
    pub fn advance(&self, secs: u64) {
        self.inner.skew.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_skews_both_views() {
        let c = Clock::new();
        let rel = c.now();
        let abs = c.real_time();
        c.advance(100);
        assert!(c.now() >= rel + 100);
        assert!(c.real_time() >= abs + 100);
    }

    #[test]
    fn abs_time_is_stable_for_a_given_rel() {
        let c = Clock::new();
        let rel = c.now();
        let a = c.abs_time(rel);
        c.advance(50);
        assert_eq!(a, c.abs_time(rel));
    }
}
