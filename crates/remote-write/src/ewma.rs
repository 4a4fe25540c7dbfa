use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// A tick-based exponentially-weighted moving rate of a monotonic counter.
///
/// `incr` is called concurrently by many producers; `tick` has exactly one
/// caller which drives it at the configured interval. The rate starts at
/// zero and never goes negative.
pub struct EwmaRate {
    pending: AtomicI64,
    rate_bits: AtomicU64,
    alpha: f64,
    interval: Duration,
}

impl EwmaRate {
    pub fn new(alpha: f64, interval: Duration) -> Self {
        debug_assert!(alpha > 0.0 && alpha < 1.0);
        Self {
            pending: AtomicI64::new(0),
            rate_bits: AtomicU64::new(0.0_f64.to_bits()),
            alpha,
            interval,
        }
    }

    /// Add `delta` events to the pending count.
    pub fn incr(&self, delta: i64) {
        self.pending.fetch_add(delta, Ordering::Relaxed);
    }

    /// Fold the pending count into the rate:
    /// `rate <- alpha * (pending / interval) + (1 - alpha) * rate`.
    pub fn tick(&self) {
        let delta = self.pending.swap(0, Ordering::Relaxed);
        let instant_rate = delta as f64 / self.interval.as_secs_f64();
        let prev = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
        let next = (self.alpha * instant_rate + (1.0 - self.alpha) * prev).max(0.0);
        self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    /// The rate as of the last tick, in events per second.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }
}
