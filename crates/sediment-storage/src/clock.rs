//! Monotonic microsecond clock for record timestamps.
//!
//! Record headers carry a microsecond timestamp relative to the partition
//! epoch. OS clocks can repeat readings (coarse resolution) or step
//! backwards (NTP); the [`MonotonicClock`] therefore composes a
//! process-start [`Instant`] base with the wall clock observed at
//! construction, and clamps every reading to be strictly greater than the
//! previous one.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Strictly increasing microsecond timestamps since a configurable epoch.
///
/// `time()` returns `max(last + 1, now)` where `now` is derived from a
/// hi-resolution monotonic base, so consecutive calls never return the same
/// value even when the OS reading has not advanced. Accuracy is at best
/// about one microsecond.
///
/// The clock is owned by a single writer; it is deliberately not `Sync`.
#[derive(Debug)]
pub struct MonotonicClock {
    /// Hi-resolution base captured at construction.
    base: Instant,
    /// Wall-clock micros between the epoch and `base`.
    offset_micros: u64,
    /// Last value handed out.
    last: u64,
}

impl MonotonicClock {
    /// Creates a clock measuring microseconds since `epoch_ms`
    /// (milliseconds since the Unix epoch).
    ///
    /// A restart constructs a fresh clock from the current wall time, so
    /// successive process lifetimes produce near-continuous values as long
    /// as the system clock is sane. An epoch in the future yields offset 0;
    /// timestamps then grow from the process start.
    pub fn new(epoch_ms: u64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let epoch = Duration::from_millis(epoch_ms);
        let offset = now.checked_sub(epoch).unwrap_or(Duration::ZERO);
        Self {
            base: Instant::now(),
            offset_micros: offset.as_micros() as u64,
            last: 0,
        }
    }

    /// Returns the current epoch-relative time in microseconds, strictly
    /// greater than any previously returned value.
    pub fn time(&mut self) -> u64 {
        let elapsed = self.base.elapsed().as_micros() as u64;
        let now = self.offset_micros + elapsed;
        self.last = now.max(self.last + 1);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_strictly_increasing() {
        let mut clock = MonotonicClock::new(0);
        let mut last = 0;
        for _ in 0..10_000 {
            let t = clock.time();
            assert!(t > last, "clock went backwards: {t} <= {last}");
            last = t;
        }
    }

    #[test]
    fn time_tracks_wall_clock_scale() {
        let epoch_ms = 1_500_000_000_000u64; // mid-2017
        let mut clock = MonotonicClock::new(epoch_ms);
        let t = clock.time();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;
        let expected = wall - epoch_ms * 1000;
        // Within a second of the expected epoch-relative reading.
        assert!(t.abs_diff(expected) < 1_000_000, "t={t} expected≈{expected}");
    }

    #[test]
    fn future_epoch_clamps_to_zero_offset() {
        let future_ms = (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64)
            + 60_000;
        let mut clock = MonotonicClock::new(future_ms);
        // Still strictly positive and increasing, just small.
        let t1 = clock.time();
        let t2 = clock.time();
        assert!(t1 >= 1);
        assert!(t2 > t1);
        assert!(t1 < 10_000_000, "offset should have clamped, got {t1}");
    }
}
