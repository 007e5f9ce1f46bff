//! Timestamps taken from the POSIX clocks.
//!
//! Restart bookkeeping uses `CLOCK_MONOTONIC` so wall-clock jumps cannot
//! age a crash episode out early. The supervisor start time is the only
//! value recorded with `CLOCK_REALTIME`. Both clocks are system-wide, which
//! lets an out-of-process reader compare a stored monotonic value with its
//! own reading.

use nix::time::{ClockId, clock_gettime};
use serde::Serialize;
use std::time::Duration;

/// Seconds + nanoseconds reading of one of the system clocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp {
    /// Whole seconds.
    pub secs: i64,
    /// Nanoseconds within the second (`0..1_000_000_000`).
    pub nanos: i64,
}

impl Timestamp {
    /// The clock origin; used for "never happened".
    pub const ZERO: Self = Self { secs: 0, nanos: 0 };

    /// Build a timestamp from raw parts.
    pub const fn new(secs: i64, nanos: i64) -> Self {
        Self { secs, nanos }
    }

    /// Current `CLOCK_MONOTONIC` reading.
    pub fn monotonic() -> Self {
        Self::read(ClockId::CLOCK_MONOTONIC)
    }

    /// Current `CLOCK_REALTIME` reading.
    pub fn realtime() -> Self {
        Self::read(ClockId::CLOCK_REALTIME)
    }

    fn read(clock: ClockId) -> Self {
        // clock_gettime only fails for clock ids the kernel does not know.
        match clock_gettime(clock) {
            Ok(ts) => Self::new(ts.tv_sec() as i64, ts.tv_nsec() as i64),
            Err(_) => Self::ZERO,
        }
    }

    /// `true` for [`Timestamp::ZERO`].
    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.nanos == 0
    }

    /// Difference in whole seconds, ignoring the sub-second part.
    pub const fn whole_secs_since(&self, earlier: Timestamp) -> i64 {
        self.secs - earlier.secs
    }

    /// This timestamp moved forward by `d`.
    pub fn saturating_add(self, d: Duration) -> Self {
        let mut secs = self.secs.saturating_add(d.as_secs() as i64);
        let mut nanos = self.nanos + i64::from(d.subsec_nanos());
        if nanos >= 1_000_000_000 {
            secs = secs.saturating_add(1);
            nanos -= 1_000_000_000;
        }
        Self { secs, nanos }
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let total = (self.secs - earlier.secs) as i128 * 1_000_000_000
            + (self.nanos - earlier.nanos) as i128;
        if total <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = Timestamp::monotonic();
        let b = Timestamp::monotonic();
        assert!(b >= a);
        assert!(!a.is_zero());
    }

    #[test]
    fn add_carries_nanoseconds() {
        let t = Timestamp::new(10, 900_000_000).saturating_add(Duration::from_millis(200));
        assert_eq!(t, Timestamp::new(11, 100_000_000));
    }

    #[test]
    fn duration_since_clamps_to_zero() {
        let early = Timestamp::new(5, 0);
        let late = Timestamp::new(7, 500_000_000);
        assert_eq!(late.duration_since(early), Duration::from_millis(2500));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }

    #[test]
    fn whole_seconds_ignore_fraction() {
        let a = Timestamp::new(100, 999_999_999);
        let b = Timestamp::new(101, 0);
        assert_eq!(b.whole_secs_since(a), 1);
    }
}
