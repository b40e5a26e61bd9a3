//! Monotonic timestamps with microsecond resolution.
//!
//! All reactor bookkeeping (poll return times, receive times, timer
//! expirations) uses `CLOCK_MONOTONIC` so that wall-clock adjustments cannot
//! reorder timers or skew receive times.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A point on the monotonic clock, in microseconds.
///
/// `Timestamp::default()` is the invalid (zero) timestamp; `is_valid()`
/// distinguishes it from real clock samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Sample the monotonic clock.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid timespec.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Timestamp {
            micros: ts.tv_sec as i64 * MICROS_PER_SECOND + ts.tv_nsec as i64 / 1000,
        }
    }

    /// Construct from a raw microsecond count.
    pub fn from_micros(micros: i64) -> Self {
        Timestamp { micros }
    }

    /// Raw microseconds since the monotonic epoch.
    pub fn micros(&self) -> i64 {
        self.micros
    }

    /// Whether this is a real clock sample rather than the zero default.
    pub fn is_valid(&self) -> bool {
        self.micros > 0
    }

    /// Time elapsed since `earlier`, saturating to zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let delta = self.micros - earlier.micros;
        if delta <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(delta as u64)
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SECOND,
            self.micros % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_valid() {
        assert!(Timestamp::now().is_valid());
        assert!(!Timestamp::default().is_valid());
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
    }

    #[test]
    fn test_add_duration() {
        let t = Timestamp::from_micros(1_000_000);
        let later = t + Duration::from_millis(500);
        assert_eq!(later.micros(), 1_500_000);
        assert_eq!(later.duration_since(t), Duration::from_millis(500));
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::from_micros(100);
        let b = Timestamp::from_micros(200);
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }
}
