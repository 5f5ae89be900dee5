//! Time keeping for the event loop.

use std::ops::Add;
use std::time::Duration;

#[cfg(unix)]
use std::io;

/// An instant on the monotonic clock used by the event loop.
///
/// `Time` never decreases between reads of the same [`Clock`]. It is an
/// opaque number of nanoseconds since an unspecified epoch; only
/// comparisons and offsets with [`Duration`] are meaningful.
///
/// [`Time::MAX`] is a sentinel meaning "no deadline", all arithmetic
/// saturates there.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Time(u64);

impl Time {
    /// The epoch of the clock.
    pub const ZERO: Time = Time(0);

    /// Sentinel instant meaning "no deadline".
    pub const MAX: Time = Time(u64::MAX);

    /// Create a time from a number of nanoseconds since the clock's epoch.
    pub const fn from_nanos(nanos: u64) -> Time {
        Time(nanos)
    }

    /// Returns the number of nanoseconds since the clock's epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Add a duration to this time, saturating at [`Time::MAX`].
    pub fn saturating_add(self, duration: Duration) -> Time {
        let nanos = duration.as_nanos();
        if nanos >= u128::from(u64::MAX) {
            Time::MAX
        } else {
            Time(self.0.saturating_add(nanos as u64))
        }
    }

    /// Returns the duration from `earlier` to `self`, or zero if `self` is
    /// not later than `earlier`.
    pub fn saturating_duration_since(self, earlier: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, duration: Duration) -> Time {
        self.saturating_add(duration)
    }
}

/// A source of [`Time`].
///
/// The event loop reads its clock once per iteration, see
/// [`EventLoop::event_time`]. The clock must be monotonic: a later call to
/// [`now`] never returns a smaller time than an earlier call.
///
/// [`EventLoop::event_time`]: crate::EventLoop::event_time
/// [`now`]: Clock::now
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// The operating system's monotonic clock (`CLOCK_MONOTONIC`).
#[cfg(unix)]
#[derive(Debug)]
pub struct MonotonicClock;

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now(&self) -> Time {
        const NANOS_PER_SEC: u64 = 1_000_000_000;

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        assert_eq!(
            ret,
            0,
            "clock_gettime(CLOCK_MONOTONIC) failed: {}",
            io::Error::last_os_error()
        );
        Time(ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Clock, MonotonicClock, Time};

    #[test]
    fn ordering() {
        assert!(Time::ZERO < Time::from_nanos(1));
        assert!(Time::from_nanos(1) < Time::MAX);
    }

    #[test]
    fn add_saturates_at_sentinel() {
        let time = Time::from_nanos(10);
        assert_eq!(time + Duration::from_nanos(5), Time::from_nanos(15));
        assert_eq!(time + Duration::from_secs(u64::MAX), Time::MAX);
        assert_eq!(Time::MAX + Duration::from_nanos(1), Time::MAX);
    }

    #[test]
    fn duration_since_saturates_at_zero() {
        let t1 = Time::from_nanos(10);
        let t2 = Time::from_nanos(25);
        assert_eq!(t2.saturating_duration_since(t1), Duration::from_nanos(15));
        assert_eq!(t1.saturating_duration_since(t2), Duration::from_nanos(0));
    }

    #[test]
    fn monotonic_clock() {
        let clock = MonotonicClock;
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t1 > Time::ZERO);
        assert!(t2 >= t1);
    }
}
