//! Wall-clock time as a (seconds, microseconds) pair.

use nix::time::{clock_gettime, ClockId};

const USEC_PER_SEC: i64 = 1_000_000;

/// A point in wall-clock time.
///
/// The value is kept normalized with `usec` in `[0, 1_000_000)`, which
/// makes the derived ordering (seconds first, then microseconds) correct.
/// Overflow of the seconds field is not handled; program lifetimes are
/// assumed reasonable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeVal {
    /// Seconds.
    pub sec: i64,
    /// Microseconds, in `[0, 1_000_000)`.
    pub usec: i64,
}

impl TimeVal {
    /// Builds a normalized `TimeVal`, carrying excess microseconds into
    /// the seconds field (in either direction).
    pub fn new(sec: i64, usec: i64) -> TimeVal {
        TimeVal {
            sec: sec + usec.div_euclid(USEC_PER_SEC),
            usec: usec.rem_euclid(USEC_PER_SEC),
        }
    }

    /// Reads the current wall-clock time.
    pub fn now() -> TimeVal {
        let ts = clock_gettime(ClockId::CLOCK_REALTIME)
            .expect("cannot read the wall clock (clock_gettime)");
        TimeVal::new(ts.tv_sec() as i64, ts.tv_nsec() as i64 / 1000)
    }

    /// Returns this time shifted by `msec` milliseconds.
    pub fn add_msec(self, msec: i64) -> TimeVal {
        TimeVal::new(self.sec, self.usec + msec * 1000)
    }

    /// Signed difference `self - other`, in milliseconds.
    pub fn msec_diff(self, other: TimeVal) -> i64 {
        (self.sec - other.sec) * 1000 + (self.usec - other.usec) / 1000
    }
}

/// Fills a `TimeVal` with the current wall-clock time.
pub fn current_time() -> TimeVal {
    TimeVal::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_carries_microseconds() {
        let t = TimeVal::new(1, 2_500_000);
        assert_eq!(t, TimeVal { sec: 3, usec: 500_000 });

        let t = TimeVal::new(3, -500_000);
        assert_eq!(t, TimeVal { sec: 2, usec: 500_000 });
    }

    #[test]
    fn add_msec_carries_past_a_second() {
        let t = TimeVal { sec: 10, usec: 900_000 };
        assert_eq!(t.add_msec(150), TimeVal { sec: 11, usec: 50_000 });
        assert_eq!(t.add_msec(2500), TimeVal { sec: 13, usec: 400_000 });
    }

    #[test]
    fn ordering_is_seconds_then_microseconds() {
        let a = TimeVal { sec: 5, usec: 999_999 };
        let b = TimeVal { sec: 6, usec: 0 };
        assert!(a < b);
        assert!(b > a);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn msec_diff_matches_add() {
        let a = TimeVal { sec: 2, usec: 250_000 };
        let b = a.add_msec(1750);
        assert_eq!(b.msec_diff(a), 1750);
        assert_eq!(a.msec_diff(b), -1750);
    }

    #[test]
    fn now_is_monotonic_enough() {
        let a = TimeVal::now();
        let b = TimeVal::now();
        assert!(b >= a);
    }
}
