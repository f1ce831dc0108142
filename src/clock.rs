//! Timekeeping for the link stack.
//!
//! Every component reads time through a [`Clock`] handle instead of the
//! system clock so that simulated runs can be accelerated (a "warp"
//! factor) or stepped manually from a test. The resolution is one
//! microsecond; higher resolutions overflow too quickly once multiplied
//! by large warp factors.

use std::ops::{Add, AddAssign, Sub};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// An absolute instant, stored as microseconds since the UNIX epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TimePoint {
    micros: i64,
}

impl TimePoint {
    /// 1970-01-01T00:00:00Z.
    pub const UNIX_EPOCH: TimePoint = TimePoint { micros: 0 };

    pub fn from_unix_micros(micros: i64) -> Self {
        TimePoint { micros }
    }

    pub fn from_unix_seconds(seconds: i64) -> Self {
        TimePoint {
            micros: seconds * 1_000_000,
        }
    }

    pub fn unix_micros(self) -> i64 {
        self.micros
    }

    /// Seconds since the UNIX epoch, as used by the per-command timeout
    /// bookkeeping in the AT dialogs.
    pub fn unix_seconds_f64(self) -> f64 {
        self.micros as f64 / 1.0e6
    }

    /// Signed distance from `earlier` to `self` in microseconds.
    pub fn micros_since(self, earlier: TimePoint) -> i64 {
        self.micros - earlier.micros
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.micros).single().unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        TimePoint {
            micros: dt.timestamp_micros(),
        }
    }

    /// Midnight UTC of the day containing `self` (the `start_of_day` MAC
    /// reference anchor).
    pub fn start_of_day(self) -> TimePoint {
        const DAY_MICROS: i64 = 86_400 * 1_000_000;
        TimePoint {
            micros: self.micros.div_euclid(DAY_MICROS) * DAY_MICROS,
        }
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        self.micros += rhs.as_micros() as i64;
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint {
            micros: self.micros - rhs.as_micros() as i64,
        }
    }
}

#[derive(Debug, Clone)]
enum Source {
    Real,
    /// t_sim = t0 + (t - t0) * warp
    Warped { reference: TimePoint, warp: i64 },
    /// Manually stepped; shared so harness and components see one time.
    Simulated(Arc<AtomicI64>),
}

/// Monotonic-enough wall clock with optional warp or manual stepping.
///
/// `Clock` is a cheap handle: clones observe the same simulated instant,
/// so a test can hold one handle to step time while the components under
/// test hold their own.
#[derive(Debug, Clone)]
pub struct Clock {
    source: Source,
}

impl Default for Clock {
    fn default() -> Self {
        Clock::real()
    }
}

impl Clock {
    /// System time, unwarped.
    pub fn real() -> Self {
        Clock {
            source: Source::Real,
        }
    }

    /// System time warped by an integer factor relative to `reference`:
    /// the returned instants advance `warp` times faster than real time.
    pub fn warped(reference: TimePoint, warp: i64) -> Self {
        Clock {
            source: Source::Warped { reference, warp },
        }
    }

    /// A clock that only moves when [`Clock::set`] or [`Clock::advance`]
    /// is called. Used by the tests and simulators.
    pub fn simulated(start: TimePoint) -> Self {
        Clock {
            source: Source::Simulated(Arc::new(AtomicI64::new(start.unix_micros()))),
        }
    }

    pub fn now(&self) -> TimePoint {
        match &self.source {
            Source::Real => real_now(),
            Source::Warped { reference, warp } => {
                let since_ref = real_now().micros_since(*reference);
                *reference + Duration::from_micros((since_ref * warp).max(0) as u64)
            }
            Source::Simulated(micros) => TimePoint::from_unix_micros(micros.load(Ordering::SeqCst)),
        }
    }

    /// Step a simulated clock forward. Ignored (with a debug assertion)
    /// for real or warped clocks.
    pub fn advance(&self, by: Duration) {
        match &self.source {
            Source::Simulated(micros) => {
                micros.fetch_add(by.as_micros() as i64, Ordering::SeqCst);
            }
            _ => debug_assert!(false, "advance() called on a non-simulated clock"),
        }
    }

    /// Jump a simulated clock to an absolute instant.
    pub fn set(&self, to: TimePoint) {
        match &self.source {
            Source::Simulated(micros) => micros.store(to.unix_micros(), Ordering::SeqCst),
            _ => debug_assert!(false, "set() called on a non-simulated clock"),
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.source, Source::Simulated(_))
    }
}

fn real_now() -> TimePoint {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    TimePoint::from_unix_micros(since_epoch.as_micros() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_steps() {
        let clock = Clock::simulated(TimePoint::from_unix_seconds(100));
        let observer = clock.clone();

        assert_eq!(clock.now().unix_micros(), 100_000_000);
        clock.advance(Duration::from_millis(2500));
        assert_eq!(observer.now().unix_micros(), 102_500_000);

        observer.set(TimePoint::from_unix_seconds(7));
        assert_eq!(clock.now(), TimePoint::from_unix_seconds(7));
    }

    #[test]
    fn start_of_day_truncates() {
        // 2020-06-01T13:45:00Z
        let t = TimePoint::from_datetime(
            Utc.with_ymd_and_hms(2020, 6, 1, 13, 45, 0).single().unwrap(),
        );
        assert_eq!(
            t.start_of_day().to_datetime(),
            Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn warped_clock_outpaces_real_time() {
        let t0 = real_now();
        let clock = Clock::warped(t0, 10);
        std::thread::sleep(Duration::from_millis(20));
        let warped = clock.now().micros_since(t0);
        let real = real_now().micros_since(t0);
        assert!(warped >= real * 5, "warp factor not applied: {warped} vs {real}");
    }
}
