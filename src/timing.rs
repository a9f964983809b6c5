//! Scan-counter to wall-clock mapping.
//!
//! Every stream runs from its own sample clock, so scans from two streams can
//! only be related through time. A [`TimeIndex`] fixes a stream's origin (the
//! wall-clock second at which scan 0 was taken) and its nominal rate:
//!
//! ```text
//! t(ct)  = t0 + ct / srate
//! ct(t)  = round((t - t0) * srate)
//! ```
//!
//! Both directions are pure and monotone, and `t(ct(t))` is within half a
//! sample period of `t`. All times are seconds on the process clock returned
//! by [`now_secs`].

use once_cell::sync::Lazy;
use std::time::Instant;
use thiserror::Error;

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the first call in this process.
pub fn now_secs() -> f64 {
    PROCESS_EPOCH.elapsed().as_secs_f64()
}

/// Why a time could not be mapped onto a queue's resident span.
///
/// These are transient: the trigger loop retries on its next tick.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The queue holds no scans yet.
    #[error("queue is empty")]
    Empty,
    /// The target precedes the oldest retained scan.
    #[error("time precedes queue")]
    BeforeQueue,
    /// The target has not been buffered yet.
    #[error("time follows queue")]
    AfterQueue,
}

/// Bidirectional mapping between a stream's scan counter and process time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeIndex {
    srate: f64,
    t0: f64,
}

impl TimeIndex {
    /// Create an index with the given nominal rate and origin.
    pub fn new(srate: f64, t0: f64) -> Self {
        Self { srate, t0 }
    }

    /// Nominal sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.srate
    }

    /// Wall-clock second of scan 0.
    pub fn origin(&self) -> f64 {
        self.t0
    }

    /// One sample period in seconds.
    pub fn period(&self) -> f64 {
        1.0 / self.srate
    }

    /// Time of scan `ct`.
    pub fn ct_to_time(&self, ct: u64) -> f64 {
        self.t0 + ct as f64 / self.srate
    }

    /// Nearest scan at time `t`. Times before the origin clamp to scan 0.
    pub fn time_to_ct(&self, t: f64) -> u64 {
        let ct = ((t - self.t0) * self.srate).round();
        if ct <= 0.0 {
            0
        } else {
            ct as u64
        }
    }

    /// Convert a duration in seconds to a whole number of scans.
    pub fn secs_to_cts(&self, secs: f64) -> u64 {
        (secs * self.srate).max(0.0) as u64
    }

    /// Absolute error of `t -> ct -> t`, in seconds.
    pub fn round_trip_error(&self, t: f64) -> f64 {
        (self.ct_to_time(self.time_to_ct(t)) - t).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn maps_known_points() {
        let ti = TimeIndex::new(30_000.0, 2.0);
        assert_eq!(ti.time_to_ct(2.0), 0);
        assert_eq!(ti.time_to_ct(3.0), 30_000);
        assert!((ti.ct_to_time(45_000) - 3.5).abs() < 1e-12);
    }

    #[test]
    fn times_before_origin_clamp_to_zero() {
        let ti = TimeIndex::new(1000.0, 10.0);
        assert_eq!(ti.time_to_ct(9.0), 0);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_secs();
        let b = now_secs();
        assert!(b >= a);
    }

    proptest! {
        #[test]
        fn round_trip_within_one_period(
            srate in 1_000.0f64..60_000.0,
            t0 in 0.0f64..1_000.0,
            dt in 0.0f64..3_600.0,
        ) {
            let ti = TimeIndex::new(srate, t0);
            let t = t0 + dt;
            prop_assert!(ti.round_trip_error(t) <= ti.period());
        }

        #[test]
        fn mapping_is_monotone(
            srate in 1_000.0f64..60_000.0,
            a in 0.0f64..100.0,
            b in 0.0f64..100.0,
        ) {
            let ti = TimeIndex::new(srate, 0.0);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(ti.time_to_ct(lo) <= ti.time_to_ct(hi));
        }
    }
}
