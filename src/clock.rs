//! Time sources.
//!
//! Every limiter reads time through the [`Clock`] trait so that tests can
//! drive time by hand with [`ManualClock`] instead of sleeping.

use std::fmt;
use std::ops::Add;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A point in time, measured as the offset from the Unix epoch.
///
/// Readings taken from a single [`SystemClock`] never go backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(Duration::ZERO);

    /// The latest representable time, used for "never".
    pub const MAX: Timestamp = Timestamp(Duration::MAX);

    /// Create a timestamp from an offset since the Unix epoch.
    pub const fn from_unix(offset: Duration) -> Self {
        Self(offset)
    }

    /// Create a timestamp from whole milliseconds since the Unix epoch.
    pub const fn from_unix_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Offset since the Unix epoch.
    pub fn as_unix(&self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    /// This timestamp moved back by `duration`, stopping at the epoch.
    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration))
    }

    /// This timestamp moved forward by a fractional number of seconds.
    ///
    /// Negative and NaN inputs leave the timestamp unchanged; offsets too
    /// large for a `Duration` (including infinity) saturate at [`Timestamp::MAX`].
    pub fn add_secs_f64(&self, secs: f64) -> Timestamp {
        if secs.is_nan() || secs <= 0.0 {
            return *self;
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(delta) => *self + delta,
            Err(_) => Timestamp::MAX,
        }
    }

    /// Convert to a UTC calendar time, clamped to chrono's range.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        i64::try_from(self.0.as_secs())
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, self.0.subsec_nanos()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

/// A source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Read the current time.
    fn now(&self) -> Timestamp;
}

/// The process clock.
///
/// The wall clock is sampled once at construction; after that, readings
/// advance with a monotonic [`Instant`], so wall-clock adjustments made by
/// the OS never move a limiter's notion of time backwards.
#[derive(Debug, Clone)]
pub struct SystemClock {
    wall_origin: Timestamp,
    origin: Instant,
}

impl SystemClock {
    /// Create a clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            wall_origin: Timestamp::from_unix(wall),
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.wall_origin + self.origin.elapsed()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle
/// while the limiter under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    /// Move the clock backward, simulating clock skew.
    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_sub(by);
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
