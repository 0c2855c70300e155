//! Epoch-millisecond timestamps
//!
//! All wire-visible timestamps are signed 64-bit millisecond counts since
//! the Unix epoch. Arithmetic with `std::time::Duration` saturates rather
//! than wrapping.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EpochMillis(i64);

impl EpochMillis {
    /// The zero timestamp (the epoch itself)
    pub const ZERO: EpochMillis = EpochMillis(0);

    /// Current wall-clock time
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        EpochMillis(ms)
    }

    /// Construct from a raw millisecond count
    pub fn from_millis(ms: i64) -> Self {
        EpochMillis(ms)
    }

    /// Raw millisecond count
    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Duration since an earlier timestamp, zero if `earlier` is in the future
    pub fn since(self, earlier: EpochMillis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    /// Saturating subtraction of a duration
    pub fn saturating_sub(self, d: Duration) -> Self {
        EpochMillis(self.0.saturating_sub(d.as_millis() as i64))
    }
}

impl Add<Duration> for EpochMillis {
    type Output = EpochMillis;

    fn add(self, d: Duration) -> EpochMillis {
        EpochMillis(self.0.saturating_add(d.as_millis() as i64))
    }
}

impl AddAssign<Duration> for EpochMillis {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<EpochMillis> for EpochMillis {
    type Output = Duration;

    fn sub(self, other: EpochMillis) -> Duration {
        self.since(other)
    }
}

impl fmt::Display for EpochMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
