//! Time types for TESSERA.
//!
//! Liveness is tracked with wall-clock timestamps so descriptors can be
//! compared across nodes that share a host clock.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall clock timestamp since the UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the epoch
    pub seconds: u64,
    /// Sub-second part, below `NANOS_PER_SEC`
    pub nanos: u32,
}

impl Timestamp {
    /// Maximum nanoseconds per second
    pub const NANOS_PER_SEC: u32 = 1_000_000_000;

    /// The UNIX epoch
    pub const EPOCH: Timestamp = Timestamp {
        seconds: 0,
        nanos: 0,
    };

    /// Create a new timestamp
    #[must_use]
    pub const fn new(seconds: u64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// Create from whole seconds
    #[must_use]
    pub const fn from_secs(seconds: u64) -> Self {
        Self { seconds, nanos: 0 }
    }

    /// Get current timestamp
    ///
    /// A clock set before the epoch reads as the epoch.
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }

    /// Convert to milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u128 {
        self.seconds as u128 * 1_000 + self.nanos as u128 / 1_000_000
    }

    /// Convert to a duration since the epoch
    #[must_use]
    pub const fn as_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    #[must_use]
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }

    /// Step back by `duration`, clamping at the epoch
    #[must_use]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let d = self.as_duration().saturating_sub(duration);
        Self {
            seconds: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    /// Step forward by `duration`
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let d = self.as_duration().saturating_add(duration);
        Self {
            seconds: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}
