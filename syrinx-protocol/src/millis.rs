//! Stable millisecond type for the protocol wire format.
//!
//! [`WireMillis`] serializes as a plain integer, which is what the child
//! synthesizer expects for `timestamp` and `latency_ms` fields. Using a
//! dedicated type instead of raw `u64` keeps durations and timestamps from
//! being confused with counters at the codec boundary.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds with a stable JSON serialization format.
///
/// Serializes as a plain `u64`. Used both for wall-clock timestamps
/// (milliseconds since the UNIX epoch) and for durations (`latency_ms`),
/// matching the wire shapes the synthesizer speaks.
///
/// # Examples
///
/// ```
/// use syrinx_protocol::WireMillis;
///
/// let ms = WireMillis::from_millis(42);
/// assert_eq!(serde_json::to_string(&ms).unwrap(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireMillis(u64);

impl WireMillis {
    /// Zero milliseconds.
    pub const ZERO: Self = Self(0);

    /// Create from a millisecond count.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Current wall-clock time as milliseconds since the UNIX epoch.
    ///
    /// Clocks before the epoch collapse to zero rather than panicking;
    /// timestamps are informational on this wire, never control flow.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// The value in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Convert to `std::time::Duration`.
    pub fn to_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Duration> for WireMillis {
    fn from(d: Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<WireMillis> for Duration {
    fn from(ms: WireMillis) -> Self {
        Duration::from_millis(ms.0)
    }
}

impl Default for WireMillis {
    fn default() -> Self {
        Self::ZERO
    }
}

impl std::fmt::Display for WireMillis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
