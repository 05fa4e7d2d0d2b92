//! Target share rate for the vardiff control loop.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Desired share submission rate for one session.
///
/// Stored as the average interval between shares, which keeps the rate
/// positive by construction. In config files it is written as a number of
/// seconds between shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareRate(Duration);

impl ShareRate {
    /// Create a rate of N shares per minute. Returns `None` for non-positive
    /// or non-finite input.
    pub fn per_minute(shares: f64) -> Option<Self> {
        if shares.is_finite() && shares > 0.0 {
            Some(Self(Duration::from_secs_f64(60.0 / shares)))
        } else {
            None
        }
    }

    /// Create a rate from the target interval between shares.
    pub fn from_interval(interval: Duration) -> Option<Self> {
        if interval.is_zero() {
            None
        } else {
            Some(Self(interval))
        }
    }

    pub fn as_per_minute(&self) -> f64 {
        60.0 / self.0.as_secs_f64()
    }

    /// Average interval between shares.
    pub fn as_interval(&self) -> Duration {
        self.0
    }

    /// How many times faster than this rate an observed interval is.
    ///
    /// Values above 1.0 mean shares arrive too quickly.
    pub fn speedup(&self, observed: Duration) -> f64 {
        let observed = observed.as_secs_f64().max(1e-6);
        self.0.as_secs_f64() / observed
    }
}

impl Default for ShareRate {
    /// One share every ten seconds.
    fn default() -> Self {
        Self(Duration::from_secs(10))
    }
}

impl std::fmt::Display for ShareRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_min = self.as_per_minute();
        if per_min >= 1.0 {
            write!(f, "{:.1} shares/min", per_min)
        } else {
            write!(f, "1 share/{:.0}s", self.0.as_secs_f64())
        }
    }
}

impl Serialize for ShareRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for ShareRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !(secs.is_finite() && secs > 0.0) {
            return Err(serde::de::Error::custom(
                "share interval must be a positive number of seconds",
            ));
        }
        Ok(Self(Duration::from_secs_f64(secs)))
    }
}
