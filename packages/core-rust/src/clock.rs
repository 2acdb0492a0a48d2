//! Wall-clock timestamps for commit times and the last-sync watermark.
//!
//! Timestamps render as RFC 3339 UTC text with fixed millisecond precision,
//! so their lexicographic order is their chronological order. That lets the
//! catch-up filter compare an `updated_at` column as plain text.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::Value;

/// Milliseconds since the Unix epoch, rendered as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch; the watermark of a replica that has never synced.
    pub const EPOCH: Timestamp = Timestamp(0);

    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn is_epoch(self) -> bool {
        self == Self::EPOCH
    }

    /// Shifts the timestamp forward, saturating at the representable maximum.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// RFC 3339 text with millisecond precision and a `Z` suffix.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }

    /// Parses RFC 3339 text in any offset.
    ///
    /// # Errors
    ///
    /// Returns the chrono parse error for malformed input.
    pub fn parse(text: &str) -> Result<Self, chrono::ParseError> {
        let dt = DateTime::parse_from_rfc3339(text)?;
        Ok(Self(dt.timestamp_millis()))
    }

    /// Reads a timestamp out of a row field holding RFC 3339 text.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| Self::parse(s).ok())
    }

    /// The timestamp as a row field value.
    #[must_use]
    pub fn to_value(self) -> Value {
        Value::String(self.to_rfc3339())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a manual one.
pub trait ClockSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(Utc::now().timestamp_millis())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.millis.store(ts.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_renders_as_unix_zero() {
        assert_eq!(Timestamp::EPOCH.to_rfc3339(), "1970-01-01T00:00:00.000Z");
        assert!(Timestamp::EPOCH.is_epoch());
    }

    #[test]
    fn parse_accepts_offsets() {
        let a = Timestamp::parse("2024-03-01T12:00:00+02:00").unwrap();
        let b = Timestamp::parse("2024-03-01T10:00:00Z").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn text_order_matches_time_order() {
        let early = Timestamp::from_millis(1_700_000_000_000);
        let late = Timestamp::from_millis(1_700_000_000_001);
        assert!(early < late);
        assert!(early.to_rfc3339() < late.to_rfc3339());
    }

    #[test]
    fn serde_uses_rfc3339_text() {
        let ts = Timestamp::from_millis(1_000);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"1970-01-01T00:00:01.000Z\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::from_millis(10));
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Timestamp::from_millis(15));
        clock.set(Timestamp::EPOCH);
        assert_eq!(clock.now(), Timestamp::EPOCH);
    }

    #[test]
    fn from_value_reads_text_fields() {
        let value = Value::from("1970-01-01T00:00:02.500Z");
        assert_eq!(Timestamp::from_value(&value), Some(Timestamp::from_millis(2_500)));
        assert_eq!(Timestamp::from_value(&Value::Int(3)), None);
    }
}
