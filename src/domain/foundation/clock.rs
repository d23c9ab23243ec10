//! Wall-clock abstraction and millisecond timestamps.
//!
//! All timestamps and message ids read one clock so tests can inject a
//! fixed or stepping time source.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Immutable point in time, unix milliseconds UTC.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0).single().unwrap_or_default()
    }

    pub fn saturating_add_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.0 < other.0
    }
}

/// Time source for timestamps and id generation.
pub trait Clock: Send + Sync {
    /// Current unix time in milliseconds.
    fn now_millis(&self) -> i64;

    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_millis())
    }
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FixedClock;
    use super::*;

    #[test]
    fn system_clock_is_roughly_now() {
        let before = Utc::now().timestamp_millis();
        let now = SystemClock.now_millis();
        let after = Utc::now().timestamp_millis();
        assert!(now >= before && now <= after);
    }

    #[test]
    fn fixed_clock_reads_back_and_advances() {
        let clock = FixedClock::at(1_700_000_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);

        clock.advance(250);
        assert_eq!(clock.now().as_millis(), 1_700_000_000_250);
    }

    #[test]
    fn timestamp_ordering_follows_millis() {
        let a = Timestamp::from_millis(10);
        let b = Timestamp::from_millis(20);
        assert!(a.is_before(&b));
        assert!(a < b);
    }

    #[test]
    fn timestamp_serializes_as_plain_number() {
        let ts = Timestamp::from_millis(1234);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1234");

        let back: Timestamp = serde_json::from_str("1234").unwrap();
        assert_eq!(back, ts);
    }
}
