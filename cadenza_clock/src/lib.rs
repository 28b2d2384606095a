//! Utilities for telling (and faking) the time
//!
//! Credential expiry is always evaluated against a [`Clock`] so that the
//! expiry arithmetic can be exercised deterministically in tests with a
//! [`TestClock`] instead of the real [`System`] clock.

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use
)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Represents a clock, which can tell the current time
pub trait Clock: fmt::Debug + Send + Sync {
    /// Gets the current time according to this clock
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// The system clock as provided by `chrono::Utc::now()`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct System;

impl Clock for System {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A test clock which maintains the current time as shared internal state
///
/// Clones share the same underlying instant, so a clone handed to a
/// component under test observes every [`set()`][Self::set()] and
/// [`advance()`][Self::advance()] made through the original.
/// Precision is one millisecond.
#[derive(Clone, Default)]
pub struct TestClock {
    millis: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a new test clock with the specified time
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(time.timestamp_millis())),
        }
    }

    /// Creates a new test clock starting at the given Unix timestamp (in seconds)
    pub fn from_timestamp(secs: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(secs.saturating_mul(1000))),
        }
    }

    /// Updates the clock's current time to `time`
    pub fn set(&self, time: DateTime<Utc>) {
        self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
    }

    /// Moves the clock forward (or backward, for negative values) by `by`
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestClock").field(&self.now()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_the_same_instant() {
        let clock = TestClock::from_timestamp(1_700_000_000);
        let observer = clock.clone();

        clock.advance(Duration::seconds(90));

        assert_eq!(observer.now().timestamp(), 1_700_000_090);
    }

    #[test]
    fn set_replaces_the_current_time() {
        let clock = TestClock::default();
        let target = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        clock.set(target);

        assert_eq!(clock.now(), target);
    }

    #[test]
    fn shared_clock_delegates() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::from_timestamp(42));
        assert_eq!(clock.now().timestamp(), 42);
    }
}
