//! Wall-clock abstraction.
//!
//! Every expiry decision (remaining lifetime, refresh point, prune grace
//! window) reads time through [`Clock`] so that tests can drive certificate
//! and token lifecycles deterministically.

use std::fmt;

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Converts a non-negative [`chrono::Duration`] into a [`std::time::Duration`],
/// clamping negative spans to zero.
#[must_use]
pub fn to_std_duration(span: chrono::Duration) -> std::time::Duration {
    span.to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Converts a [`std::time::Duration`] into a [`chrono::Duration`], saturating
/// at the largest representable span.
#[must_use]
pub fn to_chrono_duration(span: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(span).unwrap_or(chrono::Duration::MAX)
}
