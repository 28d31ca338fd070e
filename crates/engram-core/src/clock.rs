//! Injected clock and operation deadlines
//!
//! All time reads in the engine go through a [`Clock`] handle so that cache
//! TTLs, recency scoring, sync backoff, and deadlines are deterministic under
//! test. Production code uses [`SystemClock`]; tests use [`ManualClock`] and
//! advance it explicitly.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::{DbError, DbResult};

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside of tests
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Optional per-operation deadline, checked at suspension points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: DateTime<Utc>,
}

impl Deadline {
    /// Deadline at an absolute instant
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    /// Deadline `after` from now on the given clock
    pub fn after(clock: &dyn Clock, after: Duration) -> Self {
        Self {
            at: clock.now() + after,
        }
    }

    /// Fail with [`DbError::Timeout`] once the deadline has passed
    pub fn check(&self, clock: &dyn Clock) -> DbResult<()> {
        if clock.now() > self.at {
            Err(DbError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Check an optional deadline; `None` never expires
pub fn check_deadline(deadline: Option<&Deadline>, clock: &dyn Clock) -> DbResult<()> {
    match deadline {
        Some(d) => d.check(clock),
        None => Ok(()),
    }
}

/// Cooperative cancellation flag, checked at suspension points
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    /// Fresh, uncancelled flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect at the next suspension point
    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Fail with [`DbError::Cancelled`] once cancelled
    pub fn check(&self) -> DbResult<()> {
        if self.is_cancelled() {
            Err(DbError::Cancelled)
        } else {
            Ok(())
        }
    }
}
