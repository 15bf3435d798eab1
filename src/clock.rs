//! Injectable wall clock
//!
//! Everything that reads "now" (mailbox aging, retention scores, daily quotas,
//! trigger cooldowns) goes through a [`Clock`] so tests can move time by hand.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations
///
/// Cloning shares the underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Create a clock frozen at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.current_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        self.current_ms.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.current_ms.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

/// Shared handle to the production clock
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
