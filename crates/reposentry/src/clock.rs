//! The wall-clock seam.
//!
//! Monotonic time for waits and deadlines comes from `tokio::time`
//! (which test code can pause); wall timestamps that end up in the ledger
//! and in event payloads come through [`Clock`] so tests can pin them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, for tests.
#[derive(Clone, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Convenience alias used throughout the runtime.
pub type SharedClock = Arc<dyn Clock>;
