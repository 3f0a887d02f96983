//! Time source for cooldown evaluation.
//!
//! Reuse eligibility is checked lazily at allocation time, so the only
//! thing the allocators need is "now".

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Supplies the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Ok(delta) = chrono::Duration::from_std(by) {
            if let Some(next) = now.checked_add_signed(delta) {
                *now = next;
            }
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Returns true once `reuse_after` has elapsed since `deallocated_at`.
pub fn cooled_down(
    deallocated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    reuse_after: Duration,
) -> bool {
    let Some(deallocated_at) = deallocated_at else {
        // no timestamp means the row was never stamped; treat as free
        return true;
    };
    let Ok(delta) = chrono::Duration::from_std(reuse_after) else {
        return false;
    };
    match now.checked_sub_signed(delta) {
        Some(cutoff) => deallocated_at <= cutoff,
        None => false,
    }
}
