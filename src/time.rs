//! Time base shared by the scheduler, devices and the conductor
//!
//! Every time comparison in the crate goes through a [`Clock`] so the whole
//! pipeline can run against a virtual clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds on the clock's time line (epoch milliseconds for [`SystemClock`])
pub type Millis = u64;

/// Source of "now" for all timing decisions
pub trait Clock: Send + Sync {
    /// Current time in milliseconds
    fn now(&self) -> Millis;
}

/// Wall clock: milliseconds since the UNIX epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually driven clock
///
/// Time only moves when `set` or `advance` is called. Used by tests and by
/// offline simulation of a timeline.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute time. Moving backwards is ignored.
    pub fn set(&self, time: Millis) {
        self.now.fetch_max(time, Ordering::SeqCst);
    }

    /// Move forward by `delta` milliseconds, returning the new time
    pub fn advance(&self, delta: Millis) -> Millis {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}
