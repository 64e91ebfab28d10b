//! Wall-clock seam. The correlation engine, dedup window, and pending-buffer
//! expiry all reason about epoch seconds; injecting the clock keeps the
//! boundary rules (30 s future tolerance, 7 day age, 1 h dedup) testable.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current wall clock, epoch seconds.
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}
