use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Point in time used for deadlines and completion estimates.
pub type Timestamp = Instant;

/// Monotonic time source shared by every stage of a stack.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Instant::now()
    }
}

/// Clock that only moves when told to. Deadline and estimate tests use this
/// so the outcome does not depend on how fast the machine is.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.origin + *self.offset.lock()
    }
}
