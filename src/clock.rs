use std::time::Instant;

/// Source of 'now' for last-activity bookkeeping and idle eviction. Production code uses
///  [SystemClock]; tests substitute [crate::test_util::clock::ManualClock] to control time
///  precisely.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
