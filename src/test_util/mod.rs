//! Utilities for testing code that runs on top of the server: a controllable clock, a simulated
//!  network stack and a handler that records its callbacks. They are used by the server's own
//!  tests, and they are exported for application testing.

use std::thread;
use std::time::{Duration, Instant};

pub mod clock;
pub mod recording;
pub mod sim_stack;

/// Polls `condition` until it holds or `timeout` expires, returning the condition's final value.
///  This is for waiting on other threads (network thread, workers) in tests.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::*;

    #[test]
    fn test_wait_until() {
        let counter = AtomicUsize::new(0);
        assert!(wait_until(Duration::from_secs(1), || counter.fetch_add(1, Ordering::SeqCst) >= 3));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }
}
