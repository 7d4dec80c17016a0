//! The lifecycle every connection passes through, independent of the concurrency model that
//!  drives it:
//!
//! ```ascii
//!  INIT --admitted, on_connect--> ACTIVE --close trigger--> CLOSING --teardown--> CLOSED
//! ```
//!
//! * `INIT -> ACTIVE` happens exactly once, right after admission and before any data event
//! * `ACTIVE -> CLOSING` is triggered by peer close, transport error, idle timeout or an
//!    explicit close. Only the first trigger wins, all later ones are no-ops.
//! * `CLOSING -> CLOSED` is the tail of the teardown routine. `CLOSED` is terminal.
//!
//! No transition skips a state. The state is written by a single owner (the network thread or
//!  the connection's worker thread), but it is stored atomically so that `is_alive` can be
//!  checked from any thread, and the transitions are compare-and-swap so that at-most-once
//!  holds even if that discipline is violated.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use crate::error::StackError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Init = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}
impl ConnState {
    fn from_raw(raw: u8) -> ConnState {
        match raw {
            0 => ConnState::Init,
            1 => ConnState::Active,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub fn is_terminating(&self) -> bool {
        *self >= ConnState::Closing
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Init => "INIT",
            ConnState::Active => "ACTIVE",
            ConnState::Closing => "CLOSING",
            ConnState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct AtomicConnState(AtomicU8);

impl Default for AtomicConnState {
    fn default() -> Self {
        AtomicConnState(AtomicU8::new(ConnState::Init as u8))
    }
}

impl AtomicConnState {
    pub fn load(&self) -> ConnState {
        ConnState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.0.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// `INIT -> ACTIVE`, returns `false` if the connection was not in `INIT`
    #[must_use]
    pub fn activate(&self) -> bool {
        self.transition(ConnState::Init, ConnState::Active)
    }

    /// `ACTIVE -> CLOSING`. Returns `true` for the one caller that actually initiated the
    ///  teardown; every other caller must back off.
    ///
    /// A connection that is torn down before it ever became active (e.g. because the server
    ///  shuts down between admission and dispatch) passes through `ACTIVE` so that no state
    ///  is skipped.
    #[must_use]
    pub fn begin_closing(&self) -> bool {
        if self.transition(ConnState::Init, ConnState::Active) {
            return self.transition(ConnState::Active, ConnState::Closing);
        }
        self.transition(ConnState::Active, ConnState::Closing)
    }

    /// `CLOSING -> CLOSED`
    #[must_use]
    pub fn finish(&self) -> bool {
        self.transition(ConnState::Closing, ConnState::Closed)
    }
}

/// What triggered a connection's `ACTIVE -> CLOSING` transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// clean end-of-stream from the peer
    PeerClosed,
    /// the transport failed; the handle may already be gone
    Error(StackError),
    /// no activity for longer than the configured idle timeout
    IdleTimeout,
    /// the application asked for the connection to be closed
    LocalClose,
    /// the server is shutting down
    Shutdown,
}

/// The idle eviction rule shared by both concurrency models: a peer is evicted once it has been
///  silent for *strictly more* than `idle_timeout`.
pub fn idle_expired(last_active: Instant, now: Instant, idle_timeout: Duration) -> bool {
    now.saturating_duration_since(last_active) > idle_timeout
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_regular_lifecycle() {
        let state = AtomicConnState::default();
        assert_eq!(state.load(), ConnState::Init);

        assert!(state.activate());
        assert_eq!(state.load(), ConnState::Active);

        assert!(state.begin_closing());
        assert_eq!(state.load(), ConnState::Closing);

        assert!(state.finish());
        assert_eq!(state.load(), ConnState::Closed);
    }

    #[test]
    fn test_activate_only_once() {
        let state = AtomicConnState::default();
        assert!(state.activate());
        assert!(!state.activate());
    }

    #[test]
    fn test_begin_closing_is_idempotent() {
        let state = AtomicConnState::default();
        assert!(state.activate());

        assert!(state.begin_closing());
        assert!(!state.begin_closing());
        assert_eq!(state.load(), ConnState::Closing);

        assert!(state.finish());
        assert!(!state.begin_closing());
        assert!(!state.finish());
        assert_eq!(state.load(), ConnState::Closed);
    }

    #[test]
    fn test_close_before_activation_passes_through_active() {
        let state = AtomicConnState::default();
        assert!(state.begin_closing());
        assert_eq!(state.load(), ConnState::Closing);
        assert!(!state.activate());
    }

    #[test]
    fn test_finish_requires_closing() {
        let state = AtomicConnState::default();
        assert!(!state.finish());
        assert!(state.activate());
        assert!(!state.finish());
        assert_eq!(state.load(), ConnState::Active);
    }

    #[test]
    fn test_concurrent_close_has_single_winner() {
        let state = std::sync::Arc::new(AtomicConnState::default());
        assert!(state.activate());

        let handles = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.begin_closing())
            })
            .collect::<Vec<_>>();

        let winners = handles.into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[rstest]
    #[case::fresh(0, 1000, false)]
    #[case::just_below(999, 1000, false)]
    #[case::exactly_at(1000, 1000, false)]
    #[case::just_above(1001, 1000, true)]
    #[case::way_above(60_000, 1000, true)]
    fn test_idle_expired(#[case] idle_millis: u64, #[case] timeout_millis: u64, #[case] expected: bool) {
        let last_active = Instant::now();
        let now = last_active + Duration::from_millis(idle_millis);
        assert_eq!(idle_expired(last_active, now, Duration::from_millis(timeout_millis)), expected);
    }

    #[test]
    fn test_idle_expired_clock_going_backwards() {
        let now = Instant::now();
        let last_active = now + Duration::from_secs(5);
        assert!(!idle_expired(last_active, now, Duration::from_secs(1)));
    }
}
