use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
#[cfg(test)] use mockall::automock;
use crate::error::StackError;
use crate::lifecycle::{AtomicConnState, ConnState};

/// Opaque, stable identifier of a connection. It is what the transport stores as callback
///  context instead of a reference to the connection record, so an event or request that
///  arrives after the record was released can never reach a different connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn from_raw(raw: u64) -> ConnId {
        ConnId(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }
}

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnId({:#x})", self.0)
    }
}

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

pub type UserData = Arc<dyn Any + Send + Sync>;

/// The part of a connection's state that is visible outside its owning thread: identity,
///  lifecycle state, the close request flag and the user data slot.
pub struct ConnStatus {
    id: ConnId,
    peer_addr: Option<SocketAddr>,
    state: AtomicConnState,
    /// set by the application to request a close, observed by the owning thread
    close_requested: AtomicBool,
    user_data: Mutex<Option<UserData>>,
}

impl Debug for ConnStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnStatus")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state.load())
            .finish()
    }
}

impl ConnStatus {
    pub fn new(id: ConnId, peer_addr: Option<SocketAddr>) -> ConnStatus {
        ConnStatus {
            id,
            peer_addr,
            state: AtomicConnState::default(),
            close_requested: AtomicBool::new(false),
            user_data: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn lifecycle(&self) -> &AtomicConnState {
        &self.state
    }

    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnState::Active
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    pub fn set_user_data(&self, data: Option<UserData>) {
        *self.user_data.lock().unwrap_or_else(PoisonError::into_inner) = data;
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.user_data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The application's handle to a single connection. Handles stay valid after the connection
///  is gone: `send` and `close` on a connection that is closing or closed are no-ops.
pub trait Connection: Send + Sync + 'static {
    fn status(&self) -> &ConnStatus;

    /// Queues (event-driven) or writes (thread-per-connection) `data`, returning the number of
    ///  bytes that were accepted for transmission. Delivery is best effort: there is no error
    ///  per chunk, and a short count means the rest was dropped.
    fn send(&self, data: &[u8]) -> usize;

    /// Requests the connection to be closed. Safe to call any number of times from any thread.
    fn close(&self);

    fn id(&self) -> ConnId {
        self.status().id()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.status().peer_addr()
    }

    fn state(&self) -> ConnState {
        self.status().state()
    }

    fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    fn set_user_data(&self, data: Option<UserData>) {
        self.status().set_user_data(data)
    }

    fn user_data(&self) -> Option<UserData> {
        self.status().user_data()
    }
}

pub type ConnRef = Arc<dyn Connection>;

/// Application callbacks. They are invoked on whatever thread the concurrency model dictates
///  (the network thread, or the connection's worker thread), so implementations must do their
///  own synchronization. In the event-driven model a callback that blocks stalls *all*
///  connections.
#[cfg_attr(test, automock)]
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &ConnRef) {}

    fn on_data(&self, _conn: &ConnRef, _data: &[u8]) {}

    /// `acked_len` bytes were acknowledged by the transport (event-driven only)
    fn on_sent(&self, _conn: &ConnRef, _acked_len: usize) {}

    /// the connection is going away - fires at most once per connection
    fn on_close(&self, _conn: &ConnRef) {}

    /// the transport failed (event-driven only); replaces `on_close` for this connection
    fn on_error(&self, _conn: &ConnRef, _error: &StackError) {}
}
