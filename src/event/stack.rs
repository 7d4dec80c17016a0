//! The network stack as seen by the event-driven server. It is modelled after a raw, callback
//!  based TCP stack: the server owns a protocol control block ([Pcb]) per connection, attaches
//!  its own context to it, and receives everything else as [StackEvent]s on the network thread.

use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::Bytes;
use crate::conn::ConnId;
use crate::error::StackError;

/// Handle to a single TCP connection inside the network stack. All methods are called on the
///  network thread only.
///
/// `close` and `abort` consume the handle, so a pcb can not be released twice.
pub trait Pcb: Send + 'static {
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Registers `ctx` as the context for this connection's events. Events are produced only for
    ///  attached pcbs, and they carry the attached context.
    fn attach(&mut self, ctx: ConnId);

    /// Unregisters the callbacks: no events are produced for this pcb after detaching, though
    ///  events that were already produced may still be in flight.
    fn detach(&mut self);

    /// acknowledges `len` received bytes as consumed, opening the receive window
    fn recved(&mut self, len: usize);

    /// Enqueues a copy of `data` for sending. The data is not referenced after the call.
    fn write(&mut self, data: &[u8]) -> Result<(), StackError>;

    /// flushes enqueued data to the wire
    fn output(&mut self) -> Result<(), StackError>;

    /// graceful close, enqueued data is still sent
    fn close(self) where Self: Sized;

    /// closes with a reset, discarding enqueued data
    fn abort(self) where Self: Sized;
}

#[derive(Debug)]
pub enum StackEvent<P> {
    /// A new connection arrived on the listener. It is not attached, so there are no events
    ///  for it until the server attaches a context.
    Accepted(P),
    Received { ctx: ConnId, data: Bytes },
    /// clean end-of-stream
    PeerClosed { ctx: ConnId },
    /// Receiving failed, but the pcb is still valid and must be closed by the server
    ReceiveFailed { ctx: ConnId, error: StackError },
    /// `len` bytes were acknowledged
    Sent { ctx: ConnId, len: usize },
    /// Fatal error. The stack already released the connection, so the pcb must not be closed
    ///  or aborted again.
    Error { ctx: ConnId, error: StackError },
}

#[async_trait]
pub trait NetStack: Send + 'static {
    type Pcb: Pcb;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Waits for the next event. This is polled in a `select!` loop and must be cancel safe.
    ///  `None` means the stack will never produce another event.
    async fn next_event(&mut self) -> Option<StackEvent<Self::Pcb>>;

    /// closes the listener, existing connections are unaffected
    fn stop_listening(&mut self);

    /// Waits for closed connections to finish sending what was written to them. This is called
    ///  once on shutdown after all connections were closed, before the network thread exits.
    async fn flush(&mut self) {}
}
