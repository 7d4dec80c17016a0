use std::sync::Arc;
use tracing::{debug, trace, warn};
use crate::conn::{ConnRef, Connection};
use crate::error::StackError;
use crate::lifecycle::{idle_expired, CloseReason};
use crate::threaded::server::{ThreadConn, ThreadShared};
use crate::threaded::transport::{BlockingStream, Recv};

/// The body of a connection's worker thread. It owns the stream for the connection's whole
///  life, so it is the only place where the connection is torn down.
pub(crate) fn run<S: BlockingStream>(shared: Arc<ThreadShared>, conn: Arc<ThreadConn<S::Writer>>, mut stream: S) {
    let conn_ref: ConnRef = conn.clone();
    let id = conn.id();

    if !conn.status().lifecycle().activate() {
        warn!("connection {} was not in INIT when its worker started", id);
    }
    shared.handler.on_connect(&conn_ref);

    let mut buf = vec![0u8; shared.config.recv_buffer_size];
    let mut last_active = shared.clock.now();

    let reason = loop {
        if conn.status().is_close_requested() {
            break CloseReason::LocalClose;
        }

        match stream.recv_timeout(&mut buf, shared.config.read_timeout) {
            Ok(Recv::Data(n)) => {
                trace!("connection {}: received {} bytes", id, n);
                last_active = shared.clock.now();
                shared.handler.on_data(&conn_ref, &buf[..n]);
            }
            Ok(Recv::TimedOut) => {
                if idle_expired(last_active, shared.clock.now(), shared.config.idle_timeout) {
                    break CloseReason::IdleTimeout;
                }
            }
            Ok(Recv::Closed) => break CloseReason::PeerClosed,
            Err(e) => {
                debug!("connection {}: receive failed: {}", id, e);
                break CloseReason::Error(StackError::from(e));
            }
        }
    };

    if !conn.status().lifecycle().begin_closing() {
        warn!("connection {} was closed by someone other than its worker", id);
        return;
    }
    debug!("closing connection {} from {:?}: {:?}", id, conn.peer_addr(), reason);

    shared.handler.on_close(&conn_ref);

    // the writer shares the socket, so it must go before the stream for the close to take effect
    conn.release_writer();
    stream.close();
    shared.registry.release(id);

    if !conn.status().lifecycle().finish() {
        warn!("connection {} left CLOSING unexpectedly", id);
    }
}
