//! The blocking transport used by the thread-per-connection server, with implementations over
//!  `std::net` sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use socket2::SockRef;
use tracing::{debug, trace};

/// outcome of a receive with timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    Data(usize),
    TimedOut,
    /// clean end-of-stream
    Closed,
}

pub trait BlockingStream: Send + 'static {
    /// A second handle for writing, used by `send` from arbitrary threads while the worker is
    ///  blocked in a receive
    type Writer: Write + Send + 'static;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Recv>;

    fn writer(&self) -> io::Result<Self::Writer>;

    /// graceful close
    fn close(self);

    /// close with a reset
    fn abort(self);
}

pub trait BlockingListener: Send + 'static {
    type Stream: BlockingStream;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Waits up to `timeout` for an incoming connection, returning `None` if there was none
    fn accept_timeout(&mut self, timeout: Duration) -> io::Result<Option<Self::Stream>>;
}

/// granularity of accept polling
const ACCEPT_POLL_STEP: Duration = Duration::from_millis(10);

/// A `std` listener in non-blocking mode, polled for incoming connections
pub struct StdListener {
    inner: TcpListener,
}

impl StdListener {
    pub fn bind(addr: SocketAddr) -> io::Result<StdListener> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        debug!("bound listener to {:?}", inner.local_addr()?);
        Ok(StdListener { inner })
    }
}

impl BlockingListener for StdListener {
    type Stream = TcpStream;

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn accept_timeout(&mut self, timeout: Duration) -> io::Result<Option<TcpStream>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.accept() {
                Ok((stream, peer_addr)) => {
                    trace!("accepted TCP connection from {:?}", peer_addr);
                    stream.set_nonblocking(false)?;
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL_STEP.min(deadline - now));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl BlockingStream for TcpStream {
    type Writer = TcpStream;

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Recv> {
        self.set_read_timeout(Some(timeout))?;
        match self.read(buf) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            // platforms differ in which of these a read timeout produces
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => Ok(Recv::TimedOut),
            Err(e) => Err(e),
        }
    }

    fn writer(&self) -> io::Result<TcpStream> {
        self.try_clone()
    }

    fn close(self) {
        if let Err(e) = self.shutdown(Shutdown::Write) {
            trace!("shutdown failed: {}", e);
        }
    }

    fn abort(self) {
        if let Err(e) = SockRef::from(&self).set_linger(Some(Duration::ZERO)) {
            debug!("can not set SO_LINGER: {}", e);
        }
    }
}
