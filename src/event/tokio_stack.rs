//! [NetStack] over tokio TCP sockets. Every connection gets a reader task that turns socket reads
//!  into [StackEvent]s, and a writer task that flushes output and reports what went to the
//!  kernel as `Sent`. Both run on the network thread's runtime.
//!
//! OS sockets complete the handshake before `accept` returns, so rejecting 'before the
//!  handshake' is approximated by closing with an RST.

use std::future::pending;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use crate::conn::ConnId;
use crate::error::StackError;
use crate::event::stack::{NetStack, Pcb, StackEvent};

/// maximum number of bytes written to a pcb but not yet handed to the writer task
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 16 * 1024;

const RECV_BUFFER_SIZE: usize = 1536;

/// how long shutdown waits for closed connections to get their output out
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type EventSender = mpsc::UnboundedSender<StackEvent<TokioPcb>>;

/// Held by every pcb and writer task. Nothing is ever sent on it: the receiving side sees the
///  channel close once the last writer is done.
type WriterToken = mpsc::Sender<()>;

enum Listener {
    /// bound outside of the runtime, converted on first use
    Std(std::net::TcpListener),
    Tokio(TcpListener),
    Stopped,
}

pub struct TokioStack {
    listener: Listener,
    local_addr: SocketAddr,
    events: EventSender,
    events_receiver: mpsc::UnboundedReceiver<StackEvent<TokioPcb>>,
    send_buffer_size: usize,
    /// `None` once flushing started
    writers: Option<WriterToken>,
    writers_done: mpsc::Receiver<()>,
}

impl TokioStack {
    /// Binds the listener right away so that binding errors are reported to the caller. This
    ///  does not require a tokio runtime.
    pub fn bind(addr: SocketAddr) -> anyhow::Result<TokioStack> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        debug!("bound listener to {:?}", local_addr);

        let (events, events_receiver) = mpsc::unbounded_channel();
        let (writers, writers_done) = mpsc::channel(1);
        Ok(TokioStack {
            listener: Listener::Std(listener),
            local_addr,
            events,
            events_receiver,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            writers: Some(writers),
            writers_done,
        })
    }

    pub fn with_send_buffer_size(mut self, send_buffer_size: usize) -> TokioStack {
        self.send_buffer_size = send_buffer_size;
        self
    }

    /// registers the listener with the runtime on first use, returns `false` if there is none
    fn register_listener(&mut self) -> bool {
        if let Listener::Std(_) = &self.listener {
            if let Listener::Std(std_listener) = std::mem::replace(&mut self.listener, Listener::Stopped) {
                match TcpListener::from_std(std_listener) {
                    Ok(listener) => self.listener = Listener::Tokio(listener),
                    Err(e) => error!("can not register listener with the runtime: {}", e),
                }
            }
        }
        matches!(self.listener, Listener::Tokio(_))
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

#[async_trait]
impl NetStack for TokioStack {
    type Pcb = TokioPcb;

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    async fn next_event(&mut self) -> Option<StackEvent<TokioPcb>> {
        self.register_listener();

        loop {
            let send_buffer_size = self.send_buffer_size;
            let events = self.events.clone();
            let writers = self.writers.clone();
            let listener = match &self.listener {
                Listener::Tokio(listener) => Some(listener),
                _ => None,
            };

            select! {
                opt_event = self.events_receiver.recv() => return opt_event,
                accepted = accept(listener) => match accepted {
                    Ok((stream, peer_addr)) => match writers {
                        Some(writers) => {
                            trace!("accepted TCP connection from {:?}", peer_addr);
                            return Some(StackEvent::Accepted(TokioPcb::new(stream, peer_addr, events, writers, send_buffer_size)));
                        }
                        None => debug!("dropping connection from {:?} accepted while flushing", peer_addr),
                    },
                    Err(e) => {
                        // typically running out of file descriptors: back off instead of spinning
                        warn!("error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    }

    fn stop_listening(&mut self) {
        debug!("closing listener on {:?}", self.local_addr);
        self.listener = Listener::Stopped;
    }

    async fn flush(&mut self) {
        self.listener = Listener::Stopped;
        if self.writers.take().is_none() {
            return;
        }

        match tokio::time::timeout(FLUSH_TIMEOUT, self.writers_done.recv()).await {
            Ok(_) => debug!("all connections flushed"),
            Err(_) => warn!("connections did not flush within {:?}, discarding their remaining output", FLUSH_TIMEOUT),
        }
    }
}

enum WriterCmd {
    Data(Bytes),
    Close,
    Abort,
}

/// connection state of a pcb: accepted and owned by the server, but not attached yet - or
///  attached, with the socket owned by the reader and writer tasks
enum Socket {
    Unattached(TcpStream),
    Attached {
        reader: JoinHandle<()>,
        writer: mpsc::UnboundedSender<WriterCmd>,
    },
    Detached {
        writer: mpsc::UnboundedSender<WriterCmd>,
    },
    Gone,
}

pub struct TokioPcb {
    peer_addr: SocketAddr,
    socket: Socket,
    pending: BytesMut,
    send_buffer_size: usize,
    events: EventSender,
    writers: WriterToken,
}

impl TokioPcb {
    fn new(stream: TcpStream, peer_addr: SocketAddr, events: EventSender, writers: WriterToken, send_buffer_size: usize) -> TokioPcb {
        TokioPcb {
            peer_addr,
            socket: Socket::Unattached(stream),
            pending: BytesMut::new(),
            send_buffer_size,
            events,
            writers,
        }
    }

    fn writer(&self) -> Option<&mpsc::UnboundedSender<WriterCmd>> {
        match &self.socket {
            Socket::Attached { writer, .. } | Socket::Detached { writer } => Some(writer),
            _ => None,
        }
    }

    fn set_linger_zero(stream: &TcpStream) {
        if let Err(e) = SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
            debug!("can not set SO_LINGER: {}", e);
        }
    }
}

impl Pcb for TokioPcb {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn attach(&mut self, ctx: ConnId) {
        if !matches!(self.socket, Socket::Unattached(_)) {
            warn!("connection {}: pcb for {:?} can not be attached twice", ctx, self.peer_addr);
            return;
        }
        let Socket::Unattached(stream) = std::mem::replace(&mut self.socket, Socket::Gone) else {
            return;
        };

        let (read_half, write_half) = stream.into_split();
        let (writer, writer_receiver) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(ctx, read_half, self.events.clone()));
        tokio::spawn(write_loop(Some(ctx), write_half, writer_receiver, self.events.clone(), self.writers.clone()));

        self.socket = Socket::Attached { reader, writer };
    }

    fn detach(&mut self) {
        match std::mem::replace(&mut self.socket, Socket::Gone) {
            Socket::Attached { reader, writer } => {
                reader.abort();
                self.socket = Socket::Detached { writer };
            }
            other => self.socket = other,
        }
    }

    fn recved(&mut self, _len: usize) {
        // the reader task reads into a fresh buffer for every event, so the window is managed
        //  by the kernel's socket buffer
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StackError> {
        if matches!(self.socket, Socket::Gone) {
            return Err(StackError::NotConnected);
        }
        if self.pending.len() + data.len() > self.send_buffer_size {
            return Err(StackError::BufferFull);
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn output(&mut self) -> Result<(), StackError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        // unattached pcbs keep pending data until they are closed
        let Some(writer) = self.writer().cloned() else {
            return Ok(());
        };

        let data = self.pending.split().freeze();
        writer.send(WriterCmd::Data(data))
            .map_err(|_| StackError::NotConnected)
    }

    fn close(mut self) {
        let pending = self.pending.split().freeze();
        match std::mem::replace(&mut self.socket, Socket::Gone) {
            Socket::Unattached(stream) => {
                let (writer, writer_receiver) = mpsc::unbounded_channel();
                let (_, write_half) = stream.into_split();
                if !pending.is_empty() {
                    let _ = writer.send(WriterCmd::Data(pending));
                }
                let _ = writer.send(WriterCmd::Close);
                tokio::spawn(write_loop(None, write_half, writer_receiver, self.events.clone(), self.writers.clone()));
            }
            Socket::Attached { reader, writer } => {
                reader.abort();
                if !pending.is_empty() {
                    let _ = writer.send(WriterCmd::Data(pending));
                }
                let _ = writer.send(WriterCmd::Close);
            }
            Socket::Detached { writer } => {
                if !pending.is_empty() {
                    let _ = writer.send(WriterCmd::Data(pending));
                }
                let _ = writer.send(WriterCmd::Close);
            }
            Socket::Gone => {}
        }
    }

    fn abort(mut self) {
        match std::mem::replace(&mut self.socket, Socket::Gone) {
            Socket::Unattached(stream) => {
                TokioPcb::set_linger_zero(&stream);
                drop(stream);
            }
            Socket::Attached { reader, writer } => {
                reader.abort();
                let _ = writer.send(WriterCmd::Abort);
            }
            Socket::Detached { writer } => {
                let _ = writer.send(WriterCmd::Abort);
            }
            Socket::Gone => {}
        }
    }
}

impl Drop for TokioPcb {
    fn drop(&mut self) {
        // dropping the writer sender ends the writer task, which releases the socket
        if let Socket::Attached { reader, .. } = &self.socket {
            reader.abort();
        }
    }
}

async fn read_loop(ctx: ConnId, mut read_half: OwnedReadHalf, events: EventSender) {
    loop {
        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        let event = match read_half.read_buf(&mut buf).await {
            Ok(0) => StackEvent::PeerClosed { ctx },
            Ok(n) => {
                trace!("connection {}: read {} bytes", ctx, n);
                StackEvent::Received { ctx, data: buf.freeze() }
            }
            Err(e) => {
                let error = StackError::from(e);
                match error {
                    // the connection is gone for good
                    StackError::Reset | StackError::Aborted => StackEvent::Error { ctx, error },
                    _ => StackEvent::ReceiveFailed { ctx, error },
                }
            }
        };

        let is_final = !matches!(event, StackEvent::Received { .. });
        if events.send(event).is_err() || is_final {
            return;
        }
    }
}

async fn write_loop(ctx: Option<ConnId>, mut write_half: OwnedWriteHalf, mut commands: mpsc::UnboundedReceiver<WriterCmd>, events: EventSender, _writers: WriterToken) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriterCmd::Data(data) => {
                match write_half.write_all(&data).await {
                    Ok(()) => {
                        if let Some(ctx) = ctx {
                            let _ = events.send(StackEvent::Sent { ctx, len: data.len() });
                        }
                    }
                    Err(e) => {
                        debug!("write to {:?} failed: {}", write_half.peer_addr().ok(), e);
                        if let Some(ctx) = ctx {
                            let _ = events.send(StackEvent::Error { ctx, error: StackError::from(e) });
                        }
                        return;
                    }
                }
            }
            WriterCmd::Close => {
                if let Err(e) = write_half.shutdown().await {
                    debug!("shutdown of {:?} failed: {}", write_half.peer_addr().ok(), e);
                }
                return;
            }
            WriterCmd::Abort => {
                TokioPcb::set_linger_zero(write_half.as_ref());
                // no FIN: the socket is released with a reset once both halves are gone
                write_half.forget();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use super::*;

    async fn connected_pcb(stack: &mut TokioStack) -> (TokioPcb, TcpStream) {
        let client = TcpStream::connect(stack.local_addr().unwrap());
        let (event, client) = tokio::join!(stack.next_event(), client);
        match event {
            Some(StackEvent::Accepted(pcb)) => (pcb, client.unwrap()),
            _ => panic!("expected an accepted connection"),
        }
    }

    fn loopback_stack() -> TokioStack {
        TokioStack::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_receive_and_send() {
        let mut stack = loopback_stack();
        let (mut pcb, mut client) = connected_pcb(&mut stack).await;
        let ctx = ConnId::from_raw(42);
        assert_eq!(pcb.peer_addr(), Some(client.local_addr().unwrap()));
        pcb.attach(ctx);

        client.write_all(b"ping").await.unwrap();
        match stack.next_event().await {
            Some(StackEvent::Received { ctx: c, data }) => {
                assert_eq!(c, ctx);
                assert_eq!(data.as_ref(), b"ping");
            }
            _ => panic!("expected received data"),
        }

        pcb.write(b"po").unwrap();
        pcb.write(b"ng").unwrap();
        pcb.output().unwrap();
        match stack.next_event().await {
            Some(StackEvent::Sent { ctx: c, len }) => {
                assert_eq!(c, ctx);
                assert_eq!(len, 4);
            }
            _ => panic!("expected sent notification"),
        }

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_peer_close() {
        let mut stack = loopback_stack();
        let (mut pcb, client) = connected_pcb(&mut stack).await;
        pcb.attach(ConnId::from_raw(1));

        drop(client);
        assert!(matches!(stack.next_event().await, Some(StackEvent::PeerClosed { .. })));
    }

    #[tokio::test]
    async fn test_send_buffer_full() {
        let mut stack = loopback_stack().with_send_buffer_size(4);
        let (mut pcb, _client) = connected_pcb(&mut stack).await;

        pcb.write(b"abc").unwrap();
        assert_eq!(pcb.write(b"de"), Err(StackError::BufferFull));
    }

    #[tokio::test]
    async fn test_output_frees_send_buffer() {
        let mut stack = loopback_stack().with_send_buffer_size(4);
        let (mut pcb, mut client) = connected_pcb(&mut stack).await;
        pcb.attach(ConnId::from_raw(3));

        pcb.write(b"abcd").unwrap();
        pcb.output().unwrap();
        pcb.write(b"efgh").unwrap();
        pcb.output().unwrap();

        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_flush_waits_for_closed_connections() {
        let mut stack = loopback_stack();
        let (mut pcb, mut client) = connected_pcb(&mut stack).await;
        pcb.attach(ConnId::from_raw(5));

        pcb.write(b"bye").unwrap();
        pcb.output().unwrap();
        pcb.close();

        // returns as soon as the writer task is done, well before the flush timeout
        assert!(tokio::time::timeout(Duration::from_secs(1), stack.flush()).await.is_ok());

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }

    #[tokio::test]
    async fn test_close_unattached_flushes_pending() {
        let mut stack = loopback_stack();
        let (mut pcb, mut client) = connected_pcb(&mut stack).await;

        pcb.write(b"busy").unwrap();
        pcb.output().unwrap();
        pcb.close();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"busy");
    }

    #[tokio::test]
    async fn test_abort_unattached() {
        let mut stack = loopback_stack();
        let (pcb, mut client) = connected_pcb(&mut stack).await;

        pcb.abort();

        let mut buf = Vec::new();
        match client.read_to_end(&mut buf).await {
            Ok(_) => assert!(buf.is_empty()),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[tokio::test]
    async fn test_stop_listening() {
        let mut stack = loopback_stack();
        let addr = stack.local_addr().unwrap();
        // the listener is only registered with the runtime once it is used
        assert!(stack.register_listener());

        stack.stop_listening();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
