use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use anyhow::bail;
use tracing::{debug, error, info, trace, warn};
use crate::admission::AdmissionPolicy;
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::conn::{ConnId, ConnRef, ConnStatus, Connection, ConnectionHandler};
use crate::registry::Registry;
use crate::threaded::transport::{BlockingListener, BlockingStream, StdListener};
use crate::threaded::worker;

/// A connection of a [ThreadServer]. Sends are synchronous blocking writes on the caller's
///  thread, and closing only sets a flag that the connection's worker picks up within one read
///  timeout.
pub struct ThreadConn<W> {
    status: ConnStatus,
    /// `None` once the worker released the stream
    writer: Mutex<Option<W>>,
}

impl<W: Write + Send + 'static> ThreadConn<W> {
    pub fn new(id: ConnId, peer_addr: Option<SocketAddr>, writer: W) -> ThreadConn<W> {
        ThreadConn {
            status: ConnStatus::new(id, peer_addr),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// called by the worker before it closes the stream, so that later sends are no-ops
    pub(crate) fn release_writer(&self) {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl<W: Write + Send + 'static> Connection for ThreadConn<W> {
    fn status(&self) -> &ConnStatus {
        &self.status
    }

    fn send(&self, data: &[u8]) -> usize {
        if !self.status.is_alive() || self.status.is_close_requested() {
            return 0;
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = writer.as_mut() else {
            return 0;
        };
        match writer.write_all(data).and_then(|_| writer.flush()) {
            Ok(()) => {
                trace!("connection {}: sent {} bytes", self.status.id(), data.len());
                data.len()
            }
            Err(e) => {
                debug!("connection {}: send failed: {}", self.status.id(), e);
                0
            }
        }
    }

    fn close(&self) {
        if !self.status.state().is_terminating() {
            self.status.request_close();
        }
    }
}

pub(crate) struct ThreadShared {
    pub config: ServerConfig,
    pub registry: Registry<ConnRef>,
    pub handler: Arc<dyn ConnectionHandler>,
    pub clock: Arc<dyn Clock>,
    pub running: AtomicBool,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadShared {
    pub fn new(config: ServerConfig, handler: Arc<dyn ConnectionHandler>, clock: Arc<dyn Clock>) -> ThreadShared {
        ThreadShared {
            registry: Registry::new(config.max_connections),
            config,
            handler,
            clock,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// TCP server with a monitor thread that accepts connections and one worker thread per
///  connection. Only the registry and its active count are shared between threads.
///
/// The server does not accept connections before [ThreadServer::start]. Dropping the server
///  closes it.
pub struct ThreadServer<L: BlockingListener = StdListener> {
    shared: Arc<ThreadShared>,
    local_addr: Option<SocketAddr>,
    /// the listener until the server is started
    listener: Mutex<Option<L>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadServer<StdListener> {
    pub fn bind(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<ThreadServer<StdListener>> {
        config.validate()?;
        let listener = StdListener::bind(config.bind_addr())?;
        ThreadServer::new(listener, config, handler)
    }
}

impl<L: BlockingListener> ThreadServer<L> {
    pub fn new(listener: L, config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<ThreadServer<L>> {
        ThreadServer::new_with_clock(listener, config, handler, Arc::new(SystemClock))
    }

    pub fn new_with_clock(listener: L, config: ServerConfig, handler: Arc<dyn ConnectionHandler>, clock: Arc<dyn Clock>) -> anyhow::Result<ThreadServer<L>> {
        config.validate()?;

        let local_addr = listener.local_addr().ok();
        Ok(ThreadServer {
            shared: Arc::new(ThreadShared::new(config, handler, clock)),
            local_addr,
            listener: Mutex::new(Some(listener)),
            monitor: Mutex::new(None),
        })
    }

    /// Spawns the monitor thread that accepts connections
    pub fn start(&self) -> anyhow::Result<()> {
        let Some(listener) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            bail!("server was started or closed already");
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let monitor = thread::Builder::new()
            .name("tcp-monitor".to_string())
            .spawn(move || monitor_loop(listener, shared));

        match monitor {
            Ok(monitor) => {
                *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
                info!("server listening on {:?} for up to {} connections", self.local_addr, self.shared.config.max_connections);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                bail!("can not spawn monitor thread: {}", e);
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn active_count(&self) -> usize {
        self.shared.registry.active_count()
    }

    /// snapshot of all live connections, ordered by id
    pub fn connections(&self) -> Vec<ConnRef> {
        self.shared.registry.snapshot()
            .into_iter()
            .map(|(_, conn)| conn)
            .collect()
    }

    pub fn connection(&self, id: ConnId) -> Option<ConnRef> {
        self.shared.registry.get(id)
    }

    /// Closes the listener, requests all live connections to close and waits for their workers
    ///  to finish. This takes up to one read timeout. Calling this more than once is harmless.
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        // a server that was never started still owns its listener
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();

        let monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(monitor) = monitor {
            if monitor.join().is_err() {
                error!("monitor thread panicked");
            }
        }

        // the monitor is gone, so no connections are added from here on
        for conn in self.connections() {
            conn.close();
        }

        let workers = std::mem::take(&mut *self.shared.workers());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                warn!("server closed from a worker thread - not waiting for that worker");
                continue;
            }
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }

        if self.local_addr.is_some() {
            debug!("server on {:?} closed", self.local_addr);
        }
    }
}

impl<L: BlockingListener> Drop for ThreadServer<L> {
    fn drop(&mut self) {
        self.close();
    }
}

fn monitor_loop<L: BlockingListener>(mut listener: L, shared: Arc<ThreadShared>) {
    debug!("monitor thread started");

    while shared.running.load(Ordering::Acquire) {
        match listener.accept_timeout(shared.config.accept_poll_interval) {
            Ok(Some(stream)) => on_accept(&shared, stream),
            Ok(None) => {}
            Err(e) => {
                warn!("error accepting connection: {}", e);
                thread::sleep(shared.config.accept_poll_interval);
            }
        }

        shared.workers().retain(|worker| !worker.is_finished());
    }

    drop(listener);
    info!("server stopped accepting connections");
}

fn on_accept<S: BlockingStream>(shared: &Arc<ThreadShared>, stream: S) {
    let peer_addr = stream.peer_addr();
    let writer = match stream.writer() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("can not set up connection from {:?}: {}", peer_addr, e);
            stream.abort();
            return;
        }
    };

    // admission and registration happen in one critical section
    let mut registry = shared.registry.lock();
    let Some(ticket) = registry.try_admit() else {
        drop(registry);
        debug!("rejecting connection from {:?}: {} connections active", peer_addr, shared.config.max_connections);
        reject(&shared.config.admission_policy, stream, writer);
        return;
    };
    let id = ConnId::from_raw(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let conn = Arc::new(ThreadConn::new(id, peer_addr, writer));
    registry.register(ticket, id, conn.clone());
    drop(registry);

    let mut builder = thread::Builder::new()
        .name(format!("tcp-conn-{}", id.to_raw()));
    if let Some(stack_size) = shared.config.worker_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let worker_shared = shared.clone();
    let worker_conn = conn.clone();
    match builder.spawn(move || worker::run(worker_shared, worker_conn, stream)) {
        Ok(worker) => {
            debug!("connection {} from {:?} accepted", id, peer_addr);
            shared.workers().push(worker);
        }
        Err(e) => {
            // the stream was moved into the closure, and dropping the closure closed it
            warn!("can not spawn worker thread for {:?}, dropping the connection: {}", peer_addr, e);
            conn.release_writer();
            shared.registry.release(id);
            if conn.status().lifecycle().begin_closing() && !conn.status().lifecycle().finish() {
                warn!("connection {} left CLOSING unexpectedly", id);
            }
        }
    }
}

fn reject<S: BlockingStream>(policy: &AdmissionPolicy, stream: S, mut writer: S::Writer) {
    match policy {
        AdmissionPolicy::RejectBeforeHandshake => {
            drop(writer);
            stream.abort();
        }
        AdmissionPolicy::RejectAfterConnect { refusal } => {
            if let Some(refusal) = refusal {
                if let Err(e) = writer.write_all(refusal).and_then(|_| writer.flush()) {
                    debug!("could not send refusal to {:?}: {}", stream.peer_addr(), e);
                }
            }
            drop(writer);
            stream.close();
        }
    }
}
