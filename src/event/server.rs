use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::conn::{ConnId, ConnRef, ConnStatus, Connection, ConnectionHandler};
use crate::event::core::{EventCore, EventShared, Job};
use crate::event::stack::{NetStack, Pcb};
use crate::event::tokio_stack::{TokioPcb, TokioStack};

/// The application's handle to a connection of an [EventServer]. Everything it does is injected
///  into the network thread, so it can be used from any thread.
pub struct EventConn<P: Pcb> {
    status: ConnStatus,
    shared: Weak<EventShared<P>>,
}

impl<P: Pcb> EventConn<P> {
    pub fn new(id: ConnId, peer_addr: Option<SocketAddr>, shared: Weak<EventShared<P>>) -> EventConn<P> {
        EventConn {
            status: ConnStatus::new(id, peer_addr),
            shared,
        }
    }
}

impl<P: Pcb> Connection for EventConn<P> {
    fn status(&self) -> &ConnStatus {
        &self.status
    }

    fn send(&self, data: &[u8]) -> usize {
        if !self.status.is_alive() {
            trace!("connection {} is not alive, dropping {} bytes", self.status.id(), data.len());
            return 0;
        }

        match self.shared.upgrade() {
            Some(shared) => shared.send(self.status.id(), data),
            None => 0,
        }
    }

    fn close(&self) {
        if self.status.state().is_terminating() {
            return;
        }
        self.status.request_close();

        if let Some(shared) = self.shared.upgrade() {
            shared.close(self.status.id());
        }
    }
}

/// TCP server with a single network thread. All transport events, idle checks and socket
///  operations for all connections run on that thread, and application calls are injected into
///  it as jobs. Handler callbacks run on the network thread as well, so a callback that blocks
///  stalls every connection.
///
/// Listening starts with construction. Dropping the server closes it.
pub struct EventServer<P: Pcb> {
    shared: Arc<EventShared<P>>,
    local_addr: Option<SocketAddr>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    net_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventServer<TokioPcb> {
    /// Binds a TCP listener for `config` and starts serving it
    pub fn bind(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<EventServer<TokioPcb>> {
        config.validate()?;
        let stack = TokioStack::bind(config.bind_addr())?;
        EventServer::start(stack, config, handler)
    }
}

impl<P: Pcb> EventServer<P> {
    pub fn start<S: NetStack<Pcb = P>>(stack: S, config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> anyhow::Result<EventServer<P>> {
        EventServer::start_with_clock(stack, config, handler, Arc::new(SystemClock))
    }

    pub fn start_with_clock<S: NetStack<Pcb = P>>(stack: S, config: ServerConfig, handler: Arc<dyn ConnectionHandler>, clock: Arc<dyn Clock>) -> anyhow::Result<EventServer<P>> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let local_addr = stack.local_addr();
        let poll_interval = config.poll_interval;
        let stack_size = config.net_thread_stack_size;

        let (shared, jobs) = EventShared::new(config, handler, clock);
        let core = EventCore::new(shared.clone());
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let mut builder = thread::Builder::new()
            .name("tcp-net".to_string());
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }
        let net_thread = builder.spawn(move || {
            runtime.block_on(net_loop(stack, core, jobs, shutdown_receiver, poll_interval))
        })?;

        info!("server listening on {:?} for up to {} connections", local_addr, shared.config().max_connections);
        Ok(EventServer {
            shared,
            local_addr,
            shutdown: Mutex::new(Some(shutdown_sender)),
            net_thread: Mutex::new(Some(net_thread)),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        self.shared.config()
    }

    pub fn active_count(&self) -> usize {
        self.shared.registry().active_count()
    }

    /// snapshot of all live connections, ordered by id
    pub fn connections(&self) -> Vec<ConnRef> {
        self.shared.registry().snapshot()
            .into_iter()
            .map(|(_, conn)| conn)
            .collect()
    }

    pub fn connection(&self, id: ConnId) -> Option<ConnRef> {
        self.shared.registry().get(id)
    }

    /// Number of bytes written for a connection that were not acknowledged yet. This waits for
    ///  the network thread, so it must not be called from a handler callback.
    pub fn unacked(&self, id: ConnId) -> Option<usize> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        self.shared.inject(Box::new(move |core: &mut EventCore<P>| {
            let _ = sender.send(core.unacked(id));
        })).ok()?;

        receiver.recv().ok().flatten()
    }

    /// Stops listening, tears down all live connections and stops the network thread. Calling
    ///  this more than once is harmless.
    pub fn close(&self) {
        if let Some(shutdown) = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!("signalling shutdown to the network thread");
            let _ = shutdown.send(());
        }

        let Some(net_thread) = self.net_thread.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        if net_thread.thread().id() == thread::current().id() {
            warn!("server closed from a callback - network thread stops after the callback returns");
            return;
        }
        if net_thread.join().is_err() {
            error!("network thread panicked");
        }
        info!("server on {:?} stopped", self.local_addr);
    }
}

impl<P: Pcb> Drop for EventServer<P> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn net_loop<S: NetStack>(
    mut stack: S,
    mut core: EventCore<S::Pcb>,
    mut jobs: mpsc::UnboundedReceiver<Job<S::Pcb>>,
    mut shutdown: oneshot::Receiver<()>,
    poll_interval: Duration,
) {
    debug!("network thread started");

    let mut poll_ticks = interval(poll_interval);
    poll_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stack_exhausted = false;
    loop {
        select! {
            biased;
            // a dropped sender means the server is gone, which is a shutdown as well
            _ = &mut shutdown => break,
            opt_job = jobs.recv() => match opt_job {
                Some(job) => core.run_job(job),
                None => break,
            },
            opt_event = stack.next_event(), if !stack_exhausted => match opt_event {
                Some(event) => core.handle_event(event),
                None => {
                    debug!("network stack produces no more events");
                    stack_exhausted = true;
                }
            },
            _ = poll_ticks.tick() => core.poll_all(),
        }
    }

    // whatever the application queued before closing still runs, in order
    while let Ok(job) = jobs.try_recv() {
        core.run_job(job);
    }

    stack.stop_listening();
    core.shutdown();
    stack.flush().await;
    debug!("network thread stopped");
}
