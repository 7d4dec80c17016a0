//! Everything that happens to a connection in the event-driven model happens here, on the
//!  network thread: accept, received data, acks, errors, idle checks, queued writes and teardown.
//!  The records are owned by the [EventCore] and never leave the network thread, so there is no
//!  per-connection locking; only the registry is shared.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use crate::admission::AdmissionPolicy;
use crate::buffers::block_pool::{BlockPool, PoolKey};
use crate::buffers::buffer_pool::{SendBufferPool, SendRequest};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::conn::{ConnId, ConnRef, Connection, ConnectionHandler};
use crate::error::StackError;
use crate::event::server::EventConn;
use crate::event::stack::{Pcb, StackEvent};
use crate::lifecycle::{idle_expired, CloseReason, ConnState};
use crate::registry::Registry;

/// A closure to be run on the network thread (callback injection)
pub type Job<P> = Box<dyn FnOnce(&mut EventCore<P>) + Send>;

/// State shared between the network thread and application threads
pub struct EventShared<P: Pcb> {
    config: ServerConfig,
    registry: Registry<ConnRef>,
    handler: Arc<dyn ConnectionHandler>,
    send_pool: Arc<SendBufferPool>,
    clock: Arc<dyn Clock>,
    jobs: mpsc::UnboundedSender<Job<P>>,
}

impl<P: Pcb> EventShared<P> {
    pub fn new(config: ServerConfig, handler: Arc<dyn ConnectionHandler>, clock: Arc<dyn Clock>) -> (Arc<EventShared<P>>, mpsc::UnboundedReceiver<Job<P>>) {
        let (jobs, jobs_receiver) = mpsc::unbounded_channel();
        let shared = EventShared {
            registry: Registry::new(config.max_connections),
            send_pool: Arc::new(SendBufferPool::new(config.send_chunk_size, config.send_pool_size)),
            config,
            handler,
            clock,
            jobs,
        };
        (Arc::new(shared), jobs_receiver)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry<ConnRef> {
        &self.registry
    }

    pub fn send_pool(&self) -> &Arc<SendBufferPool> {
        &self.send_pool
    }

    /// Schedules `job` to run on the network thread. Jobs run in the order they were injected.
    pub fn inject(&self, job: Job<P>) -> Result<(), StackError> {
        self.jobs.send(job)
            .map_err(|_| StackError::NotRunning)
    }

    /// Splits `data` into chunks and queues a write for each of them, stopping at the first
    ///  chunk that can not be queued. Returns the number of bytes queued.
    pub fn send(&self, id: ConnId, data: &[u8]) -> usize {
        let mut queued = 0;
        for chunk in data.chunks(self.config.send_chunk_size) {
            let Some(request) = SendRequest::try_new(&self.send_pool, id, chunk) else {
                debug!("connection {}: no send buffer available, dropping {} of {} bytes", id, data.len() - queued, data.len());
                break;
            };

            if let Err(e) = self.inject(Box::new(move |core| core.execute_write(request))) {
                debug!("connection {}: can not schedule write ({}), dropping {} of {} bytes", id, e, data.len() - queued, data.len());
                break;
            }
            trace!("connection {}: queued chunk of {} bytes", id, chunk.len());
            queued += chunk.len();
        }
        queued
    }

    /// Schedules a teardown of the connection, a no-op if the connection is already going away
    pub fn close(&self, id: ConnId) {
        if self.inject(Box::new(move |core| core.close_connection(id))).is_err() {
            trace!("connection {}: network thread is gone, ignoring close request", id);
        }
    }
}

struct ConnRecord<P: Pcb> {
    conn: Arc<EventConn<P>>,
    /// `None` once the stack released the connection
    pcb: Option<P>,
    last_active: Instant,
    unacked: usize,
}

pub struct EventCore<P: Pcb> {
    shared: Arc<EventShared<P>>,
    records: BlockPool<ConnRecord<P>>,
}

impl<P: Pcb> EventCore<P> {
    pub fn new(shared: Arc<EventShared<P>>) -> EventCore<P> {
        let capacity = shared.config.max_connections;
        EventCore::with_capacity(shared, capacity)
    }

    fn with_capacity(shared: Arc<EventShared<P>>, capacity: usize) -> EventCore<P> {
        EventCore {
            shared,
            records: BlockPool::new(capacity),
        }
    }

    pub fn run_job(&mut self, job: Job<P>) {
        job(self)
    }

    pub fn handle_event(&mut self, event: StackEvent<P>) {
        match event {
            StackEvent::Accepted(pcb) => self.on_accept(pcb),
            StackEvent::Received { ctx, data } => self.on_recv(ctx, &data),
            StackEvent::PeerClosed { ctx } => self.teardown(ctx, CloseReason::PeerClosed),
            StackEvent::ReceiveFailed { ctx, error } => self.teardown(ctx, CloseReason::Error(error)),
            StackEvent::Sent { ctx, len } => self.on_sent(ctx, len),
            StackEvent::Error { ctx, error } => self.on_error(ctx, error),
        }
    }

    /// number of live records
    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// bytes written to the transport for a connection that were not acknowledged yet
    pub fn unacked(&self, id: ConnId) -> Option<usize> {
        self.records.get(id.into())
            .map(|record| record.unacked)
    }

    fn on_accept(&mut self, pcb: P) {
        let peer_addr = pcb.peer_addr();
        let shared = self.shared.clone();

        let mut registry = shared.registry.lock();
        let Some(ticket) = registry.try_admit() else {
            drop(registry);
            debug!("rejecting connection from {:?}: {} connections active", peer_addr, shared.config.max_connections);
            Self::reject(pcb, &shared.config.admission_policy);
            return;
        };

        let weak_shared = Arc::downgrade(&shared);
        let allocated = self.records.alloc_with(|key| ConnRecord {
            conn: Arc::new(EventConn::new(key.into(), peer_addr, weak_shared)),
            pcb: None,
            last_active: shared.clock.now(),
            unacked: 0,
        });
        let Some((key, record)) = allocated else {
            registry.withdraw(ticket);
            drop(registry);
            warn!("no connection record available for {:?}, aborting", peer_addr);
            pcb.abort();
            return;
        };

        let id = ConnId::from(key);
        registry.register(ticket, id, record.conn.clone());
        drop(registry);

        let mut pcb = pcb;
        pcb.attach(id);
        record.pcb = Some(pcb);

        if record.conn.status().lifecycle().activate() {
            debug!("connection {} from {:?} accepted", id, peer_addr);
            let conn: ConnRef = record.conn.clone();
            shared.handler.on_connect(&conn);
        }
    }

    fn reject(mut pcb: P, policy: &AdmissionPolicy) {
        match policy {
            AdmissionPolicy::RejectBeforeHandshake => pcb.abort(),
            AdmissionPolicy::RejectAfterConnect { refusal } => {
                if let Some(refusal) = refusal {
                    if let Err(e) = pcb.write(refusal).and_then(|_| pcb.output()) {
                        debug!("could not send refusal to {:?}: {}", pcb.peer_addr(), e);
                    }
                }
                pcb.close();
            }
        }
    }

    fn active_record(&mut self, id: ConnId) -> Option<&mut ConnRecord<P>> {
        match self.records.get_mut(id.into()) {
            Some(record) if record.conn.state() == ConnState::Active => Some(record),
            Some(_) => None,
            None => {
                trace!("event for stale connection {} - ignoring", id);
                None
            }
        }
    }

    fn on_recv(&mut self, id: ConnId, data: &[u8]) {
        let now = self.shared.clock.now();
        let Some(record) = self.active_record(id) else {
            return;
        };

        trace!("connection {}: received {} bytes", id, data.len());
        record.last_active = now;
        if let Some(pcb) = record.pcb.as_mut() {
            pcb.recved(data.len());
        }

        let conn: ConnRef = record.conn.clone();
        self.shared.handler.on_data(&conn, data);
    }

    fn on_sent(&mut self, id: ConnId, len: usize) {
        let Some(record) = self.active_record(id) else {
            return;
        };

        record.unacked = record.unacked.saturating_sub(len);
        let conn: ConnRef = record.conn.clone();
        self.shared.handler.on_sent(&conn, len);
    }

    fn on_error(&mut self, id: ConnId, error: StackError) {
        if let Some(record) = self.records.get_mut(id.into()) {
            // the stack released the pcb already, so it must not be closed again
            record.pcb = None;
        }
        self.teardown(id, CloseReason::Error(error));
    }

    /// Evicts all connections that were idle for longer than the idle timeout
    pub fn poll_all(&mut self) {
        let now = self.shared.clock.now();
        let idle_timeout = self.shared.config.idle_timeout;

        let expired = self.records.keys()
            .into_iter()
            .filter(|&key| self.records.get(key)
                .map(|record| idle_expired(record.last_active, now, idle_timeout))
                .unwrap_or(false))
            .collect::<Vec<_>>();

        for key in expired {
            self.teardown(key.into(), CloseReason::IdleTimeout);
        }
    }

    pub fn close_connection(&mut self, id: ConnId) {
        self.teardown(id, CloseReason::LocalClose);
    }

    /// Writes a queued chunk, or discards it if the connection went away in the meantime. The
    ///  request's buffer goes back to the pool either way.
    pub fn execute_write(&mut self, request: SendRequest) {
        let id = request.conn_id();
        let Some(record) = self.active_record(id) else {
            trace!("connection {}: not active, dropping chunk of {} bytes", id, request.len());
            return;
        };
        let Some(pcb) = record.pcb.as_mut() else {
            return;
        };

        match pcb.write(request.payload()).and_then(|_| pcb.output()) {
            Ok(()) => {
                trace!("connection {}: wrote {} bytes", id, request.len());
                record.unacked += request.len();
            }
            Err(e) => {
                debug!("connection {}: write of {} bytes failed: {}", id, request.len(), e);
            }
        }
    }

    /// Tears down all live connections
    pub fn shutdown(&mut self) {
        for key in self.records.keys() {
            self.teardown(key.into(), CloseReason::Shutdown);
        }
    }

    fn teardown(&mut self, id: ConnId, reason: CloseReason) {
        let key = PoolKey::from(id);
        let Some(record) = self.records.get_mut(key) else {
            trace!("connection {} is already gone - ignoring {:?}", id, reason);
            return;
        };
        if !record.conn.status().lifecycle().begin_closing() {
            trace!("connection {} is already closing - ignoring {:?}", id, reason);
            return;
        }
        debug!("closing connection {}: {:?}", id, reason);

        let mut pcb = record.pcb.take();
        if let Some(pcb) = pcb.as_mut() {
            pcb.detach();
        }

        let conn: ConnRef = record.conn.clone();
        match &reason {
            CloseReason::Error(e) => self.shared.handler.on_error(&conn, e),
            _ => self.shared.handler.on_close(&conn),
        }

        if let Some(pcb) = pcb {
            pcb.close();
        }

        self.shared.registry.release(id);
        if !conn.status().lifecycle().finish() {
            warn!("connection {} left CLOSING unexpectedly", id);
        }
        self.records.free(key);
    }
}
