//! A simulated network stack for the event-driven server. Tests play the role of the peers and
//!  the packet layer through a [SimStackHandle], and every pcb records what the server did with
//!  it in a [PcbLog].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use crate::conn::ConnId;
use crate::error::StackError;
use crate::event::stack::{NetStack, Pcb, StackEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcbAction {
    Attached(ConnId),
    Detached,
    Recved(usize),
    Written(Vec<u8>),
    Output,
    Closed,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct PcbLog(Arc<Mutex<Vec<PcbAction>>>);

impl PcbLog {
    fn push(&self, action: PcbAction) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(action);
    }

    pub fn actions(&self) -> Vec<PcbAction> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// the context the server attached, i.e. the connection's id
    pub fn attached_id(&self) -> Option<ConnId> {
        self.actions().into_iter()
            .find_map(|a| match a {
                PcbAction::Attached(id) => Some(id),
                _ => None,
            })
    }

    /// payloads of all successful writes, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.actions().into_iter()
            .filter_map(|a| match a {
                PcbAction::Written(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// `true` if the server closed or aborted the pcb
    pub fn is_released(&self) -> bool {
        self.actions().iter()
            .any(|a| matches!(a, PcbAction::Closed | PcbAction::Aborted))
    }
}

pub struct SimPcb {
    peer_addr: SocketAddr,
    log: PcbLog,
    write_failure: Option<StackError>,
}

impl SimPcb {
    pub fn new(peer_addr: SocketAddr) -> (SimPcb, PcbLog) {
        let log = PcbLog::default();
        let pcb = SimPcb {
            peer_addr,
            log: log.clone(),
            write_failure: None,
        };
        (pcb, log)
    }

    /// every write to this pcb fails with `error`
    pub fn with_write_failure(mut self, error: StackError) -> SimPcb {
        self.write_failure = Some(error);
        self
    }
}

impl Pcb for SimPcb {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn attach(&mut self, ctx: ConnId) {
        self.log.push(PcbAction::Attached(ctx));
    }

    fn detach(&mut self) {
        self.log.push(PcbAction::Detached);
    }

    fn recved(&mut self, len: usize) {
        self.log.push(PcbAction::Recved(len));
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StackError> {
        if let Some(error) = self.write_failure {
            return Err(error);
        }
        self.log.push(PcbAction::Written(data.to_vec()));
        Ok(())
    }

    fn output(&mut self) -> Result<(), StackError> {
        self.log.push(PcbAction::Output);
        Ok(())
    }

    fn close(self) {
        self.log.push(PcbAction::Closed);
    }

    fn abort(self) {
        self.log.push(PcbAction::Aborted);
    }
}

pub struct SimStack {
    events: mpsc::UnboundedReceiver<StackEvent<SimPcb>>,
    listening: Arc<AtomicBool>,
}

/// The test's side of a [SimStack]: it injects accepted connections and per-connection events
#[derive(Clone)]
pub struct SimStackHandle {
    events: mpsc::UnboundedSender<StackEvent<SimPcb>>,
    listening: Arc<AtomicBool>,
    next_port: Arc<AtomicU16>,
}

impl SimStack {
    pub fn new() -> (SimStack, SimStackHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listening = Arc::new(AtomicBool::new(true));

        let stack = SimStack {
            events: receiver,
            listening: listening.clone(),
        };
        let handle = SimStackHandle {
            events: sender,
            listening,
            next_port: Arc::new(AtomicU16::new(40000)),
        };
        (stack, handle)
    }
}

#[async_trait]
impl NetStack for SimStack {
    type Pcb = SimPcb;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn next_event(&mut self) -> Option<StackEvent<SimPcb>> {
        loop {
            match self.events.recv().await? {
                StackEvent::Accepted(pcb) if !self.listening.load(Ordering::Acquire) => {
                    trace!("simulated stack is not listening - dropping connection from {:?}", pcb.peer_addr);
                    pcb.abort();
                }
                event => return Some(event),
            }
        }
    }

    fn stop_listening(&mut self) {
        self.listening.store(false, Ordering::Release);
    }
}

impl SimStackHandle {
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    fn send(&self, event: StackEvent<SimPcb>) {
        if self.events.send(event).is_err() {
            trace!("simulated stack is gone - dropping event");
        }
    }

    /// a new peer connects, the returned log shows how the server handled it
    pub fn connect(&self) -> PcbLog {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (pcb, log) = SimPcb::new(([192, 168, 0, 1], port).into());
        self.send(StackEvent::Accepted(pcb));
        log
    }

    pub fn receive(&self, ctx: ConnId, data: &[u8]) {
        self.send(StackEvent::Received { ctx, data: Bytes::copy_from_slice(data) });
    }

    pub fn peer_close(&self, ctx: ConnId) {
        self.send(StackEvent::PeerClosed { ctx });
    }

    pub fn ack(&self, ctx: ConnId, len: usize) {
        self.send(StackEvent::Sent { ctx, len });
    }

    pub fn fail(&self, ctx: ConnId, error: StackError) {
        self.send(StackEvent::Error { ctx, error });
    }
}
