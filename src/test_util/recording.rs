use std::sync::{Mutex, PoisonError};
use crate::conn::{ConnId, ConnRef, ConnectionHandler};
use crate::error::StackError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    Connect(ConnId),
    Data(ConnId, Vec<u8>),
    Sent(ConnId, usize),
    Close(ConnId),
    Error(ConnId, StackError),
}

/// A [ConnectionHandler] that records every callback in order. In echo mode it also sends all
///  received data back to the peer.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    echo: bool,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        RecordingHandler::default()
    }

    pub fn echo() -> RecordingHandler {
        RecordingHandler {
            echo: true,
            ..RecordingHandler::default()
        }
    }

    fn record(&self, event: HandlerEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn count(&self, predicate: impl Fn(&HandlerEvent) -> bool) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| predicate(e))
            .count()
    }

    pub fn num_connects(&self) -> usize {
        self.count(|e| matches!(e, HandlerEvent::Connect(_)))
    }

    pub fn num_closes(&self) -> usize {
        self.count(|e| matches!(e, HandlerEvent::Close(_)))
    }

    pub fn num_errors(&self) -> usize {
        self.count(|e| matches!(e, HandlerEvent::Error(..)))
    }

    /// ids of closed connections in the order they were closed
    pub fn closed_ids(&self) -> Vec<ConnId> {
        self.events().into_iter()
            .filter_map(|e| match e {
                HandlerEvent::Close(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// all data received for a connection, concatenated
    pub fn data_for(&self, id: ConnId) -> Vec<u8> {
        self.events().into_iter()
            .filter_map(|e| match e {
                HandlerEvent::Data(data_id, data) if data_id == id => Some(data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// total number of acknowledged bytes over all connections
    pub fn num_sent_bytes(&self) -> usize {
        self.events().into_iter()
            .map(|e| match e {
                HandlerEvent::Sent(_, len) => len,
                _ => 0,
            })
            .sum()
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_connect(&self, conn: &ConnRef) {
        self.record(HandlerEvent::Connect(conn.id()));
    }

    fn on_data(&self, conn: &ConnRef, data: &[u8]) {
        self.record(HandlerEvent::Data(conn.id(), data.to_vec()));
        if self.echo {
            conn.send(data);
        }
    }

    fn on_sent(&self, conn: &ConnRef, acked_len: usize) {
        self.record(HandlerEvent::Sent(conn.id(), acked_len));
    }

    fn on_close(&self, conn: &ConnRef) {
        self.record(HandlerEvent::Close(conn.id()));
    }

    fn on_error(&self, conn: &ConnRef, error: &StackError) {
        self.record(HandlerEvent::Error(conn.id(), *error));
    }
}
