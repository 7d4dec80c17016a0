use std::io;
use thiserror::Error;

/// Transport-level failure as reported by the network stack. This is what `on_error` receives,
///  and it is also used internally for the outcome of writes and callback injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("connection reset by peer")]
    Reset,
    #[error("connection aborted")]
    Aborted,
    #[error("transport timed out")]
    TimedOut,
    #[error("transport send buffer is full")]
    BufferFull,
    #[error("not connected")]
    NotConnected,
    #[error("network thread is not running")]
    NotRunning,
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for StackError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => StackError::Reset,
            io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => StackError::Aborted,
            io::ErrorKind::TimedOut => StackError::TimedOut,
            io::ErrorKind::NotConnected => StackError::NotConnected,
            kind => StackError::Io(kind),
        }
    }
}
