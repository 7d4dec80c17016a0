//! An embeddable TCP server with a bounded number of concurrent connections. Both concurrency
//!  models share the connection lifecycle, admission control, the registry and idle eviction:
//!
//! * [event::server::EventServer] drives all connections from a single network thread
//! * [threaded::server::ThreadServer] gives every connection its own worker thread

pub mod admission;
pub mod buffers;
pub mod clock;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod registry;
pub mod test_util;
pub mod threaded;

pub use admission::AdmissionPolicy;
pub use config::ServerConfig;
pub use conn::{ConnId, ConnRef, Connection, ConnectionHandler};
pub use error::StackError;
pub use event::server::EventServer;
pub use lifecycle::ConnState;
pub use threaded::server::ThreadServer;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
