//! Thread-per-connection server: a monitor thread accepts and admits connections, and each
//!  admitted connection gets a worker thread that owns its stream until teardown. Workers poll
//!  with a read timeout, so close requests and idle eviction are noticed within one timeout.

pub mod server;
pub mod transport;
mod worker;
