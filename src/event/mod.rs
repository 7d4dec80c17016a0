//! Event-driven server: a single network thread executes everything that touches a socket or a
//!  connection record, and application threads reach it through callback injection.

pub mod core;
pub mod server;
pub mod stack;
pub mod tokio_stack;
