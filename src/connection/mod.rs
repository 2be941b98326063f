//! Transports and the per-connection manager that binds them to the command
//! protocol. TCP sockets and local pipes are interchangeable; both carry the
//! same encoding.

pub mod manager;
pub mod transport;

pub use manager::{ConnectionManager, ConnectionState};
pub use transport::{connect, BoxedStream, Duplex, Listener};
