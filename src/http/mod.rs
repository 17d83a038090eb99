//! HTTP plumbing below the worker.
//!
//! - [`acceptor`]: the single shared listening socket and accepted connections
//! - [`connection`]: drives one HTTP/1.1 connection with keep-alive and drain
//! - [`shutdown`]: SIGTERM/SIGINT handling

pub mod acceptor;
pub mod connection;
mod shutdown;

pub use acceptor::{Acceptor, Activity, Connection};
pub use connection::{drive, ConnectionLimits};
pub use shutdown::shutdown_signal;
