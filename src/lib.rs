//! prefork: a pre-fork HTTP worker pool supervisor.
//!
//! A fixed pool of workers shares one listening socket, answers a liveness
//! endpoint directly, enforces a per-request timeout and keep-alive window,
//! and shuts down gracefully. A supervisor keeps the pool at size, evicting
//! unresponsive workers and restarting dead ones with backoff.

pub mod app;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod middleware;
pub mod probe;
pub mod routes;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use app::Application;
pub use config::{ConfigError, WorkerConfig};
pub use error::{HandlerFault, WorkerFault};
pub use health::{HealthResult, HealthStatus};
pub use supervisor::{
    ExitReason, PoolSnapshot, Supervisor, SupervisorHandle, SupervisorPhase, WorkerId,
};
pub use worker::WorkerState;
