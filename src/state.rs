//! State shared by every worker in a pool.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::app::Application;
use crate::config::WorkerConfig;
use crate::http::Acceptor;
use crate::worker::Heartbeat;

/// Everything a worker needs from its supervisor, cloneable across spawns.
///
/// Heartbeats only flow worker -> supervisor; the shutdown flag only flows
/// supervisor -> worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub app: Arc<dyn Application>,
    pub acceptor: Arc<Acceptor>,
    pub heartbeats: mpsc::Sender<Heartbeat>,
    pub shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    /// Creates a worker context from the pool configuration, application and listener.
    pub fn new(
        config: WorkerConfig,
        app: Arc<dyn Application>,
        acceptor: Acceptor,
        heartbeats: mpsc::Sender<Heartbeat>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            app,
            acceptor: Arc::new(acceptor),
            heartbeats,
            shutdown,
        }
    }
}
