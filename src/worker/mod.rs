//! Worker processes.
//!
//! A worker is one independent execution unit of the pool: it pulls connections
//! from the shared [`Acceptor`](crate::http::Acceptor), serves them one at a
//! time, and reports its state to the supervisor through heartbeats.
//!
//! State machine:
//! `Starting -> Ready -> Busy -> Ready ... -> Terminating -> Dead`,
//! with `Dead` reachable from any state on a fatal fault.
//!
//! A worker is `Busy` for as long as it owns a connection, so a pool held by
//! idle clients is not reported as ready to accept. It keeps heartbeating
//! while the connection waits for a request and goes silent only while a
//! request is in flight. A request that outlives the timeout is cut off by the
//! worker itself (504); if the worker cannot manage even that, the silence
//! lets the supervisor evict it. Once shutdown is signalled the worker reports
//! `Terminating` while it drains its connection.

mod dispatch;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::service::service_fn;
use tokio::time::MissedTickBehavior;
use tracing::instrument;

use crate::config::{ACCEPT_ERROR_DELAY_MS, FIRST_REQUEST_TIMEOUT_SECS, HEARTBEAT_INTERVAL_MS};
use crate::error::WorkerFault;
use crate::http::{self, Connection, ConnectionLimits};
use crate::state::WorkerContext;
use crate::supervisor::WorkerId;

pub use dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Ready = 1,
    Busy = 2,
    Terminating = 3,
    Dead = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Ready,
            2 => WorkerState::Busy,
            3 => WorkerState::Terminating,
            _ => WorkerState::Dead,
        }
    }

    /// Whether the worker counts toward the live pool size.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Ready | WorkerState::Busy
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Terminating => "terminating",
            WorkerState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// One-way liveness signal from a worker to its supervisor.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub worker: WorkerId,
    pub state: WorkerState,
    pub at: Instant,
}

/// A worker's view of its own state, readable from request handling.
#[derive(Debug)]
pub struct WorkerStatus {
    state: AtomicU8,
    fatal: AtomicBool,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Starting as u8),
            fatal: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record process-level corruption; the worker exits once the current
    /// connection is closed.
    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
        self.set(WorkerState::Dead);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker bound to the pool's shared listener.
pub struct Worker {
    id: WorkerId,
    ctx: WorkerContext,
    status: Arc<WorkerStatus>,
}

impl Worker {
    pub fn new(id: WorkerId, ctx: WorkerContext) -> Self {
        Self {
            id,
            ctx,
            status: Arc::new(WorkerStatus::new()),
        }
    }

    /// Accept and serve connections until shutdown is signalled.
    #[instrument(name = "http.worker", skip(self), fields(worker_id = %self.id))]
    pub async fn run(self) -> Result<(), WorkerFault> {
        tracing::debug!("Worker starting");

        let mut shutdown = self.ctx.shutdown.clone();
        let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !*shutdown.borrow_and_update() {
            self.transition(WorkerState::Ready).await;
            tracing::info!("Worker ready");
        }

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Supervisor is gone; nobody is left to report to
                        break;
                    }
                }

                accepted = self.ctx.acceptor.accept_next() => match accepted {
                    Ok(connection) => {
                        self.serve(connection).await;
                        if self.status.is_fatal() {
                            tracing::error!("Worker exiting after fatal handler fault");
                            return Err(WorkerFault::Crashed {
                                id: self.id,
                                reason: "fatal handler fault".to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_DELAY_MS)).await;
                    }
                },

                _ = heartbeat.tick() => self.beat().await,
            }
        }

        self.transition(WorkerState::Terminating).await;
        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Serve every request on one connection, in arrival order.
    async fn serve(&self, connection: Connection) {
        let peer = connection.peer();
        let activity = connection.activity();
        self.transition(WorkerState::Busy).await;

        let dispatcher = Dispatcher::new(
            self.id,
            Arc::clone(&self.ctx.app),
            Arc::clone(&self.status),
            self.ctx.heartbeats.clone(),
            connection.activity(),
            self.ctx.config.request_timeout(),
        );

        let service = service_fn(move |request: hyper::Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            async move {
                let request = request.map(axum::body::Body::new);
                Ok::<_, std::convert::Infallible>(dispatcher.dispatch(request).await)
            }
        });

        let limits = ConnectionLimits {
            keep_alive: self.ctx.config.keep_alive(),
            first_request: Duration::from_secs(FIRST_REQUEST_TIMEOUT_SECS),
        };

        tracing::debug!(%peer, "Connection accepted");

        let mut shutdown = self.ctx.shutdown.clone();
        let mut draining = *shutdown.borrow_and_update();
        let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let drive = http::drive(connection, service, limits, self.ctx.shutdown.clone());
        tokio::pin!(drive);

        let result = loop {
            tokio::select! {
                result = &mut drive => break result,

                changed = shutdown.changed(), if !draining => {
                    draining = true;
                    if changed.is_ok() {
                        self.transition(WorkerState::Terminating).await;
                    }
                }

                _ = heartbeat.tick() => {
                    // In-flight requests stay silent so a hung handler shows up as stale
                    if !activity.is_in_flight() {
                        self.beat().await;
                    }
                }
            }
        };

        match result {
            Ok(()) => tracing::debug!(%peer, "Connection closed"),
            Err(e) => tracing::debug!(%peer, error = %e, "Connection closed with error"),
        }

        if !*self.ctx.shutdown.borrow() {
            self.transition(WorkerState::Ready).await;
        }
    }

    async fn transition(&self, state: WorkerState) {
        if self.status.is_fatal() {
            return;
        }
        self.status.set(state);
        send_heartbeat(&self.ctx.heartbeats, self.id, state).await;
    }

    async fn beat(&self) {
        let state = self.status.get();
        if matches!(state, WorkerState::Ready | WorkerState::Busy) {
            send_heartbeat(&self.ctx.heartbeats, self.id, state).await;
        }
    }
}

pub(crate) async fn send_heartbeat(
    heartbeats: &tokio::sync::mpsc::Sender<Heartbeat>,
    worker: WorkerId,
    state: WorkerState,
) {
    let heartbeat = Heartbeat {
        worker,
        state,
        at: Instant::now(),
    };
    if let Err(err) = heartbeats.send(heartbeat).await {
        tracing::debug!(error = %err, "Failed to send heartbeat");
    }
}
