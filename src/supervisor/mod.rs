//! Worker pool supervisor.
//!
//! The supervisor binds the shared listener, keeps exactly `count` workers
//! live, and coordinates shutdown. It runs as a single task that owns the
//! worker table outright:
//!
//! - workers report state changes over a heartbeat channel (one way)
//! - the [`SupervisorHandle`] sends commands over a command channel
//! - the table is published read-only after each change through a watch channel
//!
//! Busy workers that stop heartbeating past the request timeout are evicted and
//! replaced at once. Workers that die on their own are restarted, with
//! exponential backoff when deaths keep recurring. A restart streak past the
//! limit drains the pool and reports [`ExitReason::RestartsExhausted`].

mod backoff;
mod table;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::app::Application;
use crate::config::{
    ConfigError, WorkerConfig, COMMAND_CHANNEL_CAPACITY, EVICTION_SLACK_MS,
    HEARTBEAT_CHANNEL_CAPACITY, SUPERVISOR_TICK_MS,
};
use crate::error::WorkerFault;
use crate::health::{HealthResult, HealthStatus};
use crate::http::Acceptor;
use crate::state::WorkerContext;
use crate::worker::{Heartbeat, Worker, WorkerState};

pub use backoff::RestartBackoff;
pub use table::{WorkerHandle, WorkerId, WorkerTable};

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A shutdown was requested
    Shutdown,
    /// Workers kept dying faster than the backoff policy tolerates
    RestartsExhausted,
    /// The supervisor task ended without publishing a reason
    SupervisorLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Running,
    Draining,
    Stopped(ExitReason),
}

/// Read-only copy of the worker table.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub phase: SupervisorPhase,
    pub target: usize,
    pub workers: Vec<WorkerHandle>,
}

impl PoolSnapshot {
    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state == state).count()
    }

    pub fn ready_count(&self) -> usize {
        self.count_in(WorkerState::Ready)
    }

    pub fn live_count(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_live()).count()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id == id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id).collect()
    }

    /// Healthy while any worker is `Ready` or `Busy`.
    pub fn health(&self) -> HealthStatus {
        match self.phase {
            SupervisorPhase::Stopped(_) => HealthStatus::now(HealthResult::Unhealthy),
            _ => HealthStatus::for_pool(self.workers.iter().map(|w| w.state)),
        }
    }
}

enum Command {
    Shutdown { grace: Duration },
    Kill(WorkerId),
}

/// Control surface for a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<PoolSnapshot>,
    local_addr: SocketAddr,
}

impl SupervisorHandle {
    /// Address the shared listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn health(&self) -> HealthStatus {
        self.snapshot.borrow().health()
    }

    /// Wait until the published table satisfies `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<PoolSnapshot>
    where
        F: FnMut(&PoolSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| predicate(s)).await.map(|s| (*s).clone())
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    /// Wait until every worker of the pool is `Ready`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |s| {
            s.phase == SupervisorPhase::Running && s.ready_count() >= s.target
        })
        .await
        .is_some()
    }

    /// Abruptly terminate a worker, as an external SIGKILL would.
    /// The supervisor sees an unexpected death and restarts it.
    pub fn kill_worker(&self, id: WorkerId) -> bool {
        self.commands.try_send(Command::Kill(id)).is_ok()
    }

    /// Stop accepting, let in-flight requests run for up to `grace`, abort the
    /// rest. Calling it again only waits for the first shutdown to finish.
    pub async fn shutdown(&self, grace: Duration) -> ExitReason {
        if self
            .commands
            .send(Command::Shutdown { grace })
            .await
            .is_err()
        {
            tracing::debug!("Supervisor already stopped");
        }
        self.stopped().await
    }

    /// Resolves once the supervisor has stopped, for whatever reason.
    pub async fn stopped(&self) -> ExitReason {
        let mut rx = self.snapshot.clone();
        let phase = rx
            .wait_for(|s| matches!(s.phase, SupervisorPhase::Stopped(_)))
            .await
            .map(|s| s.phase);
        match phase {
            Ok(SupervisorPhase::Stopped(reason)) => reason,
            _ => ExitReason::SupervisorLost,
        }
    }
}

/// The monitoring task. Sole writer of the worker table.
pub struct Supervisor {
    ctx: Option<WorkerContext>,
    target: usize,
    eviction_limit: Duration,
    table: WorkerTable,
    tasks: JoinSet<Result<(), WorkerFault>>,
    task_workers: HashMap<tokio::task::Id, WorkerId>,
    abort_handles: HashMap<WorkerId, AbortHandle>,
    evicted: HashSet<WorkerId>,
    heartbeats: mpsc::Receiver<Heartbeat>,
    commands: mpsc::Receiver<Command>,
    shutdown_tx: watch::Sender<bool>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    backoff: RestartBackoff,
    pending_restarts: Vec<Instant>,
    next_id: u64,
    phase: SupervisorPhase,
    exit_reason: ExitReason,
    drain_deadline: Option<Instant>,
}

impl Supervisor {
    /// Bind the listener, spawn `count` workers and start monitoring them.
    pub async fn start(
        config: WorkerConfig,
        app: Arc<dyn Application>,
    ) -> Result<SupervisorHandle, ConfigError> {
        Self::start_with_backoff(config, app, RestartBackoff::default()).await
    }

    /// Like [`Supervisor::start`] with a custom restart policy.
    pub async fn start_with_backoff(
        config: WorkerConfig,
        app: Arc<dyn Application>,
        backoff: RestartBackoff,
    ) -> Result<SupervisorHandle, ConfigError> {
        let acceptor = Acceptor::bind(config.bind_address()).await?;
        let local_addr = acceptor.local_addr();

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(HEARTBEAT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let target = config.count();
        let eviction_limit = config.request_timeout() + Duration::from_millis(EVICTION_SLACK_MS);
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot {
            phase: SupervisorPhase::Running,
            target,
            workers: Vec::new(),
        });

        tracing::info!(
            workers = target,
            %local_addr,
            timeout_ms = config.request_timeout().as_millis() as u64,
            keep_alive_ms = config.keep_alive().as_millis() as u64,
            "Starting worker pool"
        );

        let ctx = WorkerContext::new(config, app, acceptor, heartbeat_tx, shutdown_rx);

        let mut supervisor = Supervisor {
            ctx: Some(ctx),
            target,
            eviction_limit,
            table: WorkerTable::new(),
            tasks: JoinSet::new(),
            task_workers: HashMap::new(),
            abort_handles: HashMap::new(),
            evicted: HashSet::new(),
            heartbeats: heartbeat_rx,
            commands: command_rx,
            shutdown_tx,
            snapshot_tx,
            backoff,
            pending_restarts: Vec::new(),
            next_id: 1,
            phase: SupervisorPhase::Running,
            exit_reason: ExitReason::Shutdown,
            drain_deadline: None,
        };

        for _ in 0..target {
            supervisor.spawn_worker();
        }

        tokio::spawn(supervisor.monitor());

        Ok(SupervisorHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            local_addr,
        })
    }

    async fn monitor(mut self) -> ExitReason {
        let mut tick = tokio::time::interval(Duration::from_millis(SUPERVISOR_TICK_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let draining = self.phase == SupervisorPhase::Draining;
            if draining && self.tasks.is_empty() {
                break;
            }
            let next_restart = self.pending_restarts.iter().min().copied();
            let drain_deadline = self.drain_deadline;

            tokio::select! {
                Some(heartbeat) = self.heartbeats.recv() => self.on_heartbeat(heartbeat),

                Some(joined) = self.tasks.join_next_with_id() => self.on_worker_exit(joined),

                Some(command) = self.commands.recv() => match command {
                    Command::Shutdown { grace } => self.begin_shutdown(grace, ExitReason::Shutdown),
                    Command::Kill(id) => self.kill(id),
                },

                _ = tick.tick() => self.evict_stale(),

                _ = sleep_until(next_restart), if !draining && next_restart.is_some() => {
                    self.spawn_due_restarts();
                }

                _ = sleep_until(drain_deadline), if drain_deadline.is_some() => {
                    tracing::warn!(
                        remaining = self.tasks.len(),
                        "Grace period elapsed, aborting remaining workers"
                    );
                    self.drain_deadline = None;
                    self.tasks.abort_all();
                }
            }
        }

        self.phase = SupervisorPhase::Stopped(self.exit_reason);
        self.publish();
        tracing::info!(reason = ?self.exit_reason, "Worker pool stopped");
        self.exit_reason
    }

    fn on_heartbeat(&mut self, heartbeat: Heartbeat) {
        if self
            .table
            .record_heartbeat(heartbeat.worker, heartbeat.state, heartbeat.at)
        {
            tracing::trace!(worker_id = %heartbeat.worker, state = %heartbeat.state, "Heartbeat");
            self.publish();
        }
    }

    fn on_worker_exit(&mut self, joined: Result<(tokio::task::Id, Result<(), WorkerFault>), JoinError>) {
        let (task_id, outcome) = match joined {
            Ok((task_id, result)) => (task_id, Ok(result)),
            Err(err) => (err.id(), Err(err)),
        };
        let Some(worker) = self.task_workers.remove(&task_id) else {
            return;
        };
        self.abort_handles.remove(&worker);
        self.table.remove(worker);
        let evicted = self.evicted.remove(&worker);

        if self.phase != SupervisorPhase::Running {
            tracing::debug!(worker_id = %worker, "Worker exited during shutdown");
            self.publish();
            return;
        }

        if evicted {
            tracing::info!(worker_id = %worker, "Evicted worker reaped");
            self.publish();
            return;
        }

        let fault = match outcome {
            Ok(Ok(())) => WorkerFault::Exited(worker),
            Ok(Err(fault)) => fault,
            Err(err) if err.is_panic() => WorkerFault::Crashed {
                id: worker,
                reason: "panicked".to_string(),
            },
            Err(_) => WorkerFault::Crashed {
                id: worker,
                reason: "killed".to_string(),
            },
        };
        tracing::warn!(error = %fault, "Worker died unexpectedly");

        let now = Instant::now();
        match self.backoff.on_death(now) {
            Some(delay) if delay.is_zero() => self.spawn_worker(),
            Some(delay) => {
                tracing::warn!(
                    delay_ms = delay.as_millis() as u64,
                    streak = self.backoff.streak(),
                    "Workers dying repeatedly, delaying restart"
                );
                self.pending_restarts.push(now + delay);
                self.publish();
            }
            None => {
                tracing::error!(
                    streak = self.backoff.streak(),
                    "Workers keep crashing, giving up on this instance"
                );
                let grace = self.eviction_limit;
                self.begin_shutdown(grace, ExitReason::RestartsExhausted);
            }
        }
    }

    fn kill(&mut self, id: WorkerId) {
        match self.abort_handles.get(&id) {
            Some(handle) => {
                tracing::info!(worker_id = %id, "Killing worker");
                handle.abort();
            }
            None => tracing::warn!(worker_id = %id, "Kill requested for unknown worker"),
        }
    }

    fn evict_stale(&mut self) {
        if self.phase != SupervisorPhase::Running {
            return;
        }
        for (id, silent_for) in self.table.stale_busy(Instant::now(), self.eviction_limit) {
            let fault = WorkerFault::Unresponsive { id, silent_for };
            tracing::warn!(error = %fault, "Evicting unresponsive worker");

            self.table.set_state(id, WorkerState::Terminating);
            self.evicted.insert(id);
            if let Some(handle) = self.abort_handles.get(&id) {
                handle.abort();
            }
            self.spawn_worker();
        }
    }

    fn spawn_due_restarts(&mut self) {
        let now = Instant::now();
        let before = self.pending_restarts.len();
        self.pending_restarts.retain(|at| *at > now);
        for _ in self.pending_restarts.len()..before {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        let id = WorkerId(self.next_id);
        self.next_id += 1;

        let worker = Worker::new(id, ctx.clone());
        let handle = self.tasks.spawn(worker.run());
        self.task_workers.insert(handle.id(), id);
        self.abort_handles.insert(id, handle);
        self.table.insert(id, Instant::now());

        tracing::debug!(worker_id = %id, "Spawned worker");
        self.publish();
    }

    fn begin_shutdown(&mut self, grace: Duration, reason: ExitReason) {
        if self.phase != SupervisorPhase::Running {
            return;
        }
        tracing::info!(
            grace_ms = grace.as_millis() as u64,
            in_flight = self.table.count_in(WorkerState::Busy),
            "Shutting down worker pool"
        );

        self.phase = SupervisorPhase::Draining;
        self.exit_reason = reason;
        self.pending_restarts.clear();
        // Workers hold the last references to the listener now
        self.ctx = None;
        self.shutdown_tx.send_replace(true);
        self.table.mark_all_terminating();
        self.drain_deadline = Some(Instant::now() + grace);
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(PoolSnapshot {
            phase: self.phase,
            target: self.target,
            workers: self.table.handles(),
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
