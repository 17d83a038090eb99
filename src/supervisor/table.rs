//! The supervisor's worker table.
//!
//! Only the supervisor task writes to it. Everyone else sees copies published
//! as a [`PoolSnapshot`](super::PoolSnapshot).

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::worker::WorkerState;

/// Unique worker identifier. Never reused within a supervisor lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub state: WorkerState,
    pub last_heartbeat: Instant,
}

#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: BTreeMap<WorkerId, WorkerHandle>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: WorkerId, now: Instant) {
        self.workers.insert(
            id,
            WorkerHandle {
                id,
                state: WorkerState::Starting,
                last_heartbeat: now,
            },
        );
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        self.workers.remove(&id)
    }

    /// Apply a heartbeat. Workers the supervisor already marked `Terminating`
    /// stay that way whatever they report.
    pub fn record_heartbeat(&mut self, id: WorkerId, state: WorkerState, at: Instant) -> bool {
        match self.workers.get_mut(&id) {
            Some(handle) if handle.state != WorkerState::Terminating => {
                handle.state = state;
                handle.last_heartbeat = handle.last_heartbeat.max(at);
                true
            }
            _ => false,
        }
    }

    pub fn set_state(&mut self, id: WorkerId, state: WorkerState) {
        if let Some(handle) = self.workers.get_mut(&id) {
            handle.state = state;
        }
    }

    pub fn mark_all_terminating(&mut self) {
        for handle in self.workers.values_mut() {
            if handle.state != WorkerState::Dead {
                handle.state = WorkerState::Terminating;
            }
        }
    }

    /// Busy workers silent for longer than `limit`.
    pub fn stale_busy(&self, now: Instant, limit: Duration) -> Vec<(WorkerId, Duration)> {
        self.workers
            .values()
            .filter(|h| h.state == WorkerState::Busy)
            .filter_map(|h| {
                let silent_for = now.saturating_duration_since(h.last_heartbeat);
                (silent_for > limit).then_some((h.id, silent_for))
            })
            .collect()
    }

    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|h| h.state == state).count()
    }

    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.workers.values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_workers_start_in_starting() {
        let mut table = WorkerTable::new();
        table.insert(WorkerId(1), Instant::now());
        assert_eq!(table.get(WorkerId(1)).unwrap().state, WorkerState::Starting);
        assert_eq!(table.count_in(WorkerState::Starting), 1);
    }

    #[test]
    fn test_heartbeat_updates_state() {
        let start = Instant::now();
        let mut table = WorkerTable::new();
        table.insert(WorkerId(1), start);
        let later = start + Duration::from_millis(10);
        assert!(table.record_heartbeat(WorkerId(1), WorkerState::Ready, later));
        let handle = table.get(WorkerId(1)).unwrap();
        assert_eq!(handle.state, WorkerState::Ready);
        assert_eq!(handle.last_heartbeat, later);
    }

    #[test]
    fn test_heartbeat_for_unknown_worker_ignored() {
        let mut table = WorkerTable::new();
        assert!(!table.record_heartbeat(WorkerId(9), WorkerState::Ready, Instant::now()));
        assert!(table.is_empty());
    }

    #[test]
    fn test_terminating_is_sticky() {
        let mut table = WorkerTable::new();
        table.insert(WorkerId(1), Instant::now());
        table.mark_all_terminating();
        assert!(!table.record_heartbeat(WorkerId(1), WorkerState::Ready, Instant::now()));
        assert_eq!(table.get(WorkerId(1)).unwrap().state, WorkerState::Terminating);
        assert_eq!(table.count_in(WorkerState::Terminating), 1);
    }

    #[test]
    fn test_stale_busy_only_reports_busy_workers() {
        let start = Instant::now();
        let mut table = WorkerTable::new();
        table.insert(WorkerId(1), start);
        table.insert(WorkerId(2), start);
        table.insert(WorkerId(3), start);
        table.record_heartbeat(WorkerId(1), WorkerState::Busy, start);
        table.record_heartbeat(WorkerId(2), WorkerState::Ready, start);
        table.record_heartbeat(
            WorkerId(3),
            WorkerState::Busy,
            start + Duration::from_secs(4),
        );

        let now = start + Duration::from_secs(5);
        let stale = table.stale_busy(now, Duration::from_secs(2));
        assert_eq!(stale, vec![(WorkerId(1), Duration::from_secs(5))]);
    }

    #[test]
    fn test_heartbeat_time_never_goes_backwards() {
        let start = Instant::now();
        let mut table = WorkerTable::new();
        table.insert(WorkerId(1), start + Duration::from_secs(1));
        table.record_heartbeat(WorkerId(1), WorkerState::Ready, start);
        assert_eq!(
            table.get(WorkerId(1)).unwrap().last_heartbeat,
            start + Duration::from_secs(1)
        );
    }
}
