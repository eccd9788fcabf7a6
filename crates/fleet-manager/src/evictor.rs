//! Eviction engine.
//!
//! Candidate selection is pure over a registry snapshot. Termination
//! follows the locked shutdown protocol:
//!
//! ```text
//! load row ─► acquire lock ─► re-read row ─► bound? ─► release, skip
//!                  │                            │
//!               busy: skip                 shutdown cmd ─► poll for Exited
//!                                                               │
//!                                                          release lock
//! ```
//!
//! The lock is released exactly once per attempt once it was taken,
//! whatever the command or the poll did.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use fleet_ctl::{Command, CommandClient};
use fleet_registry::{WorkerHealth, WorkerKind, WorkerRecord, WorkerRegistry, WorkerStatus};

/// Lock owner tag used for every eviction.
pub const EVICTION_OWNER: &str = "Wrkmanager";

/// How long to wait for a worker to report `Exited` after `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ShutdownPoll {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Result of one locked shutdown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The worker reported `Exited` within the poll window.
    Terminated,
    /// Shutdown was sent but the row never turned `Exited`.
    NotConfirmed,
    /// Someone else holds the lock; retried next tick.
    LockBusy,
    /// A request was bound to the worker; left alone this tick.
    RequestBound,
    /// No row for the port.
    Missing,
    /// Registry or command failure.
    Failed,
}

/// Ports of corrupted workers, in registry order.
pub fn corrupted_candidates(workers: &[WorkerRecord]) -> Vec<u16> {
    workers
        .iter()
        .filter(|w| w.kind == WorkerKind::Worker && !w.is_exited())
        .filter(|w| w.health == WorkerHealth::Corrupted)
        .map(|w| w.port)
        .collect()
}

/// Ports of the longest-idle workers above the idle target.
///
/// At most `live − idle_target` ports are returned, oldest
/// `last_active_time` first, and only for workers idle longer than
/// `idle_timeout` at `now` (unix seconds).
pub fn excess_idle_candidates(
    workers: &[WorkerRecord],
    idle_target: u32,
    idle_timeout: Duration,
    now: u64,
) -> Vec<u16> {
    let live = workers
        .iter()
        .filter(|w| w.kind == WorkerKind::Worker && !w.is_exited())
        .count();
    let excess = live.saturating_sub(idle_target as usize);
    if excess == 0 {
        return Vec::new();
    }

    let timeout = idle_timeout.as_secs();
    let mut idle: Vec<&WorkerRecord> = workers
        .iter()
        .filter(|w| w.kind == WorkerKind::Worker && w.status == WorkerStatus::Idle)
        .collect();
    idle.sort_by_key(|w| (w.last_active_time, w.port));

    idle.into_iter()
        .filter(|w| now.saturating_sub(w.last_active_time) > timeout)
        .take(excess)
        .map(|w| w.port)
        .collect()
}

/// Terminates workers under their advisory lock.
#[derive(Clone)]
pub struct Evictor {
    registry: Arc<dyn WorkerRegistry>,
    client: CommandClient,
    poll: ShutdownPoll,
}

impl Evictor {
    pub fn new(registry: Arc<dyn WorkerRegistry>, client: CommandClient) -> Self {
        Self {
            registry,
            client,
            poll: ShutdownPoll::default(),
        }
    }

    pub fn with_poll(mut self, poll: ShutdownPoll) -> Self {
        self.poll = poll;
        self
    }

    /// Run the shutdown protocol over `ports` in order. Failures never stop
    /// the remaining candidates.
    pub async fn evict(&self, ports: &[u16]) -> Vec<(u16, EvictionOutcome)> {
        let mut outcomes = Vec::with_capacity(ports.len());
        for &port in ports {
            outcomes.push((port, self.shutdown_worker(port).await));
        }
        outcomes
    }

    /// Terminate the worker on `port` if it can be locked and is unbound.
    pub async fn shutdown_worker(&self, port: u16) -> EvictionOutcome {
        match self.registry.get_worker(port) {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(port, "eviction candidate vanished");
                return EvictionOutcome::Missing;
            }
            Err(e) => {
                warn!(port, error = %e, "cannot load eviction candidate");
                return EvictionOutcome::Failed;
            }
        }

        match self.registry.acquire_lock(port, EVICTION_OWNER) {
            Ok(true) => {}
            Ok(false) => {
                warn!(port, "worker lock could not be obtained");
                return EvictionOutcome::LockBusy;
            }
            Err(e) => {
                warn!(port, error = %e, "worker lock could not be obtained");
                return EvictionOutcome::Failed;
            }
        }

        let outcome = self.shutdown_locked(port).await;

        match self.registry.release_lock(port, EVICTION_OWNER) {
            Ok(true) => {}
            Ok(false) => warn!(port, "worker lock was no longer held at release"),
            Err(e) => warn!(port, error = %e, "failed to release worker lock"),
        }
        outcome
    }

    async fn shutdown_locked(&self, port: u16) -> EvictionOutcome {
        // Re-read under the lock so a request bound in the meantime is seen.
        let worker = match self.registry.get_worker(port) {
            Ok(Some(w)) => w,
            Ok(None) => return EvictionOutcome::Missing,
            Err(e) => {
                warn!(port, error = %e, "cannot reload locked worker");
                return EvictionOutcome::Failed;
            }
        };
        if !worker.is_unbound() {
            warn!(port, request = %worker.id, "worker has an active request, termination cancelled");
            return EvictionOutcome::RequestBound;
        }

        info!(port, pid = worker.pid, "shutting down worker");
        match self
            .client
            .issue_request(Command::Shutdown.as_str(), port)
            .await
        {
            Ok(response) => {
                response.wait_for_completion();
            }
            Err(e) => {
                warn!(port, error = %e, "failed to stop worker");
                return EvictionOutcome::Failed;
            }
        }

        if self.await_exit(port).await {
            info!(port, "worker has been shut down");
            EvictionOutcome::Terminated
        } else {
            warn!(port, "worker has not been shut down");
            EvictionOutcome::NotConfirmed
        }
    }

    async fn await_exit(&self, port: u16) -> bool {
        for attempt in 1..=self.poll.attempts {
            match self.registry.get_worker(port) {
                Ok(Some(w)) if w.is_exited() => return true,
                Ok(_) => {}
                Err(e) => debug!(port, error = %e, "exit poll read failed"),
            }
            if attempt < self.poll.attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn idle(port: u16, last_active_time: u64) -> WorkerRecord {
        WorkerRecord::idle(port, u32::from(port), last_active_time)
    }

    const HOUR: u64 = 3600;
    const TIMEOUT: Duration = Duration::from_secs(HOUR);

    #[test]
    fn corrupted_selection_skips_healthy_and_tombstones() {
        let mut a = idle(9000, 0);
        a.health = WorkerHealth::Corrupted;
        let b = idle(9001, 0);
        let mut c = idle(9002, 0);
        c.health = WorkerHealth::Corrupted;
        c.status = WorkerStatus::Busy("cluctrl.create".into());
        let mut d = idle(9003, 0);
        d.health = WorkerHealth::Corrupted;
        d.status = WorkerStatus::Exited;

        assert_eq!(corrupted_candidates(&[a, b, c, d]), vec![9000, 9002]);
    }

    #[test]
    fn excess_idle_picks_oldest_first() {
        let now = 10 * HOUR;
        let workers: Vec<WorkerRecord> = [(9000, 6), (9001, 1), (9002, 4), (9003, 2), (9004, 5), (9005, 3)]
            .into_iter()
            .map(|(port, age_h)| idle(port, now - age_h * HOUR - 1))
            .collect();

        // Oldest four by last_active_time: 9000 (6h), 9004 (5h), 9002 (4h), 9005 (3h).
        assert_eq!(
            excess_idle_candidates(&workers, 2, TIMEOUT, now),
            vec![9000, 9004, 9002, 9005]
        );
    }

    #[test]
    fn excess_idle_respects_timeout() {
        let now = 10 * HOUR;
        let workers = vec![idle(9000, now - 2 * HOUR), idle(9001, now - 60), idle(9002, now - HOUR)];
        // Exactly at the timeout is not past it.
        assert_eq!(excess_idle_candidates(&workers, 0, TIMEOUT, now), vec![9000]);
    }

    #[test]
    fn excess_idle_is_bounded_by_live_count() {
        let now = 10 * HOUR;
        let mut busy = idle(9000, 0);
        busy.status = WorkerStatus::Busy("cluctrl.reshape".into());
        let mut gone = idle(9001, 0);
        gone.status = WorkerStatus::Exited;
        let workers = vec![busy, gone, idle(9002, 0), idle(9003, 0)];

        // live = 3 (busy + two idle), target 2 → one candidate.
        assert_eq!(excess_idle_candidates(&workers, 2, TIMEOUT, now), vec![9002]);
        assert!(excess_idle_candidates(&workers, 3, TIMEOUT, now).is_empty());
        assert!(excess_idle_candidates(&workers, 10, TIMEOUT, now).is_empty());
    }

    #[test]
    fn excess_idle_ignores_manager_row() {
        let now = 10 * HOUR;
        let mut manager = idle(7777, 0);
        manager.kind = WorkerKind::Workermanager;
        manager.status = WorkerStatus::Idle;
        manager.id = Uuid::new_v4();
        let workers = vec![manager, idle(9000, 0)];
        assert!(excess_idle_candidates(&workers, 1, TIMEOUT, now).is_empty());
        assert_eq!(excess_idle_candidates(&workers, 0, TIMEOUT, now), vec![9000]);
    }

    #[test]
    fn default_poll_is_five_by_two_seconds() {
        let poll = ShutdownPoll::default();
        assert_eq!(poll.attempts, 5);
        assert_eq!(poll.interval, Duration::from_secs(2));
    }
}
