//! Domain types for the worker registry.
//!
//! The string forms (`"Idle"`, `"NORMAL"`, `"workermanager"`, ...) are the
//! values other fleet processes read and write, so every enum here
//! serializes to exactly those literals.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request id meaning "not bound to any request".
pub const UNBOUND: Uuid = Uuid::nil();

// ── Status ─────────────────────────────────────────────────────────

/// Lifecycle status of a worker row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkerStatus {
    /// Waiting for a request.
    Idle,
    /// Executing a request; carries the request-type label.
    Busy(String),
    /// The control loop's own row.
    Wmanaging,
    /// Process is gone (tombstone).
    Exited,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkerStatus::Idle => "Idle",
            WorkerStatus::Busy(label) => label,
            WorkerStatus::Wmanaging => "Wmanaging",
            WorkerStatus::Exited => "Exited",
        }
    }
}

impl From<String> for WorkerStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Idle" => WorkerStatus::Idle,
            "Wmanaging" => WorkerStatus::Wmanaging,
            "Exited" => WorkerStatus::Exited,
            _ => WorkerStatus::Busy(s),
        }
    }
}

impl From<WorkerStatus> for String {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Busy(label) => label,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Health flag set by the worker itself or by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkerHealth {
    #[default]
    #[serde(rename = "NORMAL")]
    Normal,
    /// Must be removed regardless of idle state.
    #[serde(rename = "CORRUPTED")]
    Corrupted,
}

// ── Kind ───────────────────────────────────────────────────────────

/// Process type of a registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Worker,
    /// The singleton control loop.
    Workermanager,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Worker => "worker",
            WorkerKind::Workermanager => "workermanager",
        }
    }
}

// ── Record ─────────────────────────────────────────────────────────

/// One row per worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Bound request id, [`UNBOUND`] when free.
    pub id: Uuid,
    pub status: WorkerStatus,
    pub health: WorkerHealth,
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    /// Control endpoint port; unique among active rows.
    pub port: u16,
    pub pid: u32,
    /// Unix timestamp (seconds) of the last request activity.
    pub last_active_time: u64,
    /// Tag of the current advisory lock holder.
    pub lock_owner: Option<String>,
}

impl WorkerRecord {
    /// A freshly spawned worker: idle, unbound, healthy, unlocked.
    pub fn idle(port: u16, pid: u32, now: u64) -> Self {
        Self {
            id: UNBOUND,
            status: WorkerStatus::Idle,
            health: WorkerHealth::Normal,
            kind: WorkerKind::Worker,
            port,
            pid,
            last_active_time: now,
            lock_owner: None,
        }
    }

    /// Whether no request is bound to this worker.
    pub fn is_unbound(&self) -> bool {
        self.id == UNBOUND
    }

    /// Unbound, idle and healthy.
    pub fn is_available(&self) -> bool {
        self.is_unbound()
            && self.status == WorkerStatus::Idle
            && self.health == WorkerHealth::Normal
    }

    pub fn is_exited(&self) -> bool {
        self.status == WorkerStatus::Exited
    }
}

/// A single-column update applied by [`crate::WorkerRegistry::update_field`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerField {
    Id(Uuid),
    Status(WorkerStatus),
    Health(WorkerHealth),
    Pid(u32),
    LastActiveTime(u64),
}

impl WorkerField {
    pub(crate) fn apply(self, record: &mut WorkerRecord) {
        match self {
            WorkerField::Id(id) => record.id = id,
            WorkerField::Status(status) => record.status = status,
            WorkerField::Health(health) => record.health = health,
            WorkerField::Pid(pid) => record.pid = pid,
            WorkerField::LastActiveTime(t) => record.last_active_time = t,
        }
    }
}

// ── Environment ────────────────────────────────────────────────────

/// Aggregate resource utilisation of the host, written by an external sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    /// Used CPU in percent; `None` when the sampler had no reading.
    pub cpu_percent: Option<f64>,
    /// Used memory in percent.
    pub mem_percent: Option<f64>,
    /// Unix timestamp of the sample.
    pub updated_at: u64,
}
