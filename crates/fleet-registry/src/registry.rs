//! The repository interface the control loop programs against.

use crate::error::RegistryResult;
use crate::types::*;

/// Narrow view of the shared worker table.
///
/// Implementations must make [`acquire_lock`](Self::acquire_lock) and
/// [`release_lock`](Self::release_lock) atomic with respect to other
/// processes using the same storage.
pub trait WorkerRegistry: Send + Sync {
    /// Look up a single worker by control port.
    fn get_worker(&self, port: u16) -> RegistryResult<Option<WorkerRecord>>;

    /// A row of the given type, preferring one that has not exited.
    fn get_worker_by_type(&self, kind: WorkerKind) -> RegistryResult<Option<WorkerRecord>>;

    /// Every row, tombstones included.
    fn list_workers(&self) -> RegistryResult<Vec<WorkerRecord>>;

    /// Insert or replace the row for `record.port`.
    fn put_worker(&self, record: &WorkerRecord) -> RegistryResult<()>;

    /// Update one column. Returns false if no row exists for `port`.
    fn update_field(&self, port: u16, field: WorkerField) -> RegistryResult<bool>;

    /// Take the advisory lock for `port` if it is free (or already held by
    /// `owner`). Returns whether `owner` holds it afterwards.
    fn acquire_lock(&self, port: u16, owner: &str) -> RegistryResult<bool>;

    /// Clear the advisory lock if `owner` holds it. Returns whether it did.
    fn release_lock(&self, port: u16, owner: &str) -> RegistryResult<bool>;

    /// Latest aggregate resource sample, if the sampler ever wrote one.
    fn resource_stats(&self) -> RegistryResult<Option<ResourceStats>>;
}
