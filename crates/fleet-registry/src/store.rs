//! redb-backed worker registry.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. redb
//! serializes write transactions, which is what makes the conditional lock
//! update atomic.
//!
//! redb holds an exclusive file lock for as long as a `Database` is open.
//! The on-disk store therefore opens the file for each operation and
//! closes it again on return, so the control loop, the workers and the
//! resource sampler can all share one registry file. An open that finds
//! the file held by another process is retried with backoff until
//! `busy_timeout` elapses. The in-memory backend (for testing) keeps a
//! single handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::{debug, trace};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::WorkerRegistry;
use crate::tables::*;
use crate::types::*;

/// How long an operation waits for another process to close the file.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Convert any `Display` error into a `RegistryError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| RegistryError::$variant(e.to_string())
    };
}

enum Backend {
    File { path: PathBuf, busy_timeout: Duration },
    Memory(Database),
}

/// Registry store backed by redb. Handles are cheap to clone and may be
/// opened on the same path by any number of processes.
#[derive(Clone)]
pub struct RegistryStore {
    backend: Arc<Backend>,
}

impl RegistryStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`open`](Self::open) with a custom wait for a busy file.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> RegistryResult<Self> {
        let store = Self {
            backend: Arc::new(Backend::File {
                path: path.to_path_buf(),
                busy_timeout,
            }),
        };
        store.with_db(ensure_tables)?;
        debug!(?path, "registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        ensure_tables(&db)?;
        debug!("in-memory registry opened");
        Ok(Self {
            backend: Arc::new(Backend::Memory(db)),
        })
    }

    /// Run `f` against an open database, opening the file for the duration
    /// of the call when the store is on disk.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> RegistryResult<T>) -> RegistryResult<T> {
        match self.backend.as_ref() {
            Backend::Memory(db) => f(db),
            Backend::File { path, busy_timeout } => {
                let db = open_shared(path, *busy_timeout)?;
                f(&db)
            }
        }
    }

    /// Read-modify-write a single worker row inside one write transaction.
    ///
    /// `f` returns the value handed back to the caller; the row is written
    /// back only when `f` reports a change. Returns `None` if the row is missing.
    fn modify_worker<T>(
        &self,
        port: u16,
        f: impl FnOnce(&mut WorkerRecord) -> (bool, T),
    ) -> RegistryResult<Option<T>> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let result;
            {
                let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
                let current: Option<WorkerRecord> =
                    match table.get(port).map_err(map_err!(Read))? {
                        Some(guard) => Some(
                            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                        ),
                        None => None,
                    };
                result = match current {
                    Some(mut record) => {
                        let (changed, out) = f(&mut record);
                        if changed {
                            let value =
                                serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                            table
                                .insert(port, value.as_slice())
                                .map_err(map_err!(Write))?;
                        }
                        Some(out)
                    }
                    None => None,
                };
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(result)
        })
    }

    /// Clear every advisory lock. Used when the control loop starts, since
    /// no holder survives a restart of the fleet.
    pub fn release_all_locks(&self) -> RegistryResult<u32> {
        let count = self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let mut count = 0;
            {
                let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
                let mut locked = Vec::new();
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let record: WorkerRecord =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    if record.lock_owner.is_some() {
                        locked.push(record);
                    }
                }
                for mut record in locked {
                    record.lock_owner = None;
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(record.port, value.as_slice())
                        .map_err(map_err!(Write))?;
                    count += 1;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(count)
        })?;
        debug!(count, "stale worker locks released");
        Ok(count)
    }

    /// Store the latest aggregate resource sample.
    pub fn put_resource_stats(&self, stats: &ResourceStats) -> RegistryResult<()> {
        let value = serde_json::to_vec(stats).map_err(map_err!(Serialize))?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(ENVIRONMENT).map_err(map_err!(Table))?;
                table
                    .insert(ENVIRONMENT_KEY, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })
    }
}

fn ensure_tables(db: &Database) -> RegistryResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    txn.open_table(WORKERS).map_err(map_err!(Table))?;
    txn.open_table(ENVIRONMENT).map_err(map_err!(Table))?;
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

/// Open the registry file, waiting while another handle has it open.
fn open_shared(path: &Path, busy_timeout: Duration) -> RegistryResult<Database> {
    let deadline = Instant::now() + busy_timeout;
    let mut backoff = Duration::from_millis(1);
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                if Instant::now() >= deadline {
                    return Err(RegistryError::Busy(path.display().to_string()));
                }
                trace!(?path, ?backoff, "registry busy");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(RegistryError::Open(e.to_string())),
        }
    }
}

impl WorkerRegistry for RegistryStore {
    fn get_worker(&self, port: u16) -> RegistryResult<Option<WorkerRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            match table.get(port).map_err(map_err!(Read))? {
                Some(guard) => {
                    let record: WorkerRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Ok(Some(record))
                }
                None => Ok(None),
            }
        })
    }

    fn get_worker_by_type(&self, kind: WorkerKind) -> RegistryResult<Option<WorkerRecord>> {
        let rows: Vec<WorkerRecord> = self
            .list_workers()?
            .into_iter()
            .filter(|w| w.kind == kind)
            .collect();
        let live = rows.iter().position(|w| !w.is_exited()).unwrap_or(0);
        Ok(rows.into_iter().nth(live))
    }

    fn list_workers(&self) -> RegistryResult<Vec<WorkerRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let mut results = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: WorkerRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
            Ok(results)
        })
    }

    fn put_worker(&self, record: &WorkerRecord) -> RegistryResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        self.with_db(|db| {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
                table
                    .insert(record.port, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))
        })?;
        debug!(port = record.port, status = %record.status, "worker stored");
        Ok(())
    }

    fn update_field(&self, port: u16, field: WorkerField) -> RegistryResult<bool> {
        let updated = self.modify_worker(port, |record| {
            field.apply(record);
            (true, ())
        })?;
        Ok(updated.is_some())
    }

    fn acquire_lock(&self, port: u16, owner: &str) -> RegistryResult<bool> {
        let held = self.modify_worker(port, |record| match &record.lock_owner {
            None => {
                record.lock_owner = Some(owner.to_string());
                (true, true)
            }
            Some(current) => (false, current == owner),
        })?;
        let held = held.unwrap_or(false);
        debug!(port, owner, held, "worker lock acquire");
        Ok(held)
    }

    fn release_lock(&self, port: u16, owner: &str) -> RegistryResult<bool> {
        let released = self.modify_worker(port, |record| {
            if record.lock_owner.as_deref() == Some(owner) {
                record.lock_owner = None;
                (true, true)
            } else {
                (false, false)
            }
        })?;
        let released = released.unwrap_or(false);
        debug!(port, owner, released, "worker lock release");
        Ok(released)
    }

    fn resource_stats(&self) -> RegistryResult<Option<ResourceStats>> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ENVIRONMENT).map_err(map_err!(Table))?;
            match table.get(ENVIRONMENT_KEY).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stats: ResourceStats =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Ok(Some(stats))
                }
                None => Ok(None),
            }
        })
    }
}
