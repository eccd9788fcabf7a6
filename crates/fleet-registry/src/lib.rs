//! The persisted table of worker processes.
//!
//! Every worker process (and the control loop itself) owns one
//! [`WorkerRecord`] keyed by its control port. Other processes coordinate
//! through this table only: dispatch binds a request id to an idle row,
//! the control loop evicts rows it holds the advisory lock for.
//!
//! # Architecture
//!
//! ```text
//! WorkerRegistry (trait)          narrow repository interface
//!   └── RegistryStore             redb, JSON values, in-memory for tests
//!         ├── workers      port → WorkerRecord
//!         └── environment  "resources" → ResourceStats
//! ```
//!
//! The advisory lock is a conditional update inside one write transaction
//! ("take `lock_owner` if empty"), not a process-level mutex.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::WorkerRegistry;
pub use store::RegistryStore;
pub use types::*;
