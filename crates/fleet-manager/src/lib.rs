//! Worker-pool control plane.
//!
//! [`FleetManager`] drives one maintenance pass per tick against the shared
//! worker registry:
//!
//! ```text
//! reconcile ─► count available ─► below target? ─► thresholds ok? ─► spawn
//!                                                                      │
//!                      evict corrupted ◄───────────────────────────────┘
//!                             │
//!                      evict excess idle
//! ```
//!
//! Eviction is delegated to the [`Evictor`], which only ever terminates a
//! worker while holding its advisory lock and only while no request is
//! bound to it.

pub mod evictor;
pub mod factory;
pub mod manager;
pub mod process;

pub use evictor::{
    EVICTION_OWNER, EvictionOutcome, Evictor, ShutdownPoll, corrupted_candidates,
    excess_idle_candidates,
};
pub use factory::{ProcessWorkerFactory, WorkerFactory};
pub use manager::{FleetManager, Lifecycle, PassReport, growth_allowed};
pub use process::{ProcFs, ProcessProbe, terminate};
