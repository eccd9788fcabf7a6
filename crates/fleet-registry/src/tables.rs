//! redb table definitions for the worker registry.
//!
//! Values are JSON-serialized domain types stored as `&[u8]`.

use redb::TableDefinition;

/// Worker records keyed by their control port.
pub const WORKERS: TableDefinition<u16, &[u8]> = TableDefinition::new("workers");

/// Aggregate environment statistics keyed by [`ENVIRONMENT_KEY`].
pub const ENVIRONMENT: TableDefinition<&str, &[u8]> = TableDefinition::new("environment");

/// The single row of the environment table.
pub const ENVIRONMENT_KEY: &str = "resources";
