//! redb table definitions for the Armada state store.
//!
//! Record tables use `&str` keys and `&[u8]` JSON values. Append-only
//! tables (events, tasks, configs) are keyed by their monotonic id.

use redb::TableDefinition;

/// Deployments keyed by name.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Instances keyed by `{deployment}:{group}/{uuid}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Persistent disks (attached and orphaned) keyed by CID.
pub const DISKS: TableDefinition<&str, &[u8]> = TableDefinition::new("disks");

/// Variable sets keyed by `{deployment}:{id:020}`.
pub const VARIABLE_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("variable_sets");

/// Compiled packages keyed by `{stemcell}:{package}/{version}`.
pub const COMPILED_PACKAGES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("compiled_packages");

/// Event journal keyed by event id.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Config versions keyed by config id.
pub const CONFIGS: TableDefinition<u64, &[u8]> = TableDefinition::new("configs");

/// Tasks keyed by task id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Monotonic counters keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
