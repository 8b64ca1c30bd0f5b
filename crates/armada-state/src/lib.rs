//! armada-state: the director's current-state store.
//!
//! Backed by [redb](https://docs.rs/redb). Holds deployments, instances,
//! persistent disks, variable sets, the event journal, config versions,
//! tasks and compiled packages.
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb `&[u8]` value columns. Instance
//! keys are `{deployment}:{group}/{uuid}` so a deployment's instances are
//! one prefix scan. Journal-style tables are keyed by ids drawn from the
//! `sequences` table inside the same write transaction, so ids are
//! strictly monotonic even across restarts.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
