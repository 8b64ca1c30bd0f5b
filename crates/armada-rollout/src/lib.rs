//! armada-rollout: update scheduling for instance groups.
//!
//! # Components
//!
//! - **`strategy`**: resolves `canaries`/`max_in_flight` (counts or
//!   percentages, with per-invocation overrides) against a group's size
//! - **`controller`**: the rollout state machine handing out the canary
//!   batch, then one batch per AZ, halting on the first failure

pub mod controller;
pub mod strategy;

pub use controller::{BatchAction, BatchOutcome, Rollout, RolloutItem, RolloutPhase};
pub use strategy::{PolicyOverrides, ResolvedPolicy};
