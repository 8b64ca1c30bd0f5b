//! Update policy resolution: turns count/percentage policies into
//! concrete numbers for one instance group.

use armada_core::{Quantity, UpdatePolicy, UpdateStrategy, WatchTime};
use serde::{Deserialize, Serialize};

/// Per-invocation overrides (`--canaries`, `--max-in-flight`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub canaries: Option<Quantity>,
    #[serde(default)]
    pub max_in_flight: Option<Quantity>,
}

/// An update policy resolved against a group's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub canaries: u32,
    /// Always at least one.
    pub max_in_flight: u32,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    pub serial: bool,
    pub strategy: UpdateStrategy,
}

impl ResolvedPolicy {
    /// Resolve `policy` for a group of `group_size` instances.
    ///
    /// Percentages resolve against the group size (floor, minimum one).
    pub fn resolve(policy: &UpdatePolicy, overrides: &PolicyOverrides, group_size: u32) -> Self {
        let canaries = overrides.canaries.unwrap_or(policy.canaries);
        let max_in_flight = overrides.max_in_flight.unwrap_or(policy.max_in_flight);
        Self {
            canaries: canaries.resolve(group_size),
            max_in_flight: max_in_flight.resolve(group_size).max(1),
            canary_watch_time: policy.canary_watch_time,
            update_watch_time: policy.update_watch_time,
            serial: policy.serial,
            strategy: policy.strategy,
        }
    }

    /// Concurrency used while updating canaries.
    pub fn canary_parallelism(&self) -> u32 {
        self.canaries.min(self.max_in_flight).max(1)
    }
}
