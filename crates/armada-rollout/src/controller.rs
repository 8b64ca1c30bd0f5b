//! Rollout controller: orders one instance group's updates.
//!
//! Canaries go first as a single batch and must all succeed before
//! anything else starts. The remaining instances are grouped by AZ (in
//! the group's AZ order); each AZ is one batch processed with at most
//! `max_in_flight` instances in progress. A failed batch halts the
//! rollout: nothing after it is handed out.

use armada_core::WatchTime;
use tracing::{debug, info, warn};

use crate::strategy::ResolvedPolicy;

/// An instance waiting to be updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutItem<K> {
    pub key: K,
    pub az: Option<String>,
    pub index: u32,
    pub bootstrap: bool,
}

/// Current phase of a rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutPhase {
    /// Not started.
    Pending,
    /// Canary batch handed out.
    Canaries,
    /// Batch for the AZ at `position` of `total` handed out.
    AzBatch { position: usize, total: usize },
    /// Every batch succeeded.
    Completed,
    /// A batch failed; remaining instances stay untouched.
    Halted { reason: String },
}

/// Result of the batch handed out by the previous [`Rollout::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded,
    Failed { reason: String },
}

/// A batch to run: at most `parallelism` of `instances` in flight, each
/// observed for `watch` after its update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAction<K> {
    pub instances: Vec<K>,
    pub parallelism: usize,
    pub canary: bool,
    pub watch: WatchTime,
}

#[derive(Debug, Clone)]
pub struct Rollout<K> {
    pub group: String,
    pub policy: ResolvedPolicy,
    pub phase: RolloutPhase,
    canaries: Vec<K>,
    /// Non-canary instances bucketed per AZ, in AZ order.
    az_batches: Vec<(Option<String>, Vec<K>)>,
}

impl<K: Clone> Rollout<K> {
    /// Plan a rollout. `az_order` is the group's AZ list; instances in
    /// AZs not listed (e.g. being moved out) sort last.
    pub fn new(
        group: &str,
        policy: ResolvedPolicy,
        mut items: Vec<RolloutItem<K>>,
        az_order: &[String],
    ) -> Self {
        let position = |az: &Option<String>| {
            az.as_ref()
                .and_then(|a| az_order.iter().position(|o| o == a))
                .unwrap_or(az_order.len())
        };
        items.sort_by_key(|i| (position(&i.az), !i.bootstrap, i.index));

        let canary_count = (policy.canaries as usize).min(items.len());
        let rest = items.split_off(canary_count);
        let canaries = items.into_iter().map(|i| i.key).collect();

        let mut az_batches: Vec<(Option<String>, Vec<K>)> = Vec::new();
        for item in rest {
            match az_batches.last_mut() {
                Some((az, keys)) if *az == item.az => keys.push(item.key),
                _ => az_batches.push((item.az, vec![item.key])),
            }
        }

        Self {
            group: group.to_string(),
            policy,
            phase: RolloutPhase::Pending,
            canaries,
            az_batches,
        }
    }

    pub fn canary_count(&self) -> usize {
        self.canaries.len()
    }

    pub fn total(&self) -> usize {
        self.canaries.len() + self.az_batches.iter().map(|(_, k)| k.len()).sum::<usize>()
    }

    /// Start the rollout and hand out the first batch.
    pub fn start(&mut self) -> Option<BatchAction<K>> {
        if self.phase != RolloutPhase::Pending {
            return None;
        }
        info!(
            group = %self.group,
            canaries = self.canaries.len(),
            azs = self.az_batches.len(),
            max_in_flight = self.policy.max_in_flight,
            "starting instance group rollout"
        );
        if !self.canaries.is_empty() {
            self.phase = RolloutPhase::Canaries;
            return Some(BatchAction {
                instances: self.canaries.clone(),
                parallelism: self.policy.canary_parallelism() as usize,
                canary: true,
                watch: self.policy.canary_watch_time,
            });
        }
        self.az_batch(0)
    }

    fn az_batch(&mut self, position: usize) -> Option<BatchAction<K>> {
        let total = self.az_batches.len();
        let Some((az, keys)) = self.az_batches.get(position) else {
            self.phase = RolloutPhase::Completed;
            info!(group = %self.group, "instance group rollout completed");
            return None;
        };
        debug!(group = %self.group, az = ?az, instances = keys.len(), "next az batch");
        let action = BatchAction {
            instances: keys.clone(),
            parallelism: self.policy.max_in_flight as usize,
            canary: false,
            watch: self.policy.update_watch_time,
        };
        self.phase = RolloutPhase::AzBatch { position, total };
        Some(action)
    }

    /// Report the previous batch's outcome and get the next batch.
    ///
    /// Returns `None` when the rollout has completed or halted.
    pub fn advance(&mut self, outcome: BatchOutcome) -> Option<BatchAction<K>> {
        if let BatchOutcome::Failed { reason } = outcome {
            if matches!(self.phase, RolloutPhase::Canaries | RolloutPhase::AzBatch { .. }) {
                warn!(group = %self.group, %reason, "halting rollout");
                self.phase = RolloutPhase::Halted { reason };
            }
            return None;
        }
        match self.phase.clone() {
            RolloutPhase::Pending => self.start(),
            RolloutPhase::Canaries => self.az_batch(0),
            RolloutPhase::AzBatch { position, .. } => self.az_batch(position + 1),
            RolloutPhase::Completed | RolloutPhase::Halted { .. } => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.phase, RolloutPhase::Halted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_core::{Quantity, UpdatePolicy};

    use crate::strategy::PolicyOverrides;

    fn policy(canaries: u32, max_in_flight: u32) -> ResolvedPolicy {
        ResolvedPolicy::resolve(
            &UpdatePolicy {
                canaries: Quantity::Count(canaries),
                max_in_flight: Quantity::Count(max_in_flight),
                canary_watch_time: WatchTime::fixed(10),
                update_watch_time: WatchTime::fixed(20),
                ..UpdatePolicy::default()
            },
            &PolicyOverrides::default(),
            10,
        )
    }

    fn item(index: u32, az: &str) -> RolloutItem<u32> {
        RolloutItem {
            key: index,
            az: Some(az.to_string()),
            index,
            bootstrap: index == 0,
        }
    }

    fn azs() -> Vec<String> {
        vec!["z1".to_string(), "z2".to_string()]
    }

    #[test]
    fn canaries_then_az_batches() {
        let items = vec![item(0, "z1"), item(1, "z2"), item(2, "z1"), item(3, "z2"), item(4, "z1")];
        let mut rollout = Rollout::new("web", policy(2, 2), items, &azs());
        assert_eq!(rollout.total(), 5);

        let canaries = rollout.start().unwrap();
        assert!(canaries.canary);
        assert_eq!(canaries.instances, vec![0, 2]);
        assert_eq!(canaries.parallelism, 2);
        assert_eq!(canaries.watch, WatchTime::fixed(10));

        let z1 = rollout.advance(BatchOutcome::Succeeded).unwrap();
        assert_eq!(z1.instances, vec![4]);
        assert_eq!(z1.watch, WatchTime::fixed(20));
        assert_eq!(rollout.phase, RolloutPhase::AzBatch { position: 0, total: 2 });

        let z2 = rollout.advance(BatchOutcome::Succeeded).unwrap();
        assert_eq!(z2.instances, vec![1, 3]);
        assert_eq!(z2.parallelism, 2);

        assert!(rollout.advance(BatchOutcome::Succeeded).is_none());
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }

    #[test]
    fn canary_failure_halts_everything() {
        let items = vec![item(0, "z1"), item(1, "z1"), item(2, "z1")];
        let mut rollout = Rollout::new("web", policy(1, 1), items, &azs());
        let canaries = rollout.start().unwrap();
        assert_eq!(canaries.instances, vec![0]);
        let next = rollout.advance(BatchOutcome::Failed {
            reason: "web/0 failed".into(),
        });
        assert!(next.is_none());
        assert!(rollout.is_halted());
        assert!(rollout.advance(BatchOutcome::Succeeded).is_none());
    }

    #[test]
    fn zero_canaries_go_straight_to_batches() {
        let items = vec![item(0, "z1"), item(1, "z1"), item(2, "z1")];
        let mut rollout = Rollout::new("web", policy(0, 2), items, &azs());
        let batch = rollout.start().unwrap();
        assert!(!batch.canary);
        assert_eq!(batch.instances.len(), 3);
        assert_eq!(batch.parallelism, 2);
    }

    #[test]
    fn canaries_clamped_to_instances() {
        let items = vec![item(0, "z1")];
        let mut rollout = Rollout::new("web", policy(3, 1), items, &azs());
        assert_eq!(rollout.canary_count(), 1);
        assert_eq!(rollout.start().unwrap().parallelism, 1);
        assert!(rollout.advance(BatchOutcome::Succeeded).is_none());
    }

    #[test]
    fn bootstrap_instance_is_first_canary() {
        let items = vec![
            RolloutItem { key: 5, az: Some("z1".into()), index: 5, bootstrap: true },
            RolloutItem { key: 1, az: Some("z1".into()), index: 1, bootstrap: false },
        ];
        let mut rollout = Rollout::new("web", policy(1, 1), items, &azs());
        assert_eq!(rollout.start().unwrap().instances, vec![5]);
    }

    #[test]
    fn unknown_azs_sort_last() {
        let items = vec![item(7, "z9"), item(1, "z2")];
        let mut rollout = Rollout::new("web", policy(0, 5), items, &azs());
        assert_eq!(rollout.start().unwrap().instances, vec![1]);
        assert_eq!(rollout.advance(BatchOutcome::Succeeded).unwrap().instances, vec![7]);
    }

    #[test]
    fn empty_rollout_completes_immediately() {
        let mut rollout: Rollout<u32> = Rollout::new("web", policy(1, 1), vec![], &azs());
        assert!(rollout.start().is_none());
        assert_eq!(rollout.phase, RolloutPhase::Completed);
    }
}
