//! Instance and instance-group updater.
//!
//! [`InstanceUpdater::converge`] runs the steps of one lifecycle
//! [`Transition`](crate::lifecycle::Transition) against the agent, CPI and
//! disk manager, persisting the instance row after every step that changes
//! what exists in the cloud. [`InstanceUpdater::update_group`] drives a
//! group's [`Rollout`]: canaries first, then AZ batches with at most
//! `max_in_flight` instances in progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use armada_core::WatchTime;
use armada_core::desired::DesiredInstanceGroup;
use armada_cpi::CpiRouter;
use armada_journal::{EventJournal, EventSpec};
use armada_rollout::{BatchAction, BatchOutcome, PolicyOverrides, ResolvedPolicy, Rollout, RolloutItem};
use armada_state::{InstanceRecord, InstanceState, Mutation, StateStore, VmRecord, now_epoch};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentClient, AgentFactory, JobState, Script};
use crate::disks::DiskManager;
use crate::error::{DirectorError, DirectorResult};
use crate::lifecycle::{Operation, Step, VmStatus, transition};
use crate::planner::{Change, GroupPlan, InstanceSpec, PlannedInstance};
use crate::tasks::Cancellation;
use crate::vm::VmCreator;

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Which instance groups skip the agent drain before stopping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipDrain {
    #[default]
    None,
    All,
    Groups(Vec<String>),
}

impl SkipDrain {
    /// `None` → no skip, `""`/`"*"` → all groups, `"a,b"` → those groups.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None => SkipDrain::None,
            Some("" | "*") => SkipDrain::All,
            Some(list) => SkipDrain::Groups(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        }
    }

    pub fn applies(&self, group: &str) -> bool {
        match self {
            SkipDrain::None => false,
            SkipDrain::All => true,
            SkipDrain::Groups(groups) => groups.iter().any(|g| g == group),
        }
    }
}

/// The spec document sent to the agent's `apply`.
pub fn apply_spec(group: &DesiredInstanceGroup, record: &InstanceRecord, spec: &InstanceSpec) -> Value {
    json!({
        "deployment": record.deployment,
        "name": record.group,
        "index": record.index,
        "id": record.uuid,
        "az": record.az,
        "bootstrap": record.bootstrap,
        "stemcell": spec.stemcell,
        "jobs": group.jobs,
        "properties": group.properties,
        "networks": spec.networks,
        "persistent_disk": spec.disk.as_ref().map(|d| d.size).unwrap_or(0),
        "env": spec.env,
        "vm_hash": spec.vm_hash,
        "jobs_hash": spec.jobs_hash,
    })
}

#[derive(Debug, Clone)]
pub struct InstanceUpdater {
    store: StateStore,
    journal: EventJournal,
    agents: Arc<dyn AgentFactory>,
    vms: VmCreator,
    disks: DiskManager,
    cancel: Cancellation,
    skip_drain: SkipDrain,
    variable_set: Option<u64>,
    parent: Option<u64>,
}

impl InstanceUpdater {
    pub fn new(
        store: StateStore,
        journal: EventJournal,
        router: CpiRouter,
        agents: Arc<dyn AgentFactory>,
        director: &str,
    ) -> Self {
        Self {
            vms: VmCreator::new(router.clone(), journal.clone(), director),
            disks: DiskManager::new(store.clone(), journal.clone(), router, agents.clone()),
            store,
            journal,
            agents,
            cancel: Cancellation::never(),
            skip_drain: SkipDrain::None,
            variable_set: None,
            parent: None,
        }
    }

    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.vms = self.vms.tags(tags);
        self
    }

    /// Variable set recorded on every instance whose spec is applied.
    pub fn variable_set(mut self, id: Option<u64>) -> Self {
        self.variable_set = id;
        self
    }

    pub fn cancel(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn skip_drain(mut self, skip: SkipDrain) -> Self {
        self.skip_drain = skip;
        self
    }

    pub fn with_parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }

    fn save(&self, record: &mut InstanceRecord) -> DirectorResult<()> {
        record.updated_at = now_epoch();
        self.store.apply(&[Mutation::PutInstance(record.clone())])?;
        Ok(())
    }

    fn agent(&self, record: &InstanceRecord) -> DirectorResult<Arc<dyn AgentClient>> {
        let vm = record
            .vm
            .as_ref()
            .ok_or_else(|| DirectorError::Conflict(format!("'{}' has no vm", record.name())))?;
        Ok(self.agents.connect(&vm.agent_id))
    }

    /// Run `op` on one instance; returns the record as persisted.
    pub async fn converge(
        &self,
        group: &DesiredInstanceGroup,
        mut record: InstanceRecord,
        spec: &InstanceSpec,
        vm: VmStatus,
        op: Operation,
        watch: WatchTime,
    ) -> DirectorResult<InstanceRecord> {
        let name = record.name();
        self.cancel.check()?;
        let scope = self.journal.begin(
            EventSpec::new(op.action(), "instance", &name)
                .deployment(&record.deployment)
                .instance(&name)
                .context(json!({"az": record.az, "index": record.index}))
                .parent(self.parent),
        )?;
        let children = self.clone().with_parent(Some(scope.id()));
        let result = children
            .run_transition(group, &mut record, Some(spec), vm, op, watch)
            .await;
        scope.complete(&result);
        result.map_err(|e| e.for_instance(&name, op.action()))?;
        Ok(record)
    }

    async fn run_transition(
        &self,
        group: &DesiredInstanceGroup,
        record: &mut InstanceRecord,
        spec: Option<&InstanceSpec>,
        vm: VmStatus,
        op: Operation,
        watch: WatchTime,
    ) -> DirectorResult<()> {
        let vms = self.vms.clone().with_parent(self.parent);
        let disks = self.disks.clone().with_parent(self.parent);
        let plan = transition(record.state, vm, op);
        debug!(instance = %record.name(), %op, steps = ?plan.steps, target = %plan.target, "running transition");

        let mut replaced: Option<VmRecord> = None;
        for step in plan.steps {
            match step {
                Step::PreStop => self.agent(record)?.run_script(Script::PreStop).await?,
                Step::Drain => {
                    if self.skip_drain.applies(&record.group) {
                        debug!(instance = %record.name(), "skipping drain");
                    } else {
                        let wait = self.agent(record)?.drain().await?;
                        if wait > 0 {
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                        }
                    }
                }
                Step::StopJobs => {
                    self.agent(record)?.stop().await?;
                    record.state = InstanceState::Stopped;
                    self.save(record)?;
                }
                Step::DetachDisks => disks.detach_disks(record).await?,
                Step::DeleteVm => {
                    if let Some(current) = record.vm.clone() {
                        vms.delete_vm(record, &current).await?;
                        record.vm = None;
                        self.save(record)?;
                    }
                }
                Step::CreateVm => {
                    let created = vms.create_vm(record, required(spec)?).await?;
                    record.vm = Some(created);
                    record.applied = None;
                    self.save(record)?;
                    self.flush_arp(record).await;
                }
                Step::CreatePendingVm => {
                    let mut pending = vms.create_vm(record, required(spec)?).await?;
                    pending.active = false;
                    record.pending_vm = Some(pending);
                    self.save(record)?;
                }
                Step::Cutover => {
                    let Some(mut next) = record.pending_vm.take() else {
                        return Err(DirectorError::Conflict(format!(
                            "'{}' has no replacement vm to cut over to",
                            record.name()
                        )));
                    };
                    next.active = true;
                    replaced = record.vm.replace(next).map(|mut old| {
                        old.active = false;
                        old
                    });
                    record.applied = None;
                    self.save(record)?;
                    self.flush_arp(record).await;
                }
                Step::DeleteOldVm => {
                    if let Some(old) = replaced.take() {
                        vms.delete_vm(record, &old).await?;
                    }
                }
                Step::AttachDisks => disks.attach_disks(record).await?,
                Step::EnsureDisk => {
                    disks
                        .ensure_disk(record, required(spec)?.disk.as_ref())
                        .await?
                }
                Step::ApplySpec => {
                    let spec = required(spec)?;
                    self.agent(record)?.apply(&apply_spec(group, record, spec)).await?;
                    record.applied = Some(spec.applied());
                    record.variable_set = self.variable_set.or(record.variable_set);
                    self.save(record)?;
                }
                Step::PreStart => self.agent(record)?.run_script(Script::PreStart).await?,
                Step::StartJobs => {
                    self.agent(record)?.start().await?;
                    record.state = InstanceState::Running;
                    self.save(record)?;
                }
                Step::PostStart => self.agent(record)?.run_script(Script::PostStart).await?,
                Step::Watch => self.watch(record, watch).await?,
            }
        }
        record.state = plan.target;
        self.save(record)?;
        Ok(())
    }

    /// Tell the other agents of the deployment to forget stale ARP
    /// entries for the instance's addresses. Failures are not fatal.
    async fn flush_arp(&self, record: &InstanceRecord) {
        let ips: Vec<_> = record.ips.iter().map(|r| r.ip).collect();
        if ips.is_empty() {
            return;
        }
        let peers = match self.store.list_instances(&record.deployment) {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "cannot list peers for arp flush");
                return;
            }
        };
        for peer in peers.iter().filter(|p| p.uuid != record.uuid) {
            if let Some(vm) = &peer.vm
                && let Err(e) = self.agents.connect(&vm.agent_id).delete_arp_entries(&ips).await
            {
                warn!(peer = %peer.name(), error = %e, "delete_arp_entries failed");
            }
        }
    }

    /// Sleep `min`, then poll the agent until its jobs run or `max` passes.
    async fn watch(&self, record: &InstanceRecord, watch: WatchTime) -> DirectorResult<()> {
        let agent = self.agent(record)?;
        tokio::time::sleep(Duration::from_millis(watch.min_ms)).await;
        let deadline = Instant::now() + Duration::from_millis(watch.max_ms.saturating_sub(watch.min_ms));
        loop {
            self.cancel.check()?;
            let state = agent.get_state().await?;
            if state == JobState::Running {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DirectorError::Unhealthy {
                    instance: record.name(),
                    detail: format!("jobs are {state:?} after {}ms", watch.max_ms),
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Delete an instance: stop it, delete its VM, orphan its disks and
    /// drop the row (freeing its IPs) in one write.
    pub async fn delete_instance(&self, record: InstanceRecord, vm: VmStatus) -> DirectorResult<()> {
        let name = record.name();
        self.cancel.check()?;
        let scope = self.journal.begin(
            EventSpec::new("delete", "instance", &name)
                .deployment(&record.deployment)
                .instance(&name)
                .context(json!({"az": record.az, "index": record.index}))
                .parent(self.parent),
        )?;
        let children = self.clone().with_parent(Some(scope.id()));
        let result = children.remove(record, vm).await;
        scope.complete(&result);
        result.map_err(|e| e.for_instance(&name, "delete"))
    }

    async fn remove(&self, mut record: InstanceRecord, vm: VmStatus) -> DirectorResult<()> {
        // Only stop and delete steps run; neither reads the group or spec.
        let group = DesiredInstanceGroup::named(&record.group);
        self.run_transition(&group, &mut record, None, vm, Operation::Delete, WatchTime::fixed(0))
            .await?;
        let disks = self.disks.clone().with_parent(self.parent);
        let mut writes: Vec<Mutation> = disks
            .orphan_all(&record)?
            .into_iter()
            .map(Mutation::PutDisk)
            .collect();
        writes.push(Mutation::DeleteInstance(record.table_key()));
        self.store.apply(&writes)?;
        info!(instance = %record.name(), "deleted instance");
        Ok(())
    }

    /// Converge one instance group.
    ///
    /// Instances with nothing to do are persisted as planned (adopting the
    /// new variable set unless ignored, detached or unreachable). The rest go through a
    /// rollout; a failed canary aborts with [`DirectorError::CanaryFailed`],
    /// any other failure halts the group and is returned.
    pub async fn update_group(&self, plan: &GroupPlan, overrides: &PolicyOverrides) -> DirectorResult<usize> {
        let mut items = Vec::new();
        for (pos, planned) in plan.instances.iter().enumerate() {
            match planned.change {
                Change::NoOp => {
                    let mut record = planned.record.clone();
                    let pinned = record.ignore || record.unreachable.is_some();
                    if !pinned && record.state != InstanceState::Detached {
                        record.variable_set = self.variable_set.or(record.variable_set);
                    }
                    self.save(&mut record)?;
                }
                Change::Reserve => {
                    let mut record = planned.record.clone();
                    record.variable_set = self.variable_set;
                    self.save(&mut record)?;
                }
                Change::Create | Change::Update | Change::Recreate | Change::Hotswap => {
                    if planned.is_new() {
                        // The row must exist before disks can reference it.
                        let mut record = planned.record.clone();
                        self.save(&mut record)?;
                    }
                    items.push(RolloutItem {
                        key: pos,
                        az: planned.record.az.clone(),
                        index: planned.record.index,
                        bootstrap: planned.record.bootstrap,
                    });
                }
            }
        }
        self.roll(plan, items, None, overrides).await
    }

    /// Run an explicit state command (`start`, `stop`, `restart`,
    /// `recreate`) on the instances of `plan` at `positions`.
    pub async fn change_group_state(
        &self,
        plan: &GroupPlan,
        positions: &[usize],
        op: Operation,
        overrides: &PolicyOverrides,
    ) -> DirectorResult<usize> {
        let items = positions
            .iter()
            .filter_map(|&pos| plan.instances.get(pos).map(|p| (pos, p)))
            .map(|(pos, p)| RolloutItem {
                key: pos,
                az: p.record.az.clone(),
                index: p.record.index,
                bootstrap: p.record.bootstrap,
            })
            .collect();
        self.roll(plan, items, Some(op), overrides).await
    }

    async fn roll(
        &self,
        plan: &GroupPlan,
        items: Vec<RolloutItem<usize>>,
        op: Option<Operation>,
        overrides: &PolicyOverrides,
    ) -> DirectorResult<usize> {
        let group = &plan.group;
        if items.is_empty() {
            debug!(group = %group.name, "nothing to update");
            return Ok(0);
        }

        let policy = ResolvedPolicy::resolve(&group.update, overrides, group.instances);
        let az_order: Vec<String> = group.azs.iter().map(|a| a.name.clone()).collect();
        let mut rollout = Rollout::new(&group.name, policy, items, &az_order);
        let total = rollout.total();

        let mut next = rollout.start();
        while let Some(batch) = next {
            let canary = batch.canary;
            match self.run_batch(plan, batch, op).await {
                Ok(()) => next = rollout.advance(BatchOutcome::Succeeded),
                Err((instance, err)) => {
                    rollout.advance(BatchOutcome::Failed {
                        reason: err.to_string(),
                    });
                    if canary && !matches!(err, DirectorError::Cancelled) {
                        return Err(DirectorError::CanaryFailed {
                            group: group.name.clone(),
                            instance,
                            reason: err.root().to_string(),
                        });
                    }
                    return Err(err);
                }
            }
        }
        Ok(total)
    }

    /// Run one batch with bounded parallelism. Once an instance fails no
    /// further instance of the batch is started.
    async fn run_batch(
        &self,
        plan: &GroupPlan,
        batch: BatchAction<usize>,
        op: Option<Operation>,
    ) -> Result<(), (String, DirectorError)> {
        let limit = Arc::new(Semaphore::new(batch.parallelism.max(1)));
        let failed = Arc::new(AtomicBool::new(false));
        let mut running = JoinSet::new();

        for pos in batch.instances {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            if failed.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                break;
            }
            let Some(op) = op.or(plan.instances[pos].change.operation()) else {
                continue;
            };
            let PlannedInstance { record, spec, vm, .. } = plan.instances[pos].clone();
            let group = plan.group.clone();
            let updater = self.clone();
            let failed = failed.clone();
            let watch = batch.watch;
            running.spawn(async move {
                let name = record.name();
                let result = updater.converge(&group, record, &spec, vm, op, watch).await;
                drop(permit);
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                (name, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => (
                    plan.group.name.clone(),
                    Err(DirectorError::Conflict(format!("instance update aborted: {e}"))),
                ),
            };
            if let Err(e) = result
                && first_error.is_none()
            {
                first_error = Some((name, e));
            }
        }
        match first_error {
            Some(failure) => Err(failure),
            None if self.cancel.is_cancelled() => Err((plan.group.name.clone(), DirectorError::Cancelled)),
            None => Ok(()),
        }
    }
}

fn required(spec: Option<&InstanceSpec>) -> DirectorResult<&InstanceSpec> {
    spec.ok_or_else(|| DirectorError::Conflict("instance spec required for this step".to_string()))
}
