//! Deployment updater.
//!
//! Runs a whole deploy under the deployment lock: resolve variables and
//! desired state, plan, compile, then converge instance groups stage by
//! stage and finally delete what the new topology no longer holds. Also
//! runs the explicit state commands and deployment deletion.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use armada_core::desired::DesiredDeployment;
use armada_core::{
    CloudConfig, CpiConfig, DeploymentManifest, DirectorConfig, Lifecycle, Quantity, RuntimeConfig, resolve,
};
use armada_cpi::{CpiRegistry, CpiRouter};
use armada_journal::{EventJournal, EventSpec, LockManager, LockName};
use armada_rollout::PolicyOverrides;
use armada_state::{
    DeploymentRecord, InstanceRecord, InstanceState, IpReservation, Mutation, Revision, RevisionStatus,
    StateStore, now_epoch,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent::{AgentFactory, Script};
use crate::compiler::PackageCompiler;
use crate::error::{DirectorError, DirectorResult};
use crate::ip::IpAllocator;
use crate::lifecycle::{Operation, VmStatus};
use crate::planner::{CalculatedProperties, DeploymentPlan, GroupPlan, InstanceSelector, PlanOptions, Planner};
use crate::tasks::Cancellation;
use crate::updater::{InstanceUpdater, SkipDrain};
use crate::variables::VariableTracker;

/// Name under which the single cloud and CPI configs are stored.
pub const DEFAULT_CONFIG: &str = "default";

/// Per-invocation deploy flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployOptions {
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub fix: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_drain: SkipDrain,
    #[serde(default)]
    pub canaries: Option<Quantity>,
    #[serde(default)]
    pub max_in_flight: Option<Quantity>,
}

impl DeployOptions {
    fn overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            canaries: self.canaries,
            max_in_flight: self.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployReport {
    pub deployment: String,
    pub dry_run: bool,
    pub revision: Option<u64>,
    pub variable_set: Option<u64>,
    pub plan: Value,
    pub updated: usize,
    pub deleted: usize,
    pub compiled: usize,
}

/// Result of a state command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeReport {
    pub deployment: String,
    pub action: String,
    pub instances: Vec<String>,
    pub dry_run: bool,
}

/// Everything resolved for one operation on a deployment.
struct Resolved {
    desired: DesiredDeployment,
    router: CpiRouter,
    plan: DeploymentPlan,
    lost: HashSet<String>,
    /// Instances whose unreachable marker changed, not yet persisted.
    marked: Vec<InstanceRecord>,
    cloud_config_id: Option<u64>,
    runtime_config_ids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct Deployer {
    store: StateStore,
    journal: EventJournal,
    locks: LockManager,
    cpis: Arc<CpiRegistry>,
    agents: Arc<dyn AgentFactory>,
    variables: VariableTracker,
    config: Arc<DirectorConfig>,
    cancel: Cancellation,
}

impl Deployer {
    pub fn new(
        store: StateStore,
        journal: EventJournal,
        locks: LockManager,
        cpis: Arc<CpiRegistry>,
        agents: Arc<dyn AgentFactory>,
        variables: VariableTracker,
        config: Arc<DirectorConfig>,
    ) -> Self {
        Self {
            store,
            journal,
            locks,
            cpis,
            agents,
            variables,
            config,
            cancel: Cancellation::never(),
        }
    }

    pub fn cancel(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    // ── Config snapshots ───────────────────────────────────────────

    pub fn cpi_config(&self) -> DirectorResult<Option<CpiConfig>> {
        match self.store.latest_config("cpi", DEFAULT_CONFIG)? {
            Some(c) => Ok(Some(CpiConfig::parse(&c.content)?)),
            None => Ok(None),
        }
    }

    /// The cloud config pinned at `id`, or the latest one.
    pub fn cloud_config(&self, id: Option<u64>) -> DirectorResult<(CloudConfig, Option<u64>)> {
        let record = match id {
            Some(id) => self.store.get_config(id)?,
            None => self.store.latest_config("cloud", DEFAULT_CONFIG)?,
        };
        match record {
            Some(c) => Ok((CloudConfig::parse(&c.content)?, Some(c.id))),
            None => Ok((CloudConfig::default(), None)),
        }
    }

    /// Runtime configs pinned at `ids`, or the latest of every name.
    pub fn runtime_config(&self, ids: Option<&[u64]>) -> DirectorResult<(RuntimeConfig, Vec<u64>)> {
        let records = match ids {
            Some(ids) => {
                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(c) = self.store.get_config(*id)? {
                        records.push(c);
                    }
                }
                records
            }
            None => self.store.list_configs(Some("runtime"), false)?,
        };
        let mut parsed = Vec::with_capacity(records.len());
        for c in &records {
            parsed.push(RuntimeConfig::parse(&c.content)?);
        }
        Ok((RuntimeConfig::combine(&parsed), records.iter().map(|c| c.id).collect()))
    }

    /// A routing snapshot for the current CPI config and `cloud`.
    pub fn router(&self, cloud: &CloudConfig) -> DirectorResult<CpiRouter> {
        let cpi = self.cpi_config()?;
        Ok(self.cpis.router(cpi.as_ref(), cloud.az_cpis())?)
    }

    // ── Deploy ─────────────────────────────────────────────────────

    async fn lock(&self, deployment: &str) -> DirectorResult<armada_journal::LockGuard> {
        Ok(self
            .locks
            .acquire(
                LockName::deployment(deployment),
                &self.journal,
                Some(deployment),
                self.config.lock_timeout(),
            )
            .await?)
    }

    /// Deploy `manifest` (a raw document that may hold placeholders).
    pub async fn deploy(&self, manifest: Value, options: DeployOptions) -> DirectorResult<DeployReport> {
        let name = DeploymentManifest::name_of(&manifest)?;
        let _lock = self.lock(&name).await?;
        let existing = self.store.get_deployment(&name)?;
        let action = if existing.is_some() { "update" } else { "create" };
        let scope = self.journal.begin(
            EventSpec::new(action, "deployment", &name)
                .deployment(&name)
                .context(json!({"dry_run": options.dry_run, "recreate": options.recreate, "fix": options.fix})),
        )?;
        let result = self.run_deploy(&name, manifest, existing, &options, scope.id()).await;
        scope.complete(&result);
        result
    }

    async fn run_deploy(
        &self,
        name: &str,
        manifest: Value,
        existing: Option<DeploymentRecord>,
        options: &DeployOptions,
        parent: u64,
    ) -> DirectorResult<DeployReport> {
        let (cloud, cloud_id) = self.cloud_config(None)?;
        let (runtime, runtime_ids) = self.runtime_config(None)?;

        if options.dry_run {
            let set = self.variables.preview(name, &manifest).await?;
            let rendered = self.variables.interpolate(&manifest, &set).await?;
            let resolved = self
                .resolve(rendered, &cloud, cloud_id, &runtime, runtime_ids, PlanOptions::from(options))
                .await?;
            info!(deployment = %name, "dry run: no changes applied");
            return Ok(DeployReport {
                deployment: name.to_string(),
                dry_run: true,
                revision: None,
                variable_set: None,
                plan: resolved.plan.summary(),
                updated: 0,
                deleted: 0,
                compiled: 0,
            });
        }

        let set = self.variables.resolve(name, &manifest).await?;
        let rendered = self.variables.interpolate(&manifest, &set).await?;
        let resolved = self
            .resolve(rendered, &cloud, cloud_id, &runtime, runtime_ids, PlanOptions::from(options))
            .await?;
        self.save_marks(&resolved.marked)?;
        self.cancel.check()?;

        let compiled = PackageCompiler::new(
            self.store.clone(),
            self.journal.clone(),
            self.locks.clone(),
            resolved.router.clone(),
            self.agents.clone(),
        )
        .workers(self.config.compilation.workers)
        .lock_timeout(self.config.lock_timeout())
        .cancel(self.cancel.clone())
        .with_parent(Some(parent))
        .compile(&resolved.desired)
        .await?;

        let mut record = existing.unwrap_or_else(|| DeploymentRecord::new(name, manifest.clone()));
        record.manifest = manifest;
        record.cloud_config_id = resolved.cloud_config_id;
        record.runtime_config_ids = resolved.runtime_config_ids.clone();
        record.updated_at = now_epoch();
        let revision = record.revisions.last().map(|r| r.id + 1).unwrap_or(1);
        record.revisions.push(Revision {
            id: revision,
            task_id: self.journal.task(),
            variable_set: set.id,
            status: RevisionStatus::InProgress,
            created_at: now_epoch(),
        });
        self.store.apply(&[Mutation::PutDeployment(record.clone())])?;

        let updater = InstanceUpdater::new(
            self.store.clone(),
            self.journal.clone(),
            resolved.router.clone(),
            self.agents.clone(),
            &self.config.director.name,
        )
        .tags(resolved.desired.tags.clone())
        .variable_set(Some(set.id))
        .cancel(self.cancel.clone())
        .skip_drain(options.skip_drain.clone())
        .with_parent(Some(parent));

        let converged = self
            .converge(&updater, &resolved.plan, &resolved.lost, &options.overrides())
            .await;
        let (updated, deleted, failure) = match converged {
            Ok(counts) => (counts.0, counts.1, None),
            Err(e) => (0, 0, Some(e)),
        };
        let failure = match failure {
            None => self.post_deploy(name).await.err(),
            f => f,
        };

        let status = if failure.is_some() {
            RevisionStatus::Failed
        } else {
            RevisionStatus::Succeeded
        };
        if let Some(mut latest) = self.store.get_deployment(name)? {
            if let Some(r) = latest.revision_mut(revision) {
                r.status = status;
            }
            latest.updated_at = now_epoch();
            self.store.apply(&[Mutation::PutDeployment(latest)])?;
        }

        if let Some(e) = failure {
            warn!(deployment = %name, revision, error = %e, "deploy failed");
            return Err(e);
        }
        self.variables.collect_garbage(name)?;
        info!(deployment = %name, revision, updated, deleted, "deploy finished");
        Ok(DeployReport {
            deployment: name.to_string(),
            dry_run: false,
            revision: Some(revision),
            variable_set: Some(set.id),
            plan: resolved.plan.summary(),
            updated,
            deleted,
            compiled: compiled.compiled,
        })
    }

    /// Resolve desired state and plan it against the current instances.
    async fn resolve(
        &self,
        rendered: Value,
        cloud: &CloudConfig,
        cloud_config_id: Option<u64>,
        runtime: &RuntimeConfig,
        runtime_config_ids: Vec<u64>,
        options: PlanOptions,
    ) -> DirectorResult<Resolved> {
        let manifest = DeploymentManifest::from_value(rendered)?;
        let desired = resolve(&manifest, cloud, runtime, &self.config.env_json())?;
        let router = self.router(cloud)?;
        let mut current = self.store.list_instances(&desired.name)?;
        let scan = scan_vms(&router, &mut current).await;
        let calculated = calculate(&router, &desired).await?;

        let mut reservations: Vec<IpReservation> = Vec::new();
        for deployment in self.store.list_deployments()? {
            for instance in self.store.list_instances(&deployment.name)? {
                reservations.extend(instance.ips);
            }
        }
        let disks = self
            .store
            .list_disks()?
            .into_iter()
            .filter(|d| d.deployment == desired.name);

        let plan = Planner::new(&desired, &router, IpAllocator::new(&reservations))
            .calculated(calculated)
            .disks(disks)
            .lost_vms(scan.lost.clone())
            .options(options)
            .plan(current)?;
        Ok(Resolved {
            desired,
            router,
            plan,
            lost: scan.lost,
            marked: scan.marked,
            cloud_config_id,
            runtime_config_ids,
        })
    }

    /// Persist the unreachable markers a VM scan changed.
    fn save_marks(&self, marked: &[InstanceRecord]) -> DirectorResult<()> {
        if marked.is_empty() {
            return Ok(());
        }
        let writes: Vec<Mutation> = marked.iter().cloned().map(Mutation::PutInstance).collect();
        self.store.apply(&writes)?;
        Ok(())
    }

    /// Converge stage by stage, then delete. A failed canary stops
    /// everything; any other failure halts only its own group and is
    /// returned once the remaining stages have run.
    async fn converge(
        &self,
        updater: &InstanceUpdater,
        plan: &DeploymentPlan,
        lost: &HashSet<String>,
        overrides: &PolicyOverrides,
    ) -> DirectorResult<(usize, usize)> {
        let mut updated = 0;
        let mut failed_groups = HashSet::new();
        let mut failure = None;

        for stage in stages(&plan.groups) {
            self.cancel.check()?;
            let mut running = JoinSet::new();
            for pos in stage {
                let group = plan.groups[pos].clone();
                let updater = updater.clone();
                let overrides = overrides.clone();
                running.spawn(async move {
                    let name = group.group.name.clone();
                    (name, updater.update_group(&group, &overrides).await)
                });
            }
            let mut abort = None;
            while let Some(joined) = running.join_next().await {
                let (group, result) = joined
                    .map_err(|e| DirectorError::Conflict(format!("instance group update aborted: {e}")))?;
                match result {
                    Ok(n) => updated += n,
                    Err(e @ (DirectorError::CanaryFailed { .. } | DirectorError::Cancelled)) => {
                        abort.get_or_insert(e);
                    }
                    Err(e) => {
                        warn!(%group, error = %e, "instance group halted");
                        failed_groups.insert(group);
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = abort {
                return Err(e);
            }
        }

        let mut deleted = 0;
        let doomed = plan
            .groups
            .iter()
            .filter(|g| !failed_groups.contains(&g.group.name))
            .flat_map(|g| g.deletions.iter())
            .chain(plan.obsolete.iter());
        for record in doomed {
            self.cancel.check()?;
            updater
                .delete_instance(record.clone(), vm_status(record, lost))
                .await?;
            deleted += 1;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok((updated, deleted)),
        }
    }

    async fn post_deploy(&self, deployment: &str) -> DirectorResult<()> {
        for record in self.store.list_instances(deployment)? {
            if record.ignore || record.state != InstanceState::Running {
                continue;
            }
            if let Some(vm) = &record.vm {
                self.agents
                    .connect(&vm.agent_id)
                    .run_script(Script::PostDeploy)
                    .await
                    .map_err(|e| DirectorError::from(e).for_instance(&record.name(), "run post-deploy"))?;
            }
        }
        Ok(())
    }

    // ── State commands ─────────────────────────────────────────────

    /// `start`, `stop [--hard]`, `restart` or `recreate [--fix]` on the
    /// selected instances, using the deployment's last deployed manifest
    /// and pinned variables and configs.
    pub async fn change_state(
        &self,
        deployment: &str,
        selector: &InstanceSelector,
        op: Operation,
        options: DeployOptions,
    ) -> DirectorResult<ChangeReport> {
        if !matches!(
            op,
            Operation::Start | Operation::Stop | Operation::StopHard | Operation::Restart | Operation::Recreate
        ) {
            return Err(DirectorError::Validation(format!("'{op}' is not a state command")));
        }
        let _lock = self.lock(deployment).await?;
        let scope = self.journal.begin(
            EventSpec::new(op.action(), "deployment", deployment)
                .deployment(deployment)
                .context(json!({"instances": selector.to_string(), "hard": op == Operation::StopHard})),
        )?;
        let result = self.run_change(deployment, selector, op, &options, scope.id()).await;
        scope.complete(&result);
        result
    }

    async fn run_change(
        &self,
        deployment: &str,
        selector: &InstanceSelector,
        op: Operation,
        options: &DeployOptions,
        parent: u64,
    ) -> DirectorResult<ChangeReport> {
        let record = self
            .store
            .get_deployment(deployment)?
            .ok_or_else(|| DirectorError::not_found("deployment", deployment))?;
        let set = match record.latest_revision() {
            Some(r) => Some(self.variables.get_set(deployment, r.variable_set)?),
            None => None,
        };
        let rendered = match &set {
            Some(set) => self.variables.interpolate(&record.manifest, set).await?,
            None => record.manifest.clone(),
        };
        let (cloud, cloud_id) = self.cloud_config(record.cloud_config_id)?;
        let (runtime, runtime_ids) = self.runtime_config(Some(&record.runtime_config_ids))?;
        let plan_options = PlanOptions {
            recreate: false,
            fix: options.fix && op == Operation::Recreate,
        };
        let resolved = self
            .resolve(rendered, &cloud, cloud_id, &runtime, runtime_ids, plan_options)
            .await?;
        if !options.dry_run {
            self.save_marks(&resolved.marked)?;
        }

        let stored: HashMap<String, InstanceRecord> = self
            .store
            .list_instances(deployment)?
            .into_iter()
            .map(|r| (r.uuid.clone(), r))
            .collect();
        let mut targets = Vec::new();
        let mut groups = Vec::new();
        for group in &resolved.plan.groups {
            if group.group.lifecycle == Lifecycle::Errand {
                continue;
            }
            let mut group = group.clone();
            let mut positions = Vec::new();
            for (pos, planned) in group.instances.iter_mut().enumerate() {
                let Some(current) = stored.get(&planned.record.uuid) else {
                    continue;
                };
                if current.ignore || !selector.matches(current) {
                    continue;
                }
                planned.record = current.clone();
                targets.push(format!("{}/{}", current.group, current.uuid));
                positions.push(pos);
            }
            if !positions.is_empty() {
                groups.push((group, positions));
            }
        }
        if targets.is_empty() && !matches!(selector, InstanceSelector::All) {
            return Err(DirectorError::not_found("instance", selector.to_string()));
        }

        let report = ChangeReport {
            deployment: deployment.to_string(),
            action: op.action().to_string(),
            instances: targets,
            dry_run: options.dry_run,
        };
        if options.dry_run {
            return Ok(report);
        }

        let updater = InstanceUpdater::new(
            self.store.clone(),
            self.journal.clone(),
            resolved.router.clone(),
            self.agents.clone(),
            &self.config.director.name,
        )
        .tags(resolved.desired.tags.clone())
        .cancel(self.cancel.clone())
        .skip_drain(options.skip_drain.clone())
        .with_parent(Some(parent));
        let mut failure = None;
        for (group, positions) in &groups {
            self.cancel.check()?;
            let op = match op {
                Operation::Recreate
                    if group.group.update.strategy == armada_core::UpdateStrategy::DuplicateAndReplaceVm =>
                {
                    Operation::Hotswap
                }
                op => op,
            };
            // Static IPs cannot be held by two VMs at once.
            let op = if op == Operation::Hotswap
                && positions
                    .iter()
                    .any(|p| group.instances[*p].record.static_ips().next().is_some())
            {
                Operation::Recreate
            } else {
                op
            };
            match updater
                .change_group_state(group, positions, op, &options.overrides())
                .await
            {
                Ok(_) => {}
                Err(e @ (DirectorError::CanaryFailed { .. } | DirectorError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(group = %group.group.name, error = %e, "instance group halted");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        info!(%deployment, action = op.action(), instances = report.instances.len(), "state change finished");
        Ok(report)
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete every instance (orphaning disks), the variable sets and the
    /// deployment record. With `force`, instance failures are logged and
    /// the rows dropped anyway.
    pub async fn delete_deployment(&self, name: &str, force: bool) -> DirectorResult<usize> {
        let _lock = self.lock(name).await?;
        let record = self
            .store
            .get_deployment(name)?
            .ok_or_else(|| DirectorError::not_found("deployment", name))?;
        let scope = self.journal.begin(
            EventSpec::new("delete", "deployment", name)
                .deployment(name)
                .context(json!({"force": force})),
        )?;
        let result = self.run_delete(&record, force, scope.id()).await;
        scope.complete(&result);
        result
    }

    async fn run_delete(&self, record: &DeploymentRecord, force: bool, parent: u64) -> DirectorResult<usize> {
        let (cloud, _) = self.cloud_config(record.cloud_config_id)?;
        let router = self.router(&cloud)?;
        let mut instances = self.store.list_instances(&record.name)?;
        let lost = scan_vms(&router, &mut instances).await.lost;
        let updater = InstanceUpdater::new(
            self.store.clone(),
            self.journal.clone(),
            router,
            self.agents.clone(),
            &self.config.director.name,
        )
        .cancel(self.cancel.clone())
        .with_parent(Some(parent));

        let mut deleted = 0;
        for instance in instances {
            self.cancel.check()?;
            let status = vm_status(&instance, &lost);
            match updater.delete_instance(instance.clone(), status).await {
                Ok(()) => deleted += 1,
                Err(e) if force => {
                    warn!(instance = %instance.name(), error = %e, "force-deleting instance after failure");
                    let mut writes: Vec<Mutation> = self
                        .store
                        .disks_for_instance(&instance.uuid)?
                        .into_iter()
                        .filter(|d| !d.is_orphaned())
                        .map(|mut d| {
                            d.orphan();
                            Mutation::PutDisk(d)
                        })
                        .collect();
                    writes.push(Mutation::DeleteInstance(instance.table_key()));
                    self.store.apply(&writes)?;
                    deleted += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut writes = self.variables.delete_all(&record.name)?;
        writes.push(Mutation::DeleteDeployment(record.name.clone()));
        self.store.apply(&writes)?;
        info!(deployment = %record.name, deleted, "deleted deployment");
        Ok(deleted)
    }
}

impl From<&DeployOptions> for PlanOptions {
    fn from(o: &DeployOptions) -> Self {
        PlanOptions {
            recreate: o.recreate,
            fix: o.fix,
        }
    }
}

fn vm_status(record: &InstanceRecord, lost: &HashSet<String>) -> VmStatus {
    match &record.vm {
        None => VmStatus::Absent,
        Some(vm) if lost.contains(&vm.cid) => VmStatus::Lost,
        Some(_) => VmStatus::Present,
    }
}

/// What a scan of the recorded VMs found.
#[derive(Debug, Default)]
struct VmScan {
    /// CIDs their CPI no longer has.
    lost: HashSet<String>,
    /// Records whose unreachable marker was set or cleared.
    marked: Vec<InstanceRecord>,
}

/// Check every recorded VM against its CPI. VMs whose CPI is missing from
/// the CPI config are kept but marked unreachable (and stopped); the mark
/// is lifted once the CPI is back.
async fn scan_vms(router: &CpiRouter, instances: &mut [InstanceRecord]) -> VmScan {
    let mut scan = VmScan::default();
    for record in instances.iter_mut() {
        let Some(vm) = &record.vm else {
            continue;
        };
        let cid = vm.cid.clone();
        let cpi = match router.for_disposal(vm.cpi.as_deref(), record.az.as_deref()) {
            Ok(cpi) => cpi,
            Err(e) => {
                if record.mark_unreachable() {
                    warn!(instance = %record.name(), %cid, error = %e, "vm unreachable, marking stopped");
                    scan.marked.push(record.clone());
                }
                continue;
            }
        };
        if record.mark_reachable() {
            info!(instance = %record.name(), %cid, state = %record.state, "vm reachable again");
            scan.marked.push(record.clone());
        }
        match cpi.provider.has_vm(&cid).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(instance = %record.name(), %cid, "vm missing from cloud");
                scan.lost.insert(cid);
            }
            Err(e) => warn!(instance = %record.name(), %cid, error = %e, "has_vm failed"),
        }
    }
    scan
}

/// CPI-calculated cloud properties of `vm_resources` groups. Each AZ gets
/// the properties of its own CPI, one call per CPI; AZs whose CPI is
/// unavailable are skipped.
async fn calculate(router: &CpiRouter, desired: &DesiredDeployment) -> DirectorResult<CalculatedProperties> {
    let mut calculated = CalculatedProperties::default();
    for group in &desired.groups {
        let Some(resources) = &group.vm_resources else {
            continue;
        };
        let azs: Vec<Option<&str>> = if group.azs.is_empty() {
            vec![None]
        } else {
            group.azs.iter().map(|a| Some(a.name.as_str())).collect()
        };
        let serving: Vec<Option<&str>> = azs
            .iter()
            .copied()
            .filter(|az| az.is_none_or(|a| router.serves_az(a)))
            .collect();
        if serving.is_empty() {
            // Surfaces the routing error of the first AZ.
            router.for_az(azs.first().copied().flatten())?;
        }

        let mut per_cpi: HashMap<Option<String>, Value> = HashMap::new();
        for az in serving {
            let cpi = router.for_az(az)?;
            let props = match per_cpi.get(&cpi.name) {
                Some(props) => props.clone(),
                None => {
                    let props = cpi.provider.calculate_vm_cloud_properties(resources).await?;
                    debug!(group = %group.name, cpi = ?cpi.name, ?props, "calculated vm cloud properties");
                    per_cpi.insert(cpi.name.clone(), props.clone());
                    props
                }
            };
            calculated.insert(&group.name, az, props);
        }
    }
    Ok(calculated)
}

/// Consecutive non-serial groups share a stage; every serial group starts
/// a new one.
fn stages(groups: &[GroupPlan]) -> Vec<Vec<usize>> {
    let mut stages: Vec<Vec<usize>> = Vec::new();
    let mut parallel = false;
    for (pos, group) in groups.iter().enumerate() {
        let serial = group.group.update.serial;
        match stages.last_mut() {
            Some(stage) if !serial && parallel => stage.push(pos),
            _ => stages.push(vec![pos]),
        }
        parallel = !serial;
    }
    stages
}
