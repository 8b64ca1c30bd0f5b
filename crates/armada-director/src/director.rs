//! The director façade.
//!
//! One [`Director`] per process owns the store, lock manager, CPI
//! registry, agent factory and secret store, and exposes the operator
//! surface. Reads return immediately; anything that touches the cloud is
//! queued on the [`TaskRunner`] and returns a [`TaskHandle`].

use std::sync::Arc;

use armada_core::{CloudConfig, CpiConfig, DeploymentManifest, DirectorConfig, RuntimeConfig};
use armada_cpi::{CpiRegistry, CpiRouter, tolerate_not_found};
use armada_journal::{EventJournal, EventSpec, LockManager, LockName};
use armada_state::{
    ConfigRecord, DeploymentRecord, DiskRecord, EventFilter, EventRecord, InstanceRecord, Mutation,
    PinnedVariable, StateStore, TaskRecord,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::agent::AgentFactory;
use crate::deployer::{DeployOptions, Deployer};
use crate::disks::{DiskDeletion, DiskManager};
use crate::error::{DirectorError, DirectorResult};
use crate::lifecycle::Operation;
use crate::planner::InstanceSelector;
use crate::tasks::{Cancellation, TaskContext, TaskHandle, TaskRunner};
use crate::variables::{SecretStore, VariableTracker};
use crate::vm::VmCreator;

/// Outcome of a config upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigUpload {
    pub config: ConfigRecord,
    /// False when the content equalled the latest version.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDiff {
    pub changed: bool,
    pub current: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub disks: usize,
    pub configs: usize,
}

#[derive(Debug, Clone)]
pub struct Director {
    store: StateStore,
    locks: LockManager,
    cpis: Arc<CpiRegistry>,
    agents: Arc<dyn AgentFactory>,
    secrets: Arc<dyn SecretStore>,
    config: Arc<DirectorConfig>,
    tasks: TaskRunner,
}

impl Director {
    pub fn new(
        store: StateStore,
        cpis: Arc<CpiRegistry>,
        agents: Arc<dyn AgentFactory>,
        secrets: Arc<dyn SecretStore>,
        config: DirectorConfig,
    ) -> Self {
        let tasks = TaskRunner::new(store.clone(), config.tasks.max_concurrent);
        Self {
            store,
            locks: LockManager::new(),
            cpis,
            agents,
            secrets,
            config: Arc::new(config),
            tasks,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &DirectorConfig {
        &self.config
    }

    /// Locks currently held, with the task holding each.
    pub fn locks(&self) -> Vec<(String, Option<u64>)> {
        self.locks.holders()
    }

    fn variables(&self) -> VariableTracker {
        VariableTracker::new(self.store.clone(), self.secrets.clone(), &self.config.director.name)
    }

    fn deployer(&self, journal: EventJournal, cancel: Cancellation) -> Deployer {
        Deployer::new(
            self.store.clone(),
            journal,
            self.locks.clone(),
            self.cpis.clone(),
            self.agents.clone(),
            self.variables(),
            self.config.clone(),
        )
        .cancel(cancel)
    }

    fn task_deployer(&self, ctx: &TaskContext) -> Deployer {
        self.deployer(EventJournal::new(self.store.clone()).for_task(ctx.id), ctx.cancel.clone())
    }

    /// Routing for resources not tied to a deployment's pinned configs.
    fn current_router(&self, deployer: &Deployer) -> DirectorResult<CpiRouter> {
        let (cloud, _) = deployer.cloud_config(None)?;
        deployer.router(&cloud)
    }

    async fn lock(&self, journal: &EventJournal, deployment: &str) -> DirectorResult<armada_journal::LockGuard> {
        Ok(self
            .locks
            .acquire(
                LockName::deployment(deployment),
                journal,
                Some(deployment),
                self.config.lock_timeout(),
            )
            .await?)
    }

    // ── Configs ────────────────────────────────────────────────────

    fn validate_config(kind: &str, content: &str) -> DirectorResult<()> {
        match kind {
            "cloud" => {
                CloudConfig::parse(content)?;
            }
            "runtime" => {
                RuntimeConfig::parse(content)?;
            }
            "cpi" => {
                CpiConfig::parse(content)?;
            }
            _ => {
                serde_json::from_str::<Value>(content)
                    .map_err(|e| DirectorError::Validation(format!("{kind} config is not valid JSON: {e}")))?;
            }
        }
        Ok(())
    }

    fn same_content(a: &str, b: &str) -> bool {
        match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a == b,
        }
    }

    /// Whether uploading `content` would create a new version.
    pub fn diff_config(&self, kind: &str, name: &str, content: &str) -> DirectorResult<ConfigDiff> {
        let latest = self.store.latest_config(kind, name)?;
        Ok(ConfigDiff {
            changed: latest.as_ref().is_none_or(|c| !Self::same_content(&c.content, content)),
            current: latest.map(|c| c.id),
        })
    }

    /// Store a new config version unless it equals the latest one.
    pub fn upload_config(&self, kind: &str, name: &str, content: &str) -> DirectorResult<ConfigUpload> {
        Self::validate_config(kind, content)?;
        if let Some(latest) = self.store.latest_config(kind, name)?
            && Self::same_content(&latest.content, content)
        {
            info!(kind, name, id = latest.id, "config unchanged; no new version");
            return Ok(ConfigUpload {
                config: latest,
                created: false,
            });
        }
        let config = self.store.add_config(kind, name, content)?;
        info!(kind, name, id = config.id, "config uploaded");
        Ok(ConfigUpload { config, created: true })
    }

    pub fn latest_config(&self, kind: &str, name: &str) -> DirectorResult<ConfigRecord> {
        self.store
            .latest_config(kind, name)?
            .ok_or_else(|| DirectorError::not_found("config", format!("{kind}/{name}")))
    }

    pub fn config_version(&self, id: u64) -> DirectorResult<ConfigRecord> {
        self.store
            .get_config(id)?
            .ok_or_else(|| DirectorError::not_found("config", id.to_string()))
    }

    pub fn list_configs(&self, kind: Option<&str>, history: bool) -> DirectorResult<Vec<ConfigRecord>> {
        Ok(self.store.list_configs(kind, history)?)
    }

    pub fn delete_config(&self, kind: &str, name: &str) -> DirectorResult<usize> {
        let deleted = self.store.delete_config(kind, name)?;
        if deleted == 0 {
            return Err(DirectorError::not_found("config", format!("{kind}/{name}")));
        }
        info!(kind, name, versions = deleted, "config deleted");
        Ok(deleted)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn deployments(&self) -> DirectorResult<Vec<DeploymentRecord>> {
        Ok(self.store.list_deployments()?)
    }

    pub fn deployment(&self, name: &str) -> DirectorResult<DeploymentRecord> {
        self.store
            .get_deployment(name)?
            .ok_or_else(|| DirectorError::not_found("deployment", name))
    }

    /// Instances of `deployment`, ordered by group and index.
    pub fn instances(&self, deployment: &str) -> DirectorResult<Vec<InstanceRecord>> {
        self.deployment(deployment)?;
        let mut instances = self.store.list_instances(deployment)?;
        instances.sort_by(|a, b| a.group.cmp(&b.group).then(a.index.cmp(&b.index)));
        Ok(instances)
    }

    /// Queue a deploy. The manifest must at least name its deployment.
    pub fn deploy(&self, manifest: Value, options: DeployOptions) -> DirectorResult<TaskHandle> {
        let name = DeploymentManifest::name_of(&manifest)?;
        let director = self.clone();
        let description = if options.dry_run {
            "create deployment (dry run)"
        } else {
            "create deployment"
        };
        self.tasks.submit(description, Some(&name), move |ctx| async move {
            let report = director.task_deployer(&ctx).deploy(manifest, options).await?;
            Ok(json!(report).to_string())
        })
    }

    /// Queue a state command against the selected instances.
    pub fn change_state(
        &self,
        deployment: &str,
        selector: InstanceSelector,
        op: Operation,
        options: DeployOptions,
    ) -> DirectorResult<TaskHandle> {
        self.deployment(deployment)?;
        let director = self.clone();
        let name = deployment.to_string();
        let description = format!("{op} instances {selector}");
        self.tasks.submit(&description, Some(deployment), move |ctx| async move {
            let report = director
                .task_deployer(&ctx)
                .change_state(&name, &selector, op, options)
                .await?;
            Ok(json!(report).to_string())
        })
    }

    pub fn delete_deployment(&self, name: &str, force: bool) -> DirectorResult<TaskHandle> {
        self.deployment(name)?;
        let director = self.clone();
        let deployment = name.to_string();
        self.tasks.submit("delete deployment", Some(name), move |ctx| async move {
            let deleted = director
                .task_deployer(&ctx)
                .delete_deployment(&deployment, force)
                .await?;
            Ok(format!("deleted deployment '{deployment}' ({deleted} instances)"))
        })
    }

    // ── Instances ──────────────────────────────────────────────────

    fn find_instance(&self, deployment: &str, selector: &InstanceSelector) -> DirectorResult<InstanceRecord> {
        if !matches!(selector, InstanceSelector::Instance { .. }) {
            return Err(DirectorError::Validation(format!(
                "'{selector}' does not name a single instance"
            )));
        }
        self.store
            .list_instances(deployment)?
            .into_iter()
            .find(|r| selector.matches(r))
            .ok_or_else(|| DirectorError::not_found("instance", format!("{deployment}/{selector}")))
    }

    /// Mark an instance ignored (or not). Ignored instances are left alone
    /// by deploys and state commands.
    pub async fn set_ignore(
        &self,
        deployment: &str,
        selector: &InstanceSelector,
        ignore: bool,
    ) -> DirectorResult<InstanceRecord> {
        let journal = EventJournal::new(self.store.clone());
        let _lock = self.lock(&journal, deployment).await?;
        let mut record = self.find_instance(deployment, selector)?;
        record.ignore = ignore;
        let action = if ignore { "ignore" } else { "unignore" };
        journal.record(armada_state::NewEvent {
            action: action.to_string(),
            object_type: "instance".to_string(),
            object_name: record.name(),
            deployment: Some(deployment.to_string()),
            instance: Some(record.name()),
            ..Default::default()
        })?;
        self.store.apply(&[Mutation::PutInstance(record.clone())])?;
        info!(%deployment, instance = %record.name(), ignore, "instance ignore flag changed");
        Ok(record)
    }

    /// Delete a VM by CID. A VM the director tracks is cleared from its
    /// instance (the next deploy recreates it); an untracked one is
    /// deleted through the default CPI.
    pub fn delete_vm(&self, cid: &str) -> DirectorResult<TaskHandle> {
        let director = self.clone();
        let cid = cid.to_string();
        let owner = self.store.find_instance_by_vm(&cid)?;
        let deployment = owner.as_ref().map(|r| r.deployment.clone());
        self.tasks
            .submit("delete vm", deployment.as_deref(), move |ctx| async move {
                director.remove_vm(&ctx, &cid).await?;
                Ok(format!("vm {cid} deleted"))
            })
    }

    async fn remove_vm(&self, ctx: &TaskContext, cid: &str) -> DirectorResult<()> {
        let journal = EventJournal::new(self.store.clone()).for_task(ctx.id);
        let deployer = self.deployer(journal.clone(), ctx.cancel.clone());

        let Some(owner) = self.store.find_instance_by_vm(cid)? else {
            let router = self.current_router(&deployer)?;
            let cpi = router.for_disposal(None, None)?;
            let scope = journal.begin(EventSpec::new("delete", "vm", cid))?;
            let result = tolerate_not_found(cpi.provider.delete_vm(cid).await, "delete_vm", cid);
            scope.complete(&result);
            return Ok(result?);
        };

        let _lock = self.lock(&journal, &owner.deployment).await?;
        // Re-read under the lock.
        let Some(mut record) = self.store.find_instance_by_vm(cid)? else {
            warn!(%cid, "vm left its instance while waiting for the lock");
            return Ok(());
        };
        let Some(vm) = record.vm.clone() else {
            return Ok(());
        };
        let pinned = self.store.get_deployment(&record.deployment)?.and_then(|d| d.cloud_config_id);
        let (cloud, _) = deployer.cloud_config(pinned)?;
        let router = deployer.router(&cloud)?;
        VmCreator::new(router, journal, &self.config.director.name)
            .delete_vm(&record, &vm)
            .await?;
        record.vm = None;
        self.store.apply(&[Mutation::PutInstance(record)])?;
        Ok(())
    }

    // ── Disks ──────────────────────────────────────────────────────

    pub fn disks(&self, orphaned: bool) -> DirectorResult<Vec<DiskRecord>> {
        let disks = if orphaned {
            self.store.list_orphaned_disks()?
        } else {
            self.store.list_disks()?
        };
        Ok(disks)
    }

    fn disk_manager(&self, ctx: &TaskContext) -> DirectorResult<(DiskManager, EventJournal)> {
        let journal = EventJournal::new(self.store.clone()).for_task(ctx.id);
        let deployer = self.deployer(journal.clone(), ctx.cancel.clone());
        let router = self.current_router(&deployer)?;
        let disks = DiskManager::new(self.store.clone(), journal.clone(), router, self.agents.clone());
        Ok((disks, journal))
    }

    pub fn delete_disk(&self, cid: &str) -> DirectorResult<TaskHandle> {
        let director = self.clone();
        let cid = cid.to_string();
        self.tasks.submit("delete orphaned disk", None, move |ctx| async move {
            let (disks, _) = director.disk_manager(&ctx)?;
            Ok(match disks.delete_disk(&cid).await? {
                DiskDeletion::Deleted => format!("disk {cid} deleted"),
                DiskDeletion::NotFound => format!("disk {cid} not found; nothing to delete"),
            })
        })
    }

    pub fn orphan_disk(&self, cid: &str) -> DirectorResult<TaskHandle> {
        let disk = self
            .store
            .get_disk(cid)?
            .ok_or_else(|| DirectorError::not_found("disk", cid))?;
        let director = self.clone();
        let cid = cid.to_string();
        let deployment = disk.deployment.clone();
        self.tasks
            .submit("orphan disk", Some(&disk.deployment), move |ctx| async move {
                let (disks, journal) = director.disk_manager(&ctx)?;
                let _lock = director.lock(&journal, &deployment).await?;
                disks.orphan_disk(&cid).await?;
                Ok(format!("disk {cid} orphaned"))
            })
    }

    pub fn attach_disk(
        &self,
        deployment: &str,
        selector: InstanceSelector,
        cid: &str,
    ) -> DirectorResult<TaskHandle> {
        self.find_instance(deployment, &selector)?;
        let director = self.clone();
        let name = deployment.to_string();
        let cid = cid.to_string();
        self.tasks
            .submit("attach disk", Some(deployment), move |ctx| async move {
                let (disks, journal) = director.disk_manager(&ctx)?;
                let _lock = director.lock(&journal, &name).await?;
                let mut record = director.find_instance(&name, &selector)?;
                disks.attach_disk(&mut record, &cid).await?;
                Ok(format!("disk {cid} attached to {}", record.name()))
            })
    }

    pub fn take_snapshot(&self, deployment: &str, selector: InstanceSelector) -> DirectorResult<TaskHandle> {
        self.deployment(deployment)?;
        let director = self.clone();
        let name = deployment.to_string();
        self.tasks
            .submit("snapshot deployment", Some(deployment), move |ctx| async move {
                let (disks, journal) = director.disk_manager(&ctx)?;
                let _lock = director.lock(&journal, &name).await?;
                let mut taken = Vec::new();
                for record in director.store.list_instances(&name)? {
                    if !selector.matches(&record) {
                        continue;
                    }
                    ctx.cancel.check()?;
                    if let Some(snapshot) = disks.take_snapshot(&record).await? {
                        taken.push(snapshot.cid);
                    }
                }
                Ok(json!({"snapshots": taken}).to_string())
            })
    }

    pub fn delete_snapshot(&self, cid: &str) -> DirectorResult<TaskHandle> {
        let director = self.clone();
        let cid = cid.to_string();
        self.tasks.submit("delete snapshot", None, move |ctx| async move {
            let (disks, _) = director.disk_manager(&ctx)?;
            disks.delete_snapshot(&cid).await?;
            Ok(format!("snapshot {cid} deleted"))
        })
    }

    // ── Variables ──────────────────────────────────────────────────

    /// Variables pinned by the deployment's latest revision.
    pub fn variables_of(&self, deployment: &str) -> DirectorResult<Vec<PinnedVariable>> {
        let record = self.deployment(deployment)?;
        let Some(revision) = record.latest_revision() else {
            return Ok(Vec::new());
        };
        let set = self.variables().get_set(deployment, revision.variable_set)?;
        Ok(set.variables.into_values().collect())
    }

    // ── Clean-up ───────────────────────────────────────────────────

    /// Delete orphaned disks (all of them with `all`, otherwise all but
    /// `cleanup.keep_orphaned_disks`) and prune unused config versions.
    pub fn cleanup(&self, all: bool) -> DirectorResult<TaskHandle> {
        let director = self.clone();
        self.tasks.submit("clean up", None, move |ctx| async move {
            let report = director.run_cleanup(&ctx, all).await?;
            Ok(json!(report).to_string())
        })
    }

    async fn run_cleanup(&self, ctx: &TaskContext, all: bool) -> DirectorResult<CleanupReport> {
        let (disks, _) = self.disk_manager(ctx)?;
        let keep = self.config.cleanup.keep_orphaned_disks;
        let deleted_disks = disks.cleanup(all, keep).await?;

        let mut pinned = Vec::new();
        for deployment in self.store.list_deployments()? {
            pinned.extend(deployment.cloud_config_id);
            pinned.extend(deployment.runtime_config_ids);
        }
        let configs = self
            .store
            .prune_configs(self.config.cleanup.keep_config_versions.max(1), &pinned)?;
        info!(disks = deleted_disks, configs, all, "clean-up finished");
        Ok(CleanupReport {
            disks: deleted_disks,
            configs,
        })
    }

    // ── Events & tasks ─────────────────────────────────────────────

    pub fn events(&self, filter: &EventFilter) -> DirectorResult<Vec<EventRecord>> {
        Ok(self.store.list_events(filter)?)
    }

    pub fn task(&self, id: u64) -> DirectorResult<TaskRecord> {
        self.tasks.get(id)
    }

    pub fn tasks(&self, limit: Option<usize>) -> DirectorResult<Vec<TaskRecord>> {
        self.tasks.list(limit)
    }

    pub fn cancel_task(&self, id: u64) -> DirectorResult<TaskRecord> {
        self.tasks.cancel(id)
    }
}
