//! Package compilation.
//!
//! Every package referenced by a job is compiled once per stemcell on a
//! throw-away compilation VM. Packages compile in dependency waves; within
//! a wave up to `workers` compile in parallel, each under its own
//! `lock:compile:<job>:<pkg>/<ver>` while the release locks are held.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use armada_core::cloud::CompilationConfig;
use armada_core::desired::DesiredDeployment;
use armada_cpi::{CpiRouter, CreateVmRequest, tolerate_not_found};
use armada_journal::{EventJournal, EventSpec, LockManager, LockName};
use armada_state::{CompiledPackageRecord, StateStore, now_epoch};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::agent::AgentFactory;
use crate::error::{DirectorError, DirectorResult};
use crate::tasks::Cancellation;

/// `(stemcell, release, package)`. Package names are only unique within
/// a release.
type TaskKey = (String, String, String);

/// One package to compile for one stemcell.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompileTask {
    stemcell: String,
    job: String,
    release: String,
    package: String,
    version: String,
    dependencies: Vec<String>,
}

impl CompileTask {
    fn key(&self) -> TaskKey {
        (self.stemcell.clone(), self.release.clone(), self.package.clone())
    }

    /// Key of a dependency, which always comes from the same release.
    fn dependency(&self, name: &str) -> TaskKey {
        (self.stemcell.clone(), self.release.clone(), name.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub compiled: usize,
    pub reused: usize,
}

#[derive(Debug, Clone)]
pub struct PackageCompiler {
    store: StateStore,
    journal: EventJournal,
    locks: LockManager,
    router: CpiRouter,
    agents: Arc<dyn AgentFactory>,
    workers: usize,
    lock_timeout: Duration,
    cancel: Cancellation,
    parent: Option<u64>,
}

impl PackageCompiler {
    pub fn new(
        store: StateStore,
        journal: EventJournal,
        locks: LockManager,
        router: CpiRouter,
        agents: Arc<dyn AgentFactory>,
    ) -> Self {
        Self {
            store,
            journal,
            locks,
            router,
            agents,
            workers: 1,
            lock_timeout: Duration::from_secs(60),
            cancel: Cancellation::never(),
            parent: None,
        }
    }

    /// Default worker count when the cloud config names none.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn cancel(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }

    /// Compile every package the deployment's jobs need.
    pub async fn compile(&self, desired: &DesiredDeployment) -> DirectorResult<CompileReport> {
        let tasks = collect(desired)?;
        if tasks.is_empty() {
            return Ok(CompileReport::default());
        }
        let waves = waves(&tasks)?;
        let config = desired.compilation.clone().unwrap_or(CompilationConfig {
            workers: self.workers as u32,
            az: None,
            vm_type: None,
            cloud_properties: Value::Null,
            network: None,
        });
        let workers = (config.workers as usize).max(1);

        let releases: BTreeSet<&str> = tasks.values().map(|t| t.release.as_str()).collect();
        let mut held = Vec::with_capacity(releases.len());
        for release in releases {
            held.push(
                self.locks
                    .acquire(
                        LockName::release(release),
                        &self.journal,
                        Some(&desired.name),
                        self.lock_timeout,
                    )
                    .await?,
            );
        }

        let mut report = CompileReport::default();
        for wave in waves {
            self.cancel.check()?;
            let limit = Arc::new(Semaphore::new(workers));
            let mut running = JoinSet::new();
            for key in wave {
                let Some(task) = tasks.get(&key).cloned() else {
                    continue;
                };
                let dependency_key = dependency_key(&task, &tasks);
                if let Some(existing) = self
                    .store
                    .get_compiled_package(&task.stemcell, &task.release, &task.package, &task.version)?
                    && existing.dependency_key == dependency_key
                {
                    debug!(package = %task.package, version = %task.version, "reusing compiled package");
                    report.reused += 1;
                    continue;
                }
                let Ok(permit) = limit.clone().acquire_owned().await else {
                    break;
                };
                let compiler = self.clone();
                let config = config.clone();
                let deps = self.dependency_blobs(&task, &tasks)?;
                let deployment = desired.name.clone();
                running.spawn(async move {
                    let result = compiler
                        .compile_one(&deployment, &task, &config, deps, dependency_key)
                        .await;
                    drop(permit);
                    result
                });
            }
            let mut failure = None;
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok(Ok(())) => report.compiled += 1,
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    Err(e) => {
                        failure.get_or_insert(DirectorError::Conflict(format!("compilation aborted: {e}")));
                    }
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }
        drop(held);
        info!(deployment = %desired.name, compiled = report.compiled, reused = report.reused, "compilation finished");
        Ok(report)
    }

    fn dependency_blobs(
        &self,
        task: &CompileTask,
        tasks: &BTreeMap<TaskKey, CompileTask>,
    ) -> DirectorResult<Value> {
        let mut blobs = serde_json::Map::new();
        for dep in &task.dependencies {
            let Some(d) = tasks.get(&task.dependency(dep)) else {
                continue;
            };
            let record = self
                .store
                .get_compiled_package(&d.stemcell, &d.release, &d.package, &d.version)?
                .ok_or_else(|| DirectorError::not_found("compiled package", format!("{}/{}", d.package, d.version)))?;
            blobs.insert(dep.clone(), json!({"version": d.version, "blob_id": record.blob_id}));
        }
        Ok(Value::Object(blobs))
    }

    async fn compile_one(
        &self,
        deployment: &str,
        task: &CompileTask,
        config: &CompilationConfig,
        deps: Value,
        dependency_key: String,
    ) -> DirectorResult<()> {
        self.cancel.check()?;
        let _lock = self
            .locks
            .acquire(
                LockName::compile(&task.job, &task.package, &task.version),
                &self.journal,
                Some(deployment),
                self.lock_timeout,
            )
            .await?;
        let name = format!("{}/{}", task.package, task.version);
        let scope = self.journal.begin(
            EventSpec::new("compile", "package", &name)
                .deployment(deployment)
                .context(json!({"stemcell": task.stemcell, "release": task.release}))
                .parent(self.parent),
        )?;
        let result = self.compile_on_vm(task, config, &deps).await;
        let blob_id = match result {
            Ok(blob_id) => {
                scope.finish_with(json!({"stemcell": task.stemcell, "blob_id": blob_id}))?;
                blob_id
            }
            Err(e) => {
                scope.fail(&e)?;
                return Err(e);
            }
        };
        self.store.put_compiled_package(&CompiledPackageRecord {
            stemcell: task.stemcell.clone(),
            release: task.release.clone(),
            package: task.package.clone(),
            version: task.version.clone(),
            blob_id,
            dependency_key,
            created_at: now_epoch(),
        })?;
        info!(package = %name, stemcell = %task.stemcell, "compiled package");
        Ok(())
    }

    async fn compile_on_vm(
        &self,
        task: &CompileTask,
        config: &CompilationConfig,
        deps: &Value,
    ) -> DirectorResult<String> {
        let cpi = self.router.for_az(config.az.as_deref())?;
        let agent_id = uuid::Uuid::new_v4().to_string();
        let cid = cpi
            .provider
            .create_vm(&CreateVmRequest {
                agent_id: agent_id.clone(),
                stemcell: task.stemcell.clone(),
                cloud_properties: config.cloud_properties.clone(),
                networks: Value::Object(Default::default()),
                disk_cids: Vec::new(),
                env: Value::Object(Default::default()),
            })
            .await?;
        debug!(%cid, package = %task.package, "created compilation vm");

        let agent = self.agents.connect(&agent_id);
        let compiled = agent.compile_package(&task.package, &task.version, deps).await;
        tolerate_not_found(cpi.provider.delete_vm(&cid).await, "delete_vm", &cid)?;
        Ok(compiled?)
    }
}

/// Every (stemcell, release, package) the deployment's jobs reference.
fn collect(desired: &DesiredDeployment) -> DirectorResult<BTreeMap<TaskKey, CompileTask>> {
    let mut tasks: BTreeMap<TaskKey, CompileTask> = BTreeMap::new();
    for group in &desired.groups {
        for job in &group.jobs {
            for package in &job.packages {
                let task = CompileTask {
                    stemcell: group.stemcell.clone(),
                    job: job.name.clone(),
                    release: job.release.clone(),
                    package: package.name.clone(),
                    version: package.version.clone(),
                    dependencies: package.dependencies.clone(),
                };
                match tasks.get(&task.key()) {
                    Some(seen) if seen.version != task.version => {
                        return Err(DirectorError::Validation(format!(
                            "package '{}' of release '{}' is referenced at versions {} and {}",
                            task.package, task.release, seen.version, task.version
                        )));
                    }
                    Some(_) => {}
                    None => {
                        tasks.insert(task.key(), task);
                    }
                }
            }
        }
    }
    for task in tasks.values() {
        for dep in &task.dependencies {
            if !tasks.contains_key(&task.dependency(dep)) {
                return Err(DirectorError::Validation(format!(
                    "package '{}' depends on unknown package '{dep}'",
                    task.package
                )));
            }
        }
    }
    Ok(tasks)
}

/// Dependency waves: every package's dependencies sit in earlier waves.
fn waves(tasks: &BTreeMap<TaskKey, CompileTask>) -> DirectorResult<Vec<Vec<TaskKey>>> {
    let mut pending: HashMap<TaskKey, usize> = tasks
        .iter()
        .map(|(key, t)| (key.clone(), t.dependencies.len()))
        .collect();
    let mut waves = Vec::new();
    while !pending.is_empty() {
        let mut ready: Vec<TaskKey> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| k.clone())
            .collect();
        if ready.is_empty() {
            let mut stuck: Vec<String> = pending.keys().map(|(_, _, p)| p.clone()).collect();
            stuck.sort();
            return Err(DirectorError::Validation(format!(
                "circular package dependencies among: {}",
                stuck.join(", ")
            )));
        }
        ready.sort();
        for key in &ready {
            pending.remove(key);
        }
        for (key, count) in pending.iter_mut() {
            if let Some(task) = tasks.get(key) {
                let done = task
                    .dependencies
                    .iter()
                    .filter(|d| ready.contains(&task.dependency(d)))
                    .count();
                *count -= done;
            }
        }
        waves.push(ready);
    }
    Ok(waves)
}

/// Sorted `name/version` of the dependencies a package compiles against.
fn dependency_key(task: &CompileTask, tasks: &BTreeMap<TaskKey, CompileTask>) -> String {
    let mut deps: Vec<String> = task
        .dependencies
        .iter()
        .filter_map(|d| tasks.get(&task.dependency(d)))
        .map(|d| format!("{}/{}", d.package, d.version))
        .collect();
    deps.sort();
    deps.join(",")
}
