//! StateStore: redb-backed current state for the Armada director.
//!
//! Typed operations over deployments, instances, disks, variable sets,
//! the event journal, configs, tasks and compiled packages. Values are
//! JSON-serialized into redb's `&[u8]` columns. Multi-record writes that
//! must land together go through [`StateStore::apply`].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type StrTable = TableDefinition<'static, &'static str, &'static [u8]>;
type IdTable = TableDefinition<'static, u64, &'static [u8]>;

const EVENT_SEQ: &str = "events";
const TASK_SEQ: &str = "tasks";
const CONFIG_SEQ: &str = "configs";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Bump and return a named counter inside an open write transaction.
fn bump_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [DEPLOYMENTS, INSTANCES, DISKS, VARIABLE_SETS, COMPILED_PACKAGES] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        for def in [EVENTS, CONFIGS, TASKS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, def: StrTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: StrTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, def: StrTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn remove(&self, def: StrTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn put_id<T: Serialize>(&self, def: IdTable, id: u64, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(id, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_id<T: DeserializeOwned>(&self, def: IdTable, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Newest-first walk over an id table, keeping records `keep` accepts.
    fn scan_ids_rev<T: DeserializeOwned>(
        &self,
        def: IdTable,
        limit: Option<usize>,
        mut keep: impl FnMut(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T = decode(value.value())?;
            if keep(&record) {
                results.push(record);
                if limit.is_some_and(|l| results.len() >= l) {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// Atomically bump and return a named monotonic counter.
    pub fn next_sequence(&self, name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = bump_sequence(&txn, name)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        self.put(DEPLOYMENTS, &record.name, record)?;
        debug!(deployment = %record.name, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, name: &str) -> StateResult<Option<DeploymentRecord>> {
        self.get(DEPLOYMENTS, name)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        self.scan(DEPLOYMENTS, "")
    }

    /// Delete a deployment record. Returns true if it existed.
    pub fn delete_deployment(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(DEPLOYMENTS, name)?;
        debug!(deployment = %name, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, record: &InstanceRecord) -> StateResult<()> {
        self.put(INSTANCES, &record.table_key(), record)
    }

    pub fn get_instance(&self, key: &str) -> StateResult<Option<InstanceRecord>> {
        self.get(INSTANCES, key)
    }

    /// All instances of a deployment, sorted by group then index.
    pub fn list_instances(&self, deployment: &str) -> StateResult<Vec<InstanceRecord>> {
        let mut instances: Vec<InstanceRecord> = self.scan(INSTANCES, &format!("{deployment}:"))?;
        instances.sort_by(|a, b| a.group.cmp(&b.group).then(a.index.cmp(&b.index)));
        Ok(instances)
    }

    pub fn find_instance(&self, deployment: &str, uuid: &str) -> StateResult<Option<InstanceRecord>> {
        Ok(self
            .list_instances(deployment)?
            .into_iter()
            .find(|i| i.uuid == uuid))
    }

    /// Look up the instance whose active or pending VM has this CID.
    pub fn find_instance_by_vm(&self, cid: &str) -> StateResult<Option<InstanceRecord>> {
        let all: Vec<InstanceRecord> = self.scan(INSTANCES, "")?;
        Ok(all.into_iter().find(|i| {
            i.vm_cid() == Some(cid) || i.pending_vm.as_ref().is_some_and(|v| v.cid == cid)
        }))
    }

    pub fn delete_instance(&self, key: &str) -> StateResult<bool> {
        self.remove(INSTANCES, key)
    }

    // ── Disks ──────────────────────────────────────────────────────

    pub fn put_disk(&self, record: &DiskRecord) -> StateResult<()> {
        self.apply(&[Mutation::PutDisk(record.clone())])
    }

    pub fn get_disk(&self, cid: &str) -> StateResult<Option<DiskRecord>> {
        self.get(DISKS, cid)
    }

    pub fn list_disks(&self) -> StateResult<Vec<DiskRecord>> {
        self.scan(DISKS, "")
    }

    /// Orphaned disks, oldest orphan first.
    pub fn list_orphaned_disks(&self) -> StateResult<Vec<DiskRecord>> {
        let mut disks: Vec<DiskRecord> = self
            .list_disks()?
            .into_iter()
            .filter(DiskRecord::is_orphaned)
            .collect();
        disks.sort_by_key(|d| (d.orphaned_at, d.created_at));
        Ok(disks)
    }

    /// Disks currently attached to the given instance.
    pub fn disks_for_instance(&self, uuid: &str) -> StateResult<Vec<DiskRecord>> {
        Ok(self
            .list_disks()?
            .into_iter()
            .filter(|d| d.instance.as_deref() == Some(uuid))
            .collect())
    }

    pub fn delete_disk(&self, cid: &str) -> StateResult<bool> {
        self.remove(DISKS, cid)
    }

    // ── Variable sets ──────────────────────────────────────────────

    pub fn put_variable_set(&self, record: &VariableSetRecord) -> StateResult<()> {
        self.put(VARIABLE_SETS, &record.table_key(), record)
    }

    pub fn get_variable_set(
        &self,
        deployment: &str,
        id: u64,
    ) -> StateResult<Option<VariableSetRecord>> {
        self.get(VARIABLE_SETS, &variable_set_key(deployment, id))
    }

    /// All variable sets of a deployment, oldest first.
    pub fn list_variable_sets(&self, deployment: &str) -> StateResult<Vec<VariableSetRecord>> {
        self.scan(VARIABLE_SETS, &format!("{deployment}:"))
    }

    pub fn delete_variable_set(&self, deployment: &str, id: u64) -> StateResult<bool> {
        self.remove(VARIABLE_SETS, &variable_set_key(deployment, id))
    }

    // ── Batches ────────────────────────────────────────────────────

    /// Apply several writes in one transaction.
    ///
    /// Rejects the whole batch if any written disk is both attached and
    /// orphaned, or is attached to an instance that does not exist once
    /// the batch has been applied.
    pub fn apply(&self, mutations: &[Mutation]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut disks = txn.open_table(DISKS).map_err(map_err!(Table))?;
            let mut sets = txn.open_table(VARIABLE_SETS).map_err(map_err!(Table))?;

            for m in mutations {
                match m {
                    Mutation::PutDeployment(r) => {
                        deployments
                            .insert(r.name.as_str(), encode(r)?.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteDeployment(name) => {
                        deployments.remove(name.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutInstance(r) => {
                        instances
                            .insert(r.table_key().as_str(), encode(r)?.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteInstance(key) => {
                        instances.remove(key.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutDisk(r) => {
                        if r.instance.is_some() == r.orphaned_at.is_some() {
                            return Err(StateError::Conflict(format!(
                                "disk '{}' must be either attached or orphaned",
                                r.cid
                            )));
                        }
                        disks
                            .insert(r.cid.as_str(), encode(r)?.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteDisk(cid) => {
                        disks.remove(cid.as_str()).map_err(map_err!(Write))?;
                    }
                    Mutation::PutVariableSet(r) => {
                        sets.insert(r.table_key().as_str(), encode(r)?.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Mutation::DeleteVariableSet { deployment, id } => {
                        sets.remove(variable_set_key(deployment, *id).as_str())
                            .map_err(map_err!(Write))?;
                    }
                }
            }

            // Attached disks must point at a live instance.
            for m in mutations {
                let Mutation::PutDisk(disk) = m else { continue };
                let Some(owner) = &disk.instance else { continue };
                let prefix = format!("{}:", disk.deployment);
                let suffix = format!("/{owner}");
                let mut found = false;
                for entry in instances.range(prefix.as_str()..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    if key.ends_with(&suffix) {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(StateError::Conflict(format!(
                        "disk '{}' references missing instance '{owner}'",
                        disk.cid
                    )));
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(writes = mutations.len(), "batch applied");
        Ok(())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append an event, assigning the next id in the same transaction.
    pub fn append_event(&self, event: NewEvent) -> StateResult<EventRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = bump_sequence(&txn, EVENT_SEQ)?;
        let record = EventRecord {
            id,
            parent_id: event.parent_id,
            timestamp: now_epoch(),
            action: event.action,
            object_type: event.object_type,
            object_name: event.object_name,
            task: event.task,
            deployment: event.deployment,
            instance: event.instance,
            context: event.context,
            error: event.error,
        };
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            table
                .insert(id, encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    pub fn get_event(&self, id: u64) -> StateResult<Option<EventRecord>> {
        self.get_id(EVENTS, id)
    }

    /// Matching events, newest first.
    pub fn list_events(&self, filter: &EventFilter) -> StateResult<Vec<EventRecord>> {
        self.scan_ids_rev(EVENTS, filter.limit, |e: &EventRecord| filter.matches(e))
    }

    // ── Configs ────────────────────────────────────────────────────

    /// Store a new config version.
    pub fn add_config(&self, kind: &str, name: &str, content: &str) -> StateResult<ConfigRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = bump_sequence(&txn, CONFIG_SEQ)?;
        let record = ConfigRecord {
            id,
            kind: kind.to_string(),
            name: name.to_string(),
            content: content.to_string(),
            created_at: now_epoch(),
            deleted: false,
        };
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            table
                .insert(id, encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind, name, id, "config stored");
        Ok(record)
    }

    pub fn get_config(&self, id: u64) -> StateResult<Option<ConfigRecord>> {
        self.get_id(CONFIGS, id)
    }

    /// Newest non-deleted version of a named config.
    pub fn latest_config(&self, kind: &str, name: &str) -> StateResult<Option<ConfigRecord>> {
        Ok(self
            .scan_ids_rev(CONFIGS, Some(1), |c: &ConfigRecord| {
                !c.deleted && c.kind == kind && c.name == name
            })?
            .pop())
    }

    /// Latest version of every live config of `kind` (all kinds when
    /// `None`), or the full history when `history` is set. Newest first.
    pub fn list_configs(&self, kind: Option<&str>, history: bool) -> StateResult<Vec<ConfigRecord>> {
        let mut seen = std::collections::HashSet::new();
        self.scan_ids_rev(CONFIGS, None, |c: &ConfigRecord| {
            !c.deleted
                && kind.is_none_or(|k| c.kind == k)
                && (history || seen.insert((c.kind.clone(), c.name.clone())))
        })
    }

    /// Mark every version of a named config deleted. Returns how many
    /// versions were affected.
    pub fn delete_config(&self, kind: &str, name: &str) -> StateResult<usize> {
        let victims = self.scan_ids_rev(CONFIGS, None, |c: &ConfigRecord| {
            !c.deleted && c.kind == kind && c.name == name
        })?;
        for mut c in victims.iter().cloned() {
            c.deleted = true;
            self.put_id(CONFIGS, c.id, &c)?;
        }
        Ok(victims.len())
    }

    /// Drop all but the newest `keep` versions of each named config,
    /// sparing the ids in `pinned`. Returns how many were removed.
    pub fn prune_configs(&self, keep: usize, pinned: &[u64]) -> StateResult<usize> {
        let all = self.scan_ids_rev(CONFIGS, None, |_: &ConfigRecord| true)?;
        let mut per_name: std::collections::HashMap<(String, String), usize> =
            std::collections::HashMap::new();
        let mut doomed = Vec::new();
        for c in all {
            let seen = per_name.entry((c.kind.clone(), c.name.clone())).or_default();
            *seen += 1;
            if (*seen > keep || c.deleted) && !pinned.contains(&c.id) {
                doomed.push(c.id);
            }
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            for id in &doomed {
                table.remove(*id).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(doomed.len())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Create a queued task with the next task id.
    pub fn create_task(&self, description: &str, deployment: Option<&str>) -> StateResult<TaskRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = bump_sequence(&txn, TASK_SEQ)?;
        let record = TaskRecord {
            id,
            state: TaskState::Queued,
            description: description.to_string(),
            deployment: deployment.map(str::to_string),
            result: None,
            created_at: now_epoch(),
            started_at: None,
            finished_at: None,
        };
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(id, encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    pub fn put_task(&self, record: &TaskRecord) -> StateResult<()> {
        self.put_id(TASKS, record.id, record)
    }

    pub fn get_task(&self, id: u64) -> StateResult<Option<TaskRecord>> {
        self.get_id(TASKS, id)
    }

    /// Read-modify-write a task inside one write transaction. `update`
    /// returns whether to persist its edit. Returns the stored record
    /// afterwards, or `None` if the task does not exist.
    pub fn update_task(
        &self,
        id: u64,
        update: impl FnOnce(&mut TaskRecord) -> bool,
    ) -> StateResult<Option<TaskRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let current: Option<TaskRecord> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut record) => {
                    if update(&mut record) {
                        table
                            .insert(id, encode(&record)?.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Some(record)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// Most recent tasks first.
    pub fn list_tasks(&self, limit: Option<usize>) -> StateResult<Vec<TaskRecord>> {
        self.scan_ids_rev(TASKS, limit, |_: &TaskRecord| true)
    }

    // ── Compiled packages ──────────────────────────────────────────

    pub fn put_compiled_package(&self, record: &CompiledPackageRecord) -> StateResult<()> {
        self.put(COMPILED_PACKAGES, &record.table_key(), record)
    }

    pub fn get_compiled_package(
        &self,
        stemcell: &str,
        release: &str,
        package: &str,
        version: &str,
    ) -> StateResult<Option<CompiledPackageRecord>> {
        self.get(
            COMPILED_PACKAGES,
            &compiled_package_key(stemcell, release, package, version),
        )
    }

    pub fn list_compiled_packages(&self) -> StateResult<Vec<CompiledPackageRecord>> {
        self.scan(COMPILED_PACKAGES, "")
    }
}
