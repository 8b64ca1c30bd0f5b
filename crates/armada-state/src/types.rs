//! Domain types for the Armada state store.
//!
//! These are the director's current-state records. Every type is
//! JSON-serialized into a redb value column.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unix timestamp in seconds.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// One deploy attempt and the variable set it pinned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: u64,
    pub task_id: Option<u64>,
    pub variable_set: u64,
    pub status: RevisionStatus,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    /// The raw manifest as last submitted (placeholders intact).
    pub manifest: Value,
    /// Config ids the last deploy resolved against.
    #[serde(default)]
    pub cloud_config_id: Option<u64>,
    #[serde(default)]
    pub runtime_config_ids: Vec<u64>,
    #[serde(default)]
    pub revisions: Vec<Revision>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DeploymentRecord {
    pub fn new(name: &str, manifest: Value) -> Self {
        let now = now_epoch();
        Self {
            name: name.to_string(),
            manifest,
            cloud_config_id: None,
            runtime_config_ids: Vec::new(),
            revisions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn latest_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    pub fn revision_mut(&mut self, id: u64) -> Option<&mut Revision> {
        self.revisions.iter_mut().find(|r| r.id == id)
    }
}

// ── Instance ───────────────────────────────────────────────────────

/// Last-known lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
    /// Stopped hard: no VM, but IPs and disks stay reserved.
    Detached,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Detached => "detached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub cid: String,
    pub agent_id: String,
    /// Name of the CPI that created this VM (`None` for the default CPI).
    pub cpi: Option<String>,
    pub cloud_properties: Value,
    pub env: Value,
    pub stemcell: String,
    /// False for a hotswap replacement until cutover.
    pub active: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpKind {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReservation {
    pub network: String,
    pub ip: Ipv4Addr,
    pub kind: IpKind,
}

/// Hashes of what was last applied, used to classify the next change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSpec {
    /// Covers everything that requires a new VM (stemcell, cloud
    /// properties, env, network layout).
    pub vm_hash: String,
    /// Covers jobs and rendered properties.
    pub jobs_hash: String,
    pub stemcell: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub deployment: String,
    pub group: String,
    pub index: u32,
    /// Stable across VM recreation.
    pub uuid: String,
    pub az: Option<String>,
    pub bootstrap: bool,
    pub state: InstanceState,
    pub vm: Option<VmRecord>,
    /// Replacement VM created ahead of a hotswap cutover.
    #[serde(default)]
    pub pending_vm: Option<VmRecord>,
    #[serde(default)]
    pub disk_cids: Vec<String>,
    #[serde(default)]
    pub ips: Vec<IpReservation>,
    #[serde(default)]
    pub resurrection_paused: bool,
    #[serde(default)]
    pub ignore: bool,
    /// Set while the CPI that owns the VM is missing from the CPI config.
    /// Holds the state to restore once it is back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreachable: Option<InstanceState>,
    #[serde(default)]
    pub applied: Option<AppliedSpec>,
    /// Variable set the instance last converged with.
    #[serde(default)]
    pub variable_set: Option<u64>,
    pub updated_at: u64,
}

impl InstanceRecord {
    pub fn new(deployment: &str, group: &str, index: u32, uuid: &str, az: Option<String>) -> Self {
        Self {
            deployment: deployment.to_string(),
            group: group.to_string(),
            index,
            uuid: uuid.to_string(),
            az,
            bootstrap: false,
            state: InstanceState::Running,
            vm: None,
            pending_vm: None,
            disk_cids: Vec::new(),
            ips: Vec::new(),
            resurrection_paused: false,
            ignore: false,
            unreachable: None,
            applied: None,
            variable_set: None,
            updated_at: now_epoch(),
        }
    }

    /// Composite key: `{deployment}:{group}/{uuid}`.
    pub fn table_key(&self) -> String {
        instance_key(&self.deployment, &self.group, &self.uuid)
    }

    /// `group/uuid`, the identity used in events and errors.
    pub fn name(&self) -> String {
        format!("{}/{}", self.group, self.uuid)
    }

    pub fn vm_cid(&self) -> Option<&str> {
        self.vm.as_ref().map(|v| v.cid.as_str())
    }

    pub fn static_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ips
            .iter()
            .filter(|r| r.kind == IpKind::Static)
            .map(|r| r.ip)
    }

    /// Mark the VM unreachable and stopped. Returns false if it already was.
    pub fn mark_unreachable(&mut self) -> bool {
        if self.unreachable.is_some() {
            return false;
        }
        self.unreachable = Some(self.state);
        if self.state == InstanceState::Running {
            self.state = InstanceState::Stopped;
        }
        true
    }

    /// Restore the state held before [`Self::mark_unreachable`]. Returns
    /// false if the instance was not marked.
    pub fn mark_reachable(&mut self) -> bool {
        match self.unreachable.take() {
            Some(state) => {
                self.state = state;
                true
            }
            None => false,
        }
    }
}

pub fn instance_key(deployment: &str, group: &str, uuid: &str) -> String {
    format!("{deployment}:{group}/{uuid}")
}

// ── Disk ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub cid: String,
    /// Size in MB.
    pub size: u64,
    pub cloud_properties: Value,
    pub cpi: Option<String>,
    pub deployment: String,
    /// Owning instance UUID; `None` once orphaned.
    pub instance: Option<String>,
    /// `group/uuid` of the last owner, kept after orphaning.
    pub instance_name: String,
    pub az: Option<String>,
    /// Set iff the disk is orphaned.
    pub orphaned_at: Option<u64>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
    /// False while a replacement disk is mid-migration.
    pub active: bool,
    pub created_at: u64,
}

impl DiskRecord {
    pub fn is_orphaned(&self) -> bool {
        self.orphaned_at.is_some()
    }

    /// Unlink from the owner and stamp the orphan time.
    pub fn orphan(&mut self) {
        self.instance = None;
        self.active = false;
        self.orphaned_at = Some(now_epoch());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub cid: String,
    pub created_at: u64,
    #[serde(default)]
    pub clean: bool,
}

// ── Variables ──────────────────────────────────────────────────────

/// One resolved placeholder: absolute store path and pinned version id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedVariable {
    pub path: String,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSetRecord {
    pub deployment: String,
    pub id: u64,
    /// Keyed by the absolute variable path.
    pub variables: BTreeMap<String, PinnedVariable>,
    pub created_at: u64,
}

impl VariableSetRecord {
    pub fn table_key(&self) -> String {
        variable_set_key(&self.deployment, self.id)
    }
}

pub fn variable_set_key(deployment: &str, id: u64) -> String {
    format!("{deployment}:{id:020}")
}

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub parent_id: Option<u64>,
    pub action: String,
    pub object_type: String,
    pub object_name: String,
    pub task: Option<u64>,
    pub deployment: Option<String>,
    pub instance: Option<String>,
    #[serde(default)]
    pub context: Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub timestamp: u64,
    pub action: String,
    pub object_type: String,
    pub object_name: String,
    pub task: Option<u64>,
    pub deployment: Option<String>,
    pub instance: Option<String>,
    pub context: Value,
    pub error: Option<String>,
}

impl EventRecord {
    /// `id` or `id <- parent_id`.
    pub fn display_id(&self) -> String {
        match self.parent_id {
            Some(parent) => format!("{} <- {parent}", self.id),
            None => self.id.to_string(),
        }
    }
}

/// Query over the event journal. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub deployment: Option<String>,
    pub instance: Option<String>,
    pub task: Option<u64>,
    pub action: Option<String>,
    pub object_type: Option<String>,
    /// Only events with an id strictly below this one.
    pub before_id: Option<u64>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn matches(&self, e: &EventRecord) -> bool {
        self.deployment
            .as_ref()
            .is_none_or(|d| e.deployment.as_ref() == Some(d))
            && self
                .instance
                .as_ref()
                .is_none_or(|i| e.instance.as_ref() == Some(i))
            && self.task.is_none_or(|t| e.task == Some(t))
            && self.action.as_ref().is_none_or(|a| &e.action == a)
            && self.object_type.as_ref().is_none_or(|o| &e.object_type == o)
            && self.before_id.is_none_or(|b| e.id < b)
    }
}

// ── Configs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: u64,
    /// `cloud`, `runtime`, `cpi` or any user type.
    pub kind: String,
    pub name: String,
    /// The document exactly as uploaded.
    pub content: String,
    pub created_at: u64,
    #[serde(default)]
    pub deleted: bool,
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    Error,
    Cancelling,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: u64,
    pub state: TaskState,
    pub description: String,
    pub deployment: Option<String>,
    pub result: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

// ── Compiled packages ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPackageRecord {
    pub stemcell: String,
    #[serde(default)]
    pub release: String,
    pub package: String,
    pub version: String,
    pub blob_id: String,
    /// Sorted `name/version` of the dependencies it was compiled against.
    pub dependency_key: String,
    pub created_at: u64,
}

impl CompiledPackageRecord {
    pub fn table_key(&self) -> String {
        compiled_package_key(&self.stemcell, &self.release, &self.package, &self.version)
    }
}

pub fn compiled_package_key(stemcell: &str, release: &str, package: &str, version: &str) -> String {
    format!("{stemcell}:{release}/{package}/{version}")
}

// ── Batches ────────────────────────────────────────────────────────

/// One write in an atomic [`crate::StateStore::apply`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    PutDeployment(DeploymentRecord),
    DeleteDeployment(String),
    PutInstance(InstanceRecord),
    DeleteInstance(String),
    PutDisk(DiskRecord),
    DeleteDisk(String),
    PutVariableSet(VariableSetRecord),
    DeleteVariableSet { deployment: String, id: u64 },
}
