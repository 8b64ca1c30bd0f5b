//! In-memory cloud used by tests and the `dummy` CPI type.
//!
//! Records every call so tests can assert on the exact CPI traffic, and
//! supports one-shot failure injection per method.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use armada_core::{CpiEntry, VmResources};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{CpiError, CpiResult};
use crate::provider::{CloudProvider, CreateVmRequest, VmMetadata};

/// A recorded CPI call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub method: &'static str,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DummyVm {
    pub agent_id: String,
    pub stemcell: String,
    pub cloud_properties: Value,
    pub networks: Value,
    pub env: Value,
    pub metadata: VmMetadata,
    pub disks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DummyDisk {
    pub size: u64,
    pub cloud_properties: Value,
    pub attached_to: Option<String>,
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    vms: BTreeMap<String, DummyVm>,
    disks: BTreeMap<String, DummyDisk>,
    snapshots: BTreeMap<String, String>,
    invocations: Vec<Invocation>,
    failures: HashMap<&'static str, VecDeque<CpiError>>,
}

#[derive(Debug, Clone)]
pub struct DummyCloud {
    name: String,
    state: Arc<Mutex<DummyState>>,
}

impl DummyCloud {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(DummyState::default())),
        }
    }

    /// Builder for the `dummy` CPI type.
    pub fn build(entry: &CpiEntry) -> CpiResult<Arc<dyn CloudProvider>> {
        Ok(Arc::new(Self::new(entry.name.clone())))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, DummyState> {
        // A poisoned dummy means a test already panicked; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and pop any injected failure for it.
    fn enter(&self, method: &'static str, args: Value) -> CpiResult<MutexGuard<'_, DummyState>> {
        let mut state = self.lock();
        debug!(cpi = %self.name, method, "dummy cpi call");
        state.invocations.push(Invocation { method, args });
        if let Some(err) = state.failures.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    fn next_cid(&self, state: &mut DummyState, kind: &str) -> String {
        state.next_id += 1;
        format!("{}-{kind}-{}", self.name, state.next_id)
    }

    /// Make the next call to `method` fail with `error`.
    pub fn fail_next(&self, method: &'static str, error: CpiError) {
        self.lock().failures.entry(method).or_default().push_back(error);
    }

    /// Delete a VM behind the director's back.
    pub fn remove_vm_out_of_band(&self, cid: &str) -> bool {
        let mut state = self.lock();
        let removed = state.vms.remove(cid);
        if let Some(vm) = &removed {
            for disk in &vm.disks {
                if let Some(d) = state.disks.get_mut(disk) {
                    d.attached_to = None;
                }
            }
        }
        removed.is_some()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn invocations_of(&self, method: &str) -> Vec<Invocation> {
        self.lock()
            .invocations
            .iter()
            .filter(|i| i.method == method)
            .cloned()
            .collect()
    }

    pub fn clear_invocations(&self) {
        self.lock().invocations.clear();
    }

    pub fn vm_cids(&self) -> Vec<String> {
        self.lock().vms.keys().cloned().collect()
    }

    pub fn vm(&self, cid: &str) -> Option<DummyVm> {
        self.lock().vms.get(cid).cloned()
    }

    pub fn disk_cids(&self) -> Vec<String> {
        self.lock().disks.keys().cloned().collect()
    }

    pub fn disk(&self, cid: &str) -> Option<DummyDisk> {
        self.lock().disks.get(cid).cloned()
    }

    pub fn snapshot_cids(&self) -> Vec<String> {
        self.lock().snapshots.keys().cloned().collect()
    }
}

#[async_trait]
impl CloudProvider for DummyCloud {
    async fn create_vm(&self, request: &CreateVmRequest) -> CpiResult<String> {
        let mut state = self.enter(
            "create_vm",
            json!({
                "agent_id": request.agent_id,
                "stemcell": request.stemcell,
                "cloud_properties": request.cloud_properties,
                "networks": request.networks,
                "disk_cids": request.disk_cids,
                "env": request.env,
            }),
        )?;
        let cid = self.next_cid(&mut state, "vm");
        state.vms.insert(
            cid.clone(),
            DummyVm {
                agent_id: request.agent_id.clone(),
                stemcell: request.stemcell.clone(),
                cloud_properties: request.cloud_properties.clone(),
                networks: request.networks.clone(),
                env: request.env.clone(),
                metadata: VmMetadata::new(),
                disks: Vec::new(),
            },
        );
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> CpiResult<()> {
        let mut state = self.enter("delete_vm", json!({"vm_cid": vm_cid}))?;
        let vm = state
            .vms
            .remove(vm_cid)
            .ok_or_else(|| CpiError::VmNotFound(vm_cid.to_string()))?;
        for disk in vm.disks {
            if let Some(d) = state.disks.get_mut(&disk) {
                d.attached_to = None;
            }
        }
        Ok(())
    }

    async fn has_vm(&self, vm_cid: &str) -> CpiResult<bool> {
        let state = self.enter("has_vm", json!({"vm_cid": vm_cid}))?;
        Ok(state.vms.contains_key(vm_cid))
    }

    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &VmMetadata) -> CpiResult<()> {
        let mut state = self.enter(
            "set_vm_metadata",
            json!({"vm_cid": vm_cid, "metadata": metadata}),
        )?;
        let vm = state
            .vms
            .get_mut(vm_cid)
            .ok_or_else(|| CpiError::VmNotFound(vm_cid.to_string()))?;
        vm.metadata = metadata.clone();
        Ok(())
    }

    async fn calculate_vm_cloud_properties(&self, resources: &VmResources) -> CpiResult<Value> {
        let _state = self.enter(
            "calculate_vm_cloud_properties",
            json!({
                "cpu": resources.cpu,
                "ram": resources.ram,
                "ephemeral_disk_size": resources.ephemeral_disk_size,
            }),
        )?;
        Ok(json!({
            "instance_type": format!("dummy-{}cpu-{}mb", resources.cpu, resources.ram),
            "ephemeral_disk": {"size": resources.ephemeral_disk_size},
        }))
    }

    async fn create_disk(
        &self,
        size_mb: u64,
        cloud_properties: &Value,
        vm_cid: Option<&str>,
    ) -> CpiResult<String> {
        let mut state = self.enter(
            "create_disk",
            json!({"size": size_mb, "cloud_properties": cloud_properties, "vm_locality": vm_cid}),
        )?;
        let cid = self.next_cid(&mut state, "disk");
        state.disks.insert(
            cid.clone(),
            DummyDisk {
                size: size_mb,
                cloud_properties: cloud_properties.clone(),
                attached_to: None,
            },
        );
        Ok(cid)
    }

    async fn delete_disk(&self, disk_cid: &str) -> CpiResult<()> {
        let mut state = self.enter("delete_disk", json!({"disk_cid": disk_cid}))?;
        let disk = state
            .disks
            .remove(disk_cid)
            .ok_or_else(|| CpiError::DiskNotFound(disk_cid.to_string()))?;
        if let Some(vm_cid) = disk.attached_to
            && let Some(vm) = state.vms.get_mut(&vm_cid)
        {
            vm.disks.retain(|d| d != disk_cid);
        }
        Ok(())
    }

    async fn has_disk(&self, disk_cid: &str) -> CpiResult<bool> {
        let state = self.enter("has_disk", json!({"disk_cid": disk_cid}))?;
        Ok(state.disks.contains_key(disk_cid))
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CpiResult<()> {
        let mut state = self.enter(
            "attach_disk",
            json!({"vm_cid": vm_cid, "disk_cid": disk_cid}),
        )?;
        if !state.vms.contains_key(vm_cid) {
            return Err(CpiError::VmNotFound(vm_cid.to_string()));
        }
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CpiError::DiskNotFound(disk_cid.to_string()))?;
        disk.attached_to = Some(vm_cid.to_string());
        if let Some(vm) = state.vms.get_mut(vm_cid)
            && !vm.disks.iter().any(|d| d == disk_cid)
        {
            vm.disks.push(disk_cid.to_string());
        }
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CpiResult<()> {
        let mut state = self.enter(
            "detach_disk",
            json!({"vm_cid": vm_cid, "disk_cid": disk_cid}),
        )?;
        let vm = state
            .vms
            .get_mut(vm_cid)
            .ok_or_else(|| CpiError::VmNotFound(vm_cid.to_string()))?;
        vm.disks.retain(|d| d != disk_cid);
        let disk = state
            .disks
            .get_mut(disk_cid)
            .ok_or_else(|| CpiError::DiskNotFound(disk_cid.to_string()))?;
        disk.attached_to = None;
        Ok(())
    }

    async fn snapshot_disk(&self, disk_cid: &str, metadata: &VmMetadata) -> CpiResult<String> {
        let mut state = self.enter(
            "snapshot_disk",
            json!({"disk_cid": disk_cid, "metadata": metadata}),
        )?;
        if !state.disks.contains_key(disk_cid) {
            return Err(CpiError::DiskNotFound(disk_cid.to_string()));
        }
        let cid = self.next_cid(&mut state, "snapshot");
        state.snapshots.insert(cid.clone(), disk_cid.to_string());
        Ok(cid)
    }

    async fn delete_snapshot(&self, snapshot_cid: &str) -> CpiResult<()> {
        let mut state = self.enter("delete_snapshot", json!({"snapshot_cid": snapshot_cid}))?;
        state.snapshots.remove(snapshot_cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateVmRequest {
        CreateVmRequest {
            agent_id: "agent-1".into(),
            stemcell: "ubuntu/1".into(),
            cloud_properties: json!({}),
            networks: json!({}),
            disk_cids: vec![],
            env: json!({}),
        }
    }

    #[tokio::test]
    async fn vm_and_disk_lifecycle() {
        let cloud = DummyCloud::new("dummy");
        let vm = cloud.create_vm(&request()).await.unwrap();
        let disk = cloud.create_disk(1024, &json!({}), Some(&vm)).await.unwrap();
        cloud.attach_disk(&vm, &disk).await.unwrap();
        assert_eq!(cloud.disk(&disk).unwrap().attached_to.as_deref(), Some(vm.as_str()));

        cloud.delete_vm(&vm).await.unwrap();
        assert!(cloud.disk(&disk).unwrap().attached_to.is_none());
        assert_eq!(
            cloud.delete_vm(&vm).await.unwrap_err(),
            CpiError::VmNotFound(vm.clone())
        );
        assert_eq!(cloud.invocations_of("delete_vm").len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let cloud = DummyCloud::new("dummy");
        cloud.fail_next("create_vm", CpiError::cloud("quota exceeded"));
        assert!(cloud.create_vm(&request()).await.is_err());
        assert!(cloud.create_vm(&request()).await.is_ok());
        assert_eq!(cloud.vm_cids().len(), 1);
    }

    #[tokio::test]
    async fn out_of_band_removal() {
        let cloud = DummyCloud::new("dummy");
        let vm = cloud.create_vm(&request()).await.unwrap();
        assert!(cloud.remove_vm_out_of_band(&vm));
        assert!(!cloud.has_vm(&vm).await.unwrap());
    }

    #[tokio::test]
    async fn calculated_properties_follow_resources() {
        let cloud = DummyCloud::new("dummy");
        let props = cloud
            .calculate_vm_cloud_properties(&VmResources { cpu: 2, ram: 1024, ephemeral_disk_size: 10 })
            .await
            .unwrap();
        assert_eq!(props["instance_type"], "dummy-2cpu-1024mb");
        assert_eq!(props["ephemeral_disk"]["size"], 10);
    }
}
