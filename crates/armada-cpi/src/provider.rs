//! The cloud provider interface consumed by the director.

use std::collections::BTreeMap;
use std::fmt;

use armada_core::VmResources;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::CpiResult;

/// Everything a provider needs to boot a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub agent_id: String,
    /// Stemcell identity (`os/version`).
    pub stemcell: String,
    pub cloud_properties: Value,
    /// Network name → `{ip, type, default, cloud_properties}`.
    pub networks: Value,
    /// Disks the VM should be placed near.
    pub disk_cids: Vec<String>,
    pub env: Value,
}

pub type VmMetadata = BTreeMap<String, String>;

/// One named CPI instance.
///
/// Every call is idempotent from the director's point of view: deleting
/// or detaching something that is already gone reports
/// [`crate::CpiError::VmNotFound`]/[`crate::CpiError::DiskNotFound`], which callers
/// downgrade to success with [`tolerate_not_found`].
#[async_trait]
pub trait CloudProvider: fmt::Debug + Send + Sync {
    async fn create_vm(&self, request: &CreateVmRequest) -> CpiResult<String>;

    async fn delete_vm(&self, vm_cid: &str) -> CpiResult<()>;

    async fn has_vm(&self, vm_cid: &str) -> CpiResult<bool>;

    async fn set_vm_metadata(&self, vm_cid: &str, metadata: &VmMetadata) -> CpiResult<()>;

    async fn calculate_vm_cloud_properties(&self, resources: &VmResources) -> CpiResult<Value>;

    async fn create_disk(
        &self,
        size_mb: u64,
        cloud_properties: &Value,
        vm_cid: Option<&str>,
    ) -> CpiResult<String>;

    async fn delete_disk(&self, disk_cid: &str) -> CpiResult<()>;

    async fn has_disk(&self, disk_cid: &str) -> CpiResult<bool>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> CpiResult<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> CpiResult<()>;

    async fn snapshot_disk(&self, disk_cid: &str, metadata: &VmMetadata) -> CpiResult<String>;

    async fn delete_snapshot(&self, snapshot_cid: &str) -> CpiResult<()>;
}

/// Downgrade a not-found error to success, logging it at warn.
pub fn tolerate_not_found(result: CpiResult<()>, operation: &str, cid: &str) -> CpiResult<()> {
    match result {
        Err(e) if e.is_not_found() => {
            warn!(%cid, operation, error = %e, "resource already gone, continuing");
            Ok(())
        }
        other => other,
    }
}
