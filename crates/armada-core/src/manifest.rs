//! Deployment manifest types.
//!
//! Manifests arrive as JSON documents. Placeholders (`((name))`) are
//! interpolated on the raw `serde_json::Value` before the document is
//! deserialized into these types, so any field may be templated.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::update::{UpdatePolicy, UpdatePolicyOverride};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub name: String,
    #[serde(default)]
    pub releases: Vec<ReleaseRef>,
    #[serde(default)]
    pub stemcells: Vec<StemcellRef>,
    #[serde(default)]
    pub update: UpdatePolicy,
    #[serde(default)]
    pub instance_groups: Vec<InstanceGroupManifest>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    /// Tags forwarded to every VM's metadata.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellRef {
    pub alias: String,
    pub os: String,
    pub version: String,
}

impl StemcellRef {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.os, self.version)
    }
}

/// Whether an instance group runs continuously or on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Service,
    Errand,
}

/// Explicit VM sizing, resolved to cloud properties by the CPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmResources {
    pub cpu: u32,
    /// RAM in MB.
    pub ram: u64,
    /// Ephemeral disk size in MB.
    pub ephemeral_disk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroupManifest {
    pub name: String,
    pub instances: u32,
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkRef>,
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub vm_resources: Option<VmResources>,
    /// Legacy sizing; mutually exclusive with `vm_type`/`vm_resources`.
    #[serde(default)]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub vm_extensions: Vec<String>,
    /// Persistent disk size in MB.
    #[serde(default)]
    pub persistent_disk: Option<u64>,
    #[serde(default)]
    pub persistent_disk_type: Option<String>,
    pub stemcell: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub update: Option<UpdatePolicyOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRef {
    pub name: String,
    #[serde(default)]
    pub static_ips: Vec<Ipv4Addr>,
    /// Which defaults (`dns`, `gateway`) this network provides.
    #[serde(default)]
    pub default: Vec<String>,
}

/// A job placed on an instance group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub release: String,
    #[serde(default)]
    pub properties: Value,
    /// Packages the job needs compiled for the group's stemcell.
    #[serde(default)]
    pub packages: Vec<PackageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
    /// Names of packages (same release) that must compile first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A variable the director may generate in the secret store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: Value,
}

impl DeploymentManifest {
    /// Deserialize an already-interpolated manifest document.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let manifest: DeploymentManifest =
            serde_json::from_value(value).map_err(|e| CoreError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Extract the deployment name without deserializing the whole
    /// document (placeholders may still be present elsewhere).
    pub fn name_of(value: &Value) -> CoreResult<String> {
        value
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CoreError::Manifest("missing deployment name".to_string()))
    }

    fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::Manifest("deployment name must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for group in &self.instance_groups {
            if !seen.insert(group.name.as_str()) {
                return Err(CoreError::Manifest(format!(
                    "duplicate instance group name '{}'",
                    group.name
                )));
            }
        }
        Ok(())
    }

    pub fn stemcell(&self, alias: &str) -> Option<&StemcellRef> {
        self.stemcells.iter().find(|s| s.alias == alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_manifest() {
        let m = DeploymentManifest::from_value(json!({
            "name": "simple",
            "stemcells": [{"alias": "default", "os": "ubuntu", "version": "1"}],
            "update": {"canaries": 2, "max_in_flight": "50%", "canary_watch_time": 1000, "update_watch_time": 1000},
            "instance_groups": [{
                "name": "web", "instances": 3, "azs": ["z1"], "vm_type": "small",
                "stemcell": "default", "networks": [{"name": "private"}],
                "jobs": [{"name": "nginx", "release": "web"}]
            }]
        }))
        .unwrap();
        assert_eq!(m.instance_groups[0].instances, 3);
        assert_eq!(m.instance_groups[0].lifecycle, Lifecycle::Service);
        assert_eq!(m.stemcell("default").unwrap().identity(), "ubuntu/1");
    }

    #[test]
    fn rejects_duplicate_group_names() {
        let err = DeploymentManifest::from_value(json!({
            "name": "dup",
            "instance_groups": [
                {"name": "a", "instances": 1, "stemcell": "s"},
                {"name": "a", "instances": 1, "stemcell": "s"}
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate instance group"));
    }

    #[test]
    fn name_of_requires_name() {
        assert!(DeploymentManifest::name_of(&json!({})).is_err());
        assert_eq!(DeploymentManifest::name_of(&json!({"name": "x"})).unwrap(), "x");
    }
}
