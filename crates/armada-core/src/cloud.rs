//! Cloud config, runtime config and CPI config documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::manifest::JobSpec;

// ── Cloud config ──────────────────────────────────────────────────

/// IaaS-specific placement and sizing shared by all deployments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub azs: Vec<AzConfig>,
    #[serde(default)]
    pub vm_types: Vec<VmTypeConfig>,
    #[serde(default)]
    pub vm_extensions: Vec<VmExtensionConfig>,
    #[serde(default)]
    pub disk_types: Vec<DiskTypeConfig>,
    #[serde(default)]
    pub resource_pools: Vec<ResourcePoolConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub compilation: Option<CompilationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzConfig {
    pub name: String,
    /// Name of the CPI (from the CPI config) serving this AZ.
    #[serde(default)]
    pub cpi: Option<String>,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTypeConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmExtensionConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTypeConfig {
    pub name: String,
    /// Size in MB.
    pub disk_size: u64,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolConfig {
    pub name: String,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub env: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    Manual,
    Dynamic,
    Vip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NetworkKind,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// CIDR, e.g. `10.0.0.0/24`. Required for manual networks.
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub gateway: Option<std::net::Ipv4Addr>,
    /// Single addresses or `a - b` ranges never handed out.
    #[serde(default)]
    pub reserved: Vec<String>,
    /// Single addresses or `a - b` ranges usable as static IPs.
    #[serde(default, rename = "static")]
    pub static_ips: Vec<String>,
    #[serde(default)]
    pub az: Option<String>,
    #[serde(default)]
    pub azs: Vec<String>,
    #[serde(default)]
    pub cloud_properties: Value,
}

impl SubnetConfig {
    /// All AZs this subnet spans (`az` and `azs` are both accepted).
    pub fn az_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.azs.iter().map(String::as_str).collect();
        if let Some(az) = &self.az {
            names.push(az.as_str());
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationConfig {
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub az: Option<String>,
    #[serde(default)]
    pub vm_type: Option<String>,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub network: Option<String>,
}

fn default_workers() -> u32 {
    1
}

impl CloudConfig {
    pub fn parse(content: &str) -> CoreResult<Self> {
        let cfg: CloudConfig =
            serde_json::from_str(content).map_err(|e| CoreError::CloudConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> CoreResult<()> {
        for net in &self.networks {
            for subnet in &net.subnets {
                for az in subnet.az_names() {
                    if !self.azs.is_empty() && self.az(az).is_none() {
                        return Err(CoreError::CloudConfig(format!(
                            "network '{}' references unknown az '{az}'",
                            net.name
                        )));
                    }
                }
                if net.kind == NetworkKind::Manual && subnet.range.is_none() {
                    return Err(CoreError::CloudConfig(format!(
                        "manual network '{}' has a subnet without a range",
                        net.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn az(&self, name: &str) -> Option<&AzConfig> {
        self.azs.iter().find(|a| a.name == name)
    }

    pub fn vm_type(&self, name: &str) -> Option<&VmTypeConfig> {
        self.vm_types.iter().find(|v| v.name == name)
    }

    pub fn vm_extension(&self, name: &str) -> Option<&VmExtensionConfig> {
        self.vm_extensions.iter().find(|v| v.name == name)
    }

    pub fn disk_type(&self, name: &str) -> Option<&DiskTypeConfig> {
        self.disk_types.iter().find(|d| d.name == name)
    }

    pub fn resource_pool(&self, name: &str) -> Option<&ResourcePoolConfig> {
        self.resource_pools.iter().find(|r| r.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// AZ name → configured CPI name, for building a CPI router.
    pub fn az_cpis(&self) -> BTreeMap<String, Option<String>> {
        self.azs
            .iter()
            .map(|a| (a.name.clone(), a.cpi.clone()))
            .collect()
    }
}

// ── Runtime config ────────────────────────────────────────────────

/// Director-wide additions layered onto every deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub include: Option<AddonFilter>,
    #[serde(default)]
    pub exclude: Option<AddonFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonFilter {
    #[serde(default)]
    pub deployments: Vec<String>,
    #[serde(default)]
    pub instance_groups: Vec<String>,
}

impl AddonFilter {
    fn matches(&self, deployment: &str, group: &str) -> bool {
        let dep_ok = self.deployments.is_empty() || self.deployments.iter().any(|d| d == deployment);
        let grp_ok =
            self.instance_groups.is_empty() || self.instance_groups.iter().any(|g| g == group);
        dep_ok && grp_ok
    }
}

impl Addon {
    /// Whether this addon's jobs land on the given instance group.
    pub fn applies_to(&self, deployment: &str, group: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .is_none_or(|f| f.matches(deployment, group));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|f| f.matches(deployment, group));
        included && !excluded
    }
}

impl RuntimeConfig {
    pub fn parse(content: &str) -> CoreResult<Self> {
        serde_json::from_str(content).map_err(|e| CoreError::Parse(format!("runtime config: {e}")))
    }

    /// Fold several runtime configs into one (addons concatenate, later
    /// tags win).
    pub fn combine<'a>(configs: impl IntoIterator<Item = &'a RuntimeConfig>) -> RuntimeConfig {
        let mut out = RuntimeConfig::default();
        for cfg in configs {
            out.addons.extend(cfg.addons.iter().cloned());
            out.tags.extend(cfg.tags.clone());
        }
        out
    }
}

// ── CPI config ────────────────────────────────────────────────────

/// Named cloud provider instances available to the director.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpiConfig {
    #[serde(default)]
    pub cpis: Vec<CpiEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpiEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
    /// Former names of this CPI; resources recorded under those names
    /// are served by this entry.
    #[serde(default)]
    pub migrated_from: Vec<MigratedFrom>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedFrom {
    pub name: String,
}

impl CpiConfig {
    pub fn parse(content: &str) -> CoreResult<Self> {
        let cfg: CpiConfig = serde_json::from_str(content)
            .map_err(|e| CoreError::Parse(format!("cpi config: {e}")))?;
        let mut names = std::collections::HashSet::new();
        for entry in &cfg.cpis {
            if !names.insert(entry.name.as_str()) {
                return Err(CoreError::Parse(format!(
                    "cpi config: duplicate cpi name '{}'",
                    entry.name
                )));
            }
        }
        Ok(cfg)
    }

    pub fn entry(&self, name: &str) -> Option<&CpiEntry> {
        self.cpis.iter().find(|c| c.name == name)
    }
}
