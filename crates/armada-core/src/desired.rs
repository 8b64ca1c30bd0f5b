//! Desired State Resolver.
//!
//! Folds a deployment manifest, the latest cloud config, the combined
//! runtime config and the director's env defaults into a normalized
//! topology. Everything here is validation: any error is returned before
//! the director touches a VM.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cloud::{CloudConfig, CompilationConfig, NetworkKind, RuntimeConfig};
use crate::error::{CoreError, CoreResult};
use crate::manifest::{
    DeploymentManifest, InstanceGroupManifest, JobSpec, Lifecycle, ReleaseRef,
    VariableDefinition, VmResources,
};
use crate::merge::{deep_merge, merged};
use crate::network::{Cidr, expand_ranges};
use crate::update::UpdatePolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredDeployment {
    pub name: String,
    pub releases: Vec<ReleaseRef>,
    pub update: UpdatePolicy,
    pub groups: Vec<DesiredInstanceGroup>,
    /// Manifest tags with runtime-config tags layered underneath.
    pub tags: BTreeMap<String, String>,
    pub variables: Vec<VariableDefinition>,
    pub compilation: Option<CompilationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredAz {
    pub name: String,
    pub cpi: Option<String>,
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredSubnet {
    pub cidr: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub reserved: Vec<Ipv4Addr>,
    pub static_pool: Vec<Ipv4Addr>,
    pub azs: Vec<String>,
    pub cloud_properties: Value,
}

impl DesiredSubnet {
    pub fn serves_az(&self, az: Option<&str>) -> bool {
        match az {
            Some(az) => self.azs.is_empty() || self.azs.iter().any(|a| a == az),
            None => true,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr
            .as_deref()
            .and_then(|c| Cidr::parse(c).ok())
            .is_some_and(|c| c.contains(ip))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredNetwork {
    pub name: String,
    pub kind: NetworkKind,
    pub static_ips: Vec<Ipv4Addr>,
    pub default: Vec<String>,
    pub subnets: Vec<DesiredSubnet>,
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredDisk {
    /// Size in MB; always non-zero.
    pub size: u64,
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredInstanceGroup {
    pub name: String,
    pub instances: u32,
    /// Empty when neither the manifest nor the cloud config uses AZs.
    pub azs: Vec<DesiredAz>,
    pub networks: Vec<DesiredNetwork>,
    /// vm_type (or resource_pool) properties with vm_extensions merged on top.
    pub vm_cloud_properties: Value,
    /// Set when sizing must be computed by the CPI.
    pub vm_resources: Option<VmResources>,
    pub env: Value,
    pub stemcell: String,
    pub persistent_disk: Option<DesiredDisk>,
    pub lifecycle: Lifecycle,
    pub jobs: Vec<JobSpec>,
    pub properties: Value,
    pub update: UpdatePolicy,
}

impl DesiredInstanceGroup {
    /// An empty service group: no instances, networks, jobs or disk.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instances: 0,
            azs: Vec::new(),
            networks: Vec::new(),
            vm_cloud_properties: Value::Null,
            vm_resources: None,
            env: Value::Null,
            stemcell: String::new(),
            persistent_disk: None,
            lifecycle: Lifecycle::Service,
            jobs: Vec::new(),
            properties: Value::Null,
            update: UpdatePolicy::default(),
        }
    }

    pub fn az(&self, name: &str) -> Option<&DesiredAz> {
        self.azs.iter().find(|a| a.name == name)
    }

    pub fn az_names(&self) -> Vec<&str> {
        self.azs.iter().map(|a| a.name.as_str()).collect()
    }

    /// Static IPs across all networks, in manifest order.
    pub fn static_ips(&self) -> Vec<Ipv4Addr> {
        self.networks
            .iter()
            .flat_map(|n| n.static_ips.iter().copied())
            .collect()
    }

    pub fn has_static_ips(&self) -> bool {
        self.networks.iter().any(|n| !n.static_ips.is_empty())
    }

    /// Final VM cloud properties for one AZ, given the CPI-calculated
    /// sizing if the group uses `vm_resources`.
    pub fn cloud_properties_for(&self, az: Option<&str>, calculated: Option<&Value>) -> Value {
        let az_props = az
            .and_then(|a| self.az(a))
            .map(|a| a.cloud_properties.clone())
            .unwrap_or(Value::Null);
        merged([
            &self.vm_cloud_properties,
            &az_props,
            calculated.unwrap_or(&Value::Null),
        ])
    }
}

/// Resolve the desired topology for one deployment.
pub fn resolve(
    manifest: &DeploymentManifest,
    cloud: &CloudConfig,
    runtime: &RuntimeConfig,
    default_env: &Value,
) -> CoreResult<DesiredDeployment> {
    let mut groups = Vec::with_capacity(manifest.instance_groups.len());
    for group in &manifest.instance_groups {
        groups.push(resolve_group(manifest, group, cloud, runtime, default_env)?);
    }

    let mut tags = runtime.tags.clone();
    tags.extend(manifest.tags.clone());

    let compilation = cloud.compilation.clone();
    if let Some(c) = &compilation {
        if let Some(az) = &c.az
            && cloud.az(az).is_none()
        {
            return Err(CoreError::CloudConfig(format!(
                "compilation references unknown az '{az}'"
            )));
        }
        if c.workers == 0 {
            return Err(CoreError::CloudConfig(
                "compilation workers must be at least 1".to_string(),
            ));
        }
    }

    Ok(DesiredDeployment {
        name: manifest.name.clone(),
        releases: manifest.releases.clone(),
        update: manifest.update.clone(),
        groups,
        tags,
        variables: manifest.variables.clone(),
        compilation,
    })
}

fn group_err(group: &InstanceGroupManifest, message: impl Into<String>) -> CoreError {
    CoreError::InstanceGroup {
        group: group.name.clone(),
        message: message.into(),
    }
}

fn unknown(group: &InstanceGroupManifest, kind: &'static str, name: &str) -> CoreError {
    CoreError::UnknownReference {
        group: group.name.clone(),
        kind,
        name: name.to_string(),
    }
}

fn resolve_group(
    manifest: &DeploymentManifest,
    group: &InstanceGroupManifest,
    cloud: &CloudConfig,
    runtime: &RuntimeConfig,
    default_env: &Value,
) -> CoreResult<DesiredInstanceGroup> {
    // ── AZs ──
    let mut azs = Vec::with_capacity(group.azs.len());
    let mut seen = HashSet::new();
    for name in &group.azs {
        if !seen.insert(name.as_str()) {
            return Err(group_err(group, format!("az '{name}' listed twice")));
        }
        let az = cloud.az(name).ok_or_else(|| unknown(group, "az", name))?;
        azs.push(DesiredAz {
            name: az.name.clone(),
            cpi: az.cpi.clone(),
            cloud_properties: az.cloud_properties.clone(),
        });
    }
    if azs.is_empty() && !cloud.azs.is_empty() && group.instances > 0 {
        return Err(group_err(group, "must specify azs"));
    }

    // ── Sizing: exactly one of vm_type, vm_resources, resource_pool ──
    let sizing = [
        group.vm_type.is_some(),
        group.vm_resources.is_some(),
        group.resource_pool.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if sizing != 1 {
        return Err(group_err(
            group,
            "exactly one of vm_type, vm_resources or resource_pool must be set",
        ));
    }

    let mut env = default_env.clone();
    if env.is_null() {
        env = Value::Object(Default::default());
    }
    let mut base_props = Value::Object(Default::default());
    if let Some(name) = &group.vm_type {
        let vm_type = cloud
            .vm_type(name)
            .ok_or_else(|| unknown(group, "vm_type", name))?;
        deep_merge(&mut base_props, &vm_type.cloud_properties);
    }
    if let Some(name) = &group.resource_pool {
        let pool = cloud
            .resource_pool(name)
            .ok_or_else(|| unknown(group, "resource_pool", name))?;
        deep_merge(&mut base_props, &pool.cloud_properties);
        deep_merge(&mut env, &Value::Object(pool.env.clone()));
    }
    for name in &group.vm_extensions {
        let ext = cloud
            .vm_extension(name)
            .ok_or_else(|| unknown(group, "vm_extension", name))?;
        deep_merge(&mut base_props, &ext.cloud_properties);
    }
    deep_merge(&mut env, &Value::Object(group.env.clone()));

    // ── Persistent disk ──
    let persistent_disk = match (&group.persistent_disk, &group.persistent_disk_type) {
        (Some(_), Some(_)) => {
            return Err(group_err(
                group,
                "persistent_disk and persistent_disk_type are mutually exclusive",
            ));
        }
        (Some(0), None) | (None, None) => None,
        (Some(size), None) => Some(DesiredDisk {
            size: *size,
            cloud_properties: Value::Object(Default::default()),
        }),
        (None, Some(name)) => {
            let dt = cloud
                .disk_type(name)
                .ok_or_else(|| unknown(group, "disk_type", name))?;
            (dt.disk_size > 0).then(|| DesiredDisk {
                size: dt.disk_size,
                cloud_properties: dt.cloud_properties.clone(),
            })
        }
    };

    // ── Stemcell ──
    let stemcell = manifest
        .stemcell(&group.stemcell)
        .ok_or_else(|| unknown(group, "stemcell", &group.stemcell))?
        .identity();

    // ── Networks ──
    if group.networks.is_empty() && group.instances > 0 {
        return Err(group_err(group, "must specify at least one network"));
    }
    let mut networks = Vec::with_capacity(group.networks.len());
    for net_ref in &group.networks {
        let net = cloud
            .network(&net_ref.name)
            .ok_or_else(|| unknown(group, "network", &net_ref.name))?;
        let mut subnets = Vec::with_capacity(net.subnets.len());
        for subnet in &net.subnets {
            subnets.push(DesiredSubnet {
                cidr: subnet.range.clone(),
                gateway: subnet.gateway,
                reserved: expand_ranges(&subnet.reserved)?,
                static_pool: expand_ranges(&subnet.static_ips)?,
                azs: subnet.az_names().into_iter().map(str::to_string).collect(),
                cloud_properties: subnet.cloud_properties.clone(),
            });
        }
        let desired = DesiredNetwork {
            name: net.name.clone(),
            kind: net.kind,
            static_ips: net_ref.static_ips.clone(),
            default: net_ref.default.clone(),
            subnets,
            cloud_properties: net.cloud_properties.clone(),
        };
        validate_network(group, &desired, &azs)?;
        networks.push(desired);
    }

    // ── Jobs (manifest + addons) ──
    let mut jobs = group.jobs.clone();
    for addon in &runtime.addons {
        if addon.applies_to(&manifest.name, &group.name) {
            for job in &addon.jobs {
                if !jobs.iter().any(|j| j.name == job.name) {
                    jobs.push(job.clone());
                }
            }
        }
    }

    let update = match &group.update {
        Some(o) => manifest.update.merged(o),
        None => manifest.update.clone(),
    };

    Ok(DesiredInstanceGroup {
        name: group.name.clone(),
        instances: group.instances,
        azs,
        networks,
        vm_cloud_properties: base_props,
        vm_resources: group.vm_resources,
        env,
        stemcell,
        persistent_disk,
        lifecycle: group.lifecycle,
        jobs,
        properties: group.properties.clone(),
        update,
    })
}

fn validate_network(
    group: &InstanceGroupManifest,
    net: &DesiredNetwork,
    azs: &[DesiredAz],
) -> CoreResult<()> {
    for az in azs {
        if net.kind != NetworkKind::Vip
            && !net.subnets.is_empty()
            && !net.subnets.iter().any(|s| s.serves_az(Some(&az.name)))
        {
            return Err(group_err(
                group,
                format!("network '{}' has no subnet in az '{}'", net.name, az.name),
            ));
        }
    }

    if net.static_ips.is_empty() {
        return Ok(());
    }
    if net.static_ips.len() != group.instances as usize {
        return Err(group_err(
            group,
            format!(
                "network '{}' declares {} static IPs but the group has {} instances",
                net.name,
                net.static_ips.len(),
                group.instances
            ),
        ));
    }
    let mut seen = HashSet::new();
    for ip in &net.static_ips {
        if !seen.insert(*ip) {
            return Err(group_err(group, format!("static IP {ip} listed twice")));
        }
        if net.kind == NetworkKind::Manual
            && !net.subnets.iter().any(|s| s.static_pool.contains(ip))
        {
            return Err(group_err(
                group,
                format!(
                    "static IP {ip} is not in a static range of network '{}'",
                    net.name
                ),
            ));
        }
    }
    Ok(())
}
