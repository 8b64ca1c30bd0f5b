//! Deployment planning.
//!
//! Diffs the desired instance groups against the current instance records:
//! decides which instances are kept, created and deleted, assigns indices,
//! AZs and IPs, and classifies the change every kept instance needs. The
//! planner performs no CPI or agent calls; VM liveness comes in through
//! [`Planner::lost_vms`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

use armada_core::cloud::NetworkKind;
use armada_core::desired::{DesiredDeployment, DesiredDisk, DesiredInstanceGroup, DesiredNetwork};
use armada_core::hash::spec_hash;
use armada_core::{Lifecycle, UpdateStrategy};
use armada_cpi::CpiRouter;
use armada_state::{AppliedSpec, DiskRecord, InstanceRecord, InstanceState, IpKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::disks::disk_matches;
use crate::error::{DirectorError, DirectorResult};
use crate::ip::{IpAllocator, dynamic_still_valid};
use crate::lifecycle::{Operation, VmStatus};

/// What a planned instance needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Create,
    /// Errand instance: reserve identity and IPs, no VM.
    Reserve,
    NoOp,
    Update,
    Recreate,
    Hotswap,
}

impl Change {
    pub fn operation(self) -> Option<Operation> {
        match self {
            Change::Create => Some(Operation::Create),
            Change::Update => Some(Operation::Update),
            Change::Recreate => Some(Operation::Recreate),
            Change::Hotswap => Some(Operation::Hotswap),
            Change::Reserve | Change::NoOp => None,
        }
    }
}

/// Which instances an operator command targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InstanceSelector {
    All,
    Group { group: String },
    /// `id` is either the index or the UUID.
    Instance { group: String, id: String },
}

impl InstanceSelector {
    /// `""`/`all`, `group`, or `group/<index|uuid>`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "" | "all" => InstanceSelector::All,
            s => match s.split_once('/') {
                Some((group, id)) => InstanceSelector::Instance {
                    group: group.to_string(),
                    id: id.to_string(),
                },
                None => InstanceSelector::Group {
                    group: s.to_string(),
                },
            },
        }
    }

    pub fn matches(&self, record: &InstanceRecord) -> bool {
        match self {
            InstanceSelector::All => true,
            InstanceSelector::Group { group } => record.group == *group,
            InstanceSelector::Instance { group, id } => {
                record.group == *group && (record.uuid == *id || record.index.to_string() == *id)
            }
        }
    }
}

impl fmt::Display for InstanceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceSelector::All => f.write_str("all"),
            InstanceSelector::Group { group } => f.write_str(group),
            InstanceSelector::Instance { group, id } => write!(f, "{group}/{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Recreate every instance.
    #[serde(default)]
    pub recreate: bool,
    /// Recreate every instance, tolerating VMs that are already gone.
    #[serde(default)]
    pub fix: bool,
}

/// CPI-calculated cloud properties of `vm_resources` groups, per AZ.
#[derive(Debug, Clone, Default)]
pub struct CalculatedProperties {
    by_az: HashMap<(String, Option<String>), Value>,
    first: HashMap<String, Value>,
}

impl CalculatedProperties {
    pub fn insert(&mut self, group: &str, az: Option<&str>, props: Value) {
        self.first.entry(group.to_string()).or_insert_with(|| props.clone());
        self.by_az.insert((group.to_string(), az.map(str::to_string)), props);
    }

    /// Properties for `group` in `az`. AZs that were not calculated (their
    /// CPI is unavailable) get the group's first calculated entry.
    pub fn get(&self, group: &str, az: Option<&str>) -> Option<&Value> {
        self.by_az
            .get(&(group.to_string(), az.map(str::to_string)))
            .or_else(|| self.first.get(group))
    }
}

/// Everything needed to build (or compare against) an instance's VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub stemcell: String,
    pub cloud_properties: Value,
    pub env: Value,
    /// Network name to `{type, ip, default, cloud_properties}`.
    pub networks: Value,
    pub disk: Option<DesiredDisk>,
    pub vm_hash: String,
    pub jobs_hash: String,
}

impl InstanceSpec {
    pub fn applied(&self) -> AppliedSpec {
        AppliedSpec {
            vm_hash: self.vm_hash.clone(),
            jobs_hash: self.jobs_hash.clone(),
            stemcell: self.stemcell.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedInstance {
    /// The record as it should look once converged (index, AZ, IPs and
    /// bootstrap already updated).
    pub record: InstanceRecord,
    pub change: Change,
    pub vm: VmStatus,
    pub spec: InstanceSpec,
    pub reasons: Vec<String>,
}

impl PlannedInstance {
    pub fn is_new(&self) -> bool {
        matches!(self.change, Change::Create | Change::Reserve)
    }
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group: DesiredInstanceGroup,
    /// Kept and new instances, by index.
    pub instances: Vec<PlannedInstance>,
    /// Instances to delete once the group has converged, highest index first.
    pub deletions: Vec<InstanceRecord>,
}

#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub deployment: String,
    pub groups: Vec<GroupPlan>,
    /// Instances of groups no longer in the manifest.
    pub obsolete: Vec<InstanceRecord>,
}

impl DeploymentPlan {
    pub fn group(&self, name: &str) -> Option<&GroupPlan> {
        self.groups.iter().find(|g| g.group.name == name)
    }

    /// Every instance to delete: per-group extras, then obsolete groups.
    pub fn deletions(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.groups
            .iter()
            .flat_map(|g| g.deletions.iter())
            .chain(self.obsolete.iter())
    }

    pub fn instances(&self) -> impl Iterator<Item = &PlannedInstance> {
        self.groups.iter().flat_map(|g| g.instances.iter())
    }

    /// Whether anything would touch a VM or the instance table.
    pub fn has_changes(&self) -> bool {
        self.instances().any(|p| p.change != Change::NoOp) || self.deletions().next().is_some()
    }

    /// Human-oriented dry-run output.
    pub fn summary(&self) -> Value {
        let instances: Vec<Value> = self
            .instances()
            .map(|p| {
                json!({
                    "instance": format!("{}/{}", p.record.group, p.record.index),
                    "id": p.record.uuid,
                    "az": p.record.az,
                    "change": p.change,
                    "vm": p.vm,
                    "reasons": p.reasons,
                })
            })
            .collect();
        let deletions: Vec<Value> = self
            .deletions()
            .map(|r| json!({"instance": format!("{}/{}", r.group, r.index), "id": r.uuid}))
            .collect();
        json!({
            "deployment": self.deployment,
            "instances": instances,
            "deletions": deletions,
        })
    }
}

/// A kept or new instance plus the static IPs it must hold.
struct Slot {
    record: InstanceRecord,
    is_new: bool,
    statics: Vec<(String, Ipv4Addr)>,
}

impl Slot {
    fn existing(record: InstanceRecord) -> Self {
        Self {
            record,
            is_new: false,
            statics: Vec::new(),
        }
    }
}

pub struct Planner<'a> {
    desired: &'a DesiredDeployment,
    router: &'a CpiRouter,
    ips: IpAllocator,
    calculated: CalculatedProperties,
    /// Active disk per instance UUID.
    disks: HashMap<String, DiskRecord>,
    lost: HashSet<String>,
    options: PlanOptions,
}

impl<'a> Planner<'a> {
    pub fn new(desired: &'a DesiredDeployment, router: &'a CpiRouter, ips: IpAllocator) -> Self {
        Self {
            desired,
            router,
            ips,
            calculated: CalculatedProperties::default(),
            disks: HashMap::new(),
            lost: HashSet::new(),
            options: PlanOptions::default(),
        }
    }

    pub fn calculated(mut self, calculated: CalculatedProperties) -> Self {
        self.calculated = calculated;
        self
    }

    pub fn disks(mut self, disks: impl IntoIterator<Item = DiskRecord>) -> Self {
        self.disks = disks
            .into_iter()
            .filter(|d| d.active && !d.is_orphaned())
            .filter_map(|d| d.instance.clone().map(|owner| (owner, d)))
            .collect();
        self
    }

    /// VM CIDs recorded in state that the CPI no longer has.
    pub fn lost_vms(mut self, lost: HashSet<String>) -> Self {
        self.lost = lost;
        self
    }

    pub fn options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn plan(mut self, current: Vec<InstanceRecord>) -> DirectorResult<DeploymentPlan> {
        let mut by_group: BTreeMap<String, Vec<InstanceRecord>> = BTreeMap::new();
        for record in current {
            by_group.entry(record.group.clone()).or_default().push(record);
        }

        let mut groups = Vec::with_capacity(self.desired.groups.len());
        for group in &self.desired.groups {
            let existing = by_group.remove(&group.name).unwrap_or_default();
            groups.push(self.plan_group(group, existing)?);
        }

        let mut obsolete: Vec<InstanceRecord> = by_group.into_values().flatten().collect();
        if let Some(r) = obsolete.iter().find(|r| r.ignore) {
            return Err(DirectorError::Validation(format!(
                "instance group '{}' contains ignored instance '{}' and cannot be removed",
                r.group,
                r.name()
            )));
        }
        obsolete.sort_by(|a, b| a.group.cmp(&b.group).then(b.index.cmp(&a.index)));

        let plan = DeploymentPlan {
            deployment: self.desired.name.clone(),
            groups,
            obsolete,
        };
        info!(
            deployment = %plan.deployment,
            groups = plan.groups.len(),
            changes = plan.instances().filter(|p| p.change != Change::NoOp).count(),
            deletions = plan.deletions().count(),
            "planned deployment"
        );
        Ok(plan)
    }

    fn plan_group(
        &mut self,
        group: &DesiredInstanceGroup,
        mut existing: Vec<InstanceRecord>,
    ) -> DirectorResult<GroupPlan> {
        existing.sort_by_key(|r| r.index);
        let (mut slots, mut deletions) = if group.has_static_ips() {
            self.place_static(group, existing)?
        } else {
            self.place_dynamic(group, existing)?
        };
        assign_bootstrap(&mut slots);
        slots.sort_by_key(|s| s.record.index);
        deletions.sort_by(|a, b| b.index.cmp(&a.index));

        let mut instances = Vec::with_capacity(slots.len());
        for mut slot in slots {
            if !slot.record.ignore {
                self.assign_ips(group, &mut slot)?;
            }
            let spec = self.instance_spec(group, &slot.record)?;
            let (change, vm, reasons) = self.classify(group, &slot, &spec);
            debug!(
                group = %group.name,
                index = slot.record.index,
                instance = %slot.record.uuid,
                ?change,
                "planned instance"
            );
            instances.push(PlannedInstance {
                record: slot.record,
                change,
                vm,
                spec,
                reasons,
            });
        }
        Ok(GroupPlan {
            group: group.clone(),
            instances,
            deletions,
        })
    }

    /// Instance identity follows the static IPs of the first static network.
    fn place_static(
        &mut self,
        group: &DesiredInstanceGroup,
        existing: Vec<InstanceRecord>,
    ) -> DirectorResult<(Vec<Slot>, Vec<InstanceRecord>)> {
        let static_nets: Vec<&DesiredNetwork> =
            group.networks.iter().filter(|n| !n.static_ips.is_empty()).collect();
        let Some(first) = static_nets.first() else {
            return Ok((Vec::new(), existing));
        };
        let wanted = &first.static_ips;

        let mut assigned: Vec<Option<InstanceRecord>> = vec![None; wanted.len()];
        let mut unplaced = Vec::new();
        let mut deletions = Vec::new();
        for record in existing {
            let held = record
                .ips
                .iter()
                .find(|r| r.network == first.name && r.kind == IpKind::Static)
                .map(|r| r.ip);
            match held.and_then(|ip| wanted.iter().position(|w| *w == ip)) {
                Some(pos) if assigned[pos].is_none() => assigned[pos] = Some(record),
                _ if held.is_some() => drop_instance(record, &mut deletions)?,
                _ => unplaced.push(record),
            }
        }
        for record in unplaced {
            match assigned.iter().position(Option::is_none) {
                Some(pos) => assigned[pos] = Some(record),
                None => drop_instance(record, &mut deletions)?,
            }
        }

        let mut used: BTreeSet<u32> = assigned.iter().flatten().map(|r| r.index).collect();
        let mut slots = Vec::with_capacity(wanted.len());
        for (pos, record) in assigned.into_iter().enumerate() {
            let ip = wanted[pos];
            let az = self.az_for_ip(group, first, ip, record.as_ref().and_then(|r| r.az.clone()));
            let mut slot = match record {
                Some(mut record) => {
                    if !record.ignore {
                        record.az = az;
                    }
                    Slot::existing(record)
                }
                None => self.new_slot(group, next_index(&mut used), az),
            };
            slot.statics = static_nets
                .iter()
                .filter_map(|n| n.static_ips.get(pos).map(|ip| (n.name.clone(), *ip)))
                .collect();
            slots.push(slot);
        }
        Ok((slots, deletions))
    }

    /// AZ of the subnet holding `ip`; the current AZ if still valid otherwise.
    fn az_for_ip(
        &self,
        group: &DesiredInstanceGroup,
        network: &DesiredNetwork,
        ip: Ipv4Addr,
        current: Option<String>,
    ) -> Option<String> {
        if group.azs.is_empty() {
            return None;
        }
        let from_subnet = network
            .subnets
            .iter()
            .find(|s| s.contains(ip))
            .and_then(|s| s.azs.iter().find(|a| group.az(a).is_some()).cloned());
        from_subnet
            .or_else(|| current.filter(|a| group.az(a).is_some()))
            .or_else(|| group.azs.first().map(|a| a.name.clone()))
    }

    fn place_dynamic(
        &mut self,
        group: &DesiredInstanceGroup,
        existing: Vec<InstanceRecord>,
    ) -> DirectorResult<(Vec<Slot>, Vec<InstanceRecord>)> {
        let azs: Vec<Option<String>> = if group.azs.is_empty() {
            vec![None]
        } else {
            group.azs.iter().map(|a| Some(a.name.clone())).collect()
        };

        let mut kept = Vec::new();
        let mut deletions = Vec::new();
        for record in existing {
            if record.ignore || azs.contains(&record.az) {
                kept.push(record);
            } else {
                debug!(instance = %record.name(), az = ?record.az, "az no longer in group");
                deletions.push(record);
            }
        }

        let desired = group.instances as usize;
        while kept.len() > desired {
            let counts = az_counts(&kept);
            let victim = kept
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.ignore)
                .max_by_key(|(_, r)| (counts.get(&r.az).copied().unwrap_or(0), r.index))
                .map(|(i, _)| i);
            let Some(i) = victim else {
                return Err(DirectorError::Validation(format!(
                    "instance group '{}' cannot scale down to {desired}: remaining instances are ignored",
                    group.name
                )));
            };
            deletions.push(kept.remove(i));
        }

        // New capacity avoids AZs whose CPI is unavailable, unless none is left.
        let serving: Vec<&Option<String>> = azs
            .iter()
            .filter(|az| az.as_deref().is_none_or(|a| self.router.serves_az(a)))
            .collect();
        let eligible: Vec<&Option<String>> = if serving.is_empty() {
            azs.iter().collect()
        } else {
            serving
        };

        let mut used: BTreeSet<u32> = kept.iter().map(|r| r.index).collect();
        let mut slots: Vec<Slot> = kept.into_iter().map(Slot::existing).collect();
        while slots.len() < desired {
            let counts = az_counts(slots.iter().map(|s| &s.record));
            let az = eligible
                .iter()
                .min_by_key(|az| counts.get(**az).copied().unwrap_or(0))
                .map(|az| (*az).clone())
                .unwrap_or_default();
            slots.push(self.new_slot(group, next_index(&mut used), az));
        }
        Ok((slots, deletions))
    }

    fn new_slot(&self, group: &DesiredInstanceGroup, index: u32, az: Option<String>) -> Slot {
        let uuid = uuid::Uuid::new_v4().to_string();
        let mut record = InstanceRecord::new(&self.desired.name, &group.name, index, &uuid, az);
        if group.lifecycle == Lifecycle::Errand {
            record.state = InstanceState::Detached;
        }
        Slot {
            record,
            is_new: true,
            statics: Vec::new(),
        }
    }

    fn assign_ips(&mut self, group: &DesiredInstanceGroup, slot: &mut Slot) -> DirectorResult<()> {
        let record = &mut slot.record;
        let az = record.az.clone();
        let mut next = Vec::with_capacity(group.networks.len());
        for net in &group.networks {
            let held = record.ips.iter().find(|r| r.network == net.name).cloned();
            let wanted = slot.statics.iter().find(|(n, _)| *n == net.name).map(|(_, ip)| *ip);
            match (wanted, held) {
                (Some(ip), Some(h)) if h.kind == IpKind::Static && h.ip == ip => next.push(h),
                (Some(ip), held) => {
                    if let Some(h) = held {
                        self.ips.release(&h);
                    }
                    next.push(self.ips.reserve_static(&net.name, ip)?);
                }
                (None, Some(h))
                    if h.kind == IpKind::Dynamic && dynamic_still_valid(net, &h, az.as_deref()) =>
                {
                    next.push(h)
                }
                (None, held) => {
                    if let Some(h) = held {
                        self.ips.release(&h);
                    }
                    if let Some(r) = self.ips.allocate_dynamic(net, az.as_deref())? {
                        next.push(r);
                    }
                }
            }
        }
        for h in &record.ips {
            if !group.networks.iter().any(|n| n.name == h.network) {
                self.ips.release(h);
            }
        }
        record.ips = next;
        Ok(())
    }

    fn instance_spec(
        &self,
        group: &DesiredInstanceGroup,
        record: &InstanceRecord,
    ) -> DirectorResult<InstanceSpec> {
        let calculated = self.calculated.get(&group.name, record.az.as_deref());
        let cloud_properties = group.cloud_properties_for(record.az.as_deref(), calculated);
        let networks = network_settings(group, record);
        let vm_hash = spec_hash(&json!({
            "stemcell": group.stemcell,
            "cloud_properties": cloud_properties,
            "env": group.env,
            "networks": networks,
            "az": record.az,
        }))?;
        let jobs_hash = spec_hash(&json!({
            "jobs": group.jobs,
            "properties": group.properties,
        }))?;
        Ok(InstanceSpec {
            stemcell: group.stemcell.clone(),
            cloud_properties,
            env: group.env.clone(),
            networks,
            disk: group.persistent_disk.clone(),
            vm_hash,
            jobs_hash,
        })
    }

    fn classify(
        &self,
        group: &DesiredInstanceGroup,
        slot: &Slot,
        spec: &InstanceSpec,
    ) -> (Change, VmStatus, Vec<String>) {
        let record = &slot.record;
        let vm = match &record.vm {
            None => VmStatus::Absent,
            Some(vm) if self.lost.contains(&vm.cid) => VmStatus::Lost,
            Some(_) => VmStatus::Present,
        };
        if slot.is_new {
            let change = match group.lifecycle {
                Lifecycle::Errand => Change::Reserve,
                Lifecycle::Service => Change::Create,
            };
            return (change, vm, vec!["new instance".to_string()]);
        }
        if record.ignore {
            return (Change::NoOp, vm, vec!["ignored".to_string()]);
        }
        if record.unreachable.is_some() {
            return (Change::NoOp, vm, vec!["cpi unavailable".to_string()]);
        }
        if group.lifecycle == Lifecycle::Errand || record.state == InstanceState::Detached {
            return (Change::NoOp, vm, Vec::new());
        }

        let mut recreate = Vec::new();
        match vm {
            VmStatus::Lost => recreate.push("vm missing from cloud".to_string()),
            VmStatus::Absent => recreate.push("no vm".to_string()),
            VmStatus::Present => {}
        }
        if self.options.recreate {
            recreate.push("recreate requested".to_string());
        }
        if self.options.fix {
            recreate.push("fix requested".to_string());
        }
        match &record.applied {
            None => recreate.push("no applied spec".to_string()),
            Some(applied) if applied.stemcell != spec.stemcell => recreate.push(format!(
                "stemcell changed from {} to {}",
                applied.stemcell, spec.stemcell
            )),
            Some(applied) if applied.vm_hash != spec.vm_hash => {
                recreate.push("vm configuration changed".to_string())
            }
            Some(_) => {}
        }
        if !recreate.is_empty() {
            let hotswap = group.update.strategy == UpdateStrategy::DuplicateAndReplaceVm
                && vm == VmStatus::Present
                && record.static_ips().next().is_none();
            let change = if hotswap { Change::Hotswap } else { Change::Recreate };
            return (change, vm, recreate);
        }

        let mut update = Vec::new();
        if record.applied.as_ref().is_some_and(|a| a.jobs_hash != spec.jobs_hash) {
            update.push("jobs or properties changed".to_string());
        }
        if !disk_matches(spec.disk.as_ref(), self.disks.get(&record.uuid)) {
            update.push("persistent disk changed".to_string());
        }
        if update.is_empty() {
            (Change::NoOp, vm, Vec::new())
        } else {
            (Change::Update, vm, update)
        }
    }
}

fn drop_instance(record: InstanceRecord, deletions: &mut Vec<InstanceRecord>) -> DirectorResult<()> {
    if record.ignore {
        return Err(DirectorError::Validation(format!(
            "ignored instance '{}' would have to be deleted",
            record.name()
        )));
    }
    deletions.push(record);
    Ok(())
}

/// Lowest index not yet used; marks it used.
fn next_index(used: &mut BTreeSet<u32>) -> u32 {
    let mut index = 0;
    while used.contains(&index) {
        index += 1;
    }
    used.insert(index);
    index
}

fn az_counts<'r>(records: impl IntoIterator<Item = &'r InstanceRecord>) -> HashMap<Option<String>, usize> {
    let mut counts = HashMap::new();
    for r in records {
        *counts.entry(r.az.clone()).or_insert(0) += 1;
    }
    counts
}

/// Keep the current bootstrap instance; otherwise pick the lowest index.
fn assign_bootstrap(slots: &mut [Slot]) {
    let current = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.record.bootstrap && !s.is_new)
        .min_by_key(|(_, s)| s.record.index)
        .map(|(i, _)| i);
    let chosen = current.or_else(|| {
        slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.record.index)
            .map(|(i, _)| i)
    });
    for (i, slot) in slots.iter_mut().enumerate() {
        slot.record.bootstrap = Some(i) == chosen;
    }
}

fn network_settings(group: &DesiredInstanceGroup, record: &InstanceRecord) -> Value {
    let mut out = serde_json::Map::new();
    for net in &group.networks {
        let ip = record.ips.iter().find(|r| r.network == net.name).map(|r| r.ip);
        let cloud_properties = ip
            .and_then(|ip| net.subnets.iter().find(|s| s.contains(ip)))
            .map(|s| s.cloud_properties.clone())
            .unwrap_or_else(|| net.cloud_properties.clone());
        let kind = match net.kind {
            NetworkKind::Manual => "manual",
            NetworkKind::Dynamic => "dynamic",
            NetworkKind::Vip => "vip",
        };
        let mut entry = json!({
            "type": kind,
            "default": net.default,
            "cloud_properties": cloud_properties,
        });
        if let Some(ip) = ip {
            entry["ip"] = json!(ip.to_string());
        }
        out.insert(net.name.clone(), entry);
    }
    Value::Object(out)
}
