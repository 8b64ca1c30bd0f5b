//! Disk Manager.
//!
//! An instance owns at most one active persistent disk. Disks are never
//! deleted when they leave an instance: they are orphaned, and only
//! `delete_disk` or `cleanup` removes them from the cloud. Every change is
//! written with [`StateStore::apply`] together with the owning instance
//! row, so a disk can never reference a missing instance.

use std::sync::Arc;

use armada_core::desired::DesiredDisk;
use armada_cpi::{CpiRouter, VmMetadata, tolerate_not_found};
use armada_journal::{EventJournal, EventSpec};
use armada_state::{
    DiskRecord, InstanceRecord, Mutation, SnapshotRecord, StateStore, now_epoch,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::AgentFactory;
use crate::error::{DirectorError, DirectorResult};

/// Whether the instance's current disk already satisfies `desired`.
pub fn disk_matches(desired: Option<&DesiredDisk>, current: Option<&DiskRecord>) -> bool {
    match (desired, current) {
        (None, None) => true,
        (Some(d), Some(c)) => d.size == c.size && d.cloud_properties == c.cloud_properties,
        _ => false,
    }
}

/// Outcome of [`DiskManager::delete_disk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskDeletion {
    Deleted,
    /// Nothing recorded under that CID.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct DiskManager {
    store: StateStore,
    journal: EventJournal,
    router: CpiRouter,
    agents: Arc<dyn AgentFactory>,
    parent: Option<u64>,
}

impl DiskManager {
    pub fn new(
        store: StateStore,
        journal: EventJournal,
        router: CpiRouter,
        agents: Arc<dyn AgentFactory>,
    ) -> Self {
        Self {
            store,
            journal,
            router,
            agents,
            parent: None,
        }
    }

    /// Nest every event under `parent`.
    pub fn with_parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }

    /// The instance's active, attached disk.
    pub fn active_disk(&self, record: &InstanceRecord) -> DirectorResult<Option<DiskRecord>> {
        Ok(self
            .store
            .disks_for_instance(&record.uuid)?
            .into_iter()
            .find(|d| d.active && !d.is_orphaned()))
    }

    /// Converge the instance's persistent disk onto `desired`.
    ///
    /// Matching disks are left alone without any CPI call. A changed spec
    /// migrates the data to a new disk and orphans the old one; a removed
    /// disk is orphaned.
    pub async fn ensure_disk(
        &self,
        record: &mut InstanceRecord,
        desired: Option<&DesiredDisk>,
    ) -> DirectorResult<()> {
        let current = self.active_disk(record)?;
        if disk_matches(desired, current.as_ref()) {
            return Ok(());
        }
        match (desired, current) {
            (Some(d), None) => {
                let disk = self.create_and_attach(record, d).await?;
                record.disk_cids = vec![disk.cid.clone()];
                self.store.apply(&[
                    Mutation::PutInstance(record.clone()),
                    Mutation::PutDisk(disk),
                ])?;
            }
            (Some(d), Some(old)) => self.migrate(record, d, old).await?,
            (None, Some(old)) => {
                self.unmount_and_detach(record, &old.cid).await?;
                self.orphan(record, old)?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn create_and_attach(
        &self,
        record: &InstanceRecord,
        desired: &DesiredDisk,
    ) -> DirectorResult<DiskRecord> {
        let vm = record
            .vm
            .as_ref()
            .ok_or_else(|| DirectorError::Conflict(format!("'{}' has no vm to attach a disk to", record.name())))?;
        let cpi = self.router.for_az(record.az.as_deref())?;

        let scope = self.journal.begin(
            EventSpec::new("create", "disk", "")
                .deployment(&record.deployment)
                .instance(record.name())
                .context(json!({"size": desired.size}))
                .parent(self.parent),
        )?;
        let created = cpi
            .provider
            .create_disk(desired.size, &desired.cloud_properties, Some(&vm.cid))
            .await;
        let cid = match created {
            Ok(cid) => {
                scope.finish_with(json!({"size": desired.size, "cid": cid}))?;
                cid
            }
            Err(e) => {
                scope.fail(&e)?;
                return Err(e.into());
            }
        };
        info!(instance = %record.name(), %cid, size = desired.size, "created persistent disk");

        cpi.provider.attach_disk(&vm.cid, &cid).await?;
        self.agents.connect(&vm.agent_id).mount_disk(&cid).await?;

        Ok(DiskRecord {
            cid,
            size: desired.size,
            cloud_properties: desired.cloud_properties.clone(),
            cpi: cpi.name,
            deployment: record.deployment.clone(),
            instance: Some(record.uuid.clone()),
            instance_name: record.name(),
            az: record.az.clone(),
            orphaned_at: None,
            snapshots: Vec::new(),
            active: true,
            created_at: now_epoch(),
        })
    }

    async fn migrate(
        &self,
        record: &mut InstanceRecord,
        desired: &DesiredDisk,
        old: DiskRecord,
    ) -> DirectorResult<()> {
        debug!(instance = %record.name(), from = %old.cid, "migrating persistent disk");
        let mut new = self.create_and_attach(record, desired).await?;
        // Inactive until the data has moved.
        new.active = false;
        record.disk_cids = vec![old.cid.clone(), new.cid.clone()];
        self.store.apply(&[
            Mutation::PutInstance(record.clone()),
            Mutation::PutDisk(new.clone()),
        ])?;

        if let Some(vm) = &record.vm {
            self.agents
                .connect(&vm.agent_id)
                .migrate_disk(&old.cid, &new.cid)
                .await?;
        }
        self.unmount_and_detach(record, &old.cid).await?;

        new.active = true;
        record.disk_cids = vec![new.cid.clone()];
        let mut orphaned = old;
        orphaned.orphan();
        self.orphan_event(&orphaned)?;
        self.store.apply(&[
            Mutation::PutInstance(record.clone()),
            Mutation::PutDisk(new),
            Mutation::PutDisk(orphaned),
        ])?;
        Ok(())
    }

    async fn unmount_and_detach(&self, record: &InstanceRecord, cid: &str) -> DirectorResult<()> {
        let Some(vm) = &record.vm else {
            return Ok(());
        };
        self.agents.connect(&vm.agent_id).unmount_disk(cid).await?;
        let cpi = self.router.for_disposal(vm.cpi.as_deref(), record.az.as_deref())?;
        tolerate_not_found(cpi.provider.detach_disk(&vm.cid, cid).await, "detach_disk", cid)?;
        Ok(())
    }

    /// Detach and orphan, writing instance and disk together.
    fn orphan(&self, record: &mut InstanceRecord, mut disk: DiskRecord) -> DirectorResult<()> {
        disk.orphan();
        record.disk_cids.retain(|c| *c != disk.cid);
        self.orphan_event(&disk)?;
        self.store.apply(&[
            Mutation::PutInstance(record.clone()),
            Mutation::PutDisk(disk),
        ])?;
        Ok(())
    }

    fn orphan_event(&self, disk: &DiskRecord) -> DirectorResult<()> {
        let scope = self.journal.begin(
            EventSpec::new("orphan", "disk", &disk.cid)
                .deployment(&disk.deployment)
                .instance(&disk.instance_name)
                .context(json!({"orphaned_at": disk.orphaned_at}))
                .parent(self.parent),
        )?;
        scope.finish()?;
        info!(cid = %disk.cid, instance = %disk.instance_name, "orphaned persistent disk");
        Ok(())
    }

    /// Attach every recorded disk to the instance's (new) VM.
    pub async fn attach_disks(&self, record: &InstanceRecord) -> DirectorResult<()> {
        let Some(vm) = &record.vm else {
            return Ok(());
        };
        let cpi = self.router.named(vm.cpi.as_deref())?;
        let agent = self.agents.connect(&vm.agent_id);
        for cid in &record.disk_cids {
            cpi.provider.attach_disk(&vm.cid, cid).await?;
            agent.mount_disk(cid).await?;
            debug!(instance = %record.name(), %cid, "attached disk");
        }
        Ok(())
    }

    /// Detach every recorded disk from the instance's current VM.
    pub async fn detach_disks(&self, record: &InstanceRecord) -> DirectorResult<()> {
        for cid in &record.disk_cids {
            self.unmount_and_detach(record, cid).await?;
        }
        Ok(())
    }

    /// Orphan every disk of an instance that is about to be deleted.
    /// Returns the orphaned records; the caller writes them with the
    /// instance deletion.
    pub fn orphan_all(&self, record: &InstanceRecord) -> DirectorResult<Vec<DiskRecord>> {
        let mut orphaned = Vec::new();
        for mut disk in self.store.disks_for_instance(&record.uuid)? {
            if disk.is_orphaned() {
                continue;
            }
            disk.orphan();
            self.orphan_event(&disk)?;
            orphaned.push(disk);
        }
        Ok(orphaned)
    }

    /// Operator `orphan-disk`: detach an attached disk and orphan it.
    pub async fn orphan_disk(&self, cid: &str) -> DirectorResult<DiskRecord> {
        let disk = self
            .store
            .get_disk(cid)?
            .ok_or_else(|| DirectorError::not_found("disk", cid))?;
        let Some(owner) = disk.instance.clone() else {
            return Err(DirectorError::Conflict(format!("disk '{cid}' is already orphaned")));
        };
        let mut record = self
            .store
            .find_instance(&disk.deployment, &owner)?
            .ok_or_else(|| DirectorError::not_found("instance", &owner))?;
        self.unmount_and_detach(&record, cid).await?;
        self.orphan(&mut record, disk)?;
        self.store
            .get_disk(cid)?
            .ok_or_else(|| DirectorError::not_found("disk", cid))
    }

    /// Operator `attach-disk`: adopt an orphaned disk, orphaning whatever
    /// disk the instance had.
    pub async fn attach_disk(&self, record: &mut InstanceRecord, cid: &str) -> DirectorResult<()> {
        let mut disk = self
            .store
            .get_disk(cid)?
            .ok_or_else(|| DirectorError::not_found("disk", cid))?;
        if !disk.is_orphaned() {
            return Err(DirectorError::Conflict(format!(
                "disk '{cid}' is attached to '{}'",
                disk.instance_name
            )));
        }

        let mut writes = Vec::new();
        if let Some(mut previous) = self.active_disk(record)? {
            self.unmount_and_detach(record, &previous.cid).await?;
            previous.orphan();
            self.orphan_event(&previous)?;
            writes.push(Mutation::PutDisk(previous));
        }

        if let Some(vm) = &record.vm {
            let cpi = self.router.named(vm.cpi.as_deref())?;
            cpi.provider.attach_disk(&vm.cid, cid).await?;
            self.agents.connect(&vm.agent_id).mount_disk(cid).await?;
        }

        disk.instance = Some(record.uuid.clone());
        disk.instance_name = record.name();
        disk.deployment = record.deployment.clone();
        disk.orphaned_at = None;
        disk.active = true;
        record.disk_cids = vec![cid.to_string()];

        let scope = self.journal.begin(
            EventSpec::new("attach", "disk", cid)
                .deployment(&record.deployment)
                .instance(record.name())
                .parent(self.parent),
        )?;
        writes.push(Mutation::PutInstance(record.clone()));
        writes.push(Mutation::PutDisk(disk));
        let applied = self.store.apply(&writes);
        scope.complete(&applied);
        applied?;
        info!(instance = %record.name(), %cid, "attached orphaned disk");
        Ok(())
    }

    /// Delete an orphaned disk and its snapshots.
    pub async fn delete_disk(&self, cid: &str) -> DirectorResult<DiskDeletion> {
        let Some(disk) = self.store.get_disk(cid)? else {
            info!(%cid, "disk not found; nothing to delete");
            return Ok(DiskDeletion::NotFound);
        };
        if !disk.is_orphaned() {
            return Err(DirectorError::Conflict(format!(
                "disk '{cid}' is attached to '{}'; orphan it first",
                disk.instance_name
            )));
        }

        let scope = self.journal.begin(
            EventSpec::new("delete", "disk", cid)
                .deployment(&disk.deployment)
                .instance(&disk.instance_name)
                .parent(self.parent),
        )?;
        let result = self.destroy(&disk).await;
        scope.complete(&result);
        result?;
        Ok(DiskDeletion::Deleted)
    }

    async fn destroy(&self, disk: &DiskRecord) -> DirectorResult<()> {
        let cpi = self.router.for_disposal(disk.cpi.as_deref(), disk.az.as_deref())?;
        for snapshot in &disk.snapshots {
            tolerate_not_found(
                cpi.provider.delete_snapshot(&snapshot.cid).await,
                "delete_snapshot",
                &snapshot.cid,
            )?;
        }
        tolerate_not_found(cpi.provider.delete_disk(&disk.cid).await, "delete_disk", &disk.cid)?;
        self.store.apply(&[Mutation::DeleteDisk(disk.cid.clone())])?;
        info!(cid = %disk.cid, "deleted orphaned disk");
        Ok(())
    }

    /// Delete orphaned disks. Without `all`, the `keep` most recently
    /// orphaned disks survive. Returns how many were deleted.
    pub async fn cleanup(&self, all: bool, keep: usize) -> DirectorResult<usize> {
        let mut orphans = self.store.list_orphaned_disks()?;
        orphans.sort_by(|a, b| b.orphaned_at.cmp(&a.orphaned_at).then(b.created_at.cmp(&a.created_at)));
        let doomed = if all {
            orphans
        } else {
            orphans.into_iter().skip(keep).collect()
        };
        let mut deleted = 0;
        for disk in doomed {
            match self.delete_disk(&disk.cid).await? {
                DiskDeletion::Deleted => deleted += 1,
                DiskDeletion::NotFound => {}
            }
        }
        info!(deleted, all, "orphaned disk cleanup finished");
        Ok(deleted)
    }

    /// Snapshot the instance's active disk.
    pub async fn take_snapshot(&self, record: &InstanceRecord) -> DirectorResult<Option<SnapshotRecord>> {
        let Some(mut disk) = self.active_disk(record)? else {
            debug!(instance = %record.name(), "no persistent disk to snapshot");
            return Ok(None);
        };
        let cpi = self.router.for_disposal(disk.cpi.as_deref(), disk.az.as_deref())?;
        let metadata: VmMetadata = [
            ("deployment".to_string(), record.deployment.clone()),
            ("instance_group".to_string(), record.group.clone()),
            ("index".to_string(), record.index.to_string()),
            ("instance_id".to_string(), record.uuid.clone()),
        ]
        .into_iter()
        .collect();

        let scope = self.journal.begin(
            EventSpec::new("snapshot", "disk", &disk.cid)
                .deployment(&record.deployment)
                .instance(record.name())
                .parent(self.parent),
        )?;
        let cid = match cpi.provider.snapshot_disk(&disk.cid, &metadata).await {
            Ok(cid) => cid,
            Err(e) => {
                scope.fail(&e)?;
                return Err(e.into());
            }
        };
        scope.finish_with(json!({"snapshot": cid}))?;

        let snapshot = SnapshotRecord {
            cid,
            created_at: now_epoch(),
            clean: false,
        };
        disk.snapshots.push(snapshot.clone());
        self.store.apply(&[Mutation::PutDisk(disk)])?;
        Ok(Some(snapshot))
    }

    /// Delete one snapshot wherever it is recorded.
    pub async fn delete_snapshot(&self, snapshot_cid: &str) -> DirectorResult<()> {
        let disk = self
            .store
            .list_disks()?
            .into_iter()
            .find(|d| d.snapshots.iter().any(|s| s.cid == snapshot_cid));
        let Some(mut disk) = disk else {
            warn!(snapshot = %snapshot_cid, "snapshot not recorded; nothing to delete");
            return Ok(());
        };
        let cpi = self.router.for_disposal(disk.cpi.as_deref(), disk.az.as_deref())?;
        tolerate_not_found(
            cpi.provider.delete_snapshot(snapshot_cid).await,
            "delete_snapshot",
            snapshot_cid,
        )?;
        disk.snapshots.retain(|s| s.cid != snapshot_cid);
        self.store.apply(&[Mutation::PutDisk(disk)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_cpi::{CloudProvider, DummyCloud};
    use armada_state::VmRecord;

    use crate::agent::DummyAgentHub;

    struct Fixture {
        store: StateStore,
        cloud: DummyCloud,
        hub: DummyAgentHub,
        disks: DiskManager,
    }

    fn fixture() -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        let hub = DummyAgentHub::new();
        let disks = DiskManager::new(
            store.clone(),
            EventJournal::new(store.clone()),
            CpiRouter::single(Arc::new(cloud.clone())),
            Arc::new(hub.clone()),
        );
        Fixture {
            store,
            cloud,
            hub,
            disks,
        }
    }

    async fn instance(f: &Fixture) -> InstanceRecord {
        let mut record = InstanceRecord::new("simple", "db", 0, "uuid-0", Some("z1".into()));
        let cid = f
            .cloud
            .create_vm(&armada_cpi::CreateVmRequest {
                agent_id: "agent-0".into(),
                stemcell: "ubuntu/1".into(),
                cloud_properties: json!({}),
                networks: json!({}),
                disk_cids: vec![],
                env: json!({}),
            })
            .await
            .unwrap();
        record.vm = Some(VmRecord {
            cid,
            agent_id: "agent-0".into(),
            cpi: None,
            cloud_properties: json!({}),
            env: json!({}),
            stemcell: "ubuntu/1".into(),
            active: true,
            created_at: 0,
        });
        f.store.put_instance(&record).unwrap();
        record
    }

    fn disk(size: u64) -> DesiredDisk {
        DesiredDisk {
            size,
            cloud_properties: json!({}),
        }
    }

    #[tokio::test]
    async fn creates_then_leaves_matching_disk_alone() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        assert_eq!(record.disk_cids.len(), 1);
        assert_eq!(f.hub.mounted("agent-0"), record.disk_cids);

        f.cloud.clear_invocations();
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        assert!(f.cloud.invocations().is_empty());
    }

    #[tokio::test]
    async fn resize_migrates_and_orphans_old_disk() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        let old = record.disk_cids[0].clone();

        f.disks.ensure_disk(&mut record, Some(&disk(2048))).await.unwrap();
        let new = record.disk_cids[0].clone();
        assert_ne!(old, new);
        assert_eq!(record.disk_cids.len(), 1);

        let orphaned = f.store.get_disk(&old).unwrap().unwrap();
        assert!(orphaned.is_orphaned());
        assert!(orphaned.instance.is_none());
        assert_eq!(orphaned.instance_name, "db/uuid-0");
        let active = f.store.get_disk(&new).unwrap().unwrap();
        assert!(active.active);
        assert_eq!(active.size, 2048);
        assert_eq!(f.hub.calls_of("migrate_disk").len(), 1);
        assert_eq!(f.hub.mounted("agent-0"), vec![new]);
    }

    #[tokio::test]
    async fn removing_disk_orphans_it() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        f.disks.ensure_disk(&mut record, None).await.unwrap();
        assert!(record.disk_cids.is_empty());
        assert_eq!(f.store.list_orphaned_disks().unwrap().len(), 1);
        let events = f.store.list_events(&Default::default()).unwrap();
        assert!(events.iter().any(|e| e.action == "orphan" && e.instance.as_deref() == Some("db/uuid-0")));
    }

    #[tokio::test]
    async fn delete_missing_disk_is_a_noop() {
        let f = fixture();
        assert_eq!(f.disks.delete_disk("nope").await.unwrap(), DiskDeletion::NotFound);
    }

    #[tokio::test]
    async fn attached_disk_cannot_be_deleted() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        let err = f.disks.delete_disk(&record.disk_cids[0]).await.unwrap_err();
        assert!(err.to_string().contains("orphan it first"));
    }

    #[tokio::test]
    async fn cleanup_keeps_newest_and_is_idempotent() {
        let f = fixture();
        let mut record = instance(&f).await;
        for size in [1, 2, 3] {
            f.disks.ensure_disk(&mut record, Some(&disk(size))).await.unwrap();
        }
        f.disks.ensure_disk(&mut record, None).await.unwrap();
        assert_eq!(f.store.list_orphaned_disks().unwrap().len(), 3);

        assert_eq!(f.disks.cleanup(false, 1).await.unwrap(), 2);
        assert_eq!(f.disks.cleanup(false, 1).await.unwrap(), 0);
        assert_eq!(f.disks.cleanup(true, 1).await.unwrap(), 1);
        assert!(f.cloud.disk_cids().is_empty());
    }

    #[tokio::test]
    async fn orphan_then_attach_round_trip() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        let cid = record.disk_cids[0].clone();

        let orphaned = f.disks.orphan_disk(&cid).await.unwrap();
        assert!(orphaned.is_orphaned());
        let mut record = f.store.find_instance("simple", "uuid-0").unwrap().unwrap();
        assert!(record.disk_cids.is_empty());

        f.disks.attach_disk(&mut record, &cid).await.unwrap();
        let disk = f.store.get_disk(&cid).unwrap().unwrap();
        assert_eq!(disk.instance.as_deref(), Some("uuid-0"));
        assert!(disk.orphaned_at.is_none());
        assert_eq!(record.disk_cids, vec![cid]);
    }

    #[tokio::test]
    async fn snapshots_follow_the_disk_into_deletion() {
        let f = fixture();
        let mut record = instance(&f).await;
        f.disks.ensure_disk(&mut record, Some(&disk(1024))).await.unwrap();
        let snap = f.disks.take_snapshot(&record).await.unwrap().unwrap();
        assert_eq!(f.cloud.snapshot_cids(), vec![snap.cid.clone()]);

        f.disks.ensure_disk(&mut record, None).await.unwrap();
        f.disks.cleanup(true, 0).await.unwrap();
        assert!(f.cloud.snapshot_cids().is_empty());
    }
}
