//! VM creation and deletion for instances.

use std::collections::BTreeMap;

use armada_cpi::{CpiError, CpiRouter, CreateVmRequest, RoutedCpi, VmMetadata, tolerate_not_found};
use armada_journal::{EventJournal, EventSpec};
use armada_state::{InstanceRecord, VmRecord, now_epoch};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::DirectorResult;
use crate::planner::InstanceSpec;

#[derive(Debug, Clone)]
pub struct VmCreator {
    router: CpiRouter,
    journal: EventJournal,
    director: String,
    tags: BTreeMap<String, String>,
    parent: Option<u64>,
}

impl VmCreator {
    pub fn new(router: CpiRouter, journal: EventJournal, director: &str) -> Self {
        Self {
            router,
            journal,
            director: director.to_string(),
            tags: BTreeMap::new(),
            parent: None,
        }
    }

    /// Extra metadata (runtime-config and manifest tags) for every VM.
    pub fn tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_parent(mut self, parent: Option<u64>) -> Self {
        self.parent = parent;
        self
    }

    fn metadata(&self, record: &InstanceRecord, created_at: u64) -> VmMetadata {
        let mut metadata: VmMetadata = self.tags.clone();
        metadata.extend([
            ("director".to_string(), self.director.clone()),
            ("deployment".to_string(), record.deployment.clone()),
            ("instance_group".to_string(), record.group.clone()),
            ("index".to_string(), record.index.to_string()),
            ("id".to_string(), record.uuid.clone()),
            ("name".to_string(), record.name()),
            ("created_at".to_string(), created_at.to_string()),
        ]);
        metadata
    }

    /// Create a VM for `record` through the CPI serving its AZ.
    ///
    /// A VM whose metadata cannot be set is deleted again so no
    /// untracked VM is left behind.
    pub async fn create_vm(&self, record: &InstanceRecord, spec: &InstanceSpec) -> DirectorResult<VmRecord> {
        let cpi = self.router.for_az(record.az.as_deref())?;
        let agent_id = uuid::Uuid::new_v4().to_string();
        let request = CreateVmRequest {
            agent_id: agent_id.clone(),
            stemcell: spec.stemcell.clone(),
            cloud_properties: spec.cloud_properties.clone(),
            networks: spec.networks.clone(),
            disk_cids: record.disk_cids.clone(),
            env: spec.env.clone(),
        };

        let scope = self.journal.begin(
            EventSpec::new("create", "vm", "")
                .deployment(&record.deployment)
                .instance(record.name())
                .context(json!({"az": record.az, "cpi": cpi.name}))
                .parent(self.parent),
        )?;
        let cid = match cpi.provider.create_vm(&request).await {
            Ok(cid) => cid,
            Err(e) => {
                scope.fail(&e)?;
                return Err(e.into());
            }
        };

        let created_at = now_epoch();
        if let Err(e) = self.tag(&cpi, &cid, record, created_at).await {
            warn!(instance = %record.name(), %cid, error = %e, "setting vm metadata failed; deleting vm");
            tolerate_not_found(cpi.provider.delete_vm(&cid).await, "delete_vm", &cid)?;
            scope.fail(&e)?;
            return Err(e.into());
        }
        scope.finish_with(json!({"az": record.az, "cpi": cpi.name, "cid": cid}))?;
        info!(instance = %record.name(), %cid, cpi = ?cpi.name, "created vm");

        Ok(VmRecord {
            cid,
            agent_id,
            cpi: cpi.name,
            cloud_properties: spec.cloud_properties.clone(),
            env: spec.env.clone(),
            stemcell: spec.stemcell.clone(),
            active: true,
            created_at,
        })
    }

    async fn tag(
        &self,
        cpi: &RoutedCpi,
        cid: &str,
        record: &InstanceRecord,
        created_at: u64,
    ) -> Result<(), CpiError> {
        match cpi.provider.set_vm_metadata(cid, &self.metadata(record, created_at)).await {
            Err(CpiError::NotSupported(method)) => {
                debug!(%cid, %method, "cpi does not support vm metadata");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete `vm` through the CPI it was created with. A VM the cloud no
    /// longer knows counts as deleted.
    pub async fn delete_vm(&self, record: &InstanceRecord, vm: &VmRecord) -> DirectorResult<()> {
        let cpi = self.router.for_disposal(vm.cpi.as_deref(), record.az.as_deref())?;
        let scope = self.journal.begin(
            EventSpec::new("delete", "vm", &vm.cid)
                .deployment(&record.deployment)
                .instance(record.name())
                .parent(self.parent),
        )?;
        let result = tolerate_not_found(cpi.provider.delete_vm(&vm.cid).await, "delete_vm", &vm.cid);
        scope.complete(&result);
        result?;
        info!(instance = %record.name(), cid = %vm.cid, "deleted vm");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_cpi::DummyCloud;
    use armada_state::{EventFilter, StateStore};
    use serde_json::Value;
    use std::sync::Arc;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            stemcell: "ubuntu/1.0".into(),
            cloud_properties: json!({"instance_type": "small"}),
            env: json!({}),
            networks: json!({}),
            disk: None,
            vm_hash: "v".into(),
            jobs_hash: "j".into(),
        }
    }

    fn creator(cloud: &DummyCloud, store: &StateStore) -> VmCreator {
        let router = CpiRouter::single(Arc::new(cloud.clone()));
        VmCreator::new(router, EventJournal::new(store.clone()), "armada")
            .tags([("team".to_string(), "core".to_string())].into_iter().collect())
    }

    #[tokio::test]
    async fn created_vm_carries_metadata_and_tags() {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        let record = InstanceRecord::new("simple", "web", 2, "u-2", None);

        let vm = creator(&cloud, &store).create_vm(&record, &spec()).await.unwrap();
        let meta = cloud.vm(&vm.cid).unwrap().metadata;
        assert_eq!(meta["director"], "armada");
        assert_eq!(meta["index"], "2");
        assert_eq!(meta["name"], "web/u-2");
        assert_eq!(meta["team"], "core");
        assert_eq!(vm.stemcell, "ubuntu/1.0");

        let events = store.list_events(&EventFilter::default()).unwrap();
        assert!(events.iter().any(|e| e.object_type == "vm" && e.context["cid"] == Value::String(vm.cid.clone())));
    }

    #[tokio::test]
    async fn metadata_failure_deletes_the_vm() {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        cloud.fail_next("set_vm_metadata", CpiError::cloud("boom"));
        let record = InstanceRecord::new("simple", "web", 0, "u-0", None);

        assert!(creator(&cloud, &store).create_vm(&record, &spec()).await.is_err());
        assert!(cloud.vm_cids().is_empty());
    }

    #[tokio::test]
    async fn unsupported_metadata_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        cloud.fail_next("set_vm_metadata", CpiError::NotSupported("set_vm_metadata".into()));
        let record = InstanceRecord::new("simple", "web", 0, "u-0", None);
        let vm = creator(&cloud, &store).create_vm(&record, &spec()).await.unwrap();
        assert_eq!(cloud.vm_cids(), vec![vm.cid]);
    }

    #[tokio::test]
    async fn deleting_a_missing_vm_succeeds() {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        let record = InstanceRecord::new("simple", "web", 0, "u-0", None);
        let creator = creator(&cloud, &store);
        let vm = creator.create_vm(&record, &spec()).await.unwrap();
        cloud.remove_vm_out_of_band(&vm.cid);
        creator.delete_vm(&record, &vm).await.unwrap();
    }
}
