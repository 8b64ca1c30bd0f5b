//! Shared harness for director integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use armada_core::DirectorConfig;
use armada_cpi::{CpiRegistry, DummyCloud};
use armada_director::{DeployOptions, Director, DummyAgentHub, InstanceSelector, MemorySecretStore, Operation};
use armada_state::{EventFilter, EventRecord, InstanceRecord, StateStore, TaskRecord, TaskState};
use serde_json::{Value, json};

pub const DEPLOYMENT: &str = "simple";

pub struct Harness {
    pub director: Director,
    pub cpis: Arc<CpiRegistry>,
    pub cloud: DummyCloud,
    pub hub: DummyAgentHub,
    pub secrets: MemorySecretStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hub(DummyAgentHub::new())
    }

    pub fn with_hub(hub: DummyAgentHub) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let cloud = DummyCloud::new("default");
        let cpis = Arc::new(CpiRegistry::new(Arc::new(cloud.clone())));
        let secrets = MemorySecretStore::new();
        let director = Director::new(
            store,
            cpis.clone(),
            Arc::new(hub.clone()),
            Arc::new(secrets.clone()),
            DirectorConfig::default(),
        );
        let harness = Self {
            director,
            cpis,
            cloud,
            hub,
            secrets,
        };
        harness.upload("cloud", cloud_config());
        harness
    }

    pub fn upload(&self, kind: &str, content: Value) {
        self.director
            .upload_config(kind, "default", &content.to_string())
            .unwrap();
    }

    pub async fn deploy(&self, manifest: Value) -> TaskRecord {
        self.deploy_with(manifest, DeployOptions::default()).await
    }

    pub async fn deploy_with(&self, manifest: Value, options: DeployOptions) -> TaskRecord {
        self.director.deploy(manifest, options).unwrap().wait().await.unwrap()
    }

    /// Deploy and fail the test unless the task succeeded.
    pub async fn deploy_ok(&self, manifest: Value) -> TaskRecord {
        let task = self.deploy(manifest).await;
        assert_done(&task);
        task
    }

    pub async fn change(&self, selector: &str, op: Operation) -> TaskRecord {
        self.change_with(selector, op, DeployOptions::default()).await
    }

    pub async fn change_with(&self, selector: &str, op: Operation, options: DeployOptions) -> TaskRecord {
        self.director
            .change_state(DEPLOYMENT, InstanceSelector::parse(selector), op, options)
            .unwrap()
            .wait()
            .await
            .unwrap()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.director.instances(DEPLOYMENT).unwrap()
    }

    pub fn instance(&self, group: &str, index: u32) -> InstanceRecord {
        self.instances()
            .into_iter()
            .find(|r| r.group == group && r.index == index)
            .unwrap_or_else(|| panic!("no instance {group}/{index}"))
    }

    /// Instance events for the deployment, oldest first.
    pub fn instance_events(&self) -> Vec<EventRecord> {
        let mut events = self
            .director
            .events(&EventFilter {
                deployment: Some(DEPLOYMENT.to_string()),
                object_type: Some("instance".to_string()),
                ..Default::default()
            })
            .unwrap();
        events.sort_by_key(|e| e.id);
        events
    }

    /// `(start, finish)` event ids per instance name for one action.
    pub fn spans(&self, action: &str) -> HashMap<String, (u64, u64)> {
        let mut spans: HashMap<String, (u64, u64)> = HashMap::new();
        let mut starts: HashMap<u64, String> = HashMap::new();
        for event in self.instance_events().into_iter().filter(|e| e.action == action) {
            match event.parent_id.and_then(|p| starts.get(&p)) {
                Some(name) => {
                    if let Some(span) = spans.get_mut(name) {
                        span.1 = event.id;
                    }
                }
                None => {
                    spans.insert(event.object_name.clone(), (event.id, 0));
                    starts.insert(event.id, event.object_name);
                }
            }
        }
        spans
    }
}

pub fn assert_done(task: &TaskRecord) {
    assert_eq!(task.state, TaskState::Done, "task failed: {:?}", task.result);
}

pub fn assert_failed(task: &TaskRecord, needle: &str) {
    assert_eq!(task.state, TaskState::Error, "task unexpectedly succeeded: {:?}", task.result);
    let message = task.result.clone().unwrap_or_default();
    assert!(message.contains(needle), "'{message}' does not mention '{needle}'");
}

pub fn latency() -> DummyAgentHub {
    DummyAgentHub::new().with_latency(Duration::from_millis(20))
}

pub fn cloud_config() -> Value {
    json!({
        "azs": [
            {"name": "z1", "cloud_properties": {"zone": "a"}},
            {"name": "z2", "cloud_properties": {"zone": "b"}},
        ],
        "vm_types": [
            {"name": "small", "cloud_properties": {"instance_type": "s1"}},
            {"name": "large", "cloud_properties": {"instance_type": "l1"}},
        ],
        "disk_types": [{"name": "fast", "disk_size": 4096, "cloud_properties": {"type": "ssd"}}],
        "networks": [{
            "name": "private",
            "type": "manual",
            "subnets": [
                {
                    "range": "10.0.1.0/24",
                    "gateway": "10.0.1.1",
                    "reserved": ["10.0.1.2 - 10.0.1.9"],
                    "static": ["10.0.1.10 - 10.0.1.19"],
                    "az": "z1",
                },
                {
                    "range": "10.0.2.0/24",
                    "gateway": "10.0.2.1",
                    "reserved": ["10.0.2.2 - 10.0.2.9"],
                    "static": ["10.0.2.10 - 10.0.2.19"],
                    "az": "z2",
                },
            ],
        }],
        "compilation": {"workers": 2, "az": "z1", "vm_type": "small", "network": "private"},
    })
}

/// One instance group named `web` on the `private` network.
pub fn manifest(instances: u32, azs: &[&str]) -> Value {
    json!({
        "name": DEPLOYMENT,
        "releases": [{"name": "app", "version": "1"}],
        "stemcells": [{"alias": "default", "os": "ubuntu", "version": "1"}],
        "update": {
            "canaries": 1,
            "max_in_flight": 1,
            "canary_watch_time": 0,
            "update_watch_time": 0,
        },
        "instance_groups": [group("web", instances, azs)],
    })
}

pub fn group(name: &str, instances: u32, azs: &[&str]) -> Value {
    json!({
        "name": name,
        "instances": instances,
        "azs": azs,
        "networks": [{"name": "private"}],
        "vm_type": "small",
        "stemcell": "default",
        "jobs": [{
            "name": "server",
            "release": "app",
            "properties": {"port": 8080},
            "packages": [{"name": "runtime", "version": "1"}],
        }],
    })
}
