mod common;

use armada_director::DirectorError;
use serde_json::{Value, json};

use common::*;

#[tokio::test]
async fn uploaded_config_round_trips() {
    let h = Harness::new();
    let stored = h.director.latest_config("cloud", "default").unwrap();
    let content: Value = serde_json::from_str(&stored.content).unwrap();
    assert_eq!(content, cloud_config());
}

#[tokio::test]
async fn diff_reports_pending_changes() {
    let h = Harness::new();
    let current = h.director.latest_config("cloud", "default").unwrap();

    let same = h.director.diff_config("cloud", "default", &cloud_config().to_string()).unwrap();
    assert!(!same.changed);
    assert_eq!(same.current, Some(current.id));

    let mut changed = cloud_config();
    changed["vm_types"][0]["cloud_properties"]["instance_type"] = json!("s2");
    let diff = h.director.diff_config("cloud", "default", &changed.to_string()).unwrap();
    assert!(diff.changed);
}

#[tokio::test]
async fn deployments_pin_the_cloud_config_they_used() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    let pinned = h.director.deployment(DEPLOYMENT).unwrap().cloud_config_id.unwrap();

    let mut changed = cloud_config();
    changed["vm_types"][0]["cloud_properties"]["instance_type"] = json!("s2");
    let upload = h.director.upload_config("cloud", "default", &changed.to_string()).unwrap();
    assert!(upload.created);
    assert_ne!(upload.config.id, pinned);

    // A state command keeps using the pinned version.
    assert_done(&h.change("web/0", armada_director::Operation::Recreate).await);
    let vm = h.instance("web", 0).vm.unwrap();
    assert_eq!(vm.cloud_properties["instance_type"], "s1");

    h.deploy_ok(manifest(1, &["z1"])).await;
    let vm = h.instance("web", 0).vm.unwrap();
    assert_eq!(vm.cloud_properties["instance_type"], "s2");
    assert_eq!(h.director.deployment(DEPLOYMENT).unwrap().cloud_config_id, Some(upload.config.id));
}

#[tokio::test]
async fn runtime_config_addons_reach_every_group() {
    let h = Harness::new();
    h.upload(
        "runtime",
        json!({
            "addons": [{"name": "metrics", "jobs": [{"name": "node-exporter", "release": "monitor"}]}],
        }),
    );
    h.deploy_ok(manifest(1, &["z1"])).await;

    let applied = h.hub.calls_of("apply");
    let jobs: Vec<String> = applied[0].args["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["name"].as_str().unwrap().to_string())
        .collect();
    assert!(jobs.contains(&"node-exporter".to_string()), "{jobs:?}");
    assert_eq!(h.director.deployment(DEPLOYMENT).unwrap().runtime_config_ids.len(), 1);
}

#[tokio::test]
async fn pinned_configs_survive_cleanup() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    let pinned = h.director.deployment(DEPLOYMENT).unwrap().cloud_config_id.unwrap();
    for n in 0..5 {
        h.upload("runtime", json!({"addons": [], "tags": {"generation": n.to_string()}}));
    }

    let task = h.director.cleanup(false).unwrap().wait().await.unwrap();
    assert_done(&task);
    assert!(h.director.config_version(pinned).is_ok());
    let history = h.director.list_configs(Some("runtime"), true).unwrap();
    assert_eq!(history.len(), h.director.config().cleanup.keep_config_versions);
}

#[test]
fn deleting_every_version_of_a_config() {
    let h = Harness::new();
    h.upload("runtime", json!({"addons": []}));
    h.upload("runtime", json!({"addons": [], "tags": {"team": "infra"}}));
    assert_eq!(h.director.delete_config("runtime", "default").unwrap(), 2);
    assert!(matches!(
        h.director.latest_config("runtime", "default"),
        Err(DirectorError::NotFound { .. })
    ));
}
