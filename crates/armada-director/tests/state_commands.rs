mod common;

use armada_director::{DeployOptions, Operation};
use armada_state::{InstanceState, TaskState};
use serde_json::json;

use common::*;

fn with_disk(instances: u32) -> serde_json::Value {
    let mut m = manifest(instances, &["z1"]);
    m["instance_groups"][0]["persistent_disk"] = json!(1024);
    m
}

#[tokio::test]
async fn soft_stop_keeps_the_vm() {
    let h = Harness::new();
    h.deploy_ok(manifest(2, &["z1"])).await;
    let before = h.instance("web", 0);

    assert_done(&h.change("web/0", Operation::Stop).await);
    let stopped = h.instance("web", 0);
    assert_eq!(stopped.state, InstanceState::Stopped);
    assert_eq!(stopped.vm_cid(), before.vm_cid());
    assert_eq!(h.instance("web", 1).state, InstanceState::Running);
    assert_eq!(h.hub.calls_of("stop").len(), 1);
}

#[tokio::test]
async fn hard_stop_then_start_keeps_disk_and_ips() {
    let h = Harness::new();
    h.deploy_ok(with_disk(1)).await;
    let before = h.instance("web", 0);
    let disk = before.disk_cids[0].clone();

    assert_done(&h.change("web/0", Operation::StopHard).await);
    let detached = h.instance("web", 0);
    assert_eq!(detached.state, InstanceState::Detached);
    assert!(detached.vm.is_none());
    assert_eq!(detached.disk_cids, vec![disk.clone()]);
    assert_eq!(detached.ips, before.ips);
    assert!(h.cloud.vm(before.vm_cid().unwrap()).is_none());
    assert!(h.cloud.disk(&disk).unwrap().attached_to.is_none());

    assert_done(&h.change("web/0", Operation::Start).await);
    let started = h.instance("web", 0);
    assert_eq!(started.state, InstanceState::Running);
    assert_eq!(started.uuid, before.uuid);
    assert_eq!(started.ips, before.ips);
    let vm = started.vm_cid().unwrap().to_string();
    assert_ne!(Some(vm.as_str()), before.vm_cid());
    assert_eq!(h.cloud.disk(&disk).unwrap().attached_to.as_deref(), Some(vm.as_str()));
    assert_eq!(h.hub.mounted(&started.vm.unwrap().agent_id), vec![disk]);
}

#[tokio::test]
async fn restart_bounces_jobs_in_place() {
    let h = Harness::new();
    h.deploy_ok(manifest(2, &["z1"])).await;
    let before: Vec<_> = h.instances().iter().map(|i| i.vm_cid().unwrap().to_string()).collect();
    h.hub.clear_calls();

    assert_done(&h.change("web", Operation::Restart).await);
    let after: Vec<_> = h.instances().iter().map(|i| i.vm_cid().unwrap().to_string()).collect();
    assert_eq!(before, after);
    assert_eq!(h.hub.calls_of("stop").len(), 2);
    assert_eq!(h.hub.calls_of("start").len(), 2);
}

#[tokio::test]
async fn recreate_by_index_or_uuid_keeps_identity() {
    let h = Harness::new();
    h.deploy_ok(manifest(3, &["z1"])).await;
    let untouched = h.instance("web", 2);

    let first = h.instance("web", 0);
    assert_done(&h.change("web/0", Operation::Recreate).await);
    let recreated = h.instance("web", 0);
    assert_eq!(recreated.uuid, first.uuid);
    assert_ne!(recreated.vm_cid(), first.vm_cid());

    let second = h.instance("web", 1);
    assert_done(&h.change(&format!("web/{}", second.uuid), Operation::Recreate).await);
    let recreated = h.instance("web", 1);
    assert_eq!(recreated.uuid, second.uuid);
    assert_ne!(recreated.vm_cid(), second.vm_cid());

    assert_eq!(h.instance("web", 2).vm_cid(), untouched.vm_cid());
}

#[tokio::test]
async fn recreate_fix_replaces_a_vanished_vm() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    let before = h.instance("web", 0);
    assert!(h.cloud.remove_vm_out_of_band(before.vm_cid().unwrap()));

    let options = DeployOptions {
        fix: true,
        ..Default::default()
    };
    assert_done(&h.change_with("web/0", Operation::Recreate, options).await);
    let after = h.instance("web", 0);
    assert_eq!(after.state, InstanceState::Running);
    assert!(h.cloud.vm(after.vm_cid().unwrap()).is_some());
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    let task = h.change("web/7", Operation::Restart).await;
    assert_failed(&task, "not found");
}

#[tokio::test]
async fn dry_run_state_change_reports_targets_only() {
    let h = Harness::new();
    h.deploy_ok(manifest(2, &["z1"])).await;
    h.hub.clear_calls();
    let options = DeployOptions {
        dry_run: true,
        ..Default::default()
    };
    let task = h.change_with("web", Operation::Stop, options).await;
    assert_done(&task);
    let report: serde_json::Value = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
    assert_eq!(report["instances"].as_array().unwrap().len(), 2);
    assert!(h.hub.calls_of("stop").is_empty());
}

#[tokio::test]
async fn delete_vm_clears_the_instance_until_next_deploy() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    let cid = h.instance("web", 0).vm_cid().unwrap().to_string();

    let task = h.director.delete_vm(&cid).unwrap().wait().await.unwrap();
    assert_done(&task);
    assert!(h.instance("web", 0).vm.is_none());
    assert!(h.cloud.vm(&cid).is_none());

    h.deploy_ok(manifest(1, &["z1"])).await;
    let replaced = h.instance("web", 0);
    assert!(replaced.vm.is_some());
    assert_ne!(replaced.vm_cid(), Some(cid.as_str()));
}

#[tokio::test]
async fn delete_deployment_orphans_disks_and_forgets_state() {
    let h = Harness::new();
    h.deploy_ok(with_disk(2)).await;
    let disks: Vec<String> = h.instances().iter().flat_map(|i| i.disk_cids.clone()).collect();
    assert_eq!(disks.len(), 2);

    let task = h
        .director
        .delete_deployment(DEPLOYMENT, false)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_done(&task);
    assert!(h.director.deployment(DEPLOYMENT).is_err());
    assert!(h.director.store().list_instances(DEPLOYMENT).unwrap().is_empty());
    assert!(h.director.store().list_variable_sets(DEPLOYMENT).unwrap().is_empty());
    assert!(h.cloud.vm_cids().is_empty());

    let orphaned: Vec<String> = h.director.disks(true).unwrap().into_iter().map(|d| d.cid).collect();
    for cid in &disks {
        assert!(orphaned.contains(cid));
        assert!(h.cloud.disk(cid).unwrap().attached_to.is_none());
    }
}

#[tokio::test]
async fn forced_delete_survives_cloud_failures() {
    let h = Harness::new();
    h.deploy_ok(manifest(1, &["z1"])).await;
    h.cloud.fail_next("delete_vm", armada_cpi::CpiError::cloud("api unavailable"));

    let task = h
        .director
        .delete_deployment(DEPLOYMENT, true)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Done, "{:?}", task.result);
    assert!(h.director.deployment(DEPLOYMENT).is_err());
}

#[tokio::test]
async fn halted_group_does_not_block_the_next_group() {
    let h = Harness::new();
    let mut m = manifest(3, &["z1"]);
    m["instance_groups"] = json!([group("web", 3, &["z1"]), group("db", 2, &["z1"])]);
    h.deploy_ok(m).await;
    h.hub.clear_calls();
    h.hub.fail_next("start", Some("web/1"), "job failed to start");

    let task = h.change("all", Operation::Restart).await;
    assert_failed(&task, "job failed to start");
    let started: Vec<String> = h
        .hub
        .calls_of("start")
        .into_iter()
        .filter_map(|c| c.instance)
        .collect();
    assert!(started.contains(&"web/0".to_string()));
    assert!(!started.contains(&"web/2".to_string()));
    assert!(started.contains(&"db/0".to_string()));
    assert!(started.contains(&"db/1".to_string()));
    assert!(h.instances().iter().filter(|i| i.group == "db").all(|i| i.state == InstanceState::Running));
}
