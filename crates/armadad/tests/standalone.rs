//! Standalone regression tests: the full API router over an in-memory director.

use std::sync::Arc;
use std::time::Duration;

use armada_api::build_router;
use armada_core::DirectorConfig;
use armada_cpi::{CpiRegistry, DummyCloud};
use armada_director::{Director, DummyAgentHub, MemorySecretStore};
use armada_state::StateStore;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

fn router() -> Router {
    let director = Director::new(
        StateStore::open_in_memory().unwrap(),
        Arc::new(CpiRegistry::new(Arc::new(DummyCloud::new("default")))),
        Arc::new(DummyAgentHub::new()),
        Arc::new(MemorySecretStore::new()),
        DirectorConfig::default(),
    );
    build_router(director)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Poll a task until it finishes.
async fn wait_task(app: &Router, id: u64) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, "GET", &format!("/api/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let state = body["data"]["state"].as_str().unwrap().to_string();
        if ["done", "error", "cancelled"].contains(&state.as_str()) {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not finish");
}

fn cloud_config() -> Value {
    json!({
        "azs": [{"name": "z1"}],
        "vm_types": [{"name": "small", "cloud_properties": {"instance_type": "s1"}}],
        "networks": [{
            "name": "private",
            "type": "manual",
            "subnets": [{
                "range": "10.0.1.0/24",
                "gateway": "10.0.1.1",
                "az": "z1",
                "reserved": ["10.0.1.2 - 10.0.1.9"],
            }],
        }],
        "compilation": {"workers": 1, "az": "z1", "vm_type": "small", "network": "private"},
    })
}

fn manifest() -> Value {
    json!({
        "name": "api-test",
        "releases": [{"name": "app", "version": "1"}],
        "stemcells": [{"alias": "default", "os": "ubuntu", "version": "1"}],
        "update": {
            "canaries": 1,
            "max_in_flight": 1,
            "canary_watch_time": 0,
            "update_watch_time": 0,
        },
        "instance_groups": [{
            "name": "web",
            "instances": 2,
            "azs": ["z1"],
            "vm_type": "small",
            "stemcell": "default",
            "networks": [{"name": "private"}],
            "jobs": [{"name": "server", "release": "app"}],
        }],
    })
}

async fn deployed(app: &Router) {
    let (status, _) = send(
        app,
        "POST",
        "/api/v1/configs",
        Some(json!({"type": "cloud", "content": cloud_config()})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(app, "POST", "/api/v1/deployments", Some(json!({"manifest": manifest()}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task = wait_task(app, body["data"]["task_id"].as_u64().unwrap()).await;
    assert_eq!(task["state"], "done", "{task}");
}

#[tokio::test]
async fn empty_director() {
    let app = router();
    let (status, body) = send(&app, "GET", "/api/v1/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "data": []}));

    let (status, body) = send(&app, "GET", "/api/v1/locks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn deploy_then_inspect() {
    let app = router();
    deployed(&app).await;

    let (status, body) = send(&app, "GET", "/api/v1/deployments/api-test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "api-test");

    let (_, body) = send(&app, "GET", "/api/v1/deployments/api-test/instances", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = send(&app, "GET", "/api/v1/events?deployment=api-test&action=create", None).await;
    assert!(!body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn state_change_through_the_api() {
    let app = router();
    deployed(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/deployments/api-test/instances/state",
        Some(json!({"instances": "web/0", "action": "stop", "hard": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task = wait_task(&app, body["data"]["task_id"].as_u64().unwrap()).await;
    assert_eq!(task["state"], "done", "{task}");

    let (_, body) = send(&app, "GET", "/api/v1/deployments/api-test/instances", None).await;
    let web0 = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["index"] == 0)
        .unwrap()
        .clone();
    assert!(web0["vm"].is_null(), "{web0}");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/deployments/api-test/instances/state",
        Some(json!({"instances": "web/0", "action": "dance"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ignore_flag_round_trips() {
    let app = router();
    deployed(&app).await;

    let (status, body) = send(
        &app,
        "PUT",
        "/api/v1/deployments/api-test/instances/web/1/ignore",
        Some(json!({"ignore": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ignore"], true);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/v1/deployments/api-test/instances/web/9/ignore",
        Some(json!({"ignore": true})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_resources_are_404() {
    let app = router();
    for uri in [
        "/api/v1/deployments/missing",
        "/api/v1/configs/cloud/default",
        "/api/v1/tasks/42",
        "/api/v1/config-versions/7",
    ] {
        let (status, body) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn failed_deploy_reports_through_the_task() {
    let app = router();
    // No cloud config uploaded.
    let (status, body) = send(&app, "POST", "/api/v1/deployments", Some(json!({"manifest": manifest()}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task = wait_task(&app, body["data"]["task_id"].as_u64().unwrap()).await;
    assert_eq!(task["state"], "error");
    assert!(task["result"].as_str().is_some());
}

#[tokio::test]
async fn deleting_a_deployment_orphans_nothing_without_disks() {
    let app = router();
    deployed(&app).await;

    let (status, body) = send(&app, "DELETE", "/api/v1/deployments/api-test?force=true", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task = wait_task(&app, body["data"]["task_id"].as_u64().unwrap()).await;
    assert_eq!(task["state"], "done", "{task}");

    let (status, _) = send(&app, "GET", "/api/v1/deployments/api-test", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, body) = send(&app, "GET", "/api/v1/disks?orphaned=true", None).await;
    assert_eq!(body["data"], json!([]));
}
