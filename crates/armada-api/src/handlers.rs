//! REST API handlers.
//!
//! Each handler calls into the `Director` and returns JSON responses in
//! the `{success, data, error}` envelope.

use armada_director::{DeployOptions, DirectorError, DirectorResult, InstanceSelector, Operation, TaskHandle};
use armada_state::EventFilter;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_of(e: &DirectorError) -> StatusCode {
    match e.root() {
        DirectorError::NotFound { .. } => StatusCode::NOT_FOUND,
        DirectorError::Validation(_) => StatusCode::BAD_REQUEST,
        DirectorError::Conflict(_) | DirectorError::LockTimeout { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: serde::Serialize>(result: DirectorResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => error_response(&e.to_string(), status_of(&e)).into_response(),
    }
}

/// `202 Accepted` with the queued task's id.
fn accepted(result: DirectorResult<TaskHandle>) -> Response {
    match result {
        Ok(handle) => {
            debug!(task = handle.id, "task queued");
            (StatusCode::ACCEPTED, ApiResponse::ok(json!({"task_id": handle.id}))).into_response()
        }
        Err(e) => error_response(&e.to_string(), status_of(&e)).into_response(),
    }
}

// ── Configs ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ConfigQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub history: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConfigUploadRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_config_name")]
    pub name: String,
    /// Raw document; a JSON value is accepted and re-serialized.
    pub content: Value,
}

fn default_config_name() -> String {
    "default".to_string()
}

impl ConfigUploadRequest {
    fn content(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// GET /api/v1/configs
pub async fn list_configs(State(state): State<ApiState>, Query(q): Query<ConfigQuery>) -> impl IntoResponse {
    reply(state.director.list_configs(q.kind.as_deref(), q.history))
}

/// POST /api/v1/configs
pub async fn upload_config(
    State(state): State<ApiState>,
    Json(req): Json<ConfigUploadRequest>,
) -> impl IntoResponse {
    match state.director.upload_config(&req.kind, &req.name, &req.content()) {
        Ok(upload) if upload.created => (StatusCode::CREATED, ApiResponse::ok(upload)).into_response(),
        result => reply(result),
    }
}

/// POST /api/v1/configs/diff
pub async fn diff_config(
    State(state): State<ApiState>,
    Json(req): Json<ConfigUploadRequest>,
) -> impl IntoResponse {
    reply(state.director.diff_config(&req.kind, &req.name, &req.content()))
}

/// GET /api/v1/configs/:kind/:name
pub async fn latest_config(
    State(state): State<ApiState>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    reply(state.director.latest_config(&kind, &name))
}

/// DELETE /api/v1/configs/:kind/:name
pub async fn delete_config(
    State(state): State<ApiState>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    reply(
        state
            .director
            .delete_config(&kind, &name)
            .map(|deleted| json!({"deleted": deleted})),
    )
}

/// GET /api/v1/config-versions/:id
pub async fn config_version(State(state): State<ApiState>, Path(id): Path<u64>) -> impl IntoResponse {
    reply(state.director.config_version(id))
}

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub manifest: Value,
    #[serde(default)]
    pub options: DeployOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    reply(state.director.deployments())
}

/// GET /api/v1/deployments/:name
pub async fn get_deployment(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    reply(state.director.deployment(&name))
}

/// POST /api/v1/deployments
pub async fn deploy(State(state): State<ApiState>, Json(req): Json<DeployRequest>) -> impl IntoResponse {
    accepted(state.director.deploy(req.manifest, req.options))
}

/// DELETE /api/v1/deployments/:name
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> impl IntoResponse {
    accepted(state.director.delete_deployment(&name, q.force))
}

// ── Instances ──────────────────────────────────────────────────

/// Body of a state command. `instances` is `all`, `group` or
/// `group/<index|uuid>`.
#[derive(Debug, Deserialize)]
pub struct StateChangeRequest {
    #[serde(default)]
    pub instances: String,
    pub action: String,
    /// `stop` only: delete the VM, keep disks and IPs.
    #[serde(default)]
    pub hard: bool,
    #[serde(flatten)]
    pub options: DeployOptions,
}

impl StateChangeRequest {
    fn operation(&self) -> DirectorResult<Operation> {
        Ok(match (self.action.as_str(), self.hard) {
            ("start", false) => Operation::Start,
            ("stop", false) => Operation::Stop,
            ("stop", true) => Operation::StopHard,
            ("restart", false) => Operation::Restart,
            ("recreate", false) => Operation::Recreate,
            (action, true) => {
                return Err(DirectorError::Validation(format!("'{action}' does not take 'hard'")));
            }
            (action, false) => {
                return Err(DirectorError::Validation(format!("unknown action '{action}'")));
            }
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IgnoreRequest {
    pub ignore: bool,
}

/// GET /api/v1/deployments/:name/instances
pub async fn list_instances(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    reply(state.director.instances(&name))
}

/// POST /api/v1/deployments/:name/instances/state
pub async fn change_state(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<StateChangeRequest>,
) -> impl IntoResponse {
    let op = match req.operation() {
        Ok(op) => op,
        Err(e) => return error_response(&e.to_string(), status_of(&e)).into_response(),
    };
    let selector = InstanceSelector::parse(&req.instances);
    accepted(state.director.change_state(&name, selector, op, req.options))
}

/// PUT /api/v1/deployments/:name/instances/:group/:id/ignore
pub async fn set_ignore(
    State(state): State<ApiState>,
    Path((name, group, id)): Path<(String, String, String)>,
    Json(req): Json<IgnoreRequest>,
) -> impl IntoResponse {
    let selector = InstanceSelector::Instance { group, id };
    reply(state.director.set_ignore(&name, &selector, req.ignore).await)
}

/// GET /api/v1/deployments/:name/variables
pub async fn list_variables(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    reply(state.director.variables_of(&name))
}

// ── Disks & snapshots ──────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DiskQuery {
    #[serde(default)]
    pub orphaned: bool,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub deployment: String,
    /// `group/<index|uuid>`.
    pub instance: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotRequest {
    #[serde(default)]
    pub instances: String,
}

/// GET /api/v1/disks
pub async fn list_disks(State(state): State<ApiState>, Query(q): Query<DiskQuery>) -> impl IntoResponse {
    reply(state.director.disks(q.orphaned))
}

/// DELETE /api/v1/disks/:cid
pub async fn delete_disk(State(state): State<ApiState>, Path(cid): Path<String>) -> impl IntoResponse {
    accepted(state.director.delete_disk(&cid))
}

/// POST /api/v1/disks/:cid/orphan
pub async fn orphan_disk(State(state): State<ApiState>, Path(cid): Path<String>) -> impl IntoResponse {
    accepted(state.director.orphan_disk(&cid))
}

/// POST /api/v1/disks/:cid/attach
pub async fn attach_disk(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
    Json(req): Json<AttachRequest>,
) -> impl IntoResponse {
    let selector = InstanceSelector::parse(&req.instance);
    accepted(state.director.attach_disk(&req.deployment, selector, &cid))
}

/// POST /api/v1/deployments/:name/snapshots
pub async fn take_snapshot(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<SnapshotRequest>,
) -> impl IntoResponse {
    accepted(state.director.take_snapshot(&name, InstanceSelector::parse(&req.instances)))
}

/// DELETE /api/v1/snapshots/:cid
pub async fn delete_snapshot(State(state): State<ApiState>, Path(cid): Path<String>) -> impl IntoResponse {
    accepted(state.director.delete_snapshot(&cid))
}

/// DELETE /api/v1/vms/:cid
pub async fn delete_vm(State(state): State<ApiState>, Path(cid): Path<String>) -> impl IntoResponse {
    accepted(state.director.delete_vm(&cid))
}

// ── Clean-up, events, tasks, locks ─────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub limit: Option<usize>,
}

/// POST /api/v1/cleanup
pub async fn cleanup(State(state): State<ApiState>, Json(req): Json<CleanupRequest>) -> impl IntoResponse {
    accepted(state.director.cleanup(req.all))
}

/// GET /api/v1/events
pub async fn list_events(State(state): State<ApiState>, Query(filter): Query<EventFilter>) -> impl IntoResponse {
    reply(state.director.events(&filter))
}

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>, Query(q): Query<TaskQuery>) -> impl IntoResponse {
    reply(state.director.tasks(q.limit))
}

/// GET /api/v1/tasks/:id
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<u64>) -> impl IntoResponse {
    reply(state.director.task(id))
}

/// DELETE /api/v1/tasks/:id
pub async fn cancel_task(State(state): State<ApiState>, Path(id): Path<u64>) -> impl IntoResponse {
    reply(state.director.cancel_task(id))
}

/// GET /api/v1/locks
pub async fn list_locks(State(state): State<ApiState>) -> impl IntoResponse {
    let locks: Vec<Value> = state
        .director
        .locks()
        .into_iter()
        .map(|(name, task)| json!({"name": name, "task_id": task}))
        .collect();
    ApiResponse::ok(locks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use armada_core::DirectorConfig;
    use armada_cpi::{CpiRegistry, DummyCloud};
    use armada_director::{Director, DummyAgentHub, MemorySecretStore};
    use armada_state::StateStore;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let director = Director::new(
            store,
            Arc::new(CpiRegistry::new(Arc::new(DummyCloud::new("default")))),
            Arc::new(DummyAgentHub::new()),
            Arc::new(MemorySecretStore::new()),
            DirectorConfig::default(),
        );
        ApiState { director }
    }

    fn upload(kind: &str, content: Value) -> ConfigUploadRequest {
        ConfigUploadRequest {
            kind: kind.to_string(),
            name: "default".to_string(),
            content,
        }
    }

    #[tokio::test]
    async fn list_deployments_empty() {
        let resp = list_deployments(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_nonexistent_deployment() {
        let resp = get_deployment(State(test_state()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_creates_then_reuses() {
        let state = test_state();
        let resp = upload_config(State(state.clone()), Json(upload("cloud", json!({"azs": []}))))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = upload_config(State(state), Json(upload("cloud", json!({"azs": []}))))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_config_is_a_bad_request() {
        let resp = upload_config(
            State(test_state()),
            Json(upload("cloud", json!("{ not json"))),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deploy_without_name_is_rejected() {
        let req = DeployRequest {
            manifest: json!({"instance_groups": []}),
            options: DeployOptions::default(),
        };
        let resp = deploy(State(test_state()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn state_change_on_unknown_deployment() {
        let req = StateChangeRequest {
            instances: "web/0".to_string(),
            action: "restart".to_string(),
            hard: false,
            options: DeployOptions::default(),
        };
        let resp = change_state(State(test_state()), Path("nope".to_string()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn state_change_actions() {
        let req = |action: &str, hard: bool| StateChangeRequest {
            instances: String::new(),
            action: action.to_string(),
            hard,
            options: DeployOptions::default(),
        };
        assert_eq!(req("stop", true).operation().unwrap(), Operation::StopHard);
        assert_eq!(req("recreate", false).operation().unwrap(), Operation::Recreate);
        assert!(req("start", true).operation().is_err());
        assert!(req("deploy", false).operation().is_err());
    }
}
