//! armada-api: REST API for the Armada director.
//!
//! Every handler goes through [`Director`]. Reads answer directly; anything
//! that touches the cloud is queued as a task and answered with
//! `202 Accepted` and the task id, to be polled under `/tasks/{id}`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/configs` | List configs (`?type=`, `?history=true`) |
//! | POST | `/api/v1/configs` | Upload a config version |
//! | POST | `/api/v1/configs/diff` | Would an upload create a new version? |
//! | GET | `/api/v1/configs/{type}/{name}` | Latest version |
//! | DELETE | `/api/v1/configs/{type}/{name}` | Delete every version |
//! | GET | `/api/v1/config-versions/{id}` | One stored version |
//! | GET | `/api/v1/deployments` | List deployments |
//! | POST | `/api/v1/deployments` | Deploy a manifest (task) |
//! | GET | `/api/v1/deployments/{name}` | Deployment record |
//! | DELETE | `/api/v1/deployments/{name}` | Delete a deployment (task, `?force=true`) |
//! | GET | `/api/v1/deployments/{name}/instances` | Instances |
//! | POST | `/api/v1/deployments/{name}/instances/state` | start / stop / restart / recreate (task) |
//! | PUT | `/api/v1/deployments/{name}/instances/{group}/{id}/ignore` | Set the ignore flag |
//! | GET | `/api/v1/deployments/{name}/variables` | Pinned variables |
//! | POST | `/api/v1/deployments/{name}/snapshots` | Snapshot disks (task) |
//! | DELETE | `/api/v1/snapshots/{cid}` | Delete a snapshot (task) |
//! | GET | `/api/v1/disks` | Disks (`?orphaned=true`) |
//! | DELETE | `/api/v1/disks/{cid}` | Delete an orphaned disk (task) |
//! | POST | `/api/v1/disks/{cid}/orphan` | Orphan a disk (task) |
//! | POST | `/api/v1/disks/{cid}/attach` | Attach an orphaned disk (task) |
//! | DELETE | `/api/v1/vms/{cid}` | Delete a VM (task) |
//! | POST | `/api/v1/cleanup` | Delete orphans, prune configs (task) |
//! | GET | `/api/v1/events` | Event journal |
//! | GET | `/api/v1/tasks` | Recent tasks |
//! | GET | `/api/v1/tasks/{id}` | One task |
//! | DELETE | `/api/v1/tasks/{id}` | Cancel a task |
//! | GET | `/api/v1/locks` | Held locks |

pub mod handlers;

use armada_director::Director;
use axum::Router;
use axum::routing::{delete, get, post, put};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub director: Director,
}

/// Build the complete API router.
pub fn build_router(director: Director) -> Router {
    let state = ApiState { director };

    let api_routes = Router::new()
        .route("/configs", get(handlers::list_configs).post(handlers::upload_config))
        .route("/configs/diff", post(handlers::diff_config))
        .route(
            "/configs/{kind}/{name}",
            get(handlers::latest_config).delete(handlers::delete_config),
        )
        .route("/config-versions/{id}", get(handlers::config_version))
        .route("/deployments", get(handlers::list_deployments).post(handlers::deploy))
        .route(
            "/deployments/{name}",
            get(handlers::get_deployment).delete(handlers::delete_deployment),
        )
        .route("/deployments/{name}/instances", get(handlers::list_instances))
        .route("/deployments/{name}/instances/state", post(handlers::change_state))
        .route(
            "/deployments/{name}/instances/{group}/{id}/ignore",
            put(handlers::set_ignore),
        )
        .route("/deployments/{name}/variables", get(handlers::list_variables))
        .route("/deployments/{name}/snapshots", post(handlers::take_snapshot))
        .route("/snapshots/{cid}", delete(handlers::delete_snapshot))
        .route("/disks", get(handlers::list_disks))
        .route("/disks/{cid}", delete(handlers::delete_disk))
        .route("/disks/{cid}/orphan", post(handlers::orphan_disk))
        .route("/disks/{cid}/attach", post(handlers::attach_disk))
        .route("/vms/{cid}", delete(handlers::delete_vm))
        .route("/cleanup", post(handlers::cleanup))
        .route("/events", get(handlers::list_events))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task).delete(handlers::cancel_task))
        .route("/locks", get(handlers::list_locks))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
