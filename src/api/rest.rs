//! REST API handlers: the `/api/v1/*` surface described in the external
//! interfaces section. Shares one `AppState` wrapping the `Agent`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Json, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::agent::Agent;
use crate::domain::OperationState;
use crate::error::{Error, Result};
use crate::operations::OperationRequest;

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    pub label: String,
    pub drive_serials: Vec<String>,
    #[serde(default)]
    pub drive_labels: BTreeMap<String, String>,
    pub mount_path: String,
    #[serde(default)]
    pub pool_group_guid: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoolRequest {
    pub mount_path: String,
}

#[derive(Debug, Deserialize)]
pub struct KillProcessesRequest {
    pub pids: Vec<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAckResponse {
    pub success: bool,
    pub pool_group_guid: Uuid,
    pub state: OperationState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillOutcome {
    pub pid: i32,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatusResponse {
    pub state: OperationState,
    pub pool_status: crate::domain::PoolHealthStatus,
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub use_percent: String,
    pub mount_path: Option<String>,
    pub drives: Vec<crate::inventory::PoolDriveView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync_time_estimate_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptResponse {
    pub outputs: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub fixed_entries: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatusResponse {
    pub serial: String,
    pub mount_path: Option<String>,
    pub pool_group_guid: Option<Uuid>,
    pub processes: Vec<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct RestRouter {
    agent: Arc<Agent>,
}

impl RestRouter {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn build(self) -> Router {
        let state = AppState { agent: self.agent.clone() };
        let api_key = self.agent.config.api_key.clone();

        let api_routes = Router::new()
            .route("/api/v1/drives", get(list_drives))
            .route("/api/v1/drives/:serial/status", get(drive_status))
            .route("/api/v1/drives/processes/kill", post(kill_processes))
            .route("/api/v1/pools", get(list_pools).post(create_pool))
            .route("/api/v1/pools/validate", post(validate_pools))
            .route("/api/v1/pools/:guid", get(get_pool).delete(remove_pool))
            .route("/api/v1/pools/:guid/output", get(pool_output))
            .route("/api/v1/pools/:guid/mount", post(mount_pool))
            .route("/api/v1/pools/:guid/unmount", post(unmount_pool))
            .route_layer(middleware::from_fn_with_state(api_key, require_api_key));

        api_routes
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }
}

async fn require_api_key(
    State(expected): State<String>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided != expected {
        return Error::Validation("missing or invalid X-Api-Key header".into()).into_response();
    }

    next.run(req).await
}

// ---------------------------------------------------------------------------
// Drive handlers
// ---------------------------------------------------------------------------

async fn list_drives(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.drives.get().drives.clone())
}

async fn drive_status(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> impl IntoResponse {
    let pools = state.agent.metadata.all().await;
    let owning_pool = pools
        .iter()
        .find(|p| p.drive_serials.contains(&serial))
        .cloned();

    let drives = state.agent.drives.get();
    let drive = drives.drives.iter().find(|d| d.serial.as_deref() == Some(serial.as_str()));

    let mount_path = match drive.and_then(|d| d.mountpoint.clone()) {
        Some(mp) => Some(mp),
        None => owning_pool.as_ref().and_then(|p| p.last_mount_path.clone()),
    };

    let processes = if let Some(path) = &mount_path {
        let outcome = state.agent.commands.run("lsof", &["+f", "--", path.as_str()], false).await;
        outcome
            .sanitised_output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let command = fields.next()?;
                let pid = fields.next()?;
                Some(format!("{command}({pid})"))
            })
            .collect()
    } else {
        Vec::new()
    };

    Json(DriveStatusResponse {
        serial,
        mount_path,
        pool_group_guid: owning_pool.map(|p| p.pool_group_guid),
        processes,
    })
}

async fn kill_processes(
    State(state): State<AppState>,
    Json(request): Json<KillProcessesRequest>,
) -> impl IntoResponse {
    let mut results = Vec::with_capacity(request.pids.len());
    for pid in request.pids {
        let pid_str = pid.to_string();
        let outcome = state.agent.commands.run("kill", &["-9", &pid_str], true).await;
        results.push(KillOutcome {
            pid,
            success: outcome.success,
            message: outcome.sanitised_output,
        });
    }
    Json(results)
}

// ---------------------------------------------------------------------------
// Pool handlers
// ---------------------------------------------------------------------------

async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.agent.inventory.list_pools().await)
}

async fn get_pool(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
) -> std::result::Result<Json<PoolStatusResponse>, Error> {
    let detail = state
        .agent
        .inventory
        .get_by_guid(guid)
        .await
        .ok_or_else(|| Error::NotFound(format!("pool {guid}")))?;

    let operation = state.agent.operations.get(guid);
    let (op_state, error_message) = match &operation {
        Some(op) => (op.state, op.error_message.clone()),
        None if detail.mount_path.is_some() => (OperationState::Ready, None),
        None => (OperationState::Unmounted, None),
    };

    Ok(Json(PoolStatusResponse {
        state: op_state,
        pool_status: detail.pool_status,
        size_bytes: detail.size_bytes,
        used_bytes: detail.used_bytes,
        available_bytes: detail.available_bytes,
        use_percent: detail.use_percent,
        mount_path: detail.mount_path,
        drives: detail.drives,
        resync_percentage: detail.resync_percentage,
        resync_time_estimate_minutes: detail.resync_time_estimate_minutes,
        error_message,
    }))
}

async fn pool_output(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
) -> std::result::Result<Json<TranscriptResponse>, Error> {
    let outputs = state
        .agent
        .operations
        .get_transcript(guid)
        .ok_or_else(|| Error::NotFound(format!("operation {guid}")))?;
    Ok(Json(TranscriptResponse { outputs }))
}

async fn create_pool(
    State(state): State<AppState>,
    Json(request): Json<CreatePoolRequest>,
) -> Result<Json<OperationAckResponse>> {
    let drive_serials: IndexSet<String> = request.drive_serials.into_iter().collect();
    let guid = state
        .agent
        .operations
        .start(OperationRequest::Create {
            label: request.label,
            drive_serials,
            drive_labels: request.drive_labels,
            mount_path: request.mount_path,
            pool_group_guid: request.pool_group_guid,
        })
        .await?;

    info!(pool = %guid, "create pool operation started");
    Ok(Json(OperationAckResponse {
        success: true,
        pool_group_guid: guid,
        state: OperationState::Creating,
    }))
}

async fn mount_pool(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
    Json(request): Json<MountPoolRequest>,
) -> Result<Json<OperationAckResponse>> {
    state
        .agent
        .operations
        .start(OperationRequest::Mount {
            pool_group_guid: guid,
            mount_path: request.mount_path,
        })
        .await?;

    Ok(Json(OperationAckResponse {
        success: true,
        pool_group_guid: guid,
        state: OperationState::Mounting,
    }))
}

async fn unmount_pool(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
) -> Result<Json<OperationAckResponse>> {
    state
        .agent
        .operations
        .start(OperationRequest::Unmount { pool_group_guid: guid })
        .await?;

    Ok(Json(OperationAckResponse {
        success: true,
        pool_group_guid: guid,
        state: OperationState::Unmounting,
    }))
}

async fn remove_pool(
    State(state): State<AppState>,
    Path(guid): Path<Uuid>,
) -> Result<Json<OperationAckResponse>> {
    state
        .agent
        .operations
        .start(OperationRequest::Remove { pool_group_guid: guid })
        .await?;

    Ok(Json(OperationAckResponse {
        success: true,
        pool_group_guid: guid,
        state: OperationState::Removing,
    }))
}

async fn validate_pools(State(state): State<AppState>) -> impl IntoResponse {
    let fixed_entries = state.agent.reconciler.reconcile(false).await;
    Json(ValidateResponse { fixed_entries })
}
