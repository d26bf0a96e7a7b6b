use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::bridge::{CallbackEvent, CompletionEvent, MachiningCallback, MachiningLog, MachiningRecord};
use crate::error::ConductorError;
use crate::leadership::LeadershipState;
use crate::machine::{Machine, MachineRegistry};
use crate::queue::{BatchOp, Dispatcher, FailedJob, InFlight, ProductionQueue, ProductionScheduler, QueueJob};
use crate::scheduler::{LoopStatus, SchedulerStatus};
use crate::stage::{ManufacturingRequest, StageStateMachine};

pub const BRIDGE_SECRET_HEADER: &str = "x-bridge-secret";

#[derive(Clone)]
pub struct DashboardState {
    pub worker_id: String,
    pub leadership: watch::Receiver<LeadershipState>,
    pub scheduler: SchedulerStatus,
    pub machines: Arc<MachineRegistry>,
    pub queue: Arc<ProductionQueue>,
    pub stages: Arc<StageStateMachine>,
    pub production: Arc<ProductionScheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub records: Arc<MachiningLog>,
    pub completions: mpsc::Sender<CompletionEvent>,
    pub bridge_secret: Option<String>,
}

impl DashboardState {
    fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader()
    }

    fn require_leader(&self) -> Result<(), ApiError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(ApiError::NotLeader)
        }
    }
}

/// Error body: the message plus, for rejected transitions and stale batches,
/// the authoritative state the caller should reconcile with.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<serde_json::Value>,
}

pub enum ApiError {
    NotLeader,
    Unauthorized,
    NotFound(String),
    Conductor(ConductorError),
}

impl From<ConductorError> for ApiError {
    fn from(e: ConductorError) -> Self {
        ApiError::Conductor(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, current) = match self {
            ApiError::NotLeader => (
                StatusCode::SERVICE_UNAVAILABLE,
                "this worker is not the leader".to_string(),
                None,
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "invalid bridge secret".to_string(),
                None,
            ),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what, None),
            ApiError::Conductor(e) => {
                let status = match &e {
                    ConductorError::InvalidTransition { .. }
                    | ConductorError::StaleBatchApply { .. }
                    | ConductorError::StoreConflict { .. }
                    | ConductorError::MachineUnavailable { .. } => StatusCode::CONFLICT,
                    ConductorError::MachineNotFound(_)
                    | ConductorError::JobNotFound(_)
                    | ConductorError::RequestNotFound(_) => StatusCode::NOT_FOUND,
                    ConductorError::InvalidQuantity(_) | ConductorError::InvalidRequest(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    ConductorError::BridgeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    ConductorError::BridgeRejected { .. } => StatusCode::BAD_GATEWAY,
                    ConductorError::QueueFull { .. }
                    | ConductorError::LockContention { .. }
                    | ConductorError::LeadershipLost { .. }
                    | ConductorError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let current = match &e {
                    ConductorError::InvalidTransition { current, .. } => {
                        serde_json::to_value(current.as_ref()).ok()
                    }
                    ConductorError::StaleBatchApply { current, .. } => {
                        serde_json::to_value(current).ok()
                    }
                    _ => None,
                };
                (status, e.to_string(), current)
            }
        };
        (status, Json(ErrorResponse { error, current })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    worker_id: String,
    leader: bool,
    leadership: String,
    last_tick: BTreeMap<String, Option<DateTime<Utc>>>,
    last_error: BTreeMap<String, Option<String>>,
    loops: BTreeMap<String, LoopStatus>,
    queue_depth_by_machine: BTreeMap<String, usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    machine_id: String,
    jobs: Vec<QueueJob>,
    in_flight: Option<InFlight>,
    failed: Vec<FailedJob>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    #[serde(default)]
    machine_id: Option<String>,
    ops: Vec<BatchOp>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    machine_id: String,
    jobs: Vec<QueueJob>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaterialRequest {
    diameter_group: String,
    operator: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/machines", get(list_machines_handler))
        .route("/api/machines/:machine_id/queue", get(queue_handler))
        .route("/api/machines/:machine_id/queue/batch", post(batch_handler))
        .route("/api/machines/:machine_id/material", post(material_handler))
        .route("/api/machines/:machine_id/stop", post(stop_handler))
        .route("/api/machines/:machine_id/reset", post(reset_handler))
        .route(
            "/api/machines/:machine_id/failed/:job_id/retry",
            post(retry_failed_handler),
        )
        .route(
            "/api/machines/:machine_id/failed/:job_id",
            axum::routing::delete(discard_failed_handler),
        )
        .route("/api/machines/:machine_id/machining", get(machining_handler))
        .route("/api/requests/:request_id", get(request_handler))
        .route("/api/requests/:request_id/cancel", post(cancel_handler))
        .route(
            "/api/bridge/machining/:event/:machine_id",
            post(bridge_callback_handler),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, cancel: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let leadership = state.leadership.borrow().clone();
    let loops = state.scheduler.snapshot().await;
    let last_tick = loops
        .iter()
        .map(|(name, s)| (name.clone(), s.last_run))
        .collect();
    let last_error = loops
        .iter()
        .map(|(name, s)| (name.clone(), s.last_error.clone()))
        .collect();

    Json(HealthResponse {
        worker_id: state.worker_id.clone(),
        leader: leadership.is_leader(),
        leadership: leadership.to_string(),
        last_tick,
        last_error,
        loops,
        queue_depth_by_machine: state.queue.depth_by_machine().await,
    })
}

async fn list_machines_handler(State(state): State<DashboardState>) -> Json<Vec<Machine>> {
    Json(state.machines.list().await)
}

async fn queue_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
) -> ApiResult<QueueResponse> {
    let queue = state.queue.snapshot(&machine_id).await?;
    Ok(Json(QueueResponse {
        machine_id: queue.machine_id,
        jobs: queue.jobs,
        in_flight: queue.in_flight,
        failed: queue.failed,
    }))
}

async fn batch_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
    Json(payload): Json<BatchRequest>,
) -> ApiResult<BatchResponse> {
    state.require_leader()?;
    if let Some(body_id) = &payload.machine_id {
        if *body_id != machine_id {
            return Err(ConductorError::InvalidRequest(format!(
                "machineId {} does not match path {}",
                body_id, machine_id
            ))
            .into());
        }
    }
    let jobs = state.queue.batch_apply(&machine_id, &payload.ops).await?;
    Ok(Json(BatchResponse { machine_id, jobs }))
}

async fn material_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
    Json(payload): Json<MaterialRequest>,
) -> ApiResult<Machine> {
    state.require_leader()?;
    let machine = state
        .machines
        .set_material(&machine_id, &payload.diameter_group, &payload.operator)
        .await?;
    Ok(Json(machine))
}

async fn stop_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.require_leader()?;
    state.dispatcher.stop_machine(&machine_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn reset_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
) -> ApiResult<Machine> {
    state.require_leader()?;
    state.dispatcher.reset_machine(&machine_id).await?;
    Ok(Json(state.machines.get(&machine_id).await?))
}

async fn retry_failed_handler(
    State(state): State<DashboardState>,
    Path((machine_id, job_id)): Path<(String, Uuid)>,
) -> ApiResult<QueueJob> {
    state.require_leader()?;
    Ok(Json(state.queue.retry_failed(&machine_id, job_id).await?))
}

async fn discard_failed_handler(
    State(state): State<DashboardState>,
    Path((machine_id, job_id)): Path<(String, Uuid)>,
) -> ApiResult<FailedJob> {
    state.require_leader()?;
    Ok(Json(state.queue.discard_failed(&machine_id, job_id).await?))
}

async fn machining_handler(
    State(state): State<DashboardState>,
    Path(machine_id): Path<String>,
) -> ApiResult<Vec<MachiningRecord>> {
    state.machines.get(&machine_id).await?;
    Ok(Json(state.records.for_machine(&machine_id).await))
}

async fn request_handler(
    State(state): State<DashboardState>,
    Path(request_id): Path<String>,
) -> ApiResult<ManufacturingRequest> {
    Ok(Json(state.stages.get(&request_id).await?))
}

async fn cancel_handler(
    State(state): State<DashboardState>,
    Path(request_id): Path<String>,
    Json(payload): Json<CancelRequest>,
) -> ApiResult<ManufacturingRequest> {
    state.require_leader()?;
    let actor = payload.actor.unwrap_or_else(|| "operator".to_string());
    let request = state
        .production
        .cancel_request(&request_id, &actor, payload.reason)
        .await?;
    Ok(Json(request))
}

async fn bridge_callback_handler(
    State(state): State<DashboardState>,
    Path((event, machine_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<MachiningCallback>,
) -> ApiResult<MachiningRecord> {
    if let Some(secret) = &state.bridge_secret {
        let presented = headers
            .get(BRIDGE_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            tracing::warn!(machine_id = %machine_id, event = %event, "Bridge callback with bad secret");
            return Err(ApiError::Unauthorized);
        }
    }
    let event: CallbackEvent = event.parse().map_err(ApiError::NotFound)?;
    state.require_leader()?;
    state.machines.get(&machine_id).await?;

    let (record, completion) = state.records.apply(&machine_id, event, payload).await?;
    if let Some(completion) = completion {
        if state.completions.send(completion).await.is_err() {
            return Err(ConductorError::Shutdown.into());
        }
    }
    Ok(Json(record))
}
