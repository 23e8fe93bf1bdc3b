use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::AgentSpec;
use crate::control::ControlPlane;
use crate::error::{FleetError, Result};
use crate::protocol::{
    AckRequest, CompleteRunRequest, CreateRunRequest, ErrorBody, FailRunRequest, PullRequest,
    RegisterNodeRequest,
};
use crate::scheduler::{NodeStatus, RunCosts, RunErrorInfo};

/// Error wrapper that renders a [`FleetError`] as a JSON response.
pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::NodeNotFound(_)
            | FleetError::RunNotFound(_)
            | FleetError::AgentNotFound { .. } => StatusCode::NOT_FOUND,
            FleetError::RunTerminal { .. } | FleetError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            FleetError::RunStoreFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, status = %status, "Request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(plane: Arc<ControlPlane>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/nodes", get(list_nodes).post(register_node))
        .route("/v1/nodes/load", get(node_load))
        .route("/v1/nodes/:node_id/heartbeat", post(heartbeat))
        .route("/v1/agents", post(register_agent))
        .route("/v1/runs", get(list_runs).post(create_run))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/lease/pull", post(pull_lease))
        .route("/v1/lease/:run_id/ack", post(ack_lease))
        .route("/v1/lease/:run_id/complete", post(complete_lease))
        .route("/v1/lease/:run_id/fail", post(fail_lease))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(plane)
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn run_api(
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind control API");
        e
    })?;
    serve(listener, plane, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "Starting control API");
    axum::serve(listener, router(plane))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Control API stopped");
    Ok(())
}

async fn register_node(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    let node = plane.register_node(&req.node_id, req.capacity, req.metadata);
    (StatusCode::CREATED, Json(node))
}

async fn heartbeat(
    State(plane): State<Arc<ControlPlane>>,
    Path(node_id): Path<String>,
    Json(status): Json<NodeStatus>,
) -> ApiResult<impl IntoResponse> {
    let node = plane
        .heartbeat(&node_id, status)
        .ok_or(FleetError::NodeNotFound(node_id))?;
    Ok(Json(node))
}

async fn list_nodes(State(plane): State<Arc<ControlPlane>>) -> impl IntoResponse {
    Json(plane.list_nodes())
}

async fn node_load(State(plane): State<Arc<ControlPlane>>) -> impl IntoResponse {
    Json(plane.node_load())
}

async fn register_agent(
    State(plane): State<Arc<ControlPlane>>,
    Json(spec): Json<AgentSpec>,
) -> impl IntoResponse {
    plane.register_agent(spec.clone());
    (StatusCode::CREATED, Json(spec))
}

async fn create_run(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<CreateRunRequest>,
) -> ApiResult<impl IntoResponse> {
    let run = plane.create_run(&req.agent_id, &req.version, req.input, req.constraints)?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(State(plane): State<Arc<ControlPlane>>) -> impl IntoResponse {
    Json(plane.list_runs())
}

async fn get_run(
    State(plane): State<Arc<ControlPlane>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(plane.get_run(&run_id)?))
}

async fn cancel_run(
    State(plane): State<Arc<ControlPlane>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(plane.cancel_run(&run_id)?))
}

async fn pull_lease(
    State(plane): State<Arc<ControlPlane>>,
    Json(req): Json<PullRequest>,
) -> Response {
    match plane
        .pull_lease(&req.node_id, Duration::from_millis(req.wait_ms))
        .await
    {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ack_lease(
    State(plane): State<Arc<ControlPlane>>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<AckRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(plane.ack_lease(&run_id, &req.node_id)?))
}

async fn complete_lease(
    State(plane): State<Arc<ControlPlane>>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<CompleteRunRequest>,
) -> ApiResult<impl IntoResponse> {
    let costs = RunCosts {
        tokens: req.tokens,
        usd: req.usd_cost,
    };
    Ok(Json(plane.complete_run(&run_id, &req.node_id, req.output, costs)?))
}

async fn fail_lease(
    State(plane): State<Arc<ControlPlane>>,
    Path(run_id): Path<Uuid>,
    Json(req): Json<FailRunRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut error = RunErrorInfo::new(req.error);
    if let Some(code) = req.code {
        error = error.with_code(code);
    }
    let costs = RunCosts {
        tokens: req.tokens,
        usd: req.usd_cost,
    };
    Ok(Json(plane.fail_run(&run_id, &req.node_id, error, costs)?))
}
