//! REST API handlers

use autobot_core::{AutobotError, Lease, LeaseFilter, LeaseId, LeaseTtl, NodeInfo, Reservation};
use autobot_scheduler::{ClusterStatus, NodeView, Scheduler};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/allocations", post(allocate))
        .route("/api/v1/leases", get(list_leases))
        .route("/api/v1/leases/:id", get(get_lease).delete(release_lease))
        .route("/api/v1/leases/:id/renew", post(renew_lease))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/:id/drain", post(drain_node))
        .route("/api/v1/nodes/:id/undrain", post(undrain_node))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Request to allocate GPUs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// GPU model, any spelling (`RTX_2080_Ti`, `rtx2080ti`)
    pub model: String,
    /// Number of GPUs on one node
    pub count: u32,
    /// Who is asking; shown in lease listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// `60s`, `5m`, `2h`, `manual`; daemon default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Successful allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub node_id: String,
    pub slot_indices: Vec<u32>,
    pub lease_id: LeaseId,
    pub model: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// `node:idx,idx`
    pub line: String,
}

impl From<Reservation> for ReservationResponse {
    fn from(reservation: Reservation) -> Self {
        Self {
            line: reservation.to_line(),
            node_id: reservation.node_id,
            slot_indices: reservation.slot_indices,
            lease_id: reservation.lease_id,
            model: reservation.model,
            expires_at: reservation.expires_at,
        }
    }
}

fn parse_ttl(ttl: Option<&str>) -> ApiResult<Option<LeaseTtl>> {
    ttl.map(|t| t.parse::<LeaseTtl>()).transpose().map_err(ApiError)
}

fn parse_lease_id(id: &str) -> ApiResult<LeaseId> {
    id.parse().map_err(ApiError)
}

/// Reserve GPUs on one node
async fn allocate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ReservationResponse>)> {
    let Json(req) =
        payload.map_err(|e| ApiError(AutobotError::InvalidRequest(e.body_text())))?;
    let ttl = parse_ttl(req.ttl.as_deref())?;
    let requester = req.requester.as_deref().unwrap_or("unknown");

    info!(
        model = %req.model,
        count = req.count,
        requester = requester,
        "Allocation requested"
    );

    let reservation = state
        .scheduler
        .allocate(&req.model, req.count, requester, ttl)
        .await?;

    Ok((StatusCode::CREATED, Json(reservation.into())))
}

/// Query for listing leases
#[derive(Debug, Default, Deserialize)]
pub struct LeaseQuery {
    /// Include released and expired leases
    #[serde(default)]
    pub all: bool,
}

/// List leases
async fn list_leases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaseQuery>,
) -> ApiResult<Json<Vec<Lease>>> {
    let leases = state
        .scheduler
        .list_leases(LeaseFilter {
            include_ended: query.all,
        })
        .await?;
    Ok(Json(leases))
}

/// Get a specific lease
async fn get_lease(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Lease>> {
    let id = parse_lease_id(&id)?;
    Ok(Json(state.scheduler.lease(id).await?))
}

/// Release a lease
async fn release_lease(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_lease_id(&id)?;
    info!(lease_id = %id, "Release requested");
    state.scheduler.release(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to renew a lease
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenewRequest {
    /// New TTL; the lease's own TTL when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Renew a lease
async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RenewRequest>>,
) -> ApiResult<Json<Lease>> {
    let id = parse_lease_id(&id)?;
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let ttl = parse_ttl(req.ttl.as_deref())?;
    Ok(Json(state.scheduler.renew(id, ttl).await?))
}

/// List nodes with their slots
async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<NodeView>>> {
    Ok(Json(state.scheduler.nodes().await?))
}

/// Exclude a node from allocation
async fn drain_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeInfo>> {
    Ok(Json(state.scheduler.drain(&id).await?))
}

/// Return a node to service
async fn undrain_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeInfo>> {
    Ok(Json(state.scheduler.undrain(&id).await?))
}

/// System status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub cluster: ClusterStatus,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        cluster: state.scheduler.status().await?,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
