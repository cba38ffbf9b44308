//! REST API handlers

use super::dto::*;
use super::state::AppState;
use crate::engine::EngineHealth;
use crate::error::ErrorCode;
use crate::protocol::{
    AllocateRequest, AllocateResponse, AllocationService, CheckRequest, ReleaseRequest,
};
use crate::Error;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Convert internal error to API response
fn error_response(err: Error) -> (StatusCode, Json<ApiError>) {
    let status = match (&err, err.code()) {
        (Error::PoolNotFound(_), _) => StatusCode::NOT_FOUND,
        (_, ErrorCode::Exhausted | ErrorCode::InUse) => StatusCode::CONFLICT,
        (_, ErrorCode::OutOfRange | ErrorCode::InvalidRequest) => StatusCode::BAD_REQUEST,
        (_, ErrorCode::NotReady | ErrorCode::PersistenceFailure) => StatusCode::SERVICE_UNAVAILABLE,
        (_, ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        (_, ErrorCode::InconsistentState) => StatusCode::UNPROCESSABLE_ENTITY,
        (_, ErrorCode::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiError::from(&err)))
}

// ============================================================================
// Allocation protocol
// ============================================================================

pub async fn allocate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocateRequest>,
) -> ApiResult<Json<AllocateResponse>> {
    state
        .engine
        .allocate(req)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn release(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<StatusCode> {
    state.engine.release(req).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> ApiResult<StatusCode> {
    state.engine.check(req).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Introspection
// ============================================================================

pub async fn list_pools(State(state): State<Arc<AppState>>) -> Json<PoolsResponse> {
    Json(PoolsResponse {
        node: state.engine.node().to_string(),
        items: state.engine.pool_statuses().await,
    })
}

pub async fn list_allocations(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> ApiResult<Json<AllocationsResponse>> {
    let items = state
        .engine
        .allocations(&pool)
        .await
        .map_err(error_response)?;
    Ok(Json(AllocationsResponse {
        pool,
        total: items.len(),
        items,
    }))
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.engine.health() {
        EngineHealth::Fatal => (StatusCode::SERVICE_UNAVAILABLE, "FATAL"),
        _ => (StatusCode::OK, "OK"),
    }
}

pub async fn readiness_check(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.engine.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "RECOVERING")
    }
}
