//! HTTP request handlers.

use super::AppState;
use crate::db::DbError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_CHECK_LIMIT: u32 = 50;
const MAX_CHECK_LIMIT: u32 = 500;

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_targets() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> impl IntoResponse {
    // Destination safety is the guard's job at probe time; here only the shape is checked.
    let url = match validate_target_url(&req.url) {
        Ok(url) => url,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let name = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty());

    match state.store.add_target(url.as_str(), name) {
        Ok(target) => {
            tracing::info!("Added target {} ({})", target.id, target.url);
            (StatusCode::CREATED, Json(target)).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_target(id) {
        Ok(()) => {
            tracing::info!("Deleted target {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Target not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Accept absolute http(s) URLs that name a host.
fn validate_target_url(raw: &str) -> Result<url::Url, String> {
    let url = url::Url::parse(raw.trim()).map_err(|e| format!("Invalid URL: {}", e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("Unsupported scheme: {}", url.scheme()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("URL has no host".to_string());
    }
    Ok(url)
}

// ============================================================================
// API: Checks
// ============================================================================

pub async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest_statuses() {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChecksQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_get_checks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ChecksQuery>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_target(id) {
        return match e {
            DbError::NotFound => (StatusCode::NOT_FOUND, "Target not found").into_response(),
            e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        };
    }

    let limit = query.limit.unwrap_or(DEFAULT_CHECK_LIMIT).clamp(1, MAX_CHECK_LIMIT);

    match state.store.recent_checks(id, limit) {
        Ok(checks) => Json(checks).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
