//! HTTP handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use updraft_core::{RefreshSummary, RegistryError};
use updraft_schema::Sha256Digest;

use crate::error::{AppError, AppResult};
use crate::protocol::{UpdateQuery, UpdateRequest};
use crate::service::UpdateDecision;
use crate::state::AppState;

/// `POST /update`: `200` with an update, `204` when there is none.
pub async fn check_update(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload?;
    let app_id = request.app_id.clone();
    let query = UpdateQuery::try_from(request)?;

    match state.service.check(&query).await {
        UpdateDecision::NoUpdate => Ok(StatusCode::NO_CONTENT.into_response()),
        UpdateDecision::Update(resp) => {
            info!(
                app_id = app_id.as_deref().unwrap_or("-"),
                platform = %query.platform,
                arch = %query.arch,
                from = %query.current,
                to = %resp.version,
                patch_type = %resp.patch_type,
                "offering update"
            );
            Ok(Json(resp).into_response())
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Assets in the current graph.
    pub assets: usize,
    /// When the graph was last rebuilt.
    pub last_refresh: Option<DateTime<Utc>>,
    /// Seconds since start.
    pub uptime_secs: i64,
}

/// `GET /health`.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.registry();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        assets: registry.snapshot().asset_count(),
        last_refresh: registry.last_refreshed(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

/// Accept the request only if it carries the configured admin token.
fn authorize(expected: Option<&str>, headers: &HeaderMap) -> AppResult<()> {
    let Some(expected) = expected else {
        return Err(AppError::Unauthorized("no admin token configured".into()));
    };
    let Some(given) = bearer_token(headers) else {
        return Err(AppError::Unauthorized("missing bearer token".into()));
    };
    // Compare digests rather than the raw tokens.
    if Sha256Digest::compute(given.as_bytes()) != Sha256Digest::compute(expected.as_bytes()) {
        warn!("rejected refresh with a wrong admin token");
        return Err(AppError::Unauthorized("invalid admin token".into()));
    }
    Ok(())
}

/// `POST /refresh`: rebuild the update graph now. Requires the admin token.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> AppResult<Json<RefreshSummary>> {
    authorize(state.config.admin_token.as_deref(), &headers)?;
    match state.registry().refresh().await {
        Ok(summary) => Ok(Json(summary)),
        Err(RegistryError::Source(e)) => Err(AppError::Upstream(e.to_string())),
        Err(e) => Err(AppError::Internal(e.to_string())),
    }
}
