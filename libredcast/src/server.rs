//! Operator control surface
//!
//! A minimal HTTP API for running the service: health check, manual tick
//! trigger, upcoming queue, and campaign stats. When a bearer token is
//! configured, every route except the health check requires it.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::db::Database;
use crate::scheduler::Scheduler;
use crate::sync::PostSync;

#[derive(Clone)]
pub struct ServerState {
    pub db: Database,
    pub scheduler: Arc<Scheduler>,
    pub sync: Arc<PostSync>,
    pub auth_token: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process", post(trigger_process))
        .route("/sync", post(trigger_sync))
        .route("/upcoming", get(upcoming))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Check the bearer token when one is configured. The health check is the
/// only route exempt from this.
fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.auth_token else {
        return true;
    };

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "message": "missing or invalid bearer token"})),
    )
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Manual "process now" trigger. Reports a summary, not per-post detail;
/// that lives in `/upcoming` and `/stats`.
async fn trigger_process(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.scheduler.tick().await {
        Ok(summary) if summary.ran => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!(
                    "processed {} due post(s): {} posted, {} failed, {} skipped",
                    summary.due, summary.posted, summary.failed, summary.skipped
                ),
                "summary": summary,
            })),
        ),
        Ok(_) => (
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "message": "a tick is already in progress",
            })),
        ),
        Err(e) => {
            warn!("Manual tick failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": e.to_string()})),
            )
        }
    }
}

async fn trigger_sync(State(state): State<ServerState>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state.sync.sync_all().await {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("synced {} account(s)", count),
            })),
        ),
        Err(e) => {
            warn!("Manual sync failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": e.to_string()})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpcomingParams {
    limit: Option<i64>,
}

async fn upcoming(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<UpcomingParams>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let limit = params.limit.unwrap_or(25).clamp(1, 200);

    match state.db.upcoming_campaign_posts(limit).await {
        Ok(posts) => (StatusCode::OK, Json(json!({"posts": posts}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": e.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    campaign_id: Option<String>,
}

async fn stats(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<StatsParams>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    match state
        .db
        .campaign_status_counts(params.campaign_id.as_deref())
        .await
    {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "total": counts.total(),
                "counts": counts,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": e.to_string()})),
        ),
    }
}
