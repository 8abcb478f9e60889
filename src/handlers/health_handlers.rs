//! Health & stats handlers.
//!
//! - GET /healthz -> liveness with server time and uptime
//! - GET /stats   -> in-flight upload sessions and buffered bytes

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// `GET /healthz`
///
/// Cheap liveness probe; never touches the transport.
pub async fn healthz(State(service): State<UploadService>) -> impl IntoResponse {
    let now = Utc::now();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            timestamp: now,
            uptime_secs: uptime_secs(service.stats().started_at, now),
        }),
    )
}

/// `GET /stats`
pub async fn stats(State(service): State<UploadService>) -> impl IntoResponse {
    service.store().sweep_expired();
    let stats = service.stats();
    Json(StatsResponse {
        active_sessions: stats.store.active_sessions,
        buffered_bytes: stats.store.buffered_bytes,
        uptime_secs: uptime_secs(stats.started_at, Utc::now()),
    })
}

fn uptime_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - started_at).num_seconds().max(0) as u64
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    timestamp: DateTime<Utc>,
    uptime_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    active_sessions: usize,
    buffered_bytes: u64,
    uptime_secs: u64,
}
