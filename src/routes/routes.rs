//! Defines routes for the chunked upload relay.
//!
//! ## Structure
//! - **Upload protocol**
//!   - `POST   /upload/chunk` — submit one base64 chunk
//!   - `POST   /upload/finalize` — assemble and forward to the transport
//!   - `GET    /upload/status/{upload_id}` — session progress
//!   - `DELETE /upload/{upload_id}` — cancel and drop a session
//!
//! - **Retrieval**
//!   - `POST   /download` — resolve a file id back to base64 bytes
//!
//! - **Operations**
//!   - `GET    /healthz`, `GET /stats`
//!
//! `chunk` and `finalize` are reserved and never accepted as upload ids.
//!
//! Every upload route answers `OPTIONS` with 200 and any other unsupported
//! method with 405.

use crate::{
    handlers::{
        health_handlers::{healthz, stats},
        upload_handlers::{
            cancel_upload, download_file, finalize_upload, method_not_allowed, preflight,
            upload_chunk, upload_status,
        },
    },
    routes::cors::{CorsPolicy, apply_cors},
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

/// Build the router. `max_body_bytes` bounds every JSON request body.
pub fn routes(cors: CorsPolicy, max_body_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        // upload protocol
        .route(
            "/upload/chunk",
            post(upload_chunk)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/upload/finalize",
            post(finalize_upload)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/upload/status/{upload_id}",
            get(upload_status)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/upload/{upload_id}",
            delete(cancel_upload)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/download",
            post(download_file)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(cors, apply_cors))
}
