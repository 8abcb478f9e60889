//! Chunked large-file upload relay.
//!
//! Clients split a file into base64 chunks and post them to the server,
//! which buffers them per upload session and, on finalize, forwards the
//! assembled file to a messaging transport acting as storage.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use crate::{
    routes::cors::CorsPolicy,
    services::{session_store::SessionStore, transport::Transport, upload_service::UploadService},
};
use axum::Router;
use std::sync::Arc;

/// Router with state attached, ready to serve.
pub fn app(
    store: SessionStore,
    transport: Arc<dyn Transport>,
    cors: CorsPolicy,
    max_body_bytes: usize,
) -> Router {
    routes::routes::routes(cors, max_body_bytes).with_state(UploadService::new(store, transport))
}
