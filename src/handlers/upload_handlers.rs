//! HTTP handlers for the chunked upload protocol.
//!
//! Request bodies are parsed leniently (every field optional) and validated
//! in `UploadService`, so a missing field becomes a 400 with a readable
//! message. Failures are rendered through `AppError`.

use crate::{
    errors::AppError,
    models::{
        upload_session::SessionStatus,
        wire::{
            ChunkRequest, ChunkResponse, DownloadRequest, DownloadResponse, FinalizeRequest,
            FinalizeResponse,
        },
    },
    services::{chunk_reader::encode_chunk, upload_service::UploadService},
};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;

#[derive(Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

/// `POST /upload/chunk`
pub async fn upload_chunk(
    State(service): State<UploadService>,
    payload: Result<Json<ChunkRequest>, JsonRejection>,
) -> Result<Json<ChunkResponse>, AppError> {
    let Json(req) = payload?;
    let receipt = service.submit_chunk(req)?;

    Ok(Json(ChunkResponse {
        success: true,
        received: receipt.received,
        total: receipt.total,
        progress: receipt.progress,
    }))
}

/// `POST /upload/finalize`
pub async fn finalize_upload(
    State(service): State<UploadService>,
    payload: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Json<FinalizeResponse>, AppError> {
    let Json(req) = payload?;
    let outcome = service.finalize(req).await?;

    Ok(Json(FinalizeResponse {
        success: true,
        message_id: outcome.message_id,
        file_id: outcome.file_id,
        file_name: outcome.file_name,
        file_size: outcome.file_size,
    }))
}

/// `GET /upload/status/{upload_id}`
pub async fn upload_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    service.store().sweep_expired();
    service
        .status(&upload_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Upload session `{}` not found", upload_id)))
}

/// `DELETE /upload/{upload_id}`
pub async fn cancel_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    service.store().sweep_expired();
    if !service.cancel(&upload_id) {
        return Err(AppError::not_found(format!(
            "Upload session `{}` not found",
            upload_id
        )));
    }
    Ok(Json(CancelResponse {
        success: true,
        message: "Upload cancelled".into(),
    }))
}

/// `POST /download`
pub async fn download_file(
    State(service): State<UploadService>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, AppError> {
    let Json(req) = payload?;
    let file = service.download(req).await?;

    Ok(Json(DownloadResponse {
        success: true,
        data: encode_chunk(&file.bytes),
        file_name: file.file_name,
        mime_type: file.mime_type,
    }))
}

/// CORS preflight. Headers are added by the CORS middleware.
pub async fn preflight() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn method_not_allowed() -> AppError {
    AppError::method_not_allowed()
}
