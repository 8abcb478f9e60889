//! State shared by every HTTP handler.
//!
//! Wraps the session store, the finalize coordinator and the transport
//! behind request-shaped methods. Every upload call sweeps expired sessions
//! first so memory stays bounded even without the background sweeper.

use crate::{
    models::{
        upload_session::SessionStatus,
        wire::{ChunkRequest, DownloadRequest, FinalizeRequest},
    },
    services::{
        chunk_reader::decode_chunk,
        finalize::{FinalizeCoordinator, FinalizeOutcome},
        session_store::{ChunkSubmission, SessionStore, StoreError, StoreStats, SubmitReceipt},
        transport::{DownloadedFile, Transport, TransportError},
    },
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Upload session `{0}` not found. It may have expired.")]
    SessionNotFound(String),
    #[error("Not all chunks received: {received}/{total}")]
    IncompleteUpload { received: usize, total: usize },
    #[error("Missing chunk at index {0}")]
    MissingChunk(usize),
    #[error("Upload session `{0}` is already being finalized")]
    FinalizeInProgress(String),
    #[error("Session expired. Please re-authenticate.")]
    ExpiredSession,
    #[error("File `{0}` not found")]
    FileNotFound(String),
    #[error("{0}")]
    UploadFailed(String),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRequest(msg) => UploadError::InvalidRequest(msg),
            StoreError::SessionNotFound(id) => UploadError::SessionNotFound(id),
            StoreError::IncompleteUpload { received, total } => {
                UploadError::IncompleteUpload { received, total }
            }
            StoreError::MissingChunk(index) => UploadError::MissingChunk(index),
            StoreError::FinalizeInProgress(id) => UploadError::FinalizeInProgress(id),
        }
    }
}

impl From<TransportError> for UploadError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Auth(_) => UploadError::ExpiredSession,
            TransportError::NotFound(id) => UploadError::FileNotFound(id),
            other => UploadError::UploadFailed(other.to_string()),
        }
    }
}

/// Numbers reported by `GET /stats`.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UploadService {
    store: SessionStore,
    coordinator: FinalizeCoordinator,
    transport: Arc<dyn Transport>,
    started_at: DateTime<Utc>,
}

/// Ids that collide with static segments under `/upload/`, which would make
/// `DELETE /upload/{uploadId}` unreachable.
const RESERVED_UPLOAD_IDS: [&str; 2] = ["chunk", "finalize"];

fn required(field: Option<String>, name: &str) -> UploadResult<String> {
    field
        .filter(|value| !value.is_empty())
        .ok_or_else(|| UploadError::InvalidRequest(format!("{} is required", name)))
}

impl UploadService {
    pub fn new(store: SessionStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            coordinator: FinalizeCoordinator::new(store.clone(), transport.clone()),
            store,
            transport,
            started_at: Utc::now(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Validate and record one chunk from a `POST /upload/chunk` body.
    pub fn submit_chunk(&self, req: ChunkRequest) -> UploadResult<SubmitReceipt> {
        self.store.sweep_expired();

        let upload_id = required(req.upload_id, "uploadId")?;
        if RESERVED_UPLOAD_IDS.contains(&upload_id.as_str()) {
            return Err(UploadError::InvalidRequest(format!(
                "uploadId `{}` is reserved",
                upload_id
            )));
        }
        let session = required(req.session, "session")?;
        let chunk_index = req
            .chunk_index
            .ok_or_else(|| UploadError::InvalidRequest("chunkIndex is required".into()))?;
        let chunk_data = required(req.chunk_data, "chunkData")?;
        let data = decode_chunk(&chunk_data).map_err(|err| {
            UploadError::InvalidRequest(format!("chunkData is not valid base64: {}", err))
        })?;

        let receipt = self.store.submit(ChunkSubmission {
            upload_id: upload_id.clone(),
            chunk_index,
            total_chunks: req.total_chunks,
            data,
            file_name: req.file_name,
            mime_type: req.mime_type,
            session,
        })?;

        info!(
            "chunk {}/{} for {} ({}/{} received)",
            chunk_index + 1,
            receipt.total,
            upload_id,
            receipt.received,
            receipt.total
        );
        Ok(receipt)
    }

    /// Assemble and forward a complete upload (`POST /upload/finalize`).
    pub async fn finalize(&self, req: FinalizeRequest) -> UploadResult<FinalizeOutcome> {
        self.store.sweep_expired();

        let upload_id = required(req.upload_id, "uploadId")?;
        let session = required(req.session, "session")?;
        self.coordinator.finalize(&upload_id, &session).await
    }

    pub fn status(&self, upload_id: &str) -> Option<SessionStatus> {
        self.store
            .get(upload_id)
            .map(|session| SessionStatus::from(&session))
    }

    /// Explicit cancellation. Returns whether a session was removed.
    pub fn cancel(&self, upload_id: &str) -> bool {
        let removed = self.store.delete(upload_id);
        if removed {
            info!("cancelled upload session {}", upload_id);
        }
        removed
    }

    /// Resolve a transport file id back to its bytes (`POST /download`).
    pub async fn download(&self, req: DownloadRequest) -> UploadResult<DownloadedFile> {
        let session = required(req.session, "session")?;
        let file_id = required(req.file_id, "fileId")?;

        let mut conn = self.transport.connect(&session).await?;
        let result = async {
            conn.who_am_i()
                .await?
                .ok_or(UploadError::ExpiredSession)?;
            Ok::<_, UploadError>(conn.get_file(&file_id).await?)
        }
        .await;
        if let Err(err) = conn.disconnect().await {
            warn!("transport disconnect failed: {}", err);
        }
        result
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            store: self.store.stats(),
            started_at: self.started_at,
        }
    }
}
