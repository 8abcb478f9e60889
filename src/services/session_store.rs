//! Process-wide registry of in-flight chunked uploads.
//!
//! All mutation goes through one mutex, so concurrent submitters for the
//! same upload id are serialized. Expiry is measured from `created_at`
//! against an injected [`Clock`]; expired sessions are invisible to every
//! read even before a sweep physically removes them.

use crate::models::upload_session::UploadSession;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default session lifetime in seconds: one hour.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 60 * 60;

/// Default cap on `totalChunks` for a new session: 256 GiB in 4 MiB chunks.
pub const DEFAULT_MAX_TOTAL_CHUNKS: usize = 65_536;

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(String),
    #[error("not all chunks received: {received}/{total}")]
    IncompleteUpload { received: usize, total: usize },
    #[error("missing chunk at index {0}")]
    MissingChunk(usize),
    #[error("upload session `{0}` is already being finalized")]
    FinalizeInProgress(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One chunk submission as received from a client.
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub upload_id: String,
    pub chunk_index: usize,
    /// Required when the submission creates the session.
    pub total_chunks: Option<usize>,
    pub data: Bytes,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub session: String,
}

/// Counts reported back after a chunk submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub received: usize,
    pub total: usize,
    pub progress: u8,
    /// False when the slot was already filled and the call was a no-op.
    pub stored: bool,
}

/// Everything finalize needs, copied out so the lock is not held while the
/// transport is busy.
#[derive(Debug, Clone)]
pub struct AssembledUpload {
    pub upload_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub total_chunks: usize,
    pub bytes: Bytes,
}

/// Aggregate numbers for the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub active_sessions: usize,
    pub buffered_bytes: u64,
}

#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, UploadSession>>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_total_chunks: usize,
}

impl SessionStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            clock,
            ttl,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
        }
    }

    /// Largest `totalChunks` a new session may declare.
    pub fn with_max_total_chunks(mut self, max_total_chunks: usize) -> Self {
        self.max_total_chunks = max_total_chunks;
        self
    }

    /// Store with the system clock and the default one-hour lifetime.
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(SystemClock),
            Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UploadSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `upload_id` from `map` if it has outlived the TTL.
    fn evict_if_expired(
        &self,
        map: &mut HashMap<String, UploadSession>,
        upload_id: &str,
        now: DateTime<Utc>,
    ) {
        if map
            .get(upload_id)
            .is_some_and(|s| s.is_expired(now, self.ttl))
        {
            map.remove(upload_id);
            debug!("evicted expired upload session {}", upload_id);
        }
    }

    /// Record one chunk.
    ///
    /// - The first submission for an id creates the session from its own
    ///   `total_chunks`, file name and MIME type.
    /// - Later submissions never change that metadata; a differing
    ///   `total_chunks` is logged and ignored.
    /// - A slot already filled is left untouched and the call succeeds.
    pub fn submit(&self, chunk: ChunkSubmission) -> StoreResult<SubmitReceipt> {
        if chunk.upload_id.is_empty() {
            return Err(StoreError::InvalidRequest("uploadId is required".into()));
        }
        if chunk.session.is_empty() {
            return Err(StoreError::InvalidRequest("session is required".into()));
        }

        let now = self.clock.now();
        let mut map = self.lock();
        self.evict_if_expired(&mut map, &chunk.upload_id, now);

        let session = match map.entry(chunk.upload_id.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if let Some(declared) = chunk.total_chunks {
                    if declared != existing.total_chunks {
                        warn!(
                            "upload {} declared {} chunks but session expects {}; keeping {}",
                            chunk.upload_id, declared, existing.total_chunks, existing.total_chunks
                        );
                    }
                }
                existing
            }
            Entry::Vacant(entry) => {
                let total = match chunk.total_chunks {
                    Some(total) if total > 0 => total,
                    _ => {
                        return Err(StoreError::InvalidRequest(
                            "totalChunks is required and must be positive".into(),
                        ));
                    }
                };
                if total > self.max_total_chunks {
                    return Err(StoreError::InvalidRequest(format!(
                        "totalChunks {} exceeds the limit of {}",
                        total, self.max_total_chunks
                    )));
                }
                if chunk.chunk_index >= total {
                    return Err(StoreError::InvalidRequest(format!(
                        "chunkIndex {} out of range for {} chunks",
                        chunk.chunk_index, total
                    )));
                }
                info!(
                    "created upload session {} ({} chunks)",
                    chunk.upload_id, total
                );
                entry.insert(UploadSession::new(
                    chunk.upload_id.clone(),
                    total,
                    chunk.file_name,
                    chunk.mime_type,
                    chunk.session,
                    now,
                ))
            }
        };

        if chunk.chunk_index >= session.total_chunks {
            return Err(StoreError::InvalidRequest(format!(
                "chunkIndex {} out of range for {} chunks",
                chunk.chunk_index, session.total_chunks
            )));
        }

        session.last_activity = now;
        let stored = session.store_chunk(chunk.chunk_index, chunk.data);
        if stored {
            debug!(
                "stored chunk {} for {} ({}/{})",
                chunk.chunk_index, chunk.upload_id, session.received_count, session.total_chunks
            );
        } else {
            debug!(
                "chunk {} for {} already stored; ignoring resubmission",
                chunk.chunk_index, chunk.upload_id
            );
        }

        Ok(SubmitReceipt {
            received: session.received_count,
            total: session.total_chunks,
            progress: session.progress_percent(),
            stored,
        })
    }

    /// Snapshot of a live session. Chunk buffers are reference-counted, so
    /// the clone does not copy payload bytes.
    pub fn get(&self, upload_id: &str) -> Option<UploadSession> {
        let now = self.clock.now();
        let mut map = self.lock();
        self.evict_if_expired(&mut map, upload_id, now);
        map.get(upload_id).cloned()
    }

    /// Remove a session. Returns whether it existed.
    pub fn delete(&self, upload_id: &str) -> bool {
        self.lock().remove(upload_id).is_some()
    }

    /// Remove every session older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, session| !session.is_expired(now, self.ttl));
        let removed = before - map.len();
        if removed > 0 {
            info!("cleaned up {} stale upload sessions", removed);
        }
        removed
    }

    /// Validate completeness and hand out the assembled bytes, marking the
    /// session as finalizing. Pair with [`end_finalize`](Self::end_finalize)
    /// or [`delete`](Self::delete).
    pub fn begin_finalize(&self, upload_id: &str) -> StoreResult<AssembledUpload> {
        let now = self.clock.now();
        let mut map = self.lock();
        self.evict_if_expired(&mut map, upload_id, now);

        let session = map
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::SessionNotFound(upload_id.to_string()))?;

        if session.finalizing {
            return Err(StoreError::FinalizeInProgress(upload_id.to_string()));
        }
        if session.received_count < session.total_chunks {
            return Err(StoreError::IncompleteUpload {
                received: session.received_count,
                total: session.total_chunks,
            });
        }
        if let Some(index) = session.first_missing() {
            return Err(StoreError::MissingChunk(index));
        }

        session.finalizing = true;
        Ok(AssembledUpload {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            mime_type: session.mime_type.clone(),
            total_chunks: session.total_chunks,
            bytes: session.assemble(),
        })
    }

    /// Release a session after a failed finalize so finalize can be retried.
    pub fn end_finalize(&self, upload_id: &str) {
        if let Some(session) = self.lock().get_mut(upload_id) {
            session.finalizing = false;
        }
    }

    pub fn stats(&self) -> StoreStats {
        let map = self.lock();
        StoreStats {
            active_sessions: map.len(),
            buffered_bytes: map.values().map(|s| s.total_size).sum(),
        }
    }
}
