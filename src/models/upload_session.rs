//! Represents an in-flight chunked upload held by the server.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Fallback file name when the first chunk carries none.
pub const DEFAULT_FILE_NAME: &str = "file";

/// Fallback MIME type when the first chunk carries none.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Lifecycle position of a session, derived from its slots.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created but no slot filled yet.
    Empty,
    /// Some but not all slots filled.
    Accumulating,
    /// Every slot filled; finalize may run.
    Complete,
    /// A finalize call is currently forwarding the assembled file.
    Finalizing,
}

/// A server-side upload session keyed by the client's upload id.
///
/// `chunks` always has exactly `total_chunks` slots. A slot is written at
/// most once; `received_count` counts the filled slots.
#[derive(Clone)]
pub struct UploadSession {
    /// Opaque id chosen by the client.
    pub upload_id: String,

    /// One slot per expected chunk index.
    pub chunks: Vec<Option<Bytes>>,

    /// Declared by the first chunk and fixed afterwards.
    pub total_chunks: usize,

    /// File name taken from the first chunk.
    pub file_name: String,

    /// MIME type taken from the first chunk.
    pub mime_type: String,

    /// Number of filled slots.
    pub received_count: usize,

    /// Bytes currently buffered across all slots.
    pub total_size: u64,

    /// Transport credential supplied with the first chunk.
    pub session: String,

    /// Creation time; drives expiry.
    pub created_at: DateTime<Utc>,

    /// Time of the most recent chunk submission.
    pub last_activity: DateTime<Utc>,

    /// Set while a finalize call owns the session.
    pub finalizing: bool,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        total_chunks: usize,
        file_name: Option<String>,
        mime_type: Option<String>,
        session: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            chunks: vec![None; total_chunks],
            total_chunks,
            file_name: file_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            mime_type: mime_type
                .filter(|mime| !mime.is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            received_count: 0,
            total_size: 0,
            session: session.into(),
            created_at: now,
            last_activity: now,
            finalizing: false,
        }
    }

    /// Store `data` in slot `index` if it is still empty.
    ///
    /// Returns `true` when the slot was newly filled, `false` for a
    /// duplicate submission (the first write wins).
    pub fn store_chunk(&mut self, index: usize, data: Bytes) -> bool {
        let Some(slot) = self.chunks.get_mut(index) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        self.total_size += data.len() as u64;
        *slot = Some(data);
        self.received_count += 1;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    /// Index of the first empty slot, if any.
    pub fn first_missing(&self) -> Option<usize> {
        self.chunks.iter().position(Option::is_none)
    }

    /// Concatenate all slots in index order. Empty slots contribute nothing,
    /// so callers check [`first_missing`](Self::first_missing) first.
    pub fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_size as usize);
        for chunk in self.chunks.iter().flatten() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }

    /// Percentage of slots filled, rounded.
    pub fn progress_percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        ((self.received_count as f64 / self.total_chunks as f64) * 100.0).round() as u8
    }

    pub fn state(&self) -> SessionState {
        if self.finalizing {
            SessionState::Finalizing
        } else if self.received_count == 0 {
            SessionState::Empty
        } else if self.is_complete() {
            SessionState::Complete
        } else {
            SessionState::Accumulating
        }
    }
}

// The transport credential must never end up in logs.
impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("upload_id", &self.upload_id)
            .field("total_chunks", &self.total_chunks)
            .field("received_count", &self.received_count)
            .field("total_size", &self.total_size)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("session", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .field("finalizing", &self.finalizing)
            .finish()
    }
}

/// Public view of a session returned by the status endpoint.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub upload_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub received_chunks: usize,
    pub total_chunks: usize,
    pub total_size: u64,
    pub progress: u8,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&UploadSession> for SessionStatus {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            mime_type: session.mime_type.clone(),
            received_chunks: session.received_count,
            total_chunks: session.total_chunks,
            total_size: session.total_size,
            progress: session.progress_percent(),
            state: session.state(),
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}
