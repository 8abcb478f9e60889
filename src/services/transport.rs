//! The external store that durably keeps assembled files.
//!
//! A [`Transport`] opens a [`Connection`] from a caller-supplied session
//! credential. The relay only needs four things from a connection: an
//! identity probe, a document upload, a lookup by file id, and disconnect.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Prefix marking file ids that refer to photo-kind media.
pub const PHOTO_ID_PREFIX: &str = "photo_";

#[derive(Debug, Error)]
pub enum TransportError {
    /// The credential was rejected; the caller must re-authenticate.
    #[error("transport rejected credential: {0}")]
    Auth(String),
    /// The transport answered but refused the operation.
    #[error("transport error: {0}")]
    Rejected(String),
    /// The requested file does not exist on the transport.
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unexpected transport response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Auth failures surface as a distinct outcome so callers re-authenticate
    /// instead of retrying.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Account the credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

impl Identity {
    /// Name suitable for log lines.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.first_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// An assembled file on its way to the transport.
#[derive(Debug, Clone)]
pub struct OutgoingDocument {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Media attached to a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Document { id: String },
    Photo { id: String },
}

/// What the transport returns after storing a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: i64,
    pub media: Option<Media>,
}

impl SentMessage {
    /// Identifier used to fetch the file back later: the document id, or a
    /// `photo_`-prefixed id for photo results. Empty when no media came back.
    pub fn file_id(&self) -> String {
        match &self.media {
            Some(Media::Document { id }) => id.clone(),
            Some(Media::Photo { id }) => format!("{PHOTO_ID_PREFIX}{id}"),
            None => String::new(),
        }
    }
}

/// A file resolved back from the transport.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// Factory for authenticated connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection using `session`. Fails with [`TransportError::Auth`]
    /// when the credential is unusable.
    async fn connect(&self, session: &str) -> TransportResult<Box<dyn Connection>>;
}

/// One authenticated connection to the transport.
#[async_trait]
pub trait Connection: Send {
    /// "Who am I" probe. `None` means the credential no longer maps to an
    /// account.
    async fn who_am_i(&mut self) -> TransportResult<Option<Identity>>;

    /// Store `document` in the caller's own private chat.
    async fn send_document(&mut self, document: OutgoingDocument) -> TransportResult<SentMessage>;

    /// Resolve a file id produced by [`SentMessage::file_id`] back to bytes.
    async fn get_file(&mut self, file_id: &str) -> TransportResult<DownloadedFile>;

    async fn disconnect(&mut self) -> TransportResult<()>;
}
