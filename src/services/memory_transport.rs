//! In-process transport for local development and tests.
//!
//! Documents live in a shared map keyed by file id and are only visible to
//! the session that stored them.

use crate::services::transport::{
    Connection, DownloadedFile, Identity, Media, OutgoingDocument, SentMessage, Transport,
    TransportError, TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// A document held by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub message_id: i64,
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
    owner: String,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, StoredDocument>,
    next_message_id: i64,
    revoked: HashSet<String>,
    orphaned: HashSet<String>,
    pending_send_failure: Option<String>,
    connects: usize,
    disconnects: usize,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject `session` at connect time, as a revoked authorization would.
    pub fn revoke(&self, session: &str) {
        self.lock().revoked.insert(session.to_string());
    }

    /// Let `session` connect but answer the identity probe with nothing.
    pub fn orphan(&self, session: &str) {
        self.lock().orphaned.insert(session.to_string());
    }

    /// Make the next `send_document` call fail with `message`.
    pub fn fail_next_send(&self, message: impl Into<String>) {
        self.lock().pending_send_failure = Some(message.into());
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        let mut docs: Vec<_> = self.lock().documents.values().cloned().collect();
        docs.sort_by_key(|d| d.message_id);
        docs
    }

    pub fn document(&self, file_id: &str) -> Option<StoredDocument> {
        self.lock().documents.get(file_id).cloned()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connects - state.disconnects
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, session: &str) -> TransportResult<Box<dyn Connection>> {
        let mut state = self.lock();
        if session.is_empty() || state.revoked.contains(session) {
            return Err(TransportError::Auth("AUTH_KEY_UNREGISTERED".into()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            session: session.to_string(),
            open: true,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    session: String,
    open: bool,
}

impl MemoryConnection {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn who_am_i(&mut self) -> TransportResult<Option<Identity>> {
        let state = self.lock();
        if state.revoked.contains(&self.session) {
            return Err(TransportError::Auth("SESSION_REVOKED".into()));
        }
        if state.orphaned.contains(&self.session) {
            return Ok(None);
        }
        Ok(Some(Identity {
            id: 1,
            username: Some("memory".into()),
            first_name: None,
        }))
    }

    async fn send_document(&mut self, document: OutgoingDocument) -> TransportResult<SentMessage> {
        let session = self.session.clone();
        let mut state = self.lock();
        if let Some(message) = state.pending_send_failure.take() {
            return Err(TransportError::Rejected(message));
        }

        state.next_message_id += 1;
        let message_id = state.next_message_id;
        let file_id = format!("{}", 1_000_000 + message_id);
        debug!(
            "memory transport stored {} ({} bytes) as {}",
            document.file_name,
            document.bytes.len(),
            file_id
        );
        state.documents.insert(
            file_id.clone(),
            StoredDocument {
                message_id,
                file_id: file_id.clone(),
                file_name: document.file_name,
                mime_type: document.mime_type,
                bytes: document.bytes,
                owner: session,
            },
        );

        Ok(SentMessage {
            message_id,
            media: Some(Media::Document { id: file_id }),
        })
    }

    async fn get_file(&mut self, file_id: &str) -> TransportResult<DownloadedFile> {
        let state = self.lock();
        state
            .documents
            .get(file_id)
            .filter(|doc| doc.owner == self.session)
            .map(|doc| DownloadedFile {
                file_name: doc.file_name.clone(),
                mime_type: doc.mime_type.clone(),
                bytes: doc.bytes.clone(),
            })
            .ok_or_else(|| TransportError::NotFound(file_id.to_string()))
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        if self.open {
            self.open = false;
            self.lock().disconnects += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(bytes: &'static [u8]) -> OutgoingDocument {
        OutgoingDocument {
            file_name: "a.bin".into(),
            mime_type: "application/octet-stream".into(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn stored_documents_are_private_to_their_session() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("alice").await.unwrap();
        let sent = conn.send_document(doc(b"hello")).await.unwrap();
        conn.disconnect().await.unwrap();

        let mut own = transport.connect("alice").await.unwrap();
        let file = own.get_file(&sent.file_id()).await.unwrap();
        assert_eq!(&file.bytes[..], b"hello");

        let mut other = transport.connect("bob").await.unwrap();
        assert!(matches!(
            other.get_file(&sent.file_id()).await,
            Err(TransportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn revoked_session_cannot_connect() {
        let transport = MemoryTransport::new();
        transport.revoke("alice");
        let err = transport.connect("alice").await.err().unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn orphaned_session_probe_returns_none() {
        let transport = MemoryTransport::new();
        transport.orphan("alice");
        let mut conn = transport.connect("alice").await.unwrap();
        assert_eq!(conn.who_am_i().await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let transport = MemoryTransport::new();
        transport.fail_next_send("FILE_PARTS_INVALID");
        let mut conn = transport.connect("alice").await.unwrap();
        assert!(conn.send_document(doc(b"x")).await.is_err());
        assert!(conn.send_document(doc(b"x")).await.is_ok());
        assert_eq!(transport.documents().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_is_counted_once() {
        let transport = MemoryTransport::new();
        let mut conn = transport.connect("alice").await.unwrap();
        assert_eq!(transport.open_connections(), 1);
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(transport.open_connections(), 0);
    }
}
