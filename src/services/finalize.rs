//! Turns a complete upload session into a stored document.
//!
//! Flow: validate and assemble under the store lock, then connect to the
//! transport with the caller's credential, probe identity, send the file,
//! disconnect. Success and credential failures delete the session; every
//! other failure releases it so finalize alone can be retried. A finalize
//! future dropped mid-delivery releases the session the same way.

use crate::services::{
    session_store::{AssembledUpload, SessionStore},
    transport::{Connection, OutgoingDocument, Transport},
    upload_service::{UploadError, UploadResult},
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a delivered upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub message_id: i64,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Clears the finalizing flag on drop unless disarmed.
struct FinalizeGuard<'a> {
    store: &'a SessionStore,
    upload_id: &'a str,
    armed: bool,
}

impl<'a> FinalizeGuard<'a> {
    fn new(store: &'a SessionStore, upload_id: &'a str) -> Self {
        Self {
            store,
            upload_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.end_finalize(self.upload_id);
        }
    }
}

#[derive(Clone)]
pub struct FinalizeCoordinator {
    store: SessionStore,
    transport: Arc<dyn Transport>,
}

impl FinalizeCoordinator {
    pub fn new(store: SessionStore, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    pub async fn finalize(&self, upload_id: &str, session: &str) -> UploadResult<FinalizeOutcome> {
        if upload_id.is_empty() || session.is_empty() {
            return Err(UploadError::InvalidRequest(
                "Missing uploadId or session".into(),
            ));
        }

        let assembled = self.store.begin_finalize(upload_id)?;
        let mut guard = FinalizeGuard::new(&self.store, upload_id);
        info!(
            "assembled {} chunks for {}: {} ({} bytes)",
            assembled.total_chunks,
            upload_id,
            assembled.file_name,
            assembled.bytes.len()
        );

        match self.deliver(assembled, session).await {
            Ok(outcome) => {
                guard.disarm();
                self.store.delete(upload_id);
                info!(
                    "upload {} delivered as message {}",
                    upload_id, outcome.message_id
                );
                Ok(outcome)
            }
            Err(UploadError::ExpiredSession) => {
                guard.disarm();
                self.store.delete(upload_id);
                warn!("transport credential for {} is no longer valid", upload_id);
                Err(UploadError::ExpiredSession)
            }
            Err(err) => {
                error!("finalize of {} failed: {}", upload_id, err);
                Err(err)
            }
        }
    }

    async fn deliver(
        &self,
        assembled: AssembledUpload,
        session: &str,
    ) -> UploadResult<FinalizeOutcome> {
        let mut conn = self.transport.connect(session).await?;
        let result = Self::send(conn.as_mut(), assembled).await;
        if let Err(err) = conn.disconnect().await {
            warn!("transport disconnect failed: {}", err);
        }
        result
    }

    async fn send(
        conn: &mut dyn Connection,
        assembled: AssembledUpload,
    ) -> UploadResult<FinalizeOutcome> {
        let identity = conn.who_am_i().await?.ok_or(UploadError::ExpiredSession)?;
        info!("connected to transport as {}", identity.display_name());

        let file_size = assembled.bytes.len() as u64;
        let file_name = assembled.file_name.clone();
        let sent = conn
            .send_document(OutgoingDocument {
                file_name: assembled.file_name,
                mime_type: assembled.mime_type,
                bytes: assembled.bytes,
            })
            .await
            .map_err(|err| {
                if err.is_auth() {
                    UploadError::ExpiredSession
                } else {
                    UploadError::UploadFailed(err.to_string())
                }
            })?;

        Ok(FinalizeOutcome {
            message_id: sent.message_id,
            file_id: sent.file_id(),
            file_name,
            file_size,
        })
    }
}
