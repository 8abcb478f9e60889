//! Sequential multi-file uploader with per-file status tracking.
//!
//! Files are uploaded one at a time in the order they were queued. A failed
//! file is marked `error` and the queue moves on. Cancelling a file removes
//! its entry and aborts its in-flight upload locally; the server is not told
//! and the abandoned session is left for expiry.

use crate::services::upload_client::{
    ChunkUploadClient, ClientError, UploadApi, UploadProgress, generate_upload_id,
};
use serde::Serialize;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Success,
    Error,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Success | FileStatus::Error)
    }
}

/// Client-side view of one queued file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadingFileState {
    pub upload_id: String,
    pub path: PathBuf,
    pub progress: u8,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

struct QueueEntry {
    state: UploadingFileState,
    cancel: CancellationToken,
}

type Entries = Arc<Mutex<Vec<QueueEntry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, Vec<QueueEntry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

fn update(entries: &Entries, upload_id: &str, f: impl FnOnce(&mut UploadingFileState)) {
    if let Some(entry) = lock(entries)
        .iter_mut()
        .find(|e| e.state.upload_id == upload_id)
    {
        f(&mut entry.state);
    }
}

#[derive(Clone)]
pub struct UploadQueue<A> {
    client: ChunkUploadClient<A>,
    entries: Entries,
}

impl<A: UploadApi> UploadQueue<A> {
    pub fn new(client: ChunkUploadClient<A>) -> Self {
        Self {
            client,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue `path` under a freshly generated upload id.
    pub fn enqueue(&self, path: impl Into<PathBuf>) -> String {
        self.enqueue_with_id(path, generate_upload_id())
    }

    pub fn enqueue_with_id(&self, path: impl Into<PathBuf>, upload_id: impl Into<String>) -> String {
        let upload_id = upload_id.into();
        lock(&self.entries).push(QueueEntry {
            state: UploadingFileState {
                upload_id: upload_id.clone(),
                path: path.into(),
                progress: 0,
                status: FileStatus::Pending,
                error: None,
                file_id: None,
            },
            cancel: CancellationToken::new(),
        });
        upload_id
    }

    pub fn files(&self) -> Vec<UploadingFileState> {
        lock(&self.entries).iter().map(|e| e.state.clone()).collect()
    }

    /// True while any tracked file is pending or uploading.
    pub fn is_uploading(&self) -> bool {
        lock(&self.entries)
            .iter()
            .any(|e| !e.state.status.is_terminal())
    }

    /// Stop tracking `upload_id` and abort its upload if it is running.
    pub fn cancel(&self, upload_id: &str) -> bool {
        let mut entries = lock(&self.entries);
        let Some(pos) = entries.iter().position(|e| e.state.upload_id == upload_id) else {
            return false;
        };
        let entry = entries.remove(pos);
        entry.cancel.cancel();
        info!("cancelled queued upload {}", upload_id);
        true
    }

    /// Drop every entry that finished, successfully or not.
    pub fn clear_completed(&self) {
        lock(&self.entries).retain(|e| !e.state.status.is_terminal());
    }

    fn next_pending(&self) -> Option<(String, PathBuf, CancellationToken)> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.state.status == FileStatus::Pending)?;
        entry.state.status = FileStatus::Uploading;
        entry.state.progress = 0;
        Some((
            entry.state.upload_id.clone(),
            entry.state.path.clone(),
            entry.cancel.clone(),
        ))
    }

    /// Upload every pending file, one after another, until none are left.
    /// Returns the final state of each file processed, cancelled ones
    /// included.
    pub async fn run(&self) -> Vec<UploadingFileState> {
        let mut finished = Vec::new();

        while let Some((upload_id, path, cancel)) = self.next_pending() {
            let entries = self.entries.clone();
            let id = upload_id.clone();
            let on_progress = move |p: UploadProgress| {
                update(&entries, &id, |state| state.progress = p.percent);
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                result = self.client.upload_file(&path, Some(upload_id.clone()), None, &on_progress) => result,
            };

            let (status, error, file_id) = match result {
                Ok(outcome) => {
                    info!("{} uploaded as {}", path.display(), outcome.file_id);
                    (FileStatus::Success, None, Some(outcome.file_id))
                }
                Err(err) => {
                    warn!("{} failed: {}", path.display(), err);
                    (FileStatus::Error, Some(err.to_string()), None)
                }
            };

            let mut tracked = None;
            update(&self.entries, &upload_id, |entry| {
                entry.status = status;
                entry.error = error.clone();
                entry.file_id = file_id.clone();
                if status == FileStatus::Success {
                    entry.progress = 100;
                }
                tracked = Some(entry.clone());
            });
            // Cancelled entries are no longer tracked.
            finished.push(tracked.unwrap_or(UploadingFileState {
                upload_id,
                path,
                progress: 0,
                status,
                error,
                file_id,
            }));
        }

        finished
    }
}
