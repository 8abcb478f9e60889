//! Client side of the chunked upload protocol.
//!
//! [`ChunkUploadClient`] reads a file chunk by chunk, posts each chunk in
//! index order with bounded retry, then asks the server to finalize. The
//! network side sits behind [`UploadApi`] so the same driver runs against
//! the HTTP server or an in-process service.

use crate::{
    models::wire::{
        ChunkRequest, ChunkResponse, ErrorBody, FinalizeRequest, FinalizeResponse,
    },
    services::chunk_reader::{ChunkReader, DEFAULT_CHUNK_SIZE, encode_chunk},
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::{io, path::Path, time::Duration};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncSeek},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors reported by an [`UploadApi`] call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Http(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// The two calls the upload driver needs from a server.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn send_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, ApiError>;
    async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ApiError>;
}

/// [`UploadApi`] over HTTP.
#[derive(Clone)]
pub struct HttpUploadApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or_else(|_| {
                    if text.is_empty() {
                        status
                            .canonical_reason()
                            .unwrap_or("request failed")
                            .to_string()
                    } else {
                        text
                    }
                });
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn send_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, ApiError> {
        self.post_json("/upload/chunk", req).await
    }

    async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ApiError> {
        self.post_json("/upload/finalize", req).await
    }
}

/// Per-chunk retry: `attempts` tries in total, waiting `attempt * base_delay`
/// after failed attempt number `attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("file is empty")]
    EmptyFile,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to upload chunk {index} after {attempts} attempts: {reason}")]
    ChunkTransmission {
        index: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Session expired. Please re-authenticate.")]
    SessionExpired,

    #[error("finalize failed: {message}")]
    Finalize { status: Option<u16>, message: String },

    #[error("Upload cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Preparing,
    Uploading,
    Finalizing,
    Complete,
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub phase: UploadPhase,
    pub chunks_uploaded: u64,
    pub total_chunks: u64,
    pub percent: u8,
}

/// Callback invoked with upload progress.
pub type ProgressFn = dyn Fn(UploadProgress) + Send + Sync;

/// Percent reported after `uploaded` of `total` chunks: the chunk phase
/// spans 0..=90, finalize owns the rest.
pub fn chunk_phase_percent(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (uploaded as f64 / total as f64 * 90.0).round() as u8
}

/// `upload_<unix millis>_<random>`.
pub fn generate_upload_id() -> String {
    format!(
        "upload_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

/// Metadata sent alongside every chunk.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub upload_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
}

/// A delivered upload as reported by finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub upload_id: String,
    pub message_id: i64,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

/// Drives one file through the chunk and finalize calls.
#[derive(Clone)]
pub struct ChunkUploadClient<A> {
    api: A,
    session: String,
    chunk_size: u64,
    retry: RetryPolicy,
}

impl<A: UploadApi> ChunkUploadClient<A> {
    pub fn new(api: A, session: impl Into<String>) -> Self {
        Self {
            api,
            session: session.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            ..retry
        };
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Upload the file at `path`. The file name sent to the server is the
    /// last path component.
    pub async fn upload_file(
        &self,
        path: &Path,
        upload_id: Option<String>,
        mime_type: Option<String>,
        on_progress: &ProgressFn,
    ) -> Result<UploadOutcome, ClientError> {
        let reader = ChunkReader::<File>::open(path, self.chunk_size).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = UploadTarget {
            upload_id: upload_id.unwrap_or_else(generate_upload_id),
            file_name,
            mime_type,
        };
        self.upload(reader, &target, on_progress).await
    }

    /// Upload everything `reader` covers under `target`.
    pub async fn upload<R>(
        &self,
        mut reader: ChunkReader<R>,
        target: &UploadTarget,
        on_progress: &ProgressFn,
    ) -> Result<UploadOutcome, ClientError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let total = reader.total_chunks();
        if total == 0 {
            return Err(ClientError::EmptyFile);
        }

        on_progress(UploadProgress {
            phase: UploadPhase::Preparing,
            chunks_uploaded: 0,
            total_chunks: total,
            percent: 0,
        });
        info!(
            "uploading {} ({} bytes) as {} in {} chunks",
            target.file_name,
            reader.file_size(),
            target.upload_id,
            total
        );

        for index in 0..total {
            let chunk_data = encode_chunk(&reader.read_chunk(index).await?);
            let req = ChunkRequest {
                upload_id: Some(target.upload_id.clone()),
                chunk_index: Some(index as usize),
                total_chunks: Some(total as usize),
                chunk_data: Some(chunk_data),
                file_name: Some(target.file_name.clone()),
                mime_type: target.mime_type.clone(),
                session: Some(self.session.clone()),
            };
            let resp = self.send_chunk_with_retry(&req, index).await?;
            debug!(
                "chunk {}/{} accepted ({}/{} on server)",
                index + 1,
                total,
                resp.received,
                resp.total
            );

            on_progress(UploadProgress {
                phase: UploadPhase::Uploading,
                chunks_uploaded: index + 1,
                total_chunks: total,
                percent: chunk_phase_percent(index + 1, total),
            });
        }

        on_progress(UploadProgress {
            phase: UploadPhase::Finalizing,
            chunks_uploaded: total,
            total_chunks: total,
            percent: 95,
        });

        let finalized = self
            .api
            .finalize(&FinalizeRequest {
                upload_id: Some(target.upload_id.clone()),
                session: Some(self.session.clone()),
            })
            .await
            .map_err(|err| match err.status() {
                Some(401) => ClientError::SessionExpired,
                status => ClientError::Finalize {
                    status,
                    message: match err {
                        ApiError::Status { message, .. } => message,
                        other => other.to_string(),
                    },
                },
            })?;

        on_progress(UploadProgress {
            phase: UploadPhase::Complete,
            chunks_uploaded: total,
            total_chunks: total,
            percent: 100,
        });
        info!(
            "upload {} finalized as message {}",
            target.upload_id, finalized.message_id
        );

        Ok(UploadOutcome {
            upload_id: target.upload_id.clone(),
            message_id: finalized.message_id,
            file_id: finalized.file_id,
            file_name: target.file_name.clone(),
            file_size: reader.file_size(),
        })
    }

    async fn send_chunk_with_retry(
        &self,
        req: &ChunkRequest,
        index: u64,
    ) -> Result<ChunkResponse, ClientError> {
        let mut attempt = 1;
        loop {
            match self.api.send_chunk(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < self.retry.attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "chunk {} attempt {}/{} failed: {}; retrying in {:?}",
                        index, attempt, self.retry.attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ClientError::ChunkTransmission {
                        index,
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        errors::AppError,
        services::{
            memory_transport::MemoryTransport, session_store::SessionStore,
            upload_service::UploadService,
        },
    };
    use std::{
        io::Cursor,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use reqwest::StatusCode;
    use tokio::time::Instant;

    fn status_error(status: StatusCode, message: impl Into<String>) -> ApiError {
        ApiError::Status {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    /// Calls the service directly, converting errors the way the HTTP layer
    /// would.
    #[derive(Clone)]
    pub(crate) struct DirectApi {
        pub service: UploadService,
        pub finalize_calls: Arc<AtomicUsize>,
    }

    impl DirectApi {
        pub(crate) fn new(service: UploadService) -> Self {
            Self {
                service,
                finalize_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl UploadApi for DirectApi {
        async fn send_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, ApiError> {
            let receipt = self.service.submit_chunk(req.clone()).map_err(|err| {
                let err = AppError::from(err);
                status_error(err.status, err.message)
            })?;
            Ok(ChunkResponse {
                success: true,
                received: receipt.received,
                total: receipt.total,
                progress: receipt.progress,
            })
        }

        async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ApiError> {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self.service.finalize(req.clone()).await.map_err(|err| {
                let err = AppError::from(err);
                status_error(err.status, err.message)
            })?;
            Ok(FinalizeResponse {
                success: true,
                message_id: outcome.message_id,
                file_id: outcome.file_id,
                file_name: outcome.file_name,
                file_size: outcome.file_size,
            })
        }
    }

    /// Fails every submission of one chunk index.
    struct FlakyApi {
        inner: DirectApi,
        failing_index: usize,
        /// Forward the failing chunk before reporting failure, as when the
        /// response is lost on the way back.
        lose_response: bool,
        attempts: AtomicUsize,
        attempt_times: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl UploadApi for FlakyApi {
        async fn send_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, ApiError> {
            if req.chunk_index == Some(self.failing_index) {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                self.attempt_times.lock().unwrap().push(Instant::now());
                if self.lose_response {
                    self.inner.send_chunk(req).await?;
                }
                return Err(status_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "connection reset",
                ));
            }
            self.inner.send_chunk(req).await
        }

        async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ApiError> {
            self.inner.finalize(req).await
        }
    }

    fn setup() -> (UploadService, MemoryTransport) {
        let transport = MemoryTransport::new();
        let service = UploadService::new(SessionStore::with_defaults(), Arc::new(transport.clone()));
        (service, transport)
    }

    fn target(id: &str) -> UploadTarget {
        UploadTarget {
            upload_id: id.into(),
            file_name: "data.bin".into(),
            mime_type: Some("application/x-test".into()),
        }
    }

    fn reader(data: &[u8], chunk_size: u64) -> ChunkReader<Cursor<Vec<u8>>> {
        ChunkReader::new(Cursor::new(data.to_vec()), data.len() as u64, chunk_size)
    }

    fn recorder() -> (Arc<Mutex<Vec<UploadProgress>>>, impl Fn(UploadProgress) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p: UploadProgress| sink.lock().unwrap().push(p))
    }

    #[test]
    fn upload_ids_have_expected_shape() {
        let id = generate_upload_id();
        let parts: Vec<_> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "upload");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 32);
        assert_ne!(id, generate_upload_id());
    }

    #[test]
    fn linear_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_after(1), Duration::from_secs(1));
        assert_eq!(retry.delay_after(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn exact_multiple_of_chunk_size_uploads_in_three_chunks() {
        let (service, transport) = setup();
        let api = DirectApi::new(service);
        let client = ChunkUploadClient::new(api.clone(), "token").with_chunk_size(4);
        let data = b"aaaabbbbcccc";
        let (seen, on_progress) = recorder();

        let outcome = client
            .upload(reader(data, 4), &target("u1"), &on_progress)
            .await
            .unwrap();

        assert_eq!(outcome.file_size, 12);
        let doc = transport.document(&outcome.file_id).unwrap();
        assert_eq!(doc.bytes.len(), data.len());
        assert_eq!(&doc.bytes[..], data);
        assert_eq!(doc.mime_type, "application/x-test");

        let percents: Vec<u8> = seen.lock().unwrap().iter().map(|p| p.percent).collect();
        assert_eq!(percents, vec![0, 30, 60, 90, 95, 100]);
        assert_eq!(api.finalize_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_any_call() {
        let (service, _) = setup();
        let api = DirectApi::new(service.clone());
        let client = ChunkUploadClient::new(api.clone(), "token");
        let (seen, on_progress) = recorder();

        let err = client
            .upload(reader(b"", 4), &target("u1"), &on_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyFile));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(service.stats().store.active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_chunk_aborts_upload_without_finalize() {
        let (service, _) = setup();
        let direct = DirectApi::new(service.clone());
        let api = FlakyApi {
            inner: direct.clone(),
            failing_index: 1,
            lose_response: true,
            attempts: AtomicUsize::new(0),
            attempt_times: Mutex::new(Vec::new()),
        };
        let client = ChunkUploadClient::new(api, "token").with_chunk_size(4);
        let (_, on_progress) = recorder();

        let err = client
            .upload(reader(b"aaaabbbbcccc", 4), &target("u1"), &on_progress)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("chunk 1"));
        match err {
            ClientError::ChunkTransmission {
                index, attempts, ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(direct.finalize_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.status("u1").unwrap().received_chunks, 2);

        let api = client.api();
        assert_eq!(api.attempts.load(Ordering::SeqCst), 3);
        let times = api.attempt_times.lock().unwrap();
        assert_eq!(times[1] - times[0], Duration::from_secs(1));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers_within_budget() {
        struct OnceFailing {
            inner: DirectApi,
            failed: AtomicUsize,
        }

        #[async_trait]
        impl UploadApi for OnceFailing {
            async fn send_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, ApiError> {
                if self.failed.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(status_error(StatusCode::BAD_GATEWAY, "upstream hiccup"));
                }
                self.inner.send_chunk(req).await
            }

            async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ApiError> {
                self.inner.finalize(req).await
            }
        }

        let (service, transport) = setup();
        let api = OnceFailing {
            inner: DirectApi::new(service),
            failed: AtomicUsize::new(0),
        };
        let client = ChunkUploadClient::new(api, "token").with_chunk_size(3);
        let (_, on_progress) = recorder();
        let outcome = client
            .upload(reader(b"abcdef", 3), &target("u1"), &on_progress)
            .await
            .unwrap();
        assert_eq!(&transport.document(&outcome.file_id).unwrap().bytes[..], b"abcdef");
    }

    #[tokio::test]
    async fn finalize_auth_failure_is_session_expired() {
        let (service, transport) = setup();
        transport.orphan("token");
        let client = ChunkUploadClient::new(DirectApi::new(service.clone()), "token").with_chunk_size(4);
        let (seen, on_progress) = recorder();

        let err = client
            .upload(reader(b"abc", 4), &target("u1"), &on_progress)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SessionExpired));
        assert!(service.status("u1").is_none());
        assert_eq!(seen.lock().unwrap().last().unwrap().percent, 95);
    }

    #[tokio::test]
    async fn finalize_transport_failure_carries_status() {
        let (service, transport) = setup();
        transport.fail_next_send("FILE_PARTS_INVALID");
        let client = ChunkUploadClient::new(DirectApi::new(service.clone()), "token").with_chunk_size(4);
        let (_, on_progress) = recorder();

        let err = client
            .upload(reader(b"abc", 4), &target("u1"), &on_progress)
            .await
            .unwrap_err();
        match err {
            ClientError::Finalize { status, message } => {
                assert_eq!(status, Some(500));
                assert!(message.contains("FILE_PARTS_INVALID"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(service.status("u1").is_some());
    }

    #[tokio::test]
    async fn upload_file_uses_path_name() {
        let (service, transport) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        tokio::fs::write(&path, b"%PDF-1.7 body").await.unwrap();

        let client = ChunkUploadClient::new(DirectApi::new(service), "token").with_chunk_size(5);
        let outcome = client
            .upload_file(&path, Some("u9".into()), None, &|_: UploadProgress| {})
            .await
            .unwrap();
        assert_eq!(outcome.upload_id, "u9");
        assert_eq!(outcome.file_name, "report.pdf");

        let doc = transport.document(&outcome.file_id).unwrap();
        assert_eq!(doc.file_name, "report.pdf");
        assert_eq!(doc.mime_type, "application/octet-stream");
        assert_eq!(&doc.bytes[..], b"%PDF-1.7 body");
    }
}
