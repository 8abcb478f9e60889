//! Telegram Bot API transport (managed mode).
//!
//! The session credential is the bot token. Documents are posted to a
//! configured private chat; `getMe` serves as the identity probe and
//! `getFile` resolves a stored file id back to a download path.

use crate::{
    models::upload_session::DEFAULT_MIME_TYPE,
    services::transport::{
        Connection, DownloadedFile, Identity, Media, OutgoingDocument, PHOTO_ID_PREFIX,
        SentMessage, Transport, TransportError, TransportResult,
    },
};
use async_trait::async_trait;
use reqwest::{
    StatusCode,
    multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

pub const DEFAULT_BOT_API_URL: &str = "https://api.telegram.org";

#[derive(Clone)]
pub struct BotApiTransport {
    http: reqwest::Client,
    base_url: String,
    chat_id: String,
}

impl BotApiTransport {
    pub fn new(base_url: impl Into<String>, chat_id: impl Into<String>) -> TransportResult<Self> {
        let http = reqwest::Client::builder().build().map_err(http_error)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Transport for BotApiTransport {
    async fn connect(&self, session: &str) -> TransportResult<Box<dyn Connection>> {
        // Bot tokens look like `<bot id>:<secret>`.
        if session.split_once(':').is_none_or(|(id, secret)| id.is_empty() || secret.is_empty()) {
            return Err(TransportError::Auth("malformed bot token".into()));
        }
        Ok(Box::new(BotApiConnection {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            chat_id: self.chat_id.clone(),
            token: session.to_string(),
        }))
    }
}

struct BotApiConnection {
    http: reqwest::Client,
    base_url: String,
    chat_id: String,
    token: String,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Deserialize)]
struct BotUser {
    id: i64,
    first_name: Option<String>,
    username: Option<String>,
}

#[derive(Deserialize)]
struct BotMessage {
    message_id: i64,
    document: Option<BotFileRef>,
    #[serde(default)]
    photo: Vec<BotFileRef>,
}

#[derive(Deserialize)]
struct BotFileRef {
    file_id: String,
}

#[derive(Deserialize)]
struct BotFile {
    file_path: Option<String>,
}

impl BotApiConnection {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> TransportResult<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Auth("Unauthorized".into()));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|err| TransportError::Decode(err.without_url().to_string()))?;

        if !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| format!("request failed with status {}", status));
            return Err(match envelope.error_code {
                Some(401) => TransportError::Auth(description),
                _ => TransportError::Rejected(description),
            });
        }

        envelope
            .result
            .ok_or_else(|| TransportError::Decode("missing result".into()))
    }
}

#[async_trait]
impl Connection for BotApiConnection {
    async fn who_am_i(&mut self) -> TransportResult<Option<Identity>> {
        let response = self
            .http
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(http_error)?;
        // The Bot API answers 404 for tokens that never existed.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let user: BotUser = Self::read_envelope(response).await?;
        Ok(Some(Identity {
            id: user.id,
            username: user.username,
            first_name: user.first_name,
        }))
    }

    async fn send_document(&mut self, document: OutgoingDocument) -> TransportResult<SentMessage> {
        let size = document.bytes.len() as u64;
        let body = document.bytes;
        let part = Part::stream_with_length(reqwest::Body::from(body.clone()), size)
            .file_name(document.file_name.clone())
            .mime_str(&document.mime_type)
            .or_else(|_| {
                debug!(
                    "unparseable mime type {:?}, sending as {}",
                    document.mime_type, DEFAULT_MIME_TYPE
                );
                Part::stream_with_length(reqwest::Body::from(body), size)
                    .file_name(document.file_name)
                    .mime_str(DEFAULT_MIME_TYPE)
            })
            .map_err(http_error)?;

        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("document", part);

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(http_error)?;
        let message: BotMessage = Self::read_envelope(response).await?;

        let media = match (message.document, message.photo.last()) {
            (Some(doc), _) => Some(Media::Document { id: doc.file_id }),
            (None, Some(photo)) => Some(Media::Photo {
                id: photo.file_id.clone(),
            }),
            (None, None) => None,
        };

        Ok(SentMessage {
            message_id: message.message_id,
            media,
        })
    }

    async fn get_file(&mut self, file_id: &str) -> TransportResult<DownloadedFile> {
        let raw_id = file_id.strip_prefix(PHOTO_ID_PREFIX).unwrap_or(file_id);
        let response = self
            .http
            .get(self.method_url("getFile"))
            .query(&[("file_id", raw_id)])
            .send()
            .await
            .map_err(http_error)?;
        let file: BotFile = match Self::read_envelope(response).await {
            Ok(file) => file,
            Err(TransportError::Rejected(description)) if is_unknown_file(&description) => {
                return Err(TransportError::NotFound(file_id.to_string()));
            }
            Err(err) => return Err(err),
        };
        let file_path = file
            .file_path
            .ok_or_else(|| TransportError::NotFound(file_id.to_string()))?;

        let response = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(TransportError::Rejected(format!(
                "file download failed with status {}",
                response.status()
            )));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        let bytes = response.bytes().await.map_err(http_error)?;
        let file_name = file_path
            .rsplit('/')
            .next()
            .unwrap_or(&file_path)
            .to_string();

        Ok(DownloadedFile {
            file_name,
            mime_type,
            bytes,
        })
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        // Bot API calls are stateless HTTP requests; nothing to tear down.
        Ok(())
    }
}

/// The Bot API reports an unknown or malformed file id as a 400 whose
/// description reads `Bad Request: invalid file_id` (or `wrong file_id`).
fn is_unknown_file(description: &str) -> bool {
    description.starts_with("Bad Request") && description.contains("file_id")
}

/// reqwest errors embed the request URL, which carries the bot token.
fn http_error(err: reqwest::Error) -> TransportError {
    TransportError::Http(err.without_url())
}
