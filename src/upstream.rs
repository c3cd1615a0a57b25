use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Video,
    Document,
    /// Any wire-level type other than `video`/`document`, e.g. `photo` or
    /// `audio`; kept distinct so `get_file_properties` can reject it
    /// explicitly instead of a deserialization mismatch surfacing as
    /// an opaque error.
    #[serde(other)]
    Other,
}

/// The decoded file identifier for one chat message, augmented with the
/// metadata `get_file_properties` attaches before caching.
#[derive(Debug, Clone, Deserialize)]
pub struct FileDescriptor {
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: String,
    pub dc_id: i32,
    pub file_type: FileKind,
    pub file_size: u64,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub unique_id: String,
}

/// One authenticated session bound to a single datacenter; issues the
/// ranged reads `yield_file` drives.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn dc_id(&self) -> i32;
    async fn get_file(&self, descriptor: &FileDescriptor, offset: u64, limit: u32) -> Result<Bytes>;
}

/// One upstream credential: the main control client, the helper (worker 0),
/// or one of the numbered workers (1..K).
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn home_dc(&self) -> i32;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    async fn resolve_file(&self, chat_id: i64, message_id: i64) -> Result<FileDescriptor>;

    /// Reuses the primary session when `dc_id` is the home datacenter;
    /// otherwise looks up or creates a session keyed by `dc_id`, exporting
    /// an authorization from the home session and importing it on a fresh
    /// one bound to that datacenter.
    async fn media_session(&self, dc_id: i32) -> Result<Arc<dyn MediaSession>>;

    async fn scan_recent_videos(&self, chat_id: i64, limit: u32) -> Result<Vec<(i64, FileDescriptor)>>;
    async fn scan_videos_since(&self, chat_id: i64, since_id: i64, limit: u32) -> Result<Vec<(i64, FileDescriptor)>>;
    async fn resolve_channel_name(&self, chat_id: i64) -> Result<Option<String>>;
}

/// Concrete `UpstreamClient`: HTTP against a configured per-datacenter base
/// URL, using the same `reqwest` crate the HTTP server's own outbound fetch
/// already depends on.
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
    home_dc: i32,
    sessions: RwLock<HashMap<i32, Arc<dyn MediaSession>>>,
}

impl HttpUpstreamClient {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>, home_dc: i32) -> Self {
        Self {
            http: reqwest::Client::builder().danger_accept_invalid_certs(true).build().unwrap_or_default(),
            base_url: base_url.into(),
            bot_token: bot_token.into(),
            home_dc,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn dc_url(&self, dc_id: i32, path: &str) -> String {
        format!("{}/dc{}{}", self.base_url.trim_end_matches('/'), dc_id, path)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    fn home_dc(&self) -> i32 {
        self.home_dc
    }

    async fn connect(&self) -> Result<()> {
        let url = self.dc_url(self.home_dc, "/getMe");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bot_token)
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::CredentialExpired);
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(Error::RateLimited(wait));
        }
        let primary: Arc<dyn MediaSession> =
            Arc::new(HttpMediaSession { http: self.http.clone(), base_url: self.dc_url(self.home_dc, ""), dc_id: self.home_dc });
        self.sessions.write().await.insert(self.home_dc, primary);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.sessions.write().await.clear();
        Ok(())
    }

    async fn resolve_file(&self, chat_id: i64, message_id: i64) -> Result<FileDescriptor> {
        let url = self.dc_url(self.home_dc, "/getMessageFile");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bot_token)
            .query(&[("chat_id", chat_id.to_string()), ("message_id", message_id.to_string())])
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound);
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited(1));
        }

        let descriptor: FileDescriptor = resp.json().await.map_err(|e| Error::Other(e.into()))?;
        if descriptor.file_size == 0 {
            return Err(Error::NotFound);
        }
        Ok(descriptor)
    }

    async fn media_session(&self, dc_id: i32) -> Result<Arc<dyn MediaSession>> {
        if let Some(session) = self.sessions.read().await.get(&dc_id) {
            return Ok(session.clone());
        }
        if dc_id == self.home_dc {
            return Err(Error::Other(anyhow::anyhow!("home dc session not connected")));
        }

        debug!(dc_id, "exporting authorization to new datacenter");
        let export_url = self.dc_url(self.home_dc, "/exportAuthorization");
        let exported: ExportedAuth = self
            .http
            .get(&export_url)
            .bearer_auth(&self.bot_token)
            .query(&[("dc_id", dc_id.to_string())])
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?
            .json()
            .await
            .map_err(|e| Error::Other(e.into()))?;

        let import_url = self.dc_url(dc_id, "/importAuthorization");
        self.http
            .post(&import_url)
            .bearer_auth(&self.bot_token)
            .json(&exported)
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;

        let session: Arc<dyn MediaSession> =
            Arc::new(HttpMediaSession { http: self.http.clone(), base_url: self.dc_url(dc_id, ""), dc_id });

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(dc_id).or_insert(session).clone();
        Ok(session)
    }

    async fn scan_recent_videos(&self, chat_id: i64, limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
        self.scan(chat_id, None, limit).await
    }

    async fn scan_videos_since(&self, chat_id: i64, since_id: i64, limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
        self.scan(chat_id, Some(since_id), limit).await
    }

    async fn resolve_channel_name(&self, chat_id: i64) -> Result<Option<String>> {
        let url = self.dc_url(self.home_dc, "/getChat");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bot_token)
            .query(&[("chat_id", chat_id.to_string())])
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;
        if !resp.status().is_success() {
            warn!(chat_id, status = %resp.status(), "could not resolve channel name");
            return Ok(None);
        }
        #[derive(Deserialize)]
        struct ChatInfo {
            title: Option<String>,
        }
        let info: ChatInfo = resp.json().await.map_err(|e| Error::Other(e.into()))?;
        Ok(info.title)
    }
}

impl HttpUpstreamClient {
    async fn scan(&self, chat_id: i64, since_id: Option<i64>, limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
        let url = self.dc_url(self.home_dc, "/scanMessages");
        let mut query = vec![("chat_id".to_string(), chat_id.to_string()), ("limit".to_string(), limit.to_string())];
        if let Some(since) = since_id {
            query.push(("since_id".to_string(), since.to_string()));
        }
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bot_token)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(Error::RateLimited(wait));
        }

        #[derive(Deserialize)]
        struct ScanEntry {
            message_id: i64,
            #[serde(flatten)]
            descriptor: FileDescriptor,
        }
        let entries: Vec<ScanEntry> = resp.json().await.map_err(|e| Error::Other(e.into()))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.descriptor.file_type == FileKind::Video || e.descriptor.mime_type.starts_with("video/"))
            .map(|e| (e.message_id, e.descriptor))
            .collect())
    }
}

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
struct ExportedAuth {
    id: i64,
    bytes: String,
}

struct HttpMediaSession {
    http: reqwest::Client,
    base_url: String,
    dc_id: i32,
}

#[async_trait]
impl MediaSession for HttpMediaSession {
    fn dc_id(&self) -> i32 {
        self.dc_id
    }

    async fn get_file(&self, descriptor: &FileDescriptor, offset: u64, limit: u32) -> Result<Bytes> {
        let url = format!("{}/getFile", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("media_id", descriptor.media_id.to_string()),
                ("access_hash", descriptor.access_hash.to_string()),
                ("file_reference", descriptor.file_reference.clone()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::Other(e.into()))?;

        if resp.status() == reqwest::StatusCode::REQUEST_TIMEOUT || resp.status().is_server_error() {
            return Err(Error::PipeClosed);
        }
        resp.bytes().await.map_err(|e| Error::Other(e.into()))
    }
}
