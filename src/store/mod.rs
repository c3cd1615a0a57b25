use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod json_store;
#[cfg(feature = "mongo")]
pub mod mongo_store;
#[cfg(feature = "postgres")]
pub mod postgres_array_store;
#[cfg(feature = "postgres")]
pub mod postgres_text_store;

/// Keeps the store interface backend-agnostic: the JSON backend keys its map
/// by an arbitrary string, while the relational/document backends bind a
/// native numeric column. Every chat_id observed in practice is numeric (it
/// comes straight off `StreamConfig`/Telegram), so `Named` exists for the
/// interface contract rather than any real caller constructing one today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    Numeric(i64),
    Named(String),
}

impl ChatId {
    /// Storage key used by the JSON backend (`channel_<id>`), which has no
    /// native numeric column to bind against.
    pub fn storage_key(&self) -> String {
        match self {
            ChatId::Numeric(id) => format!("channel_{id}"),
            ChatId::Named(name) => format!("channel_{name}"),
        }
    }

    /// Relational/document backends store `chat_id` as a native `BIGINT`
    /// column; they can't represent a `Named` id and report so explicitly
    /// rather than silently truncating or stringifying it.
    pub fn as_numeric(&self) -> Result<i64> {
        match self {
            ChatId::Numeric(id) => Ok(*id),
            ChatId::Named(name) => {
                Err(Error::StorageUnavailable(anyhow::anyhow!("backend requires a numeric chat id, got {name:?}")))
            }
        }
    }
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        ChatId::Numeric(id)
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatId::Numeric(id) => write!(f, "{id}"),
            ChatId::Named(name) => write!(f, "{name}"),
        }
    }
}

/// One row/document per channel. Field set matches the persisted layout
/// exactly across all four backends (JSON, document, both relational
/// variants).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistRecord {
    pub chat_id: ChatId,
    pub playlist: Vec<i64>,
    pub latest_id: i64,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub last_started_id: Option<i64>,
    #[serde(default)]
    pub last_completed_id: Option<i64>,
    #[serde(default)]
    pub channel_name: Option<String>,
    pub updated_at: u64,
}

impl PlaylistRecord {
    pub fn empty(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            playlist: Vec::new(),
            latest_id: 0,
            reverse: false,
            last_started_id: None,
            last_completed_id: None,
            channel_name: None,
            updated_at: now_epoch_secs(),
        }
    }

    /// `get_playlist`: storage order, reversed iff `reverse`.
    pub fn view(&self) -> Vec<i64> {
        if self.reverse {
            self.playlist.iter().rev().copied().collect()
        } else {
            self.playlist.clone()
        }
    }

    /// Union-merge used by `append_new`: preserve existing order, append
    /// only previously-absent IDs in ascending order, and raise `latest_id`.
    pub fn merge_new(&mut self, ids: &[i64]) -> usize {
        let mut seen: std::collections::HashSet<i64> = self.playlist.iter().copied().collect();
        let mut sorted_new = ids.to_vec();
        sorted_new.sort_unstable();
        let mut added = 0;
        for id in sorted_new {
            if seen.insert(id) {
                self.playlist.push(id);
                added += 1;
            }
        }
        self.latest_id = self.latest_id.max(ids.iter().copied().max().unwrap_or(self.latest_id));
        added
    }
}

pub fn now_epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Storage contract implemented identically by all four backends. Every
/// method may fail with `Error::StorageUnavailable`.
#[async_trait]
pub trait PlaylistStore: Send + Sync {
    async fn load(&self, chat_id: &ChatId) -> Result<Option<PlaylistRecord>>;

    async fn append_new(
        &self,
        chat_id: &ChatId,
        ids: &[i64],
        reverse: Option<bool>,
        channel_name: Option<&str>,
    ) -> Result<()>;

    async fn remove_video(&self, chat_id: &ChatId, id: i64) -> Result<()>;

    async fn set_last_started(&self, chat_id: &ChatId, id: i64) -> Result<()>;

    async fn set_last_completed(&self, chat_id: &ChatId, id: i64) -> Result<()>;

    async fn get_playlist(&self, chat_id: &ChatId) -> Result<Vec<i64>>;
}
