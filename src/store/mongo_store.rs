use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{now_epoch_secs, ChatId, PlaylistRecord, PlaylistStore};

/// One `playlists` collection, `_id = chat_id`, same field set as the
/// other three backends.
pub struct MongoPlaylistStore {
    collection: Collection<Doc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Doc {
    #[serde(rename = "_id")]
    chat_id: i64,
    playlist: Vec<i64>,
    latest_id: i64,
    #[serde(default)]
    reverse: bool,
    last_started_id: Option<i64>,
    last_completed_id: Option<i64>,
    channel_name: Option<String>,
    updated_at: i64,
}

impl Doc {
    /// `r.chat_id` must already be numeric; callers convert with
    /// `ChatId::as_numeric` before this is reached.
    fn from_record(r: &PlaylistRecord, numeric_id: i64) -> Self {
        Doc {
            chat_id: numeric_id,
            playlist: r.playlist.clone(),
            latest_id: r.latest_id,
            reverse: r.reverse,
            last_started_id: r.last_started_id,
            last_completed_id: r.last_completed_id,
            channel_name: r.channel_name.clone(),
            updated_at: r.updated_at as i64,
        }
    }
}

impl From<Doc> for PlaylistRecord {
    fn from(d: Doc) -> Self {
        PlaylistRecord {
            chat_id: ChatId::Numeric(d.chat_id),
            playlist: d.playlist,
            latest_id: d.latest_id,
            reverse: d.reverse,
            last_started_id: d.last_started_id,
            last_completed_id: d.last_completed_id,
            channel_name: d.channel_name,
            updated_at: d.updated_at as u64,
        }
    }
}

fn wrap(e: mongodb::error::Error) -> Error {
    Error::StorageUnavailable(e.into())
}

impl MongoPlaylistStore {
    pub async fn connect(uri: &str, db_name: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let collection = client.database(db_name).collection::<Doc>("playlists");
        Ok(Self { collection })
    }
}

#[async_trait]
impl PlaylistStore for MongoPlaylistStore {
    async fn load(&self, chat_id: &ChatId) -> Result<Option<PlaylistRecord>> {
        let numeric = chat_id.as_numeric()?;
        let doc = self.collection.find_one(doc! { "_id": numeric }).await.map_err(wrap)?;
        Ok(doc.map(Into::into))
    }

    async fn append_new(
        &self,
        chat_id: &ChatId,
        ids: &[i64],
        reverse: Option<bool>,
        channel_name: Option<&str>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let numeric = chat_id.as_numeric()?;
        let mut record = self.load(chat_id).await?.unwrap_or_else(|| PlaylistRecord::empty(chat_id.clone()));
        record.merge_new(ids);
        if let Some(r) = reverse {
            record.reverse = r;
        }
        if let Some(name) = channel_name {
            record.channel_name = Some(name.to_string());
        }
        record.updated_at = now_epoch_secs();

        self.collection
            .replace_one(doc! { "_id": numeric }, Doc::from_record(&record, numeric))
            .upsert(true)
            .await
            .map_err(wrap)?;
        Ok(())
    }

    async fn remove_video(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let numeric = chat_id.as_numeric()?;
        let Some(mut record) = self.load(chat_id).await? else {
            return Ok(());
        };
        record.playlist.retain(|&v| v != id);
        if record.last_started_id == Some(id) {
            record.last_started_id = None;
        }
        if record.last_completed_id == Some(id) {
            record.last_completed_id = None;
        }
        record.updated_at = now_epoch_secs();

        self.collection
            .update_one(
                doc! { "_id": numeric },
                doc! { "$set": {
                    "playlist": record.playlist,
                    "last_started_id": record.last_started_id,
                    "last_completed_id": record.last_completed_id,
                    "updated_at": record.updated_at as i64,
                }},
            )
            .await
            .map_err(wrap)?;
        Ok(())
    }

    async fn set_last_started(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let numeric = chat_id.as_numeric()?;
        self.collection
            .update_one(
                doc! { "_id": numeric },
                doc! {
                    "$set": { "last_started_id": id, "updated_at": now_epoch_secs() as i64 },
                    "$setOnInsert": { "playlist": Vec::<i64>::new(), "latest_id": 0i64, "reverse": false },
                },
            )
            .upsert(true)
            .await
            .map_err(wrap)?;
        Ok(())
    }

    async fn set_last_completed(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let numeric = chat_id.as_numeric()?;
        self.collection
            .update_one(
                doc! { "_id": numeric },
                doc! {
                    "$set": { "last_completed_id": id, "updated_at": now_epoch_secs() as i64 },
                    "$setOnInsert": { "playlist": Vec::<i64>::new(), "latest_id": 0i64, "reverse": false },
                },
            )
            .upsert(true)
            .await
            .map_err(wrap)?;
        Ok(())
    }

    async fn get_playlist(&self, chat_id: &ChatId) -> Result<Vec<i64>> {
        Ok(self.load(chat_id).await?.map(|r| r.view()).unwrap_or_default())
    }
}
