use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};

use super::{now_epoch_secs, ChatId, PlaylistRecord, PlaylistStore};

/// Same table shape as `PostgresTextStore`, but `playlist` is a native
/// `BIGINT[]` bound directly as `Vec<i64>` via sqlx's array support.
pub struct PostgresArrayStore {
    pool: PgPool,
}

impl PostgresArrayStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS playlists_array (
                chat_id BIGINT PRIMARY KEY,
                playlist BIGINT[] NOT NULL DEFAULT '{}',
                latest_id BIGINT NOT NULL DEFAULT 0,
                last_started_id BIGINT,
                last_completed_id BIGINT,
                reverse BOOLEAN NOT NULL DEFAULT FALSE,
                channel_name TEXT,
                updated_at BIGINT NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    fn row_to_record(row: sqlx::postgres::PgRow) -> Result<PlaylistRecord> {
        Ok(PlaylistRecord {
            chat_id: ChatId::Numeric(row.try_get("chat_id").map_err(wrap)?),
            playlist: row.try_get("playlist").map_err(wrap)?,
            latest_id: row.try_get("latest_id").map_err(wrap)?,
            reverse: row.try_get("reverse").map_err(wrap)?,
            last_started_id: row.try_get("last_started_id").map_err(wrap)?,
            last_completed_id: row.try_get("last_completed_id").map_err(wrap)?,
            channel_name: row.try_get("channel_name").map_err(wrap)?,
            updated_at: row.try_get::<i64, _>("updated_at").map_err(wrap)? as u64,
        })
    }
}

fn wrap(e: sqlx::Error) -> Error {
    Error::StorageUnavailable(e.into())
}

#[async_trait]
impl PlaylistStore for PostgresArrayStore {
    async fn load(&self, chat_id: &ChatId) -> Result<Option<PlaylistRecord>> {
        let numeric = chat_id.as_numeric()?;
        let row = sqlx::query("SELECT * FROM playlists_array WHERE chat_id = $1")
            .bind(numeric)
            .fetch_optional(&self.pool)
            .await
            .map_err(wrap)?;
        row.map(Self::row_to_record).transpose()
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
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        let existing = sqlx::query("SELECT playlist, latest_id FROM playlists_array WHERE chat_id = $1 FOR UPDATE")
            .bind(numeric)
            .fetch_optional(&mut *tx)
            .await
            .map_err(wrap)?;

        let mut record = match existing {
            Some(row) => PlaylistRecord {
                playlist: row.try_get("playlist").map_err(wrap)?,
                latest_id: row.try_get("latest_id").map_err(wrap)?,
                ..PlaylistRecord::empty(chat_id.clone())
            },
            None => PlaylistRecord::empty(chat_id.clone()),
        };
        record.merge_new(ids);
        let now = now_epoch_secs() as i64;

        sqlx::query(
            r#"INSERT INTO playlists_array (chat_id, playlist, latest_id, reverse, channel_name, updated_at)
               VALUES ($1, $2, $3, COALESCE($4, FALSE), $5, $6)
               ON CONFLICT (chat_id) DO UPDATE SET
                 playlist = EXCLUDED.playlist,
                 latest_id = EXCLUDED.latest_id,
                 reverse = COALESCE($4, playlists_array.reverse),
                 channel_name = COALESCE($5, playlists_array.channel_name),
                 updated_at = EXCLUDED.updated_at"#,
        )
        .bind(numeric)
        .bind(&record.playlist)
        .bind(record.latest_id)
        .bind(reverse)
        .bind(channel_name)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(wrap)?;

        tx.commit().await.map_err(wrap)
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
        sqlx::query(
            "UPDATE playlists_array SET playlist = $2, last_started_id = $3, last_completed_id = $4, updated_at = $5 WHERE chat_id = $1",
        )
        .bind(numeric)
        .bind(&record.playlist)
        .bind(record.last_started_id)
        .bind(record.last_completed_id)
        .bind(now_epoch_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(wrap)?;
        Ok(())
    }

    async fn set_last_started(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let numeric = chat_id.as_numeric()?;
        sqlx::query(
            r#"INSERT INTO playlists_array (chat_id, last_started_id, updated_at) VALUES ($1, $2, $3)
               ON CONFLICT (chat_id) DO UPDATE SET last_started_id = $2, updated_at = $3"#,
        )
        .bind(numeric)
        .bind(id)
        .bind(now_epoch_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(wrap)?;
        Ok(())
    }

    async fn set_last_completed(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let numeric = chat_id.as_numeric()?;
        sqlx::query(
            r#"INSERT INTO playlists_array (chat_id, last_completed_id, updated_at) VALUES ($1, $2, $3)
               ON CONFLICT (chat_id) DO UPDATE SET last_completed_id = $2, updated_at = $3"#,
        )
        .bind(numeric)
        .bind(id)
        .bind(now_epoch_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(wrap)?;
        Ok(())
    }

    async fn get_playlist(&self, chat_id: &ChatId) -> Result<Vec<i64>> {
        Ok(self.load(chat_id).await?.map(|r| r.view()).unwrap_or_default())
    }
}
