use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::{now_epoch_secs, ChatId, PlaylistRecord, PlaylistStore};

/// Single `playlists.json`, written atomically (temp file + rename). All
/// I/O is serialized by one in-process mutex, mirroring the Python
/// `JsonPlaylistStore`'s `asyncio.Lock`.
pub struct JsonPlaylistStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonPlaylistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    fn key(chat_id: &ChatId) -> String {
        chat_id.storage_key()
    }

    async fn load_all(&self) -> HashMap<String, PlaylistRecord> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("playlists.json malformed, starting from empty state: {e}");
                HashMap::new()
            }),
            _ => HashMap::new(),
        }
    }

    async fn save_all(&self, data: &HashMap<String, PlaylistRecord>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(data).map_err(|e| Error::StorageUnavailable(e.into()))?;
        tokio::fs::write(&tmp, &body).await.map_err(|e| Error::StorageUnavailable(e.into()))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| Error::StorageUnavailable(e.into()))?;
        debug!(path = %self.path.display(), "playlists.json written");
        Ok(())
    }
}

#[async_trait]
impl PlaylistStore for JsonPlaylistStore {
    async fn load(&self, chat_id: &ChatId) -> Result<Option<PlaylistRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await.remove(&Self::key(chat_id)))
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
        let _guard = self.lock.lock().await;
        let mut data = self.load_all().await;
        let key = Self::key(chat_id);
        let mut entry = data.remove(&key).unwrap_or_else(|| PlaylistRecord::empty(chat_id.clone()));

        let added = entry.merge_new(ids);
        if let Some(r) = reverse {
            entry.reverse = r;
        }
        if let Some(name) = channel_name {
            entry.channel_name = Some(name.to_string());
        }
        entry.updated_at = now_epoch_secs();

        info!(chat_id, added, total = entry.playlist.len(), latest_id = entry.latest_id, "appended to playlist");
        data.insert(key, entry);
        self.save_all(&data).await
    }

    async fn remove_video(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.load_all().await;
        let key = Self::key(chat_id);
        let Some(entry) = data.get_mut(&key) else {
            return Ok(());
        };
        entry.playlist.retain(|&v| v != id);
        if entry.last_started_id == Some(id) {
            entry.last_started_id = None;
        }
        if entry.last_completed_id == Some(id) {
            entry.last_completed_id = None;
        }
        entry.updated_at = now_epoch_secs();
        self.save_all(&data).await
    }

    async fn set_last_started(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.load_all().await;
        let entry = data.entry(Self::key(chat_id)).or_insert_with(|| PlaylistRecord::empty(chat_id.clone()));
        entry.last_started_id = Some(id);
        entry.updated_at = now_epoch_secs();
        self.save_all(&data).await
    }

    async fn set_last_completed(&self, chat_id: &ChatId, id: i64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut data = self.load_all().await;
        let entry = data.entry(Self::key(chat_id)).or_insert_with(|| PlaylistRecord::empty(chat_id.clone()));
        entry.last_completed_id = Some(id);
        entry.updated_at = now_epoch_secs();
        self.save_all(&data).await
    }

    async fn get_playlist(&self, chat_id: &ChatId) -> Result<Vec<i64>> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await.get(&Self::key(chat_id)).map(PlaylistRecord::view).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlists.json");
        let store = JsonPlaylistStore::new(&path);
        let chat = ChatId::Numeric(42);

        store.append_new(&chat, &[10, 20, 30], Some(false), None).await.unwrap();
        let record = store.load(&chat).await.unwrap().unwrap();
        assert_eq!(record.playlist, vec![10, 20, 30]);
        assert_eq!(record.latest_id, 30);
        assert_eq!(record.last_started_id, None);

        let reloaded = JsonPlaylistStore::new(&path).load(&chat).await.unwrap().unwrap();
        assert_eq!(reloaded, record);
    }

    #[tokio::test]
    async fn append_is_idempotent_with_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPlaylistStore::new(dir.path().join("playlists.json"));
        let chat = ChatId::Numeric(1);
        store.append_new(&chat, &[1, 2, 3], None, None).await.unwrap();
        store.append_new(&chat, &[2, 3, 4, 5], None, None).await.unwrap();
        let record = store.load(&chat).await.unwrap().unwrap();
        assert_eq!(record.playlist, vec![1, 2, 3, 4, 5]);
        assert_eq!(record.latest_id, 5);
    }

    #[tokio::test]
    async fn reverse_view_does_not_mutate_storage_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPlaylistStore::new(dir.path().join("playlists.json"));
        let chat = ChatId::Numeric(7);
        store.append_new(&chat, &[10, 20, 30], Some(true), None).await.unwrap();
        assert_eq!(store.get_playlist(&chat).await.unwrap(), vec![30, 20, 10]);
        let record = store.load(&chat).await.unwrap().unwrap();
        assert_eq!(record.playlist, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn remove_video_clears_markers() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPlaylistStore::new(dir.path().join("playlists.json"));
        let chat = ChatId::Numeric(3);
        store.append_new(&chat, &[1, 2, 3], None, None).await.unwrap();
        store.set_last_started(&chat, 2).await.unwrap();
        store.set_last_completed(&chat, 2).await.unwrap();
        store.remove_video(&chat, 2).await.unwrap();
        let record = store.load(&chat).await.unwrap().unwrap();
        assert!(!record.playlist.contains(&2));
        assert_eq!(record.last_started_id, None);
        assert_eq!(record.last_completed_id, None);
    }

    #[tokio::test]
    async fn empty_ids_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPlaylistStore::new(dir.path().join("playlists.json"));
        let chat = ChatId::Numeric(1);
        store.append_new(&chat, &[], None, None).await.unwrap();
        assert_eq!(store.load(&chat).await.unwrap(), None);
    }
}
