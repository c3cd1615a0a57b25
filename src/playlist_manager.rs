use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{ChatId, PlaylistRecord, PlaylistStore};
use crate::upstream::{FileDescriptor, UpstreamClient};

lazy_static! {
    /// Upstream scans (first-run archive walk, incremental checker) are
    /// globally serialized so concurrent channels never hammer the upstream
    /// simultaneously.
    static ref SCAN_GATE: Semaphore = Semaphore::new(1);
}

const FIRST_RUN_SCAN_LIMIT: u32 = 2_000;
const INCREMENTAL_SCAN_LIMIT: u32 = 500;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

async fn paced_scan<F, Fut>(op: F) -> Result<Vec<(i64, FileDescriptor)>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<(i64, FileDescriptor)>>>,
{
    let _permit = SCAN_GATE.acquire().await.expect("scan gate never closed");
    for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
        match op().await {
            Ok(entries) => {
                for (i, _) in entries.iter().enumerate() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if (i + 1) % 200 == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                return Ok(entries);
            }
            Err(Error::RateLimited(wait)) if attempt < MAX_RATE_LIMIT_RETRIES => {
                warn!(wait, attempt, "scan rate-limited, backing off and retrying same window");
                tokio::time::sleep(Duration::from_secs(wait + 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns or errors before exhausting retries")
}

#[derive(Debug, Clone)]
pub struct PlaylistManagerFlags {
    pub auto_checker: bool,
    pub check_interval_seconds: u64,
    pub reverse: bool,
}

impl Default for PlaylistManagerFlags {
    fn default() -> Self {
        Self { auto_checker: true, check_interval_seconds: 120, reverse: false }
    }
}

#[derive(Debug, Default, Clone)]
struct ManagerState {
    playlist: Vec<i64>,
    latest_id: i64,
    reverse: bool,
    last_started_id: Option<i64>,
    last_completed_id: Option<i64>,
    channel_name: Option<String>,
}

/// Owns one channel's in-memory playlist state plus the scheduled
/// auto-checker; persists every mutation through a `PlaylistStore`.
pub struct PlaylistManager {
    client: Arc<dyn UpstreamClient>,
    chat_id: i64,
    store: Arc<dyn PlaylistStore>,
    flags: PlaylistManagerFlags,
    state: Mutex<ManagerState>,
    auto_checker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlaylistManager {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        chat_id: i64,
        store: Arc<dyn PlaylistStore>,
        flags: PlaylistManagerFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            chat_id,
            store,
            flags,
            state: Mutex::new(ManagerState::default()),
            auto_checker_handle: Mutex::new(None),
        })
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// The store interface takes `ChatId`; every caller here has a concrete
    /// numeric id, so this just wraps it at the call boundary.
    fn store_key(&self) -> ChatId {
        ChatId::from(self.chat_id)
    }

    pub async fn channel_name(&self) -> Option<String> {
        self.state.lock().await.channel_name.clone()
    }

    /// Resolves the display name, then adopts `preloaded` state, persisted
    /// state, or performs a first-run archive scan, in that priority order.
    pub async fn build(self: &Arc<Self>, preloaded: Option<PlaylistRecord>) -> Result<()> {
        let name = self.client.resolve_channel_name(self.chat_id).await.unwrap_or(None);
        self.state.lock().await.channel_name = name;

        if let Some(record) = preloaded {
            self.adopt(record).await;
            return Ok(());
        }

        if let Some(record) = self.store.load(&self.store_key()).await? {
            self.adopt(record).await;
            self.schedule_auto_checker(Duration::from_secs(30)).await;
            return Ok(());
        }

        let entries = paced_scan(|| self.client.scan_recent_videos(self.chat_id, FIRST_RUN_SCAN_LIMIT)).await?;
        let mut ids: Vec<i64> = entries.into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        let latest = ids.iter().copied().max().unwrap_or(0);

        let channel_name = {
            let mut state = self.state.lock().await;
            state.playlist = ids.clone();
            state.latest_id = latest;
            state.reverse = self.flags.reverse;
            state.channel_name.clone()
        };
        self.store.append_new(&self.store_key(), &ids, Some(self.flags.reverse), channel_name.as_deref()).await?;
        self.schedule_auto_checker(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn adopt(&self, record: PlaylistRecord) {
        let mut state = self.state.lock().await;
        state.playlist = record.playlist;
        state.latest_id = record.latest_id;
        state.reverse = record.reverse;
        state.last_started_id = record.last_started_id;
        state.last_completed_id = record.last_completed_id;
        if record.channel_name.is_some() {
            state.channel_name = record.channel_name;
        }
    }

    /// Incremental scan starting at `latest_id + 1`, spanning up to 500
    /// additional IDs; only genuinely new video IDs are appended.
    pub async fn check_for_updates(&self) -> Result<()> {
        let since = self.state.lock().await.latest_id;
        let entries = paced_scan(|| self.client.scan_videos_since(self.chat_id, since, INCREMENTAL_SCAN_LIMIT)).await?;

        let existing: HashSet<i64> = self.state.lock().await.playlist.iter().copied().collect();
        let mut new_ids: Vec<i64> = entries.into_iter().map(|(id, _)| id).filter(|id| !existing.contains(id)).collect();
        new_ids.sort_unstable();
        if new_ids.is_empty() {
            return Ok(());
        }
        let max_new = new_ids.iter().copied().max().unwrap();

        {
            let mut state = self.state.lock().await;
            state.playlist.extend(new_ids.iter().copied());
            state.latest_id = state.latest_id.max(max_new);
        }
        self.store.append_new(&self.store_key(), &new_ids, None, None).await
    }

    /// Empty playlist: none. `current_id` null: prefer `last_started_id` if
    /// still present; else the item after `last_completed_id` (wrapping);
    /// else the first item. Otherwise: the item after `current_id`, wrapping
    /// to the first item if `current_id` is no longer present.
    pub async fn next_video(&self, current_id: Option<i64>) -> Option<i64> {
        let state = self.state.lock().await;
        if state.playlist.is_empty() {
            return None;
        }
        match current_id {
            None => {
                if let Some(started) = state.last_started_id {
                    if state.playlist.contains(&started) {
                        return Some(started);
                    }
                }
                if let Some(completed) = state.last_completed_id {
                    if let Some(pos) = state.playlist.iter().position(|&v| v == completed) {
                        return Some(state.playlist[(pos + 1) % state.playlist.len()]);
                    }
                }
                Some(state.playlist[0])
            }
            Some(id) => match state.playlist.iter().position(|&v| v == id) {
                Some(pos) => Some(state.playlist[(pos + 1) % state.playlist.len()]),
                None => Some(state.playlist[0]),
            },
        }
    }

    pub async fn remove_video(&self, id: i64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.playlist.retain(|&v| v != id);
            if state.last_started_id == Some(id) {
                state.last_started_id = None;
            }
            if state.last_completed_id == Some(id) {
                state.last_completed_id = None;
            }
        }
        self.store.remove_video(&self.store_key(), id).await
    }

    pub async fn mark_started(&self, id: i64) -> Result<()> {
        self.state.lock().await.last_started_id = Some(id);
        self.store.set_last_started(&self.store_key(), id).await
    }

    pub async fn mark_completed(&self, id: i64) -> Result<()> {
        self.state.lock().await.last_completed_id = Some(id);
        self.store.set_last_completed(&self.store_key(), id).await
    }

    pub async fn get_playlist(&self) -> Vec<i64> {
        let state = self.state.lock().await;
        if state.reverse {
            state.playlist.iter().rev().copied().collect()
        } else {
            state.playlist.clone()
        }
    }

    async fn schedule_auto_checker(self: &Arc<Self>, delay: Duration) {
        if !self.flags.auto_checker {
            return;
        }
        let this = self.clone();
        let interval = Duration::from_secs(self.flags.check_interval_seconds);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = this.check_for_updates().await {
                    warn!(chat_id = this.chat_id, error = %e, "auto-checker scan failed");
                }
            }
        });
        *self.auto_checker_handle.lock().await = Some(handle);
    }

    /// Cancels the scheduled auto-checker task and drains it.
    pub async fn stop(&self) {
        if let Some(handle) = self.auto_checker_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::json_store::JsonPlaylistStore;
    use crate::upstream::{FileKind, MediaSession};
    use async_trait::async_trait;

    struct StaticClient;

    #[async_trait]
    impl UpstreamClient for StaticClient {
        fn home_dc(&self) -> i32 {
            1
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn resolve_file(&self, _chat_id: i64, _message_id: i64) -> Result<FileDescriptor> {
            Err(Error::NotFound)
        }
        async fn media_session(&self, _dc_id: i32) -> Result<Arc<dyn MediaSession>> {
            Err(Error::NotFound)
        }
        async fn scan_recent_videos(&self, _chat_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
            Ok(vec![])
        }
        async fn scan_videos_since(&self, _chat_id: i64, _since_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
            Ok(vec![])
        }
        async fn resolve_channel_name(&self, _chat_id: i64) -> Result<Option<String>> {
            Ok(Some("test channel".to_string()))
        }
    }

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            media_id: 1,
            access_hash: 1,
            file_reference: "r".into(),
            dc_id: 1,
            file_type: FileKind::Video,
            file_size: 1,
            mime_type: "video/mp4".into(),
            file_name: None,
            unique_id: "u".into(),
        }
    }

    async fn manager_with_store(dir: &std::path::Path) -> Arc<PlaylistManager> {
        let store: Arc<dyn PlaylistStore> = Arc::new(JsonPlaylistStore::new(dir.join("playlists.json")));
        PlaylistManager::new(
            Arc::new(StaticClient),
            1,
            store,
            PlaylistManagerFlags { auto_checker: false, ..Default::default() },
        )
    }

    #[tokio::test]
    async fn first_run_scan_populates_from_empty_store() {
        let _ = descriptor();
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(dir.path()).await;
        manager.build(None).await.unwrap();
        assert_eq!(manager.get_playlist().await, Vec::<i64>::new());
    }

    #[tokio::test]
    async fn next_video_wraps_to_first_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(dir.path()).await;
        manager.build(Some(PlaylistRecord {
            chat_id: ChatId::Numeric(1),
            playlist: vec![10, 20, 30],
            latest_id: 30,
            reverse: false,
            last_started_id: None,
            last_completed_id: None,
            channel_name: None,
            updated_at: 0,
        }))
        .await
        .unwrap();

        assert_eq!(manager.next_video(Some(30)).await, Some(10));
        assert_eq!(manager.next_video(Some(10)).await, Some(20));
        assert_eq!(manager.next_video(Some(999)).await, Some(10));
    }

    #[tokio::test]
    async fn next_video_prefers_last_started_when_no_current() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(dir.path()).await;
        manager.build(Some(PlaylistRecord {
            chat_id: ChatId::Numeric(1),
            playlist: vec![10, 20, 30],
            latest_id: 30,
            reverse: false,
            last_started_id: Some(20),
            last_completed_id: None,
            channel_name: None,
            updated_at: 0,
        }))
        .await
        .unwrap();

        assert_eq!(manager.next_video(None).await, Some(20));
    }

    #[tokio::test]
    async fn next_video_falls_back_to_after_last_completed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(dir.path()).await;
        manager.build(Some(PlaylistRecord {
            chat_id: ChatId::Numeric(1),
            playlist: vec![10, 20, 30],
            latest_id: 30,
            reverse: false,
            last_started_id: None,
            last_completed_id: Some(20),
            channel_name: None,
            updated_at: 0,
        }))
        .await
        .unwrap();

        assert_eq!(manager.next_video(None).await, Some(30));
    }

    #[tokio::test]
    async fn remove_video_nullifies_markers_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_store(dir.path()).await;
        manager.build(Some(PlaylistRecord {
            chat_id: ChatId::Numeric(1),
            playlist: vec![10, 20, 30],
            latest_id: 30,
            reverse: false,
            last_started_id: Some(20),
            last_completed_id: Some(20),
            channel_name: None,
            updated_at: 0,
        }))
        .await
        .unwrap();

        manager.remove_video(20).await.unwrap();
        assert_eq!(manager.get_playlist().await, vec![10, 30]);
    }
}
