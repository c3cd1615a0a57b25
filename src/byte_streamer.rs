use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::upstream::{FileDescriptor, FileKind, UpstreamClient};

/// Chunk size is fixed at 512 KiB.
pub const CHUNK_SIZE: u64 = 512 * 1024;

const CLEAN_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// `part_count = ceil(file_size / chunk_size)` (at least 1). `last_cut` is
/// `file_size mod chunk_size`, or `chunk_size` when it divides evenly.
pub fn chunk_plan(file_size: u64, chunk_size: u64) -> (u32, u64) {
    let part_count = file_size.div_ceil(chunk_size).max(1);
    let remainder = file_size % chunk_size;
    let last_cut = if remainder == 0 { chunk_size } else { remainder };
    (part_count as u32, last_cut)
}

fn slice_part(buf: Bytes, current_part: u32, part_count: u32, first_cut: u64, last_cut: u64) -> Bytes {
    let first_cut = (first_cut as usize).min(buf.len());
    let last_cut = (last_cut as usize).min(buf.len());
    if part_count == 1 {
        buf.slice(first_cut..last_cut.max(first_cut))
    } else if current_part == 0 {
        buf.slice(first_cut..)
    } else if current_part == part_count - 1 {
        buf.slice(..last_cut)
    } else {
        buf
    }
}

struct CacheEntry {
    descriptor: FileDescriptor,
    inserted_at: Instant,
}

/// `get_file_properties` results cached until the periodic sweep empties
/// the whole cache (default every 30 minutes) — the sweep is a full clear,
/// not a per-entry TTL, matching the original Python implementation.
pub struct ByteStreamer {
    cache: RwLock<HashMap<(i64, i64), CacheEntry>>,
}

impl Default for ByteStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStreamer {
    pub fn new() -> Self {
        Self { cache: RwLock::new(HashMap::new()) }
    }

    pub async fn get_file_properties(
        &self,
        client: &dyn UpstreamClient,
        chat_id: i64,
        message_id: i64,
    ) -> Result<FileDescriptor> {
        let key = (chat_id, message_id);
        if let Some(entry) = self.cache.read().await.get(&key) {
            return Ok(entry.descriptor.clone());
        }
        let descriptor = client.resolve_file(chat_id, message_id).await?;
        if descriptor.file_size == 0 || !matches!(descriptor.file_type, FileKind::Video | FileKind::Document) {
            return Err(Error::NotFound);
        }
        self.cache
            .write()
            .await
            .insert(key, CacheEntry { descriptor: descriptor.clone(), inserted_at: Instant::now() });
        Ok(descriptor)
    }

    /// Runs forever; intended to be spawned once per process.
    pub async fn run_cache_sweeper(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CLEAN_INTERVAL).await;
            let mut cache = self.cache.write().await;
            let cleared = cache.len();
            cache.clear();
            drop(cache);
            debug!(cleared, "byte streamer descriptor cache cleared");
        }
    }

    #[cfg(test)]
    async fn cache_age(&self, chat_id: i64, message_id: i64) -> Option<Duration> {
        self.cache.read().await.get(&(chat_id, message_id)).map(|e| e.inserted_at.elapsed())
    }

    /// Produces a lazy finite sequence of byte buffers for one file,
    /// feeding the cleaner's stdin. Errors while reading end the sequence
    /// cleanly; the supervisor restarts the stream.
    pub fn yield_file(
        &self,
        client: Arc<dyn UpstreamClient>,
        descriptor: FileDescriptor,
        mut offset: u64,
        first_cut: u64,
        last_cut: u64,
        part_count: u32,
        chunk_size: u64,
    ) -> impl Stream<Item = Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(4);
        tokio::spawn(async move {
            let session = match client.media_session(descriptor.dc_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "could not open media session, ending byte source");
                    return;
                }
            };

            let mut current_part = 0u32;
            while current_part < part_count {
                let buf = match session.get_file(&descriptor, offset, chunk_size as u32).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "transient upstream error, ending byte source");
                        break;
                    }
                };
                if buf.is_empty() {
                    break;
                }
                let sliced = slice_part(buf, current_part, part_count, first_cut, last_cut);
                if tx.send(sliced).await.is_err() {
                    break;
                }
                offset += chunk_size;
                current_part += 1;
            }
        });
        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_arithmetic_matches_exact_multiple() {
        let (part_count, last_cut) = chunk_plan(1_572_864, 524_288);
        assert_eq!(part_count, 3);
        assert_eq!(last_cut, 524_288);
    }

    #[test]
    fn single_part_file_under_chunk_size() {
        let (part_count, last_cut) = chunk_plan(300_000, 524_288);
        assert_eq!(part_count, 1);
        assert_eq!(last_cut, 300_000);
    }

    #[test]
    fn empty_file_still_reports_one_part() {
        let (part_count, _) = chunk_plan(0, 524_288);
        assert_eq!(part_count, 1);
    }

    #[test]
    fn single_part_slices_first_and_last_cut() {
        let buf = Bytes::from(vec![0u8; 524_288]);
        let sliced = slice_part(buf, 0, 1, 1_000, 2_000);
        assert_eq!(sliced.len(), 1_000);
    }

    #[test]
    fn first_part_of_many_slices_from_first_cut_only() {
        let buf = Bytes::from(vec![0u8; 524_288]);
        let sliced = slice_part(buf, 0, 3, 1_000, 524_288);
        assert_eq!(sliced.len(), 524_288 - 1_000);
    }

    #[test]
    fn last_part_of_many_slices_up_to_last_cut() {
        let buf = Bytes::from(vec![0u8; 524_288]);
        let sliced = slice_part(buf, 2, 3, 0, 100_000);
        assert_eq!(sliced.len(), 100_000);
    }

    #[test]
    fn middle_part_is_passed_through_whole() {
        let buf = Bytes::from(vec![0u8; 524_288]);
        let sliced = slice_part(buf, 1, 3, 0, 524_288);
        assert_eq!(sliced.len(), 524_288);
    }

    #[tokio::test]
    async fn get_file_properties_is_cached() {
        use crate::error::Error;
        use crate::upstream::{FileKind, MediaSession};
        use async_trait::async_trait;

        struct CountingClient {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl UpstreamClient for CountingClient {
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
                self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(FileDescriptor {
                    media_id: 1,
                    access_hash: 1,
                    file_reference: "ref".into(),
                    dc_id: 1,
                    file_type: FileKind::Video,
                    file_size: 1_000,
                    mime_type: "video/mp4".into(),
                    file_name: None,
                    unique_id: "u1".into(),
                })
            }
            async fn media_session(&self, _dc_id: i32) -> Result<Arc<dyn MediaSession>> {
                Err(Error::NotFound)
            }
            async fn scan_recent_videos(&self, _chat_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
                Ok(Vec::new())
            }
            async fn scan_videos_since(&self, _chat_id: i64, _since_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
                Ok(Vec::new())
            }
            async fn resolve_channel_name(&self, _chat_id: i64) -> Result<Option<String>> {
                Ok(None)
            }
        }

        let client = CountingClient { calls: std::sync::atomic::AtomicUsize::new(0) };
        let streamer = ByteStreamer::new();
        streamer.get_file_properties(&client, 1, 2).await.unwrap();
        streamer.get_file_properties(&client, 1, 2).await.unwrap();
        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(streamer.cache_age(1, 2).await.is_some());
    }

    #[tokio::test]
    async fn get_file_properties_rejects_non_media_and_empty_files() {
        use crate::error::Error;
        use crate::upstream::{FileKind, MediaSession};
        use async_trait::async_trait;

        struct StaticClient {
            descriptor: FileDescriptor,
        }

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
                Ok(self.descriptor.clone())
            }
            async fn media_session(&self, _dc_id: i32) -> Result<Arc<dyn MediaSession>> {
                Err(Error::NotFound)
            }
            async fn scan_recent_videos(&self, _chat_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
                Ok(Vec::new())
            }
            async fn scan_videos_since(&self, _chat_id: i64, _since_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
                Ok(Vec::new())
            }
            async fn resolve_channel_name(&self, _chat_id: i64) -> Result<Option<String>> {
                Ok(None)
            }
        }

        let photo_client = StaticClient {
            descriptor: FileDescriptor {
                media_id: 1,
                access_hash: 1,
                file_reference: "ref".into(),
                dc_id: 1,
                file_type: FileKind::Other,
                file_size: 1_000,
                mime_type: "image/jpeg".into(),
                file_name: None,
                unique_id: "u1".into(),
            },
        };
        let streamer = ByteStreamer::new();
        assert!(matches!(streamer.get_file_properties(&photo_client, 1, 2).await, Err(Error::NotFound)));

        let empty_client = StaticClient {
            descriptor: FileDescriptor {
                media_id: 1,
                access_hash: 1,
                file_reference: "ref".into(),
                dc_id: 1,
                file_type: FileKind::Video,
                file_size: 0,
                mime_type: "video/mp4".into(),
                file_name: None,
                unique_id: "u2".into(),
            },
        };
        assert!(matches!(streamer.get_file_properties(&empty_client, 1, 3).await, Err(Error::NotFound)));
    }
}
