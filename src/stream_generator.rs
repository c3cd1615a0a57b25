use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tracing::{info, warn};

use crate::byte_streamer::{chunk_plan, ByteStreamer, CHUNK_SIZE};
use crate::cleaner::cleaner;
use crate::error::{Error, Result};
use crate::playlist_manager::PlaylistManager;
use crate::pool::UpstreamClientPool;
use crate::registry::ProcessRegistry;

/// One video handed to the supervisor: the worker that was charged with its
/// load (so the caller can release it once the stream ends) and the
/// already-cleaned `.ts` byte stream, ready to be piped into the segmenter.
pub struct NextVideo {
    pub video_id: i64,
    pub worker_id: u32,
    pub ts_source: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
}

/// Rust has no bidirectional generator: the source material's
/// `async for video_id, ts_source in iter_videos()` marks a video started
/// before yielding it and only marks it completed once the caller resumes
/// after consuming the stream fully. `next` plays the role of one iteration
/// up to (and including) the yield; the caller must call `mark_completed`
/// or `release` afterward to play the rest.
pub struct PlaylistStreamGenerator {
    manager: Arc<PlaylistManager>,
    pool: Arc<UpstreamClientPool>,
    byte_streamer: Arc<ByteStreamer>,
    registry: ProcessRegistry,
    stream_name: String,
}

impl PlaylistStreamGenerator {
    pub fn new(
        stream_name: String,
        manager: Arc<PlaylistManager>,
        pool: Arc<UpstreamClientPool>,
        byte_streamer: Arc<ByteStreamer>,
        registry: ProcessRegistry,
    ) -> Self {
        Self { manager, pool, byte_streamer, registry, stream_name }
    }

    /// Picks the next video after `current_id`, marks it started, charges a
    /// worker's load, and prepares its cleaned `.ts` source. Returns `Ok(None)`
    /// when the playlist is currently empty; the caller should back off and
    /// retry. On `Error::NotFound` the video has already been removed from
    /// the playlist, mirroring the source's `FIleNotFound` branch.
    pub async fn next(&self, current_id: Option<i64>) -> Result<Option<NextVideo>> {
        let video_id = match self.manager.next_video(current_id).await {
            None => return Ok(None),
            Some(id) => id,
        };

        let _ = self.manager.mark_started(video_id).await;
        info!(stream = %self.stream_name, video_id, "starting video");

        let worker_id = self.pool.choose().await;
        self.pool.inc_load(worker_id).await;

        match self.prepare(worker_id, video_id).await {
            Ok(ts_source) => Ok(Some(NextVideo { video_id, worker_id, ts_source })),
            Err(Error::NotFound) => {
                self.pool.dec_load(worker_id).await;
                warn!(stream = %self.stream_name, video_id, "video not found, removing from playlist");
                let _ = self.manager.remove_video(video_id).await;
                Ok(None)
            }
            Err(e) => {
                self.pool.dec_load(worker_id).await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, worker_id: u32, video_id: i64) -> Result<Pin<Box<dyn Stream<Item = Bytes> + Send>>> {
        let client = self.pool.client_for(worker_id).await;
        let descriptor = self.byte_streamer.get_file_properties(client.as_ref(), self.manager.chat_id(), video_id).await?;

        let (part_count, last_cut) = chunk_plan(descriptor.file_size, CHUNK_SIZE);
        let byte_source = self.byte_streamer.yield_file(client, descriptor, 0, 0, last_cut, part_count, CHUNK_SIZE);
        Ok(Box::pin(cleaner(byte_source, self.stream_name.clone(), self.registry.clone())))
    }

    /// Called once the caller has fully drained a video's `ts_source`
    /// without error: records completion and frees the worker's load slot.
    pub async fn mark_completed(&self, video_id: i64, worker_id: u32) {
        let _ = self.manager.mark_completed(video_id).await;
        info!(stream = %self.stream_name, video_id, "finished video");
        self.pool.dec_load(worker_id).await;
    }

    /// Called when a video's `ts_source` ended in an error other than
    /// `NotFound` (already handled inside `next`): just frees the worker's
    /// load slot, leaving the playlist position untouched so the caller can
    /// retry from the same `current_id`.
    pub async fn release(&self, worker_id: u32) {
        self.pool.dec_load(worker_id).await;
    }
}
