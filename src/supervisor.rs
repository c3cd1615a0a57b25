use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::ProcessRegistry;
use crate::segmenter;
use crate::store::now_epoch_secs;
use crate::stream_generator::{NextVideo, PlaylistStreamGenerator};

const STREAM_STUCK_TIMEOUT: Duration = Duration::from_secs(20);
const STREAM_RESTART_DELAY: Duration = Duration::from_secs(5);
const INNER_LOOP_BACKOFF: Duration = Duration::from_secs(3);
const EMPTY_PLAYLIST_POLL: Duration = Duration::from_secs(5);

/// Owns one channel's segmenter/pump chain and restarts it whenever a video
/// ends, is removed, or the pipeline gets stuck. Delegates picking/preparing
/// each video to a `PlaylistStreamGenerator`.
pub struct StreamSupervisor {
    stream_name: String,
    hls_root: PathBuf,
    generator: PlaylistStreamGenerator,
    registry: ProcessRegistry,
    shutdown: watch::Receiver<bool>,
}

impl StreamSupervisor {
    pub fn new(
        stream_name: String,
        hls_root: PathBuf,
        generator: PlaylistStreamGenerator,
        registry: ProcessRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self { stream_name, hls_root, generator, registry, shutdown })
    }

    pub fn hls_dir(&self) -> PathBuf {
        self.hls_root.join(&self.stream_name)
    }

    /// Outer loop: restarts the inner loop after a backoff on any
    /// unhandled error; returns immediately on shutdown/cancellation.
    pub async fn run(self: Arc<Self>) {
        let mut current: Option<i64> = None;
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            match self.run_inner_loop(&mut current).await {
                InnerLoopOutcome::Cancelled => return,
                InnerLoopOutcome::Restart(delay) => {
                    metrics::STREAM_RESTARTS_TOTAL.with_label_values(&[&self.stream_name]).inc();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_inner_loop(&self, current: &mut Option<i64>) -> InnerLoopOutcome {
        loop {
            if *self.shutdown.borrow() {
                return InnerLoopOutcome::Cancelled;
            }

            let next = match self.generator.next(*current).await {
                Ok(None) => {
                    tokio::time::sleep(EMPTY_PLAYLIST_POLL).await;
                    continue;
                }
                Ok(Some(next)) => next,
                Err(e) => {
                    warn!(stream = %self.stream_name, error = %e, "fetching next video failed, retrying");
                    tokio::time::sleep(EMPTY_PLAYLIST_POLL).await;
                    continue;
                }
            };
            let video_id = next.video_id;
            let worker_id = next.worker_id;

            let outcome = self.run_one_video(next).await;

            match outcome {
                Ok(()) => {
                    self.generator.mark_completed(video_id, worker_id).await;
                    *current = Some(video_id);
                }
                Err(Error::NotFound) => {
                    // `generator.next` already removed the video and released the worker.
                }
                Err(Error::PipeClosed) => {
                    warn!(stream = %self.stream_name, video_id, "encoder pipe closed mid-write, moving to next video");
                    self.generator.release(worker_id).await;
                }
                Err(Error::Cancelled) => {
                    self.generator.release(worker_id).await;
                    return InnerLoopOutcome::Cancelled;
                }
                Err(Error::StreamStuck(idle)) => {
                    warn!(stream = %self.stream_name, video_id, ?idle, "stream stuck, restarting");
                    self.generator.release(worker_id).await;
                    return InnerLoopOutcome::Restart(STREAM_RESTART_DELAY);
                }
                Err(e) => {
                    warn!(stream = %self.stream_name, video_id, error = %e, "stream run failed, restarting");
                    self.generator.release(worker_id).await;
                    return InnerLoopOutcome::Restart(INNER_LOOP_BACKOFF);
                }
            }
        }
    }

    /// Feeds the prepared `.ts` source into the segmenter's stdin while a
    /// watchdog tracks stdin activity, and waits for the chain to end.
    async fn run_one_video(&self, next: NextVideo) -> Result<()> {
        let mut source = next.ts_source;
        let hls_dir = self.hls_dir();
        let mut segmenter = segmenter::spawn(&hls_dir).await?;
        let mut stdin = segmenter.child.stdin.take().expect("segmenter stdin is piped");
        let child = Arc::new(Mutex::new(segmenter.child));
        self.registry.register(child.clone()).await;

        let last_activity = Arc::new(AtomicU64::new(now_epoch_secs()));
        let watchdog_activity = last_activity.clone();
        let (stuck_tx, mut stuck_rx) = watch::channel(false);
        let watchdog_stream_name = self.stream_name.clone();
        let watchdog_hls_dir = hls_dir.clone();
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let idle = now_epoch_secs().saturating_sub(watchdog_activity.load(Ordering::Relaxed));
                metrics::STREAM_LAST_ACTIVITY_SECONDS.with_label_values(&[&watchdog_stream_name]).set(idle as f64);
                metrics::HLS_SEGMENT_COUNT
                    .with_label_values(&[&watchdog_stream_name])
                    .set(count_segments(&watchdog_hls_dir) as f64);
                if idle >= STREAM_STUCK_TIMEOUT.as_secs() {
                    let _ = stuck_tx.send(true);
                    break;
                }
            }
        });

        let result = loop {
            tokio::select! {
                chunk = source.next() => {
                    match chunk {
                        Some(bytes) => {
                            if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                                break Err(Error::PipeClosed);
                            }
                            last_activity.store(now_epoch_secs(), Ordering::Relaxed);
                        }
                        None => break Ok(()),
                    }
                }
                _ = stuck_rx.changed() => {
                    if *stuck_rx.borrow() {
                        break Err(Error::StreamStuck(STREAM_STUCK_TIMEOUT));
                    }
                }
            }
        };

        watchdog.abort();
        drop(stdin);
        self.registry.deregister(&child).await;
        let _ = child.lock().await.wait().await;

        result
    }
}

fn count_segments(hls_dir: &std::path::Path) -> usize {
    std::fs::read_dir(hls_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_name().to_str().is_some_and(|n| n.ends_with(".ts")))
                .count()
        })
        .unwrap_or(0)
}

enum InnerLoopOutcome {
    Cancelled,
    Restart(Duration),
}
