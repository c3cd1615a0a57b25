use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::upstream::UpstreamClient;

/// Main control client, helper (worker 0), and the numbered workers
/// (1..K). `work_loads` is mutated only from within the event loop, so a
/// plain `RwLock` (not a per-entry atomic) is enough.
pub struct UpstreamClientPool {
    main: Arc<dyn UpstreamClient>,
    helper: Arc<dyn UpstreamClient>,
    workers: RwLock<HashMap<u32, Arc<dyn UpstreamClient>>>,
    work_loads: RwLock<HashMap<u32, i64>>,
    rr_pointer: AtomicUsize,
}

impl UpstreamClientPool {
    pub fn new(main: Arc<dyn UpstreamClient>, helper: Arc<dyn UpstreamClient>) -> Self {
        Self {
            main,
            helper,
            workers: RwLock::new(HashMap::new()),
            work_loads: RwLock::new(HashMap::new()),
            rr_pointer: AtomicUsize::new(0),
        }
    }

    /// Connects main, helper, and all numbered workers in parallel. A
    /// worker whose connect fails with `RateLimited` is retried once after
    /// the requested backoff; any other failure (or a second rate-limit)
    /// just skips that worker.
    pub async fn start(&self, workers: Vec<(u32, Arc<dyn UpstreamClient>)>) -> Result<()> {
        let (main_res, helper_res) = tokio::join!(self.main.connect(), self.helper.connect());
        main_res?;
        helper_res?;
        self.work_loads.write().await.insert(0, 0);

        let outcomes = futures::future::join_all(workers.into_iter().map(|(id, client)| async move {
            let outcome = Self::connect_with_retry(client.as_ref()).await;
            (id, client, outcome)
        }))
        .await;

        let mut active_ids = vec![0u32];
        for (id, client, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    self.workers.write().await.insert(id, client);
                    self.work_loads.write().await.insert(id, 0);
                    active_ids.push(id);
                    info!(worker = id, "worker started");
                }
                Err(Error::CredentialExpired) => warn!(worker = id, "credential expired, skipping"),
                Err(Error::RateLimited(wait)) => warn!(worker = id, wait, "still rate-limited after retry, skipping"),
                Err(e) => warn!(worker = id, error = %e, "failed to start worker"),
            }
        }
        active_ids.sort_unstable();
        info!(?active_ids, "worker clients active");
        Ok(())
    }

    async fn connect_with_retry(client: &dyn UpstreamClient) -> Result<()> {
        match client.connect().await {
            Err(Error::RateLimited(wait)) => {
                tokio::time::sleep(Duration::from_secs(wait + 1)).await;
                client.connect().await
            }
            other => other,
        }
    }

    /// Minimum `work_loads` value, ties broken by an internal round-robin
    /// pointer. Returns the helper (worker 0) if no numbered workers exist.
    pub async fn choose(&self) -> u32 {
        let work_loads = self.work_loads.read().await;
        if work_loads.len() <= 1 {
            return 0;
        }
        let min = work_loads.values().copied().min().unwrap_or(0);
        let mut candidates: Vec<u32> = work_loads.iter().filter(|(_, &v)| v == min).map(|(&k, _)| k).collect();
        candidates.sort_unstable();
        drop(work_loads);
        if candidates.is_empty() {
            return 0;
        }
        let idx = self.rr_pointer.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[idx]
    }

    pub async fn client_for(&self, id: u32) -> Arc<dyn UpstreamClient> {
        if id == 0 {
            return self.helper.clone();
        }
        self.workers.read().await.get(&id).cloned().unwrap_or_else(|| self.helper.clone())
    }

    pub async fn inc_load(&self, id: u32) {
        let mut work_loads = self.work_loads.write().await;
        let v = work_loads.entry(id).or_insert(0);
        *v += 1;
        crate::metrics::WORKER_LOAD.with_label_values(&[&id.to_string()]).set(*v as f64);
    }

    pub async fn dec_load(&self, id: u32) {
        let mut work_loads = self.work_loads.write().await;
        if let Some(v) = work_loads.get_mut(&id) {
            *v = (*v - 1).max(0);
            crate::metrics::WORKER_LOAD.with_label_values(&[&id.to_string()]).set(*v as f64);
        }
    }

    pub async fn stop(&self) {
        let _ = self.main.disconnect().await;
        let _ = self.helper.disconnect().await;
        let workers: Vec<_> = self.workers.write().await.drain().collect();
        for (_, client) in workers {
            let _ = client.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{FileDescriptor, MediaSession};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct StubClient {
        dc: i32,
        fail_connect: bool,
    }

    #[async_trait]
    impl UpstreamClient for StubClient {
        fn home_dc(&self) -> i32 {
            self.dc
        }
        async fn connect(&self) -> Result<()> {
            if self.fail_connect {
                Err(Error::CredentialExpired)
            } else {
                Ok(())
            }
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
            Ok(Vec::new())
        }
        async fn scan_videos_since(&self, _chat_id: i64, _since_id: i64, _limit: u32) -> Result<Vec<(i64, FileDescriptor)>> {
            Ok(Vec::new())
        }
        async fn resolve_channel_name(&self, _chat_id: i64) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn stub(dc: i32) -> Arc<dyn UpstreamClient> {
        Arc::new(StubClient { dc, fail_connect: false })
    }

    #[tokio::test]
    async fn choose_returns_helper_with_no_workers() {
        let pool = UpstreamClientPool::new(stub(1), stub(1));
        pool.start(vec![]).await.unwrap();
        assert_eq!(pool.choose().await, 0);
    }

    #[tokio::test]
    async fn choose_picks_minimum_load_with_round_robin_tiebreak() {
        let pool = UpstreamClientPool::new(stub(1), stub(1));
        pool.start(vec![(1, stub(1)), (2, stub(1))]).await.unwrap();

        // all loads start at 0: candidates {0,1,2}, round robin across calls.
        let first = pool.choose().await;
        let second = pool.choose().await;
        let third = pool.choose().await;
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[tokio::test]
    async fn failed_worker_connect_is_skipped_not_fatal() {
        let pool = UpstreamClientPool::new(stub(1), stub(1));
        let bad: Arc<dyn UpstreamClient> = Arc::new(StubClient { dc: 1, fail_connect: true });
        pool.start(vec![(1, bad)]).await.unwrap();
        assert_eq!(pool.choose().await, 0);
    }

    #[tokio::test]
    async fn dec_load_floors_at_zero() {
        let pool = UpstreamClientPool::new(stub(1), stub(1));
        pool.start(vec![]).await.unwrap();
        pool.dec_load(0).await;
        pool.dec_load(0).await;
        assert_eq!(pool.choose().await, 0);
    }
}
