use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Process-wide weak index of active encoder handles, used for emergency
/// teardown on shutdown. Individual pipelines still own and await their own
/// child handles during normal operation; this registry exists so shutdown
/// can sweep anything a crashed pipeline left behind.
#[derive(Clone)]
pub struct ProcessRegistry {
    children: Arc<Mutex<Vec<Arc<Mutex<Child>>>>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self { children: Arc::new(Mutex::new(Vec::new())) }
    }

    pub async fn register(&self, child: Arc<Mutex<Child>>) {
        self.children.lock().await.push(child);
    }

    pub async fn deregister(&self, child: &Arc<Mutex<Child>>) {
        self.children.lock().await.retain(|c| !Arc::ptr_eq(c, child));
    }

    pub async fn len(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Close stdin if open, await exit with a timeout, force-kill on
    /// timeout. Used by the shutdown sequence to guarantee no child encoder
    /// process survives the process.
    pub async fn stop_all(&self, timeout: Duration) {
        let children: Vec<_> = self.children.lock().await.drain(..).collect();
        for child in children {
            let mut guard = child.lock().await;
            if let Some(stdin) = guard.stdin.take() {
                drop(stdin);
            }
            match tokio::time::timeout(timeout, guard.wait()).await {
                Ok(Ok(status)) => info!(?status, "encoder exited during shutdown"),
                Ok(Err(e)) => warn!(error = %e, "error waiting for encoder exit during shutdown"),
                Err(_) => {
                    warn!("encoder did not exit within timeout, force-killing");
                    let _ = guard.start_kill();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn stop_all_empties_the_registry() {
        let registry = ProcessRegistry::new();
        let child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        registry.register(Arc::new(Mutex::new(child))).await;
        assert_eq!(registry.len().await, 1);
        registry.stop_all(Duration::from_millis(200)).await;
        assert_eq!(registry.len().await, 0);
    }
}
