use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::registry::ProcessRegistry;

/// Reads from the cleaner's stdout in fixed 188*256-byte frames (48 MPEG-TS
/// packets at a time).
const READ_CHUNK: usize = 188 * 256;

/// Spawns the transmuxer: accepts arbitrary bytes on stdin, copies the
/// video stream through unchanged, re-encodes audio to AAC stereo 128kbps,
/// and emits MPEG-TS on stdout. Pumps `byte_source` into the child's stdin
/// concurrently with reading its stdout; on broken pipe the pump stops and
/// the output stream ends.
pub fn cleaner(
    byte_source: impl Stream<Item = Bytes> + Send + 'static,
    stream_name: String,
    registry: ProcessRegistry,
) -> impl Stream<Item = Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(8);

    tokio::spawn(async move {
        let mut child = match Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-fflags",
                "+genpts",
                "-avoid_negative_ts",
                "make_zero",
                "-i",
                "pipe:0",
                "-map",
                "0:v:0",
                "-map",
                "0:a?",
                "-c:v",
                "copy",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-ac",
                "2",
                "-f",
                "mpegts",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(stream = %stream_name, error = %e, "failed to spawn cleaner");
                return;
            }
        };

        let mut stdin = child.stdin.take().expect("cleaner stdin is piped");
        let mut stdout = child.stdout.take().expect("cleaner stdout is piped");
        let mut stderr = child.stderr.take().expect("cleaner stderr is piped");

        let child: Arc<Mutex<Child>> = Arc::new(Mutex::new(child));
        registry.register(child.clone()).await;

        let pump = tokio::spawn(async move {
            let mut source = Box::pin(byte_source);
            while let Some(chunk) = source.next().await {
                if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let stderr_tail = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = %stream_name, error = %e, "cleaner stdout read error");
                    break;
                }
            }
        }

        pump.abort();
        let _ = pump.await;

        if let Ok(stderr_bytes) = stderr_tail.await {
            if !stderr_bytes.is_empty() {
                debug!(stream = %stream_name, stderr = %String::from_utf8_lossy(&stderr_bytes), "cleaner stderr");
            }
        }

        registry.deregister(&child).await;
        let _ = child.lock().await.wait().await;
    });

    ReceiverStream::new(rx)
}
