pub mod byte_streamer;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod metrics;
pub mod playlist_manager;
pub mod pool;
pub mod registry;
pub mod segmenter;
pub mod store;
pub mod stream_generator;
pub mod supervisor;
pub mod upstream;

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::{Host, Path as AxumPath, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::config::StreamConfig;
use crate::metrics::gather_metrics;

#[derive(Clone)]
pub struct AppState {
    pub hls_root: PathBuf,
    pub project_root: PathBuf,
    pub log_path: PathBuf,
    pub streams: Vec<StreamConfig>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler).options(preflight))
        .route("/hls/{*path}", get(hls_handler).options(preflight))
        .route("/playlist.m3u", get(playlist_handler).options(preflight))
        .route("/explorer", get(explorer_handler).options(preflight))
        .route("/live-logs", get(live_logs_handler).options(preflight))
        .route("/metrics", get(metrics_handler).options(preflight))
        .layer(middleware::from_fn(cors_headers))
        .with_state(state)
}

async fn cors_headers(req: axum::extract::Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    res
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn root_handler() -> &'static str {
    "archivelive is running\n"
}

async fn metrics_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], gather_metrics())
}

/// Serves files under `hls/`. Rejects any path containing `..`; maps
/// `.m3u8` to `application/x-mpegURL` and `.ts` to `video/mp2t`.
async fn hls_handler(AxumPath(path): AxumPath<String>, State(state): State<AppState>) -> Response {
    if path.contains("..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let full_path = state.hls_root.join(&path);
    let content_type = if path.ends_with(".m3u8") {
        "application/x-mpegURL"
    } else if path.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    };

    match tokio::fs::File::open(&full_path).await {
        Ok(file) => {
            let body = axum::body::Body::from_stream(ReaderStream::new(file));
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// One `#EXTINF` line per configured channel, matching the IPTV master
/// playlist shape a downstream player expects.
async fn playlist_handler(Host(host): Host, State(state): State<AppState>) -> impl IntoResponse {
    let mut body = String::from("#EXTM3U\n");
    for stream in &state.streams {
        body.push_str(&format!(
            "#EXTINF:-1 tvg-id=\"{name}@TG\",{name} (720p)\nhttp://{host}/hls/{name}/live.m3u8\n",
            name = stream.name,
            host = host,
        ));
    }
    ([(header::CONTENT_TYPE, "audio/x-mpegurl")], body)
}

#[derive(Debug, Deserialize, Default)]
struct ExplorerQuery {
    #[serde(default)]
    path: String,
}

const VIEWABLE_EXTS: &[&str] = &["txt", "log", "toml", "json", "m3u8", "rs", "md"];
const MAX_INLINE_BYTES: u64 = 64 * 1024;

/// Read-only file tree rooted at the project root. Directory traversal is
/// blocked by a canonicalized-prefix check, not a string match on `..`.
async fn explorer_handler(Query(query): Query<ExplorerQuery>, State(state): State<AppState>) -> Response {
    let target = state.project_root.join(&query.path);
    let Ok(canonical_root) = tokio::fs::canonicalize(&state.project_root).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let Ok(canonical_target) = tokio::fs::canonicalize(&target).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !canonical_target.starts_with(&canonical_root) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let metadata = match tokio::fs::metadata(&canonical_target).await {
        Ok(m) => m,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    if metadata.is_dir() {
        let mut entries = match tokio::fs::read_dir(&canonical_target).await {
            Ok(e) => e,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        let mut body = format!("<pre>Index of /{}\n\n", html_escape(&query.path));
        for name in names {
            body.push_str(&format!("{}\n", html_escape(&name)));
        }
        body.push_str("</pre>");
        ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], body).into_response()
    } else if metadata.len() <= MAX_INLINE_BYTES
        && canonical_target
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| VIEWABLE_EXTS.contains(&ext))
            .unwrap_or(false)
    {
        match tokio::fs::read_to_string(&canonical_target).await {
            Ok(content) => ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], format!("<pre>{}</pre>", html_escape(&content))).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

fn html_escape(input: &str) -> String {
    input.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// SSE: opens `log.txt` at its current end and emits each new line with
/// 300ms polling. The stream ends (no more `Event`s) once the receiver
/// side is dropped, i.e. on client disconnect.
async fn live_logs_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(16);
    let log_path = state.log_path.clone();

    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&log_path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "could not open log file for tailing");
                return;
            }
        };
        if file.seek(std::io::SeekFrom::End(0)).await.is_err() {
            return;
        }

        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => tokio::time::sleep(Duration::from_millis(300)).await,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line).trim_end().to_string();
                        if tx.send(Event::default().data(text)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(_) => return,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx).map(Ok))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_state(dir: &Path) -> AppState {
        AppState {
            hls_root: dir.join("hls"),
            project_root: dir.to_path_buf(),
            log_path: dir.join("log.txt"),
            streams: vec![StreamConfig { name: "stream1".to_string(), chat_id: 1, reverse: false }],
        }
    }

    #[tokio::test]
    async fn root_route_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
    }

    #[tokio::test]
    async fn hls_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/hls/..%2F..%2Fetc%2Fpasswd")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn hls_missing_segment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("hls")).await.unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/hls/stream1/live.m3u8").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn playlist_m3u_lists_configured_streams() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/playlist.m3u")
                    .header("host", "example.com")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("stream1"));
        assert!(text.contains("http://example.com/hls/stream1/live.m3u8"));
    }

    #[tokio::test]
    async fn explorer_rejects_escape_above_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/explorer?path=../../../etc").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_route_returns_text_exposition() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_app(test_state(dir.path()));
        let resp = app
            .oneshot(axum::http::Request::builder().uri("/metrics").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
