use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;

use archivelive::config::StreamConfig;
use archivelive::AppState;

fn state(dir: &std::path::Path) -> AppState {
    AppState {
        hls_root: dir.join("hls"),
        project_root: dir.to_path_buf(),
        log_path: dir.join("log.txt"),
        streams: vec![
            StreamConfig { name: "stream1".to_string(), chat_id: 100, reverse: false },
            StreamConfig { name: "stream2".to_string(), chat_id: 200, reverse: true },
        ],
    }
}

#[tokio::test]
async fn playlist_lists_every_configured_stream() {
    let dir = tempfile::tempdir().unwrap();
    let app = archivelive::create_app(state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/playlist.m3u")
                .header("host", "archive.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("#EXTM3U"));
    assert!(text.contains("stream1"));
    assert!(text.contains("stream2"));
    assert!(text.contains("http://archive.example/hls/stream1/live.m3u8"));
}

#[tokio::test]
async fn hls_serves_an_existing_segment_with_the_right_content_type() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("hls/stream1")).await.unwrap();
    tokio::fs::write(dir.path().join("hls/stream1/live.m3u8"), b"#EXTM3U\n").await.unwrap();
    let app = archivelive::create_app(state(dir.path()));

    let response = app
        .oneshot(Request::builder().uri("/hls/stream1/live.m3u8").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "application/x-mpegURL");
}

#[tokio::test]
async fn hls_rejects_parent_directory_segments() {
    let dir = tempfile::tempdir().unwrap();
    let app = archivelive::create_app(state(dir.path()));

    let response = app
        .oneshot(Request::builder().uri("/hls/%2e%2e%2fsecret").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn every_response_carries_the_wildcard_cors_header() {
    let dir = tempfile::tempdir().unwrap();
    let app = archivelive::create_app(state(dir.path()));

    let response = app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
}

#[tokio::test]
async fn metrics_endpoint_is_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let app = archivelive::create_app(state(dir.path()));

    let response = app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
