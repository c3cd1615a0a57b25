use std::sync::Arc;

use archivelive::config::{Args, Settings, StorageBackend};
use archivelive::registry::ProcessRegistry;
use archivelive::store::json_store::JsonPlaylistStore;
#[cfg(feature = "mongo")]
use archivelive::store::mongo_store::MongoPlaylistStore;
#[cfg(feature = "postgres")]
use archivelive::store::postgres_array_store::PostgresArrayStore;
#[cfg(feature = "postgres")]
use archivelive::store::postgres_text_store::PostgresTextStore;
use archivelive::store::PlaylistStore;
use archivelive::upstream::{HttpUpstreamClient, UpstreamClient};
use archivelive::byte_streamer::ByteStreamer;
use archivelive::playlist_manager::{PlaylistManager, PlaylistManagerFlags};
use archivelive::{create_app, pool::UpstreamClientPool, stream_generator::PlaylistStreamGenerator, supervisor::StreamSupervisor, AppState};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn PlaylistStore>> {
    let cfg = &settings.storage;
    match cfg.backend {
        StorageBackend::Json => Ok(Arc::new(JsonPlaylistStore::new(cfg.json_path.clone()))),
        #[cfg(feature = "postgres")]
        StorageBackend::PostgresText => {
            let url = cfg.postgres_url.as_deref().or(cfg.database_url.as_deref()).ok_or_else(|| anyhow::anyhow!("postgres_url not configured"))?;
            Ok(Arc::new(PostgresTextStore::connect(url).await?))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::PostgresArray => {
            let url = cfg.postgres_url.as_deref().or(cfg.database_url.as_deref()).ok_or_else(|| anyhow::anyhow!("postgres_url not configured"))?;
            Ok(Arc::new(PostgresArrayStore::connect(url).await?))
        }
        #[cfg(feature = "mongo")]
        StorageBackend::Mongo => {
            let url = cfg.database_url.as_deref().ok_or_else(|| anyhow::anyhow!("database_url not configured"))?;
            Ok(Arc::new(MongoPlaylistStore::connect(url, &cfg.mongo_db).await?))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackend::PostgresText | StorageBackend::PostgresArray => {
            anyhow::bail!("postgres storage backend requested but the postgres feature is disabled")
        }
        #[cfg(not(feature = "mongo"))]
        StorageBackend::Mongo => {
            anyhow::bail!("mongo storage backend requested but the mongo feature is disabled")
        }
    }
}

async fn clean_hls_tree(hls_root: &std::path::Path) -> anyhow::Result<()> {
    if hls_root.exists() {
        tokio::fs::remove_dir_all(hls_root).await?;
    }
    tokio::fs::create_dir_all(hls_root).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load(&args.config)?;

    let log_path = std::path::PathBuf::from("log.txt");
    let log_file = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&log_path)?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    info!("archivelive starting up");

    let hls_root = std::path::PathBuf::from("hls");
    clean_hls_tree(&hls_root).await?;

    let store = build_store(&settings).await?;

    let main_client: Arc<dyn UpstreamClient> =
        Arc::new(HttpUpstreamClient::new(settings.telegram.base_url.clone(), settings.telegram.bot_token.clone(), 1));
    let helper_client: Arc<dyn UpstreamClient> =
        Arc::new(HttpUpstreamClient::new(settings.telegram.base_url.clone(), settings.telegram.helper_bot_token.clone(), 1));
    let pool = Arc::new(UpstreamClientPool::new(main_client.clone(), helper_client));

    let workers: Vec<(u32, Arc<dyn UpstreamClient>)> = settings
        .telegram
        .multi_tokens
        .iter()
        .enumerate()
        .map(|(idx, token)| {
            let client: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(settings.telegram.base_url.clone(), token.clone(), 1));
            ((idx + 1) as u32, client)
        })
        .collect();
    pool.start(workers).await?;

    let byte_streamer = Arc::new(ByteStreamer::new());
    tokio::spawn(byte_streamer.clone().run_cache_sweeper());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = ProcessRegistry::new();

    let mut supervisor_handles = Vec::new();
    for stream in &settings.streams {
        let manager = PlaylistManager::new(
            main_client.clone(),
            stream.chat_id,
            store.clone(),
            PlaylistManagerFlags { reverse: stream.reverse, ..Default::default() },
        );
        if let Err(e) = manager.build(None).await {
            error!(stream = %stream.name, error = %e, "failed to build playlist, skipping stream");
            continue;
        }

        let generator =
            PlaylistStreamGenerator::new(stream.name.clone(), manager, pool.clone(), byte_streamer.clone(), registry.clone());
        let supervisor = StreamSupervisor::new(stream.name.clone(), hls_root.clone(), generator, registry.clone(), shutdown_rx.clone());
        let handle = tokio::spawn(supervisor.run());
        supervisor_handles.push(handle);
    }

    let app_state = AppState {
        hls_root: hls_root.clone(),
        project_root: std::env::current_dir()?,
        log_path: log_path.clone(),
        streams: settings.streams.clone(),
    };
    let app = create_app(app_state);
    let addr = format!("{}:{}", settings.server.host, args.port.unwrap_or(settings.server.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "listening");

    let mut http_shutdown_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown_rx.changed().await;
            })
            .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, tearing down");

    let _ = shutdown_tx.send(true);

    for handle in supervisor_handles {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.is_err() {
            warn!("supervisor task did not exit in time, abandoning it");
        }
    }

    registry.stop_all(std::time::Duration::from_secs(5)).await;

    if let Err(e) = server.await {
        warn!(error = %e, "http server task join error");
    }

    pool.stop().await;
    clean_hls_tree(&hls_root).await?;

    info!("archivelive shut down cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
