//! volprov daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volprov_blockdev::LvmDriver;
use volprov_core::AppConfig;
use volprov_imagecache::ImageCache;
use volprov_jobstore::{JobStore, SqliteStore};
use volprov_objstore::S3ObjectClient;
use volprov_server::auth::TokenValidator;
use volprov_server::{create_router, AppState, JobManager};

/// volprovd - provisions block volumes from object-store disk images
#[derive(Parser, Debug)]
#[command(name = "volprovd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Validate the configuration and exit without serving.
    #[arg(long)]
    check: bool,
}

/// Interval between housekeeping passes (in-memory trim + record reaping).
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("volprov v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env().context("failed to load configuration")?;
    if args.check {
        tracing::info!("Configuration OK");
        return Ok(());
    }

    volprov_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let objects = Arc::new(S3ObjectClient::new(&config.object_store));
    tracing::info!(endpoint = %config.object_store.endpoint, "Object store client initialized");

    let volumes = Arc::new(
        LvmDriver::new(
            config.block_storage.volume_group.clone(),
            config.block_storage.retry_policy(),
        )
        .context("failed to initialize block-storage driver")?,
    );
    // Catch missing tooling and unreachable volume groups before the
    // listener reports healthy.
    volumes
        .health_check()
        .await
        .context("block-storage health check failed")?;
    tracing::info!(volume_group = %config.block_storage.volume_group, "Block-storage driver initialized");

    let cache = ImageCache::new(config.cache.root.clone());
    tracing::info!(cache_root = %config.cache.root.display(), "Image cache initialized");

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteStore::new(&config.database.path)
            .await
            .context("failed to initialize job store")?,
    );
    tracing::info!(db_path = %config.database.path.display(), "Job store initialized");

    if let Some(ca) = &config.auth.client_ca_cert {
        tracing::info!(
            ca = %ca.display(),
            "Client CA configured; mutual TLS is enforced by the fronting listener"
        );
    }

    let tokens = match &config.auth.api_tokens_file {
        Some(path) => Some(
            TokenValidator::from_file(path)
                .with_context(|| format!("failed to load API tokens from {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No API token file configured; the API is unauthenticated");
            None
        }
    };

    let manager = Arc::new(JobManager::new(objects, volumes, cache, store, &config.jobs));

    // Sweep jobs interrupted by the previous run before admitting new ones.
    let swept = manager
        .recover()
        .await
        .context("failed to recover interrupted jobs")?;
    tracing::info!(swept, "Job recovery completed");

    spawn_housekeeping(manager.clone(), &config);

    let state = AppState::new(config.clone(), manager, tokens);
    let app = create_router(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server exited gracefully");
    Ok(())
}

/// Periodically trim the in-memory job table and reap old terminal
/// records from the store.
fn spawn_housekeeping(manager: Arc<JobManager>, config: &AppConfig) {
    let retention = Duration::from_secs(config.jobs.retention_days * 24 * 3600);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;
        loop {
            interval.tick().await;
            manager.cleanup_completed();
            if let Err(e) = manager.delete_older_than(retention).await {
                tracing::warn!(error = %e, "Housekeeping failed to reap old job records");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutting down");
}
