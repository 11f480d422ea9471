use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use offline_tier::cache::disk::DiskStorage;
use offline_tier::cache::manager::CacheStoreManager;
use offline_tier::config::{Cli, Config};
use offline_tier::metrics::Metrics;
use offline_tier::net::fetcher::{Fetcher, HttpFetcher};
use offline_tier::router::Router;
use offline_tier::server::control_api::{build_router, AppState};
use offline_tier::worker::{NoClients, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "offline_tier=debug,tower_http=debug"
    } else {
        "offline_tier=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("offline-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        origin = %config.routing.origin,
        static_partition = %config.cache.static_partition(),
        runtime_partition = %config.cache.runtime_partition(),
        max_runtime_entries = config.cache.max_runtime_entries,
        assets = config.manifest.len(),
        "Configuration loaded"
    );

    // Host collaborators: persistent storage and the network.
    let storage = DiskStorage::open_root(&config.cache.storage_path, config.cache.zstd_level).await?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(Duration::from_secs(
        config.server.request_timeout_secs,
    ))?);

    let metrics = Metrics::new()?;
    let cache = Arc::new(
        CacheStoreManager::new(Arc::new(storage), &config.cache).with_metrics(metrics.clone()),
    );
    let router = Router::new(&config, cache.clone(), fetcher.clone())?.with_metrics(metrics.clone());
    let worker = Arc::new(Worker::new(
        config.clone(),
        cache.clone(),
        fetcher.clone(),
        Arc::new(NoClients),
    ));

    // Install, then activate unless waiting was requested.
    worker.install().await?;
    if worker.may_activate(false).await {
        worker.activate().await?;
    } else {
        warn!("Installed worker waiting; POST SKIP_WAITING to /__offline/message to activate");
    }

    let state = Arc::new(AppState {
        worker,
        router,
        cache,
        fetcher,
        metrics,
        origin: config.routing.origin.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
