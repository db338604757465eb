use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use printfleet_rs::bambu::{BambuMetricsStore, BambuMqttPool, BambuStatusCache, DeviceConnector, MqttConnector};
use printfleet_rs::config;
use printfleet_rs::dispatch::{BambuDispatcher, CurlFtpsUploader, FleetDispatcher, PrusaDispatcher};
use printfleet_rs::metrics::MetricsOrchestrator;
use printfleet_rs::print_job::PrintJobManager;
use printfleet_rs::prusa::{PrusaClient, PrusaCollector};
use printfleet_rs::web::api::{create_router_with_state, AppStateInner};
use printfleet_shared::memory::{InMemoryJobStore, InMemoryRoster, StaticInventory};
use printfleet_shared::object_storage::LocalObjectStorage;
use printfleet_shared::{AuthBackend, InMemoryAuthBackend, PrintJobStore, PrinterRoster};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Printer fleet telemetry and dispatch host
#[derive(Parser, Debug)]
#[command(name = "printfleet-host", version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(default_value = "printfleet.toml")]
    config: PathBuf,

    /// Listen address, overriding `server.bind`
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    tracing::info!("Starting printfleet host v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config_path = cli.config.to_string_lossy().into_owned();
    tracing::info!("Loading configuration from: {}", config_path);
    let mut config = config::load_with_env(&config_path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", config_path, e);
        Box::new(e) as BoxError
    })?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    tracing::info!(
        "Roster: {} printer(s); metrics prusa={} bambu={}",
        config.printers.len(),
        config.metrics.prusa_enabled,
        config.metrics.bambu_enabled
    );

    // Stores
    let roster: Arc<dyn PrinterRoster> = Arc::new(InMemoryRoster::new(config.printers.clone()));
    let job_store: Arc<dyn PrintJobStore> = Arc::new(InMemoryJobStore::new());
    let inventory = Arc::new(StaticInventory::new(config.inventory.clone()));
    let storage = Arc::new(LocalObjectStorage::new(&config.storage.root, &config.storage.public_base_url));

    // Bambu pool and its listeners
    let connector: Arc<dyn DeviceConnector> = Arc::new(MqttConnector::new());
    let pool = Arc::new(BambuMqttPool::new(
        roster.clone(),
        connector.clone(),
        config.bambu.mqtt_port,
        config.bambu.sync_interval(),
    ));
    let status_cache = Arc::new(BambuStatusCache::new(config.bambu.status_idle()));
    pool.add_listener(status_cache.clone());
    status_cache.start_reaper();

    let prusa_client = PrusaClient::new()?;
    let mut orchestrator = MetricsOrchestrator::new(roster.clone(), inventory, job_store.clone());
    if config.metrics.prusa_enabled {
        let collector = PrusaCollector::new(
            prusa_client.clone(),
            Duration::from_secs(config.prusa.scrape_timeout_secs),
        );
        orchestrator = orchestrator.with_prusa(Arc::new(collector));
    }
    let mut pruner = None;
    if config.metrics.bambu_enabled {
        let store = Arc::new(BambuMetricsStore::new());
        pool.add_listener(store.clone());
        pruner = Some(spawn_metrics_pruner(pool.clone(), store.clone(), config.bambu.sync_interval()));
        orchestrator = orchestrator.with_bambu(store);
    }

    // Dispatch
    let uploader = Arc::new(CurlFtpsUploader::new(
        config.bambu.curl_path.clone().map(PathBuf::from),
        config.bambu.ftps_port,
        Duration::from_secs(config.bambu.ftps_timeout_secs),
        config.bambu.connect_timeout(),
    ));
    let dispatcher = FleetDispatcher::new(
        PrusaDispatcher::new(prusa_client.clone(), (&config.prusa).into()),
        BambuDispatcher::new(
            pool.clone(),
            status_cache.clone(),
            uploader,
            connector,
            (&config.bambu).into(),
        ),
    );
    let jobs = PrintJobManager::new(roster.clone(), job_store, storage, Arc::new(dispatcher)).with_limits(
        config.server.max_upload_bytes as u64,
        Duration::from_secs(config.storage.presign_ttl_secs),
    );

    pool.init().await;

    let state = Arc::new(AppStateInner {
        roster,
        metrics: Arc::new(orchestrator),
        metrics_auth: config
            .metrics
            .credentials()
            .map(|(user, pass)| Box::new(InMemoryAuthBackend::single(user, pass)) as Box<dyn AuthBackend>),
        jwt_secret: config::jwt_secret(&config.auth),
        jobs: Arc::new(jobs),
        bambu_pool: pool.clone(),
        bambu_status: status_cache.clone(),
        prusa: prusa_client,
        prusa_status_timeout: Duration::from_secs(config.prusa.status_timeout_secs),
        http: reqwest::Client::new(),
        max_upload_bytes: config.server.max_upload_bytes,
    });
    if state.metrics_auth.is_none() {
        tracing::warn!("Metrics credentials not configured, /metrics is disabled");
    }

    let app = create_router_with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    if let Some(handle) = pruner {
        handle.abort();
    }
    status_cache.stop_reaper();
    pool.shutdown().await;
    Ok(())
}

/// Drop gauges of printers that left the pool.
fn spawn_metrics_pruner(
    pool: Arc<BambuMqttPool>,
    store: Arc<BambuMetricsStore>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            store.retain(&pool.pooled_serials());
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
    }
}
