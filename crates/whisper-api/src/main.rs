//! whisper-api - HTTP API server for the Property Whisperer pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use whisper_api::{build_router, ApiConfig, AppState};
use whisper_core::defaults::HOUSEKEEPING_INTERVAL_MS;
use whisper_core::ExtractionWorker;
use whisper_db::Database;
use whisper_jobs::{
    ExtractionPipeline, Housekeeper, HttpExtractionWorker, HttpWorkerConfig, JobWorker,
    WorkerConfig,
};
use whisper_reconcile::{ReconcileConfig, Reconciler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "whisper_api=debug,whisper_jobs=debug,whisper_reconcile=info,tower_http=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("whisper-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = ApiConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    let reconcile_config = ReconcileConfig::from_env();
    reconcile_config.validate()?;

    // Storage
    let mut db = match config.database_url.as_deref() {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            info!("Connected to PostgreSQL, migrations applied");
            db
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store (state is lost on restart)");
            Database::in_memory()
        }
    };
    if let Some(path) = config.blob_storage_path.as_deref() {
        info!(path, "Using filesystem blob storage");
        db = db.with_filesystem_storage(path);
    }

    // Extraction worker
    let extraction_worker: Option<Arc<dyn ExtractionWorker>> = match HttpWorkerConfig::from_env()
    {
        Some(worker_cfg) => {
            info!(base_url = %worker_cfg.base_url, "Extraction worker configured");
            let worker: Arc<dyn ExtractionWorker> = Arc::new(HttpExtractionWorker::new(worker_cfg)?);
            Some(worker)
        }
        None => {
            warn!("EXTRACTION_WORKER_URL not set, uploads will queue and time out");
            None
        }
    };

    // Background processing
    let worker_handle = match (&extraction_worker, worker_config.enabled) {
        (Some(extractor), true) => {
            let pipeline = ExtractionPipeline::new(
                db.clone(),
                extractor.clone(),
                Reconciler::new(reconcile_config),
            );
            info!(
                max_concurrent = worker_config.max_concurrent_jobs,
                job_timeout_secs = worker_config.job_timeout.as_secs(),
                max_auto_retries = worker_config.max_auto_retries,
                "Starting job worker"
            );
            Some(JobWorker::new(db.clone(), worker_config.clone(), pipeline).start())
        }
        (_, false) => {
            info!("Job worker disabled (JOB_WORKER_ENABLED=false)");
            None
        }
        (None, true) => None,
    };

    let housekeeping_interval = std::env::var("HOUSEKEEPING_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(HOUSEKEEPING_INTERVAL_MS);
    let mut housekeeper = Housekeeper::new(db.clone(), worker_config.job_timeout)
        .with_interval(Duration::from_millis(housekeeping_interval));
    if let Some(extractor) = &extraction_worker {
        housekeeper = housekeeper.with_worker(extractor.clone());
    }
    let housekeeper_handle = housekeeper.start();

    // HTTP
    let mut state = AppState::new(db, config.clone());
    if let Some(extractor) = extraction_worker {
        state = state.with_extraction_worker(extractor);
    }
    let app = build_router(state);

    let addr: SocketAddr = config.bind_address().parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, draining background work");
    if let Some(handle) = worker_handle {
        handle.shutdown().await?;
    }
    housekeeper_handle.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
