use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod error;
mod hash;
mod processing_client;
mod queue;
mod service;
mod storage;

use crate::db::Database;
use crate::processing_client::{HttpProcessingClient, ProcessingClient};
use crate::service::KnowledgeService;
use crate::storage::FsBlobStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!(
        "Starting knowledge base service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(config::load_config()?);
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Configuration loaded"
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Initialize database
    let db_path = config.storage.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let blobs = Arc::new(FsBlobStore::new(
        config.storage.blob_root(),
        &config.storage.bucket,
    ));
    let (producer, receiver) = queue::channel();
    let processing = HttpProcessingClient::from_config(&config.processing)?
        .map(|client| Arc::new(client) as Arc<dyn ProcessingClient>);

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let service = Arc::new(KnowledgeService::new(
        config.clone(),
        db,
        blobs,
        Arc::new(producer),
        processing,
    ));

    // Resume work interrupted by the previous shutdown before consuming new tasks
    match service.recover_tasks().await {
        Ok(report) if report.redispatched > 0 || report.failed > 0 => info!(
            redispatched = report.redispatched,
            failed = report.failed,
            "Recovered tasks from previous run"
        ),
        Err(e) => warn!(error = %e, "Task recovery failed"),
        _ => {}
    }

    let workers = KnowledgeService::start_task_workers(service.clone(), receiver);

    let app = api::router(service.clone(), prometheus_handle);

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight runs hand their tasks back to the ledger for the next start
    service.begin_shutdown();
    let grace = config.orchestration.shutdown_grace();
    match tokio::time::timeout(grace, workers).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Task worker pool exited abnormally"),
        Err(_) => warn!(
            grace_secs = grace.as_secs(),
            "In-flight runs did not stop in time; they will be failed on the next start"
        ),
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kbase_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
