use anyhow::{Context, Result};
use archive_service::api::{start_api_server, AppState};
use archive_service::config::Config;
use archive_service::notify::BroadcastNotifier;
use archive_service::pool::ArchiveService;
use archive_service::store::{self, ArchiveStore, PgArchiveStore};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        tenants = config.tenants.len(),
        "Starting archive service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let pg_pool = store::connect(&config.database)
        .await
        .context("Failed to initialize archive store")?;

    let notifier = Arc::new(BroadcastNotifier::new(1024));
    let events_handle = tokio::spawn(log_flush_events(notifier.clone()));

    let table = config.database.table.clone();
    let service = Arc::new(ArchiveService::start(
        &config.tenants,
        |tenant| {
            let store: Arc<dyn ArchiveStore> = Arc::new(PgArchiveStore::new(
                pg_pool.clone(),
                table.clone(),
                tenant.max_batch_size,
            ));
            store
        },
        notifier,
    ));

    // Create API state
    let api_state = AppState {
        service: service.clone(),
        db_pool: pg_pool.clone(),
    };

    // Spawn API server task
    let shutdown = CancellationToken::new();
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Archive service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down archive service");

    // Stop admitting over HTTP, then flush every pool
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task failed");
    }

    service.shutdown().await;
    events_handle.abort();
    pg_pool.close().await;

    info!("Archive service stopped");

    Ok(())
}

/// Log every flush event until the notifier goes away
async fn log_flush_events(notifier: Arc<BroadcastNotifier>) {
    let mut events = notifier.subscribe();
    drop(notifier);

    loop {
        match events.recv().await {
            Ok(event) => debug!(
                tenant = %event.tenant,
                worker = event.worker,
                count = event.message_count,
                inserted = event.inserted,
                "Archive flushed"
            ),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Flush event subscriber lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
