use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use jobrelay::app_state::AppState;
use jobrelay::config::AppConfig;
use jobrelay::routes;
use jobrelay::services::compute::ProcessComputeEngine;

#[tokio::main]
async fn main() {
    jobrelay::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        mode = ?config.deployment_mode,
        backend = ?config.storage_backend,
        "Initializing jobrelay server"
    );

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    let (documents, quota) = jobrelay::connect_storage(&config)
        .await
        .expect("Failed to initialize durable storage");

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .expect("Failed to create output directory");

    let engine = Arc::new(ProcessComputeEngine::new(
        &config.compute_program,
        config.compute_args.clone(),
    ));

    let state = AppState::build(&config, documents, quota, engine)
        .expect("Failed to assemble application state");

    let shutdown = CancellationToken::new();
    let background = state.spawn_background_tasks(&config, &shutdown);

    let app = routes::router(state.clone(), prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            token.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    state.shutdown().await;
    tracing::info!("Shutdown complete");
}
