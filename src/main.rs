use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use proxy_toolkit::store::postgres::PostgresStore;
use proxy_toolkit::{build_router, AppState, Backends, Config};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting proxy-toolkit v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        toolkit_enabled = config.toolkit_enabled,
        "Configuration loaded"
    );

    // Prometheus exporter (optional)
    if let Some(metrics_addr) = config.metrics_addr() {
        proxy_toolkit::metrics::try_init_metrics(metrics_addr);
    }

    // Connect storage
    info!("Connecting to PostgreSQL...");
    let store = PostgresStore::connect(&config.database_url, config.db_max_connections)
        .await
        .map_err(|e| {
            error!("Failed to connect to PostgreSQL: {e}");
            exitcode::UNAVAILABLE
        })?;
    info!("Storage ready");

    // Build application state and router
    let state = AppState::new(config.clone(), Backends::from_postgres(Arc::new(store)));
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health            - Health check");
    info!("  GET  /ready             - Readiness check");
    info!("  GET  /demo/cache        - Cached read demo");
    info!("  POST /demo/idempotent   - Idempotent write demo");
    info!("  GET  /demo/ratelimited  - Rate limit demo");
    info!("  GET  /demo/retry        - Retry demo");

    // Serve with graceful shutdown; ConnectInfo feeds the IP fallback of
    // subject resolution.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    // Gracefully shut down background tasks
    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve once the process has been asked to stop.
async fn shutdown_signal() {
    let signal_name = wait_for_stop_signal().await;
    info!(signal = signal_name, "Shutdown requested, draining in-flight work");
}

/// Wait for SIGINT or SIGTERM and report which one arrived.
///
/// # Panics
///
/// Panics when a handler cannot be installed: a server that cannot be
/// stopped cleanly should not keep running.
#[cfg(unix)]
async fn wait_for_stop_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("unable to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("unable to install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

/// Non-Unix fallback: Ctrl+C is the only stop signal available.
#[cfg(not(unix))]
async fn wait_for_stop_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("unable to install Ctrl+C handler");
    "ctrl-c"
}
