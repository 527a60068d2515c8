use anyhow::Result;
use axum::serve;
use relay_core::{config::AppConfig, runtime::RelayRuntime};
use server::{
    api::{audit, ApiState},
    router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "warn,relay_core=info,server=info,audit=info";

/// Initializes the logging system based on the configuration.
///
/// `RUST_LOG=debug` or `RUST_LOG=trace` widens the relay targets only; any other value is
/// parsed as a full filter directive.
fn init_logging(config: &AppConfig) {
    let filter = match std::env::var("RUST_LOG").as_deref() {
        Ok("debug") => EnvFilter::new("warn,relay_core=debug,server=debug,audit=debug"),
        Ok("trace") => EnvFilter::new("warn,relay_core=trace,server=trace,audit=trace"),
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!(environment = %config.environment, "Starting Relay gateway");
    debug!(
        sources = config.sources.len(),
        pools = config.pools.len(),
        bind_port = config.server.bind_port,
        "Configuration loaded"
    );

    let runtime = RelayRuntime::builder()
        .with_config(config.clone())
        .build()
        .map_err(|e| anyhow::anyhow!("Runtime initialization failed: {e}"))?;

    let forwarder =
        audit::spawn_event_forwarder(runtime.components().events(), runtime.shutdown_receiver());

    let state = ApiState::new(runtime.components().clone(), Arc::new(config.clone()));
    let app = router::create_router(state);

    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Relay gateway listening");

    if let Err(e) = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Server error occurred");
    }

    runtime.shutdown().await;
    if let Err(e) = forwarder.await {
        error!(error = %e, "Audit forwarder task failed");
    }
    info!("Server shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
