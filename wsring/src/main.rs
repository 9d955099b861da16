use anyhow::Context;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use wsring::acceptor::{self, AcceptorSettings};
use wsring::worker::{self, LogHandler};
use wsring::{config, netio, runtime, telemetry};

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;
    telemetry::init_logging(&config.logging).context("failed to initialize logging")?;
    info!("Configuration loaded successfully");

    if config.limits.raise_nofile {
        let limit = runtime::raise_nofile_limit(&config.limits)
            .context("failed to raise open file limit")?;
        info!(nofile = limit, "open file limit");
    }

    let bind_addr = config.network.bind_addr()?;

    // The tokio runtime only serves the upgrade handshake.
    let tokio_runtime =
        runtime::create_runtime(&config.runtime).context("failed to create tokio runtime")?;

    let event_loop = worker::spawn(&config, Arc::new(LogHandler))
        .context("failed to start event loop")?;

    let listener = netio::create_listener(bind_addr, &config.netio)
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(%bind_addr, "listening");

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio_runtime.spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            return;
        }
        info!("Shutdown signal received");
        signal.notify_one();
    });

    let core = Arc::clone(event_loop.core());
    let settings = AcceptorSettings::from_config(&config);
    let served = tokio_runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        acceptor::serve(listener, core, settings, shutdown).await
    });
    if let Err(e) = &served {
        error!(error = %e, "acceptor failed");
    }

    info!("Initiating graceful shutdown");
    let closed = event_loop.shutdown();
    info!(closed, "connections closed");

    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    info!("Shutdown complete");
    served
}
