use anyhow::{Context, Result};
use drivebase_engine::Engine;
use drivebase_engine::api::create_router;
use drivebase_engine::config::EngineConfig;
use drivebase_engine::logging::{self, LogConfig};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Config file location: first CLI argument, then DRIVEBASE_CONFIG, then ~/.drivebase/config.json
fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("DRIVEBASE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(EngineConfig::default_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path();
    let config = EngineConfig::load_from_path(&config_path).context("Failed to load configuration")?;

    // Keep the guard alive for the entire process lifetime
    let _log_guard = logging::init_logging(LogConfig::from_engine(&config))
        .context("Failed to initialize logging system")?;

    tracing::info!(target: "main", config = %config_path.display(), "Starting drivebase engine");

    let engine = Engine::build(config).context("Failed to build engine")?;
    let recovered = engine.recover_stalled().context("Failed to recover stalled jobs")?;
    if recovered > 0 {
        tracing::info!(target: "main", recovered, "Requeued jobs interrupted by the previous run");
    }

    let shutdown = CancellationToken::new();
    let workers = engine.spawn_workers(&shutdown);
    let sweeper = engine.spawn_sweeper(shutdown.clone());
    tracing::info!(target: "main", pools = workers.len(), "Worker pools started");

    let app = create_router(engine.app_state());

    let addr = engine.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(target: "main", "HTTP server listening on http://{}", addr);
    tracing::info!(target: "main", "SSE endpoint available at http://{}/api/events", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Draining worker pools...");
    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(target: "main", error = %e, "Worker pool task failed");
        }
    }
    if let Err(e) = sweeper.await {
        tracing::error!(target: "main", error = %e, "Sweeper task failed");
    }

    tracing::info!(target: "main", "Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(target: "main", error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(target: "main", error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }

    tracing::info!(target: "main", "Shutting down gracefully...");
}
