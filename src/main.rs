//! Ringwarden Binary Entry Point
//!
//! Loads the YAML config, opens storage, registers the configured probes and
//! runs the scheduler alongside the HTTP query surface until a shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ringwarden::{
    AppConfig, ProcLoadSource, Recorder, Scheduler, StorageBuilder,
    config::validate_settings,
    server::{AppState, create_router},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ringwarden - ring-buffer telemetry with an adaptive safety governor
#[derive(Parser, Debug)]
#[command(name = "ringwarden", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "RINGWARDEN_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "RINGWARDEN_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "RINGWARDEN_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database path (overrides config file)
    #[arg(long, env = "RINGWARDEN_DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ringwarden=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    config.validate()?;

    let storage = StorageBuilder::new(&config.database.path)
        .pool_size(config.database.pool_size)
        .build()?;

    let seeded = config.seed_settings(storage.state.as_ref())?;
    tracing::info!(seeded, "Settings seeded");

    let load = Arc::new(ProcLoadSource::with_root(&config.load.procfs_root));
    let mut recorder = Recorder::new(&storage, load)?;
    for probe in config.build_probes() {
        recorder.register(Arc::new(probe));
    }

    let settings = recorder.settings().load();
    for warning in validate_settings(&settings) {
        tracing::warn!(%warning, "Configuration check");
    }
    let recorder = Arc::new(recorder);

    let scheduler = Scheduler::new(Arc::clone(&recorder)).await?;
    scheduler.register_all(&config.schedules).await?;
    scheduler.start().await?;

    let app = create_router(AppState {
        recorder: Arc::clone(&recorder),
    });
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler, recorder))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then stop the scheduler and flush the rings one
/// last time.
async fn shutdown_signal(scheduler: Scheduler, recorder: Arc<Recorder>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down scheduler...");
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown scheduler");
    }

    let flushed = tokio::task::spawn_blocking(move || recorder.flush()).await;
    match flushed {
        Ok(reports) => tracing::info!(kinds = reports.len(), "Final flush complete"),
        Err(e) => tracing::error!(error = %e, "Final flush failed"),
    }
}
