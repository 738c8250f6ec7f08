#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use core::time::Duration;
use server::config::{CliArgs, ServerConfig};
use server::service::config::{Backend, Coordinator, build_producer};
use server::service::handler::{AppState, router};
use server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let store = Backend::open(&config).await?;
    let coordinator = Coordinator::new(store, build_producer(&config), config.coordinator.clone());
    let app = router(
        AppState::new(coordinator.clone(), config.keep_alive),
        &config.allowed_origins,
    )?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator, config.shutdown_timeout))
        .await?;

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting stream service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting stream service on {} with {:?} storage",
            config.server_addr,
            config.storage
        );
    }
}

async fn shutdown_signal(coordinator: Coordinator, drain_timeout: Duration) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // Health turns 503 and new subscriptions are refused from here on; live
    // runs get `drain_timeout` to finish before open streams are closed.
    coordinator.shutdown(drain_timeout).await;
}
