use clap::Parser;
use ollamarelay::config::{CliArgs, RelayConfig};
use ollamarelay::session::SessionRegistry;
use ollamarelay::{router, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

// application entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RelayConfig::try_from(args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let state = AppState::from_config(&config)?;
    let registry = state.registry().clone();

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        "Relay listening on http://{} (backend {}, default model {})",
        listener.local_addr()?,
        config.backend_url,
        config.default_model
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    tracing::info!("Relay shut down");
    Ok(())
}

// Waits for Ctrl+C or SIGTERM, then stops every in-flight generation so the
// open streams can drain.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    let stopped = registry.cancel_all();
    tracing::info!(stopped, "Shutdown signal received, stopping active generations");
}
