mod api;
mod app_state;
mod config;
mod core;
mod errors;
mod routes;
mod scheduler;
mod tasks;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use app_state::build_app_state;
use config::RouterConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = RouterConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let state = build_app_state(config).context("failed to build application state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tasks::spawn(state.clone(), shutdown_rx);

    let app = routes::app_router().with_state(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(%bind_addr, "inference router listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
