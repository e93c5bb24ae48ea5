//! crm-mirror server entry point.
//!
//! Serves the relational mirror of the CRM collections over HTTP. Logging
//! goes to stderr as JSON.

use anyhow::{Context, Result};
use crmsync_core::{AppConfig, MirrorDb};
use tracing_subscriber::EnvFilter;

mod error;
mod handler;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    let db = MirrorDb::open(&config.mirror_db_path)
        .await
        .with_context(|| format!("opening mirror database {}", config.mirror_db_path.display()))?;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, db = %config.mirror_db_path.display(), "Starting crm-mirror");

    axum::serve(listener, handler::router(db)).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("crm-mirror stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
