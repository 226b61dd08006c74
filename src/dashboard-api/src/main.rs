//! Dashboard API
//!
//! JSON endpoints behind the stock dashboard: proxies research and screening
//! requests to the workflow engine, and reads sessions, results and the
//! watchlist from the screening database.

mod handlers;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::{Config, Database, WatchlistService, WebhookClient, WebhookConfig};

use crate::state::AppState;

/// Dashboard API server
#[derive(Parser, Debug)]
#[command(name = "dashboard-api")]
#[command(about = "Serves the stock dashboard's proxy and database endpoints")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with RUST_LOG env filter
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();

    info!("Dashboard API starting...");

    let config = Config::from_env()?;
    let webhooks = WebhookConfig::from_env()?;
    info!("Webhooks: {:?}", webhooks);

    info!("Connecting to database...");
    let db = Database::connect(&config).await?;
    db.health_check().await?;
    info!("Database connected successfully");

    let db = Arc::new(db);
    let state = AppState::new(
        Arc::new(WebhookClient::new(webhooks)),
        db.clone(),
        WatchlistService::new(db),
    );
    let app = routes::router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("Listening on http://{}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    info!("Dashboard API stopped");
    Ok(())
}
