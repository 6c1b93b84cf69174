// src/main.rs
mod api;
mod challenge;
mod config;
mod directory;
mod error;
mod explorer;
mod lnurl;
mod monitor;
mod postgres;
mod reviews;
mod signature;
mod stores;
mod types;
mod verify;

use std::{sync::Arc, time::Duration as StdDuration};

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    api::AppState,
    challenge::ChallengeStore,
    config::Config,
    directory::{Directory, MemoryDirectory},
    postgres::PgDirectory,
};

const REAPER_PERIOD: StdDuration = StdDuration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let directory: Arc<dyn Directory> = match &config.database_url {
        Some(url) => Arc::new(PgDirectory::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set, stores and reviews live in memory only");
            Arc::new(MemoryDirectory::new())
        }
    };

    let challenges = Arc::new(ChallengeStore::new());
    tokio::spawn(challenge::run_reaper(challenges.clone(), REAPER_PERIOD));

    let addr = config.bind_addr;
    let state = AppState::new(config, directory, challenges)?;
    let monitor = state.monitor.clone();
    let app = api::router(state);

    info!("directory listening on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    monitor.stop_all().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
