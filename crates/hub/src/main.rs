//! soil-hub: polls ESP32 field devices for soil telemetry, stores readings in
//! sqlite, and serves them to the mobile client over a token-gated REST API.

mod auth;
mod config;
mod db;
mod device;
mod poller;
mod reading;
mod state;
mod web;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::auth::StaticTokenSet;
use crate::db::Db;
use crate::device::DeviceClient;
use crate::state::{SharedState, SystemState};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env_or("CONFIG_PATH", "config.toml");
    let db_url = env_or("DB_URL", "sqlite:soil.db?mode=rwc");
    let web_port: u16 = env_or("WEB_PORT", "8080")
        .parse()
        .context("WEB_PORT must be a port number")?;

    info!(%config_path, %db_url, web_port, "soil-hub starting");

    let config = config::load(&config_path)?;

    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    config::apply(&config, &db).await?;

    // Shared diagnostics view, seeded from the registry.
    let devices = db.load_devices().await?;
    let seed: Vec<(String, bool)> = devices
        .iter()
        .map(|d| (d.device_id.clone(), d.active))
        .collect();
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new(&seed)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (poller_handle, poller_commands) = poller::command_channel();

    let app_state = web::AppState {
        db: db.clone(),
        shared: Arc::clone(&shared),
        verifier: Arc::new(StaticTokenSet::new(config.api.tokens.clone())),
        crops: Arc::new(config.crop_map()),
        poller: poller_handle,
    };
    let web_shutdown = shutdown_rx.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(app_state, web_port, web_shutdown).await {
            error!("web server error: {e:#}");
        }
    });

    let client = DeviceClient::new(config.poller.timeout());
    let poller_task = tokio::spawn(poller::run(
        db,
        client,
        Arc::clone(&shared),
        config.poller.clone(),
        poller_commands,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // The poller drains in-flight polls; the web server closes its listener.
    let _ = poller_task.await;
    let _ = web_task.await;
    info!("soil-hub stopped");

    Ok(())
}
