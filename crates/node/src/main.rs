//! soil-node: simulated ESP32 field device for local development.
//!
//! Serves the same `GET /api/readings` endpoint real firmware does, backed by
//! the stateful simulator in [`sim`]. Point a hub device entry at it:
//!
//! ```toml
//! [[devices]]
//! device_id = "sim-1"
//! name = "Simulated plot"
//! url = "http://127.0.0.1:9100/api/readings"
//! ```

mod sim;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::env;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::sim::{FieldSim, Scenario, SimReading};

#[derive(Debug, Serialize)]
struct ReadingsResponse {
    ts: i64,
    readings: Vec<SimReading>,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Clone)]
struct NodeState {
    sim: Arc<Mutex<FieldSim>>,
}

async fn readings(State(state): State<NodeState>) -> Json<ReadingsResponse> {
    let readings = {
        let mut sim = state.sim.lock().unwrap_or_else(|e| e.into_inner());
        sim.sample()
    };
    Json(ReadingsResponse {
        ts: now_unix(),
        readings,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let port: u16 = env::var("NODE_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9100);
    let scenario = Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_default(),
    );
    let diurnal_period_s: f64 = env::var("SIM_DAY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    info!(%scenario, port, diurnal_period_s, "soil-node starting");

    let state = NodeState {
        sim: Arc::new(Mutex::new(FieldSim::new(scenario, diurnal_period_s))),
    };
    let app = Router::new()
        .route("/api/readings", get(readings))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
