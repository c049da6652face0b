//! Read-only REST surface for the mobile client, plus manual device
//! activation. Every route sits behind the bearer-token gate; handlers only
//! ever read the store, so they never contend with the poller beyond sqlite's
//! own locking.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::auth::{self, AuthError, TokenVerifier};
use crate::config::CropEntry;
use crate::db::{Db, DeviceRow, StoredReading, WindowStats};
use crate::poller::PollerHandle;
use crate::reading::SensorKind;
use crate::state::SharedState;

/// History rows returned when the client does not ask for a limit.
const DEFAULT_HISTORY_LIMIT: i64 = 1_000;
/// Hard ceiling on history rows per request.
const MAX_HISTORY_LIMIT: i64 = 10_000;
/// Dashboard statistics window, in seconds.
const DASHBOARD_WINDOW_SECS: i64 = 24 * 3600;

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub verifier: Arc<dyn TokenVerifier>,
    pub crops: Arc<HashMap<String, CropEntry>>,
    pub poller: PollerHandle,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(AuthError),
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Internal(e) => {
                tracing::error!("api internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let verified =
        auth::bearer_token(req.headers()).and_then(|token| state.verifier.verify(token));
    match verified {
        Ok(principal) => {
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => ApiError::Unauthorized(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{device_id}/latest", get(device_latest))
        .route("/api/devices/{device_id}/history", get(device_history))
        .route("/api/devices/{device_id}/activate", post(activate_device))
        .route(
            "/api/devices/{device_id}/deactivate",
            post(deactivate_device),
        )
        .route("/api/dashboard", get(dashboard))
        .route("/api/status", get(status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers: registry
// ---------------------------------------------------------------------------

async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceRow>>, ApiError> {
    Ok(Json(state.db.load_devices().await?))
}

async fn require_device(state: &AppState, device_id: &str) -> Result<DeviceRow, ApiError> {
    state
        .db
        .get_device(device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown device '{device_id}'")))
}

fn parse_kind(s: &str) -> Result<SensorKind, ApiError> {
    SensorKind::from_str_opt(s)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown sensor type '{s}'")))
}

// ---------------------------------------------------------------------------
// Handlers: readings
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LatestQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Latest reading for one sensor type, or for every type the device has
/// reported when `type` is omitted.
async fn device_latest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(q): Query<LatestQuery>,
) -> Result<Response, ApiError> {
    require_device(&state, &device_id).await?;

    match q.kind.as_deref() {
        Some(s) => {
            let kind = parse_kind(s)?;
            let reading = state.db.latest(&device_id, kind).await?.ok_or_else(|| {
                ApiError::NotFound(format!("no {kind} readings for '{device_id}'"))
            })?;
            Ok(Json(reading).into_response())
        }
        None => {
            let readings = state.db.latest_per_kind(&device_id).await?;
            Ok(Json(readings).into_response())
        }
    }
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(rename = "type")]
    kind: String,
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<i64>,
}

/// Chronological slice of one sensor's readings within `[from, to]`.
async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<StoredReading>>, ApiError> {
    require_device(&state, &device_id).await?;
    let kind = parse_kind(&q.kind)?;

    let from = q.from.unwrap_or(0);
    let to = q.to.unwrap_or_else(|| Utc::now().timestamp());
    if from > to {
        return Err(ApiError::BadRequest(format!(
            "empty window: from ({from}) is after to ({to})"
        )));
    }

    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit <= 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be in 1..={MAX_HISTORY_LIMIT}, got {limit}"
        )));
    }

    Ok(Json(state.db.range(&device_id, kind, from, to, limit).await?))
}

// ---------------------------------------------------------------------------
// Handlers: dashboard
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DashboardDevice {
    device_id: String,
    name: String,
    crop: Option<String>,
    active: bool,
    last_contact_ts: Option<i64>,
    latest: Vec<StoredReading>,
    /// Min/max/avg over the last 24 h, keyed by sensor type.
    stats: BTreeMap<String, WindowStats>,
    alerts: Vec<String>,
}

#[derive(Serialize)]
struct DashboardResponse {
    generated_at: i64,
    devices: Vec<DashboardDevice>,
}

/// Fleet overview: latest reading per sensor, 24 h statistics, and crop
/// threshold alerts for each registered device.
async fn dashboard(State(state): State<AppState>) -> Result<Json<DashboardResponse>, ApiError> {
    let now = Utc::now().timestamp();
    let from = now - DASHBOARD_WINDOW_SECS;
    let mut devices = Vec::new();

    for row in state.db.load_devices().await? {
        let latest = state.db.latest_per_kind(&row.device_id).await?;

        let mut stats = BTreeMap::new();
        for r in &latest {
            let Some(kind) = SensorKind::from_str_opt(&r.sensor_type) else {
                continue;
            };
            if let Some(s) = state.db.window_stats(&row.device_id, kind, from, now).await? {
                stats.insert(kind.as_str().to_string(), s);
            }
        }

        let alerts = match row.crop.as_deref().and_then(|c| state.crops.get(c)) {
            Some(crop) => crop_alerts(crop, &latest),
            None => Vec::new(),
        };

        devices.push(DashboardDevice {
            device_id: row.device_id,
            name: row.name,
            crop: row.crop,
            active: row.active,
            last_contact_ts: row.last_contact_ts,
            latest,
            stats,
            alerts,
        });
    }

    Ok(Json(DashboardResponse {
        generated_at: now,
        devices,
    }))
}

/// Compare a device's latest readings against its crop's plausible band.
fn crop_alerts(crop: &CropEntry, latest: &[StoredReading]) -> Vec<String> {
    let mut alerts = Vec::new();
    for r in latest {
        let Some(kind) = SensorKind::from_str_opt(&r.sensor_type) else {
            continue;
        };
        let (lo, hi) = crop.bounds(kind);
        if let Some(lo) = lo {
            if r.value < lo {
                alerts.push(format!(
                    "{kind} {} {} below minimum {lo} for {}",
                    r.value, r.unit, crop.name
                ));
                continue;
            }
        }
        if let Some(hi) = hi {
            if r.value > hi {
                alerts.push(format!(
                    "{kind} {} {} above maximum {hi} for {}",
                    r.value, r.unit, crop.name
                ));
            }
        }
    }
    alerts
}

// ---------------------------------------------------------------------------
// Handlers: status & activation
// ---------------------------------------------------------------------------

async fn status(State(state): State<AppState>) -> Response {
    let snapshot = state.shared.read().await.to_status();
    Json(snapshot).into_response()
}

async fn activate_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_device_active(&state, &device_id, true).await
}

async fn deactivate_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_device_active(&state, &device_id, false).await
}

async fn set_device_active(
    state: &AppState,
    device_id: &str,
    active: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.db.set_active(device_id, active).await? {
        return Err(ApiError::NotFound(format!("unknown device '{device_id}'")));
    }
    // The poller owns the schedule; tell it to re-arm (or park) the device.
    if active {
        state.poller.activate(device_id).await;
    } else {
        state.poller.deactivate(device_id).await;
    }
    info!(device = %device_id, active, "device activation changed");
    Ok(Json(json!({ "device_id": device_id, "active": active })))
}

// ===========================================================================
// Tests
// ===========================================================================
