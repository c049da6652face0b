//! Telemetry acquisition loop: polls every registered ESP32 device over HTTP,
//! normalizes the payload, and appends valid readings to the store.
//!
//! A single task owns all per-device schedule state; poll results and
//! activation commands arrive over channels, so no lock is shared across
//! devices and a slow device can never block the rest of the fleet.
//!
//! ## Per-device state machine
//!
//! ```text
//! Idle ──[due]──▶ Polling ──[stored/skipped]──▶ Idle (base interval)
//!  ▲                 │
//!  │                 └──[failed]──▶ Idle (backoff ×2, capped)
//!  │                 └──[failed × threshold]──▶ Deactivated
//!  └────────────[activate command]─────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::PollerSettings;
use crate::db::{Db, DeviceRow};
use crate::device::{DeviceClient, FetchError};
use crate::reading::{self, ParseError};
use crate::state::SharedState;

/// How often the scheduler evaluates the fleet.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for in-flight polls to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw payload bytes kept for diagnostics when a payload is malformed.
const SNAPSHOT_BYTES: usize = 200;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

/// Why a successful contact stored nothing.
#[derive(Debug)]
pub enum SkipReason {
    Malformed(ParseError),
    AllRejected(usize),
    Empty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "{e}"),
            Self::AllRejected(n) => write!(f, "all {n} readings rejected"),
            Self::Empty => write!(f, "empty payload"),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Contact succeeded and readings were written.
    Stored { accepted: u64, rejected: usize },
    /// Contact succeeded but nothing was stored; not a network failure.
    Skipped { reason: SkipReason },
    /// Network or persistence failure; feeds the failure streak.
    Failed { error: PollError },
}

/// One finished attempt, for bookkeeping and diagnostics.
#[derive(Debug)]
pub struct PollAttempt {
    pub device_id: String,
    pub outcome: PollOutcome,
    pub latency: Option<Duration>,
    pub raw_snapshot: Option<String>,
}

// ---------------------------------------------------------------------------
// Per-device schedule state
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DevicePhase {
    /// Waiting for `next_due`.
    Idle { next_due: Instant },
    /// A poll task is in flight; never scheduled again until it reports.
    Polling,
    /// Excluded from scheduling until reactivated.
    Deactivated,
}

struct DeviceState {
    device: DeviceRow,
    phase: DevicePhase,
    failures: u32,
}

impl DeviceState {
    fn from_row(device: DeviceRow, now: Instant) -> Self {
        let phase = if device.active {
            DevicePhase::Idle { next_due: now }
        } else {
            DevicePhase::Deactivated
        };
        // Failure streaks survive a restart.
        let failures = device.consecutive_failures.max(0) as u32;
        Self {
            device,
            phase,
            failures,
        }
    }

    fn interval(&self, settings: &PollerSettings) -> Duration {
        match self.device.poll_interval_sec {
            Some(sec) if sec > 0 => Duration::from_secs(sec as u64),
            _ => settings.default_interval(),
        }
    }
}

/// Backoff after `failures` consecutive failures: base interval doubled per
/// failure, capped. Zero failures means the plain base interval.
pub fn backoff_delay(base: Duration, failures: u32, cap: Duration) -> Duration {
    if failures == 0 {
        return base;
    }
    let factor = 2u32.saturating_pow(failures.min(16));
    base.checked_mul(factor).unwrap_or(cap).min(cap).max(base)
}

// ---------------------------------------------------------------------------
// Commands (manual activation from the REST surface)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum PollerCommand {
    Activate(String),
    Deactivate(String),
}

#[derive(Clone)]
pub struct PollerHandle {
    tx: mpsc::Sender<PollerCommand>,
}

impl PollerHandle {
    pub async fn activate(&self, device_id: &str) {
        let _ = self
            .tx
            .send(PollerCommand::Activate(device_id.to_string()))
            .await;
    }

    pub async fn deactivate(&self, device_id: &str) {
        let _ = self
            .tx
            .send(PollerCommand::Deactivate(device_id.to_string()))
            .await;
    }
}

pub fn command_channel() -> (PollerHandle, mpsc::Receiver<PollerCommand>) {
    let (tx, rx) = mpsc::channel(16);
    (PollerHandle { tx }, rx)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the acquisition loop. Intended to be `tokio::spawn`-ed from main;
/// returns once `shutdown` fires and in-flight polls have drained.
pub async fn run(
    db: Db,
    client: DeviceClient,
    shared: SharedState,
    settings: PollerSettings,
    mut commands: mpsc::Receiver<PollerCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let rows = match db.load_devices().await {
        Ok(rows) => rows,
        Err(e) => {
            error!("poller: failed to load device registry: {e:#}");
            return;
        }
    };

    let now = Instant::now();
    let mut states: HashMap<String, DeviceState> = rows
        .into_iter()
        .map(|row| (row.device_id.clone(), DeviceState::from_row(row, now)))
        .collect();

    let limiter = Arc::new(Semaphore::new(settings.max_in_flight));
    let (result_tx, mut results) = mpsc::channel::<PollAttempt>(64);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let mut in_flight: usize = 0;

    info!(
        devices = states.len(),
        interval_sec = settings.default_interval_sec,
        max_in_flight = settings.max_in_flight,
        failure_threshold = settings.failure_threshold,
        "poller started"
    );
    {
        let mut st = shared.write().await;
        st.record_system(format!("poller started ({} devices)", states.len()));
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for device in schedule_due(&mut states, Instant::now()) {
                    in_flight += 1;
                    spawn_poll(
                        db.clone(),
                        client.clone(),
                        device,
                        Arc::clone(&limiter),
                        result_tx.clone(),
                    );
                }
            }
            Some(attempt) = results.recv() => {
                in_flight = in_flight.saturating_sub(1);
                apply_attempt(&mut states, attempt, &db, &shared, &settings).await;
            }
            Some(cmd) = commands.recv() => {
                handle_command(&mut states, cmd, &db, &shared).await;
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    // Stop scheduling; let in-flight polls finish or time out.
    info!(in_flight, "poller stopping");
    let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(deadline);
    while in_flight > 0 {
        tokio::select! {
            Some(attempt) = results.recv() => {
                in_flight = in_flight.saturating_sub(1);
                apply_attempt(&mut states, attempt, &db, &shared, &settings).await;
            }
            _ = &mut deadline => {
                warn!(in_flight, "shutdown drain timed out");
                break;
            }
        }
    }
    info!("poller stopped");
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Collect every device due for a poll, flipping it to `Polling` so it cannot
/// be scheduled twice. Deactivated and in-flight devices are never returned.
fn schedule_due(states: &mut HashMap<String, DeviceState>, now: Instant) -> Vec<DeviceRow> {
    let mut due = Vec::new();
    for st in states.values_mut() {
        let DevicePhase::Idle { next_due } = st.phase else {
            continue;
        };
        if now < next_due {
            continue;
        }
        st.phase = DevicePhase::Polling;
        due.push(st.device.clone());
    }
    due
}

fn spawn_poll(
    db: Db,
    client: DeviceClient,
    device: DeviceRow,
    limiter: Arc<Semaphore>,
    tx: mpsc::Sender<PollAttempt>,
) {
    tokio::spawn(async move {
        let Ok(_permit) = limiter.acquire_owned().await else {
            return;
        };
        let attempt = poll_device(&db, &client, &device).await;
        let _ = tx.send(attempt).await;
    });
}

// ---------------------------------------------------------------------------
// One poll attempt
// ---------------------------------------------------------------------------

/// Fetch → normalize → store, with every failure mapped to a typed outcome.
async fn poll_device(db: &Db, client: &DeviceClient, device: &DeviceRow) -> PollAttempt {
    let device_id = device.device_id.clone();

    let payload = match client.fetch(&device.url).await {
        Ok(p) => p,
        Err(e) => {
            return PollAttempt {
                device_id,
                outcome: PollOutcome::Failed { error: e.into() },
                latency: None,
                raw_snapshot: None,
            }
        }
    };

    let latency = Some(payload.latency);
    let normalized = match reading::normalize(&payload.bytes, &device.device_id, Utc::now()) {
        Ok(n) => n,
        Err(e) => {
            return PollAttempt {
                device_id,
                outcome: PollOutcome::Skipped {
                    reason: SkipReason::Malformed(e),
                },
                latency,
                raw_snapshot: Some(snippet(&payload.bytes)),
            }
        }
    };

    for reason in &normalized.rejected {
        warn!(device = %device.device_id, %reason, "reading rejected");
    }

    if normalized.readings.is_empty() {
        let reason = if normalized.rejected.is_empty() {
            SkipReason::Empty
        } else {
            SkipReason::AllRejected(normalized.rejected.len())
        };
        return PollAttempt {
            device_id,
            outcome: PollOutcome::Skipped { reason },
            latency,
            raw_snapshot: Some(snippet(&payload.bytes)),
        };
    }

    let rejected = normalized.rejected.len();
    match db.insert_readings(&normalized.readings).await {
        Ok(accepted) => PollAttempt {
            device_id,
            outcome: PollOutcome::Stored { accepted, rejected },
            latency,
            raw_snapshot: None,
        },
        Err(e) => PollAttempt {
            device_id,
            outcome: PollOutcome::Failed {
                error: PollError::Store(e),
            },
            latency,
            raw_snapshot: None,
        },
    }
}

/// Truncated payload copy for the event log.
fn snippet(bytes: &[u8]) -> String {
    let s = String::from_utf8_lossy(bytes);
    s.chars().take(SNAPSHOT_BYTES).collect()
}

// ---------------------------------------------------------------------------
// Outcome application
// ---------------------------------------------------------------------------

/// Fold one finished attempt back into schedule state, the registry row, and
/// the shared diagnostics view.
async fn apply_attempt(
    states: &mut HashMap<String, DeviceState>,
    attempt: PollAttempt,
    db: &Db,
    shared: &SharedState,
    settings: &PollerSettings,
) {
    let Some(st) = states.get_mut(&attempt.device_id) else {
        return;
    };
    let device_id = attempt.device_id.as_str();
    let interval = st.interval(settings);
    let latency_ms = attempt.latency.map(|d| d.as_millis() as u64);
    let now_ts = Utc::now().timestamp();

    match &attempt.outcome {
        PollOutcome::Stored { accepted, rejected } => {
            st.failures = 0;
            st.phase = DevicePhase::Idle {
                next_due: Instant::now() + interval,
            };
            if let Err(e) = db.record_success(device_id, now_ts).await {
                error!(device = %device_id, "record_success failed: {e:#}");
            }
            info!(device = %device_id, accepted, rejected, ?latency_ms, "poll stored");

            let mut state = shared.write().await;
            state.record_attempt(
                device_id,
                &format!("stored {accepted} readings"),
                latency_ms,
                0,
            );
            if *rejected > 0 {
                state.record_rejects(device_id, format!("{rejected} readings rejected"));
            }
        }
        PollOutcome::Skipped { reason } => {
            // The device answered; parse trouble is not a network failure.
            st.failures = 0;
            st.phase = DevicePhase::Idle {
                next_due: Instant::now() + interval,
            };
            if let Err(e) = db.record_success(device_id, now_ts).await {
                error!(device = %device_id, "record_success failed: {e:#}");
            }
            warn!(
                device = %device_id,
                %reason,
                snapshot = attempt.raw_snapshot.as_deref().unwrap_or(""),
                "poll skipped"
            );

            let mut state = shared.write().await;
            state.record_attempt(device_id, &format!("skipped: {reason}"), latency_ms, 0);
            state.record_rejects(device_id, reason.to_string());
        }
        PollOutcome::Failed { error } => {
            st.failures += 1;
            let failures = st.failures;
            if let Err(e) = db.record_failure(device_id).await {
                error!(device = %device_id, "record_failure failed: {e:#}");
            }

            if failures >= settings.failure_threshold {
                st.phase = DevicePhase::Deactivated;
                if let Err(e) = db.set_active(device_id, false).await {
                    error!(device = %device_id, "set_active failed: {e:#}");
                }
                warn!(device = %device_id, failures, %error, "device deactivated");

                let mut state = shared.write().await;
                state.record_attempt(device_id, &error.to_string(), latency_ms, failures);
                state.set_device_active(device_id, false);
            } else {
                let delay = backoff_delay(interval, failures, settings.max_backoff());
                st.phase = DevicePhase::Idle {
                    next_due: Instant::now() + delay,
                };
                warn!(
                    device = %device_id,
                    failures,
                    retry_in_sec = delay.as_secs(),
                    %error,
                    "poll failed — backing off"
                );

                let mut state = shared.write().await;
                state.record_attempt(device_id, &error.to_string(), latency_ms, failures);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn handle_command(
    states: &mut HashMap<String, DeviceState>,
    cmd: PollerCommand,
    db: &Db,
    shared: &SharedState,
) {
    match cmd {
        PollerCommand::Activate(device_id) => {
            if let Err(e) = db.set_active(&device_id, true).await {
                error!(device = %device_id, "set_active failed: {e:#}");
                return;
            }
            match states.get_mut(&device_id) {
                Some(st) => {
                    st.failures = 0;
                    st.phase = DevicePhase::Idle {
                        next_due: Instant::now(),
                    };
                }
                None => {
                    // Registered after startup; adopt it from the db.
                    if let Ok(Some(row)) = db.get_device(&device_id).await {
                        states.insert(
                            device_id.clone(),
                            DeviceState::from_row(row, Instant::now()),
                        );
                    }
                }
            }
            info!(device = %device_id, "device reactivated");
            shared.write().await.set_device_active(&device_id, true);
        }
        PollerCommand::Deactivate(device_id) => {
            if let Err(e) = db.set_active(&device_id, false).await {
                error!(device = %device_id, "set_active failed: {e:#}");
                return;
            }
            if let Some(st) = states.get_mut(&device_id) {
                st.phase = DevicePhase::Deactivated;
            }
            info!(device = %device_id, "device deactivated by request");
            shared.write().await.set_device_active(&device_id, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
