//! Ephemeral poll diagnostics shared between the poller and the web layer.
//!
//! Nothing here is persisted; it backs the `/api/status` view the mobile
//! client uses to show fleet health.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub devices: HashMap<String, DevicePollState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct DevicePollState {
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_latency_ms: Option<u64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Poll,
    Reject,
    Failure,
    Deactivated,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub devices: HashMap<String, DevicePollState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(devices: &[(String, bool)]) -> Self {
        let devices = devices
            .iter()
            .map(|(id, active)| {
                (
                    id.clone(),
                    DevicePollState {
                        active: *active,
                        consecutive_failures: 0,
                        last_attempt: None,
                        last_outcome: None,
                        last_latency_ms: None,
                    },
                )
            })
            .collect();

        Self {
            started_at: Instant::now(),
            devices,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the outcome of one poll attempt.
    pub fn record_attempt(
        &mut self,
        device_id: &str,
        outcome: &str,
        latency_ms: Option<u64>,
        failures: u32,
    ) {
        let entry = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePollState {
                active: true,
                consecutive_failures: 0,
                last_attempt: None,
                last_outcome: None,
                last_latency_ms: None,
            });
        entry.last_attempt = Some(Utc::now());
        entry.last_outcome = Some(outcome.to_string());
        entry.last_latency_ms = latency_ms;
        entry.consecutive_failures = failures;

        let kind = if failures > 0 {
            EventKind::Failure
        } else {
            EventKind::Poll
        };
        self.push_event(kind, format!("{device_id}: {outcome}"));
    }

    /// Record entries dropped by the normalizer.
    pub fn record_rejects(&mut self, device_id: &str, detail: String) {
        self.push_event(EventKind::Reject, format!("{device_id}: {detail}"));
    }

    /// Flip a device's active flag, with a matching event.
    pub fn set_device_active(&mut self, device_id: &str, active: bool) {
        if let Some(d) = self.devices.get_mut(device_id) {
            d.active = active;
            if active {
                d.consecutive_failures = 0;
            }
        }
        if active {
            self.push_event(EventKind::System, format!("{device_id} reactivated"));
        } else {
            self.push_event(
                EventKind::Deactivated,
                format!("{device_id} deactivated after repeated failures"),
            );
        }
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot (newest events first).
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            devices: self.devices.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SystemState {
        SystemState::new(&[("esp32-1".to_string(), true)])
    }

    #[test]
    fn attempt_updates_device_entry() {
        let mut st = state();
        st.record_attempt("esp32-1", "stored 3 readings", Some(42), 0);

        let d = &st.devices["esp32-1"];
        assert_eq!(d.last_outcome.as_deref(), Some("stored 3 readings"));
        assert_eq!(d.last_latency_ms, Some(42));
        assert_eq!(d.consecutive_failures, 0);
        assert!(d.last_attempt.is_some());
    }

    #[test]
    fn failed_attempt_is_failure_event() {
        let mut st = state();
        st.record_attempt("esp32-1", "timeout", None, 2);

        assert_eq!(st.devices["esp32-1"].consecutive_failures, 2);
        assert!(matches!(st.events.back().unwrap().kind, EventKind::Failure));
    }

    #[test]
    fn deactivation_flips_flag_and_records_event() {
        let mut st = state();
        st.set_device_active("esp32-1", false);
        assert!(!st.devices["esp32-1"].active);
        assert!(matches!(
            st.events.back().unwrap().kind,
            EventKind::Deactivated
        ));

        st.set_device_active("esp32-1", true);
        assert!(st.devices["esp32-1"].active);
        assert_eq!(st.devices["esp32-1"].consecutive_failures, 0);
    }

    #[test]
    fn unknown_device_attempt_creates_entry() {
        let mut st = state();
        st.record_attempt("esp32-9", "stored 1 reading", Some(5), 0);
        assert!(st.devices.contains_key("esp32-9"));
    }

    #[test]
    fn event_ring_buffer_is_bounded() {
        let mut st = state();
        for i in 0..(MAX_EVENTS + 50) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        // Oldest events were evicted.
        assert_eq!(st.events.front().unwrap().detail, "event 50");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = state();
        st.record_system("first".into());
        st.record_system("second".into());

        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[1].detail, "first");
    }
}
