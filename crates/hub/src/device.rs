//! HTTP client for ESP32 field devices.
//!
//! Blocking `ureq` call wrapped in `spawn_blocking`, with an outer tokio
//! deadline so a stuck device can never hold up the poll loop. Every failure
//! comes back as a typed result — nothing panics past this boundary.

use std::io::Read;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on a device response body. Field nodes report a handful of
/// readings; anything bigger is a misbehaving endpoint.
const MAX_BODY_BYTES: u64 = 256 * 1024;

/// Grace added to the outer deadline so ureq's own read timeout fires first
/// and gets classified, rather than racing the tokio timer.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("device returned http {0}")]
    Http(u16),
}

#[derive(Debug)]
pub struct RawPayload {
    pub bytes: Vec<u8>,
    pub latency: Duration,
}

#[derive(Clone)]
pub struct DeviceClient {
    agent: ureq::Agent,
    timeout: Duration,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

impl DeviceClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self { agent, timeout }
    }

    /// GET the readings payload from `url`.
    pub async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let started = Instant::now();

        let call = tokio::task::spawn_blocking(move || fetch_blocking(&agent, &url));

        match tokio::time::timeout(self.timeout + DEADLINE_GRACE, call).await {
            Err(_) => Err(FetchError::Timeout),
            Ok(Err(join)) => Err(FetchError::Unreachable(format!("poll task failed: {join}"))),
            Ok(Ok(result)) => result.map(|bytes| RawPayload {
                bytes,
                latency: started.elapsed(),
            }),
        }
    }
}

fn fetch_blocking(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, FetchError> {
    match agent.get(url).set("Accept", "application/json").call() {
        Ok(resp) => {
            let mut bytes = Vec::new();
            resp.into_reader()
                .take(MAX_BODY_BYTES)
                .read_to_end(&mut bytes)
                .map_err(classify_io)?;
            Ok(bytes)
        }
        Err(ureq::Error::Status(status, _)) => Err(FetchError::Http(status)),
        Err(ureq::Error::Transport(t)) => Err(classify_transport(t)),
    }
}

fn classify_transport(t: ureq::Transport) -> FetchError {
    match t.kind() {
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
            FetchError::Unreachable(t.to_string())
        }
        ureq::ErrorKind::Io => {
            let msg = t.to_string();
            if msg.contains("timed out") || msg.contains("TimedOut") {
                FetchError::Timeout
            } else {
                FetchError::Unreachable(msg)
            }
        }
        _ => FetchError::Unreachable(t.to_string()),
    }
}

fn classify_io(e: std::io::Error) -> FetchError {
    if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
        FetchError::Timeout
    } else {
        FetchError::Unreachable(e.to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
