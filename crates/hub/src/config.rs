//! TOML config file loading, validation, and database seeding for the device
//! registry and crop threshold profiles.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::db::{Db, DeviceSeed};
use crate::reading::SensorKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub crops: Vec<CropEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Base polling interval for devices without an override.
    pub default_interval_sec: i64,
    /// Per-call device timeout. Must be shorter than the base interval so a
    /// hung device cannot eat the next tick.
    pub timeout_ms: u64,
    /// Cap on the exponential backoff between retries.
    pub max_backoff_sec: i64,
    /// Consecutive failures before a device is deactivated.
    pub failure_threshold: u32,
    /// Upper bound on concurrent in-flight polls across the fleet.
    pub max_in_flight: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            default_interval_sec: 60,
            timeout_ms: 5_000,
            max_backoff_sec: 900,
            failure_threshold: 5,
            max_in_flight: 8,
        }
    }
}

impl PollerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_sec.max(1) as u64)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_sec.max(1) as u64)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiSettings {
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Per-crop plausible bands. A device linked to a crop is flagged on the
/// dashboard when its latest reading leaves the band.
#[derive(Debug, Clone, Deserialize)]
pub struct CropEntry {
    pub name: String,
    pub moisture_min: Option<f64>,
    pub moisture_max: Option<f64>,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub humidity_min: Option<f64>,
    pub humidity_max: Option<f64>,
    pub ph_min: Option<f64>,
    pub ph_max: Option<f64>,
}

impl CropEntry {
    pub fn bounds(&self, kind: SensorKind) -> (Option<f64>, Option<f64>) {
        match kind {
            SensorKind::Moisture => (self.moisture_min, self.moisture_max),
            SensorKind::Temperature => (self.temperature_min, self.temperature_max),
            SensorKind::Humidity => (self.humidity_min, self.humidity_max),
            SensorKind::Ph => (self.ph_min, self.ph_max),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub url: String,
    pub poll_interval_sec: Option<i64>,
    pub crop: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_poller(&mut errors);
        self.validate_api(&mut errors);
        self.validate_crops(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_poller(&self, errors: &mut Vec<String>) {
        let p = &self.poller;
        if p.default_interval_sec <= 0 {
            errors.push(format!(
                "poller: default_interval_sec must be positive, got {}",
                p.default_interval_sec
            ));
        }
        if p.timeout_ms == 0 {
            errors.push("poller: timeout_ms must be positive".into());
        }
        if p.default_interval_sec > 0 && p.timeout_ms >= p.default_interval_sec as u64 * 1000 {
            errors.push(format!(
                "poller: timeout_ms ({}) must be shorter than default_interval_sec ({})",
                p.timeout_ms, p.default_interval_sec
            ));
        }
        if p.max_backoff_sec < p.default_interval_sec {
            errors.push(format!(
                "poller: max_backoff_sec ({}) must be at least default_interval_sec ({})",
                p.max_backoff_sec, p.default_interval_sec
            ));
        }
        if p.failure_threshold == 0 {
            errors.push("poller: failure_threshold must be positive".into());
        }
        if p.max_in_flight == 0 {
            errors.push("poller: max_in_flight must be positive".into());
        }
    }

    fn validate_api(&self, errors: &mut Vec<String>) {
        if self.api.tokens.is_empty() {
            errors.push("api: no tokens configured — every endpoint would reject".into());
        }
        for (i, t) in self.api.tokens.iter().enumerate() {
            if t.trim().is_empty() {
                errors.push(format!("api: tokens[{i}] is empty"));
            }
        }
    }

    fn validate_crops(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, c) in self.crops.iter().enumerate() {
            let ctx = || {
                if c.name.is_empty() {
                    format!("crops[{i}]")
                } else {
                    format!("crop '{}'", c.name)
                }
            };

            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(&c.name) {
                errors.push(format!("{}: duplicate crop name", ctx()));
            }

            for kind in crate::reading::ALL_KINDS {
                if let (Some(lo), Some(hi)) = c.bounds(kind) {
                    if lo >= hi {
                        errors.push(format!(
                            "{}: {kind} bounds [{lo}, {hi}] are inverted or empty",
                            ctx()
                        ));
                    }
                }
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let crop_names: HashSet<&str> = self.crops.iter().map(|c| c.name.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Address ─────────────────────────────────────────
            if !(d.url.starts_with("http://") || d.url.starts_with("https://")) {
                errors.push(format!("{}: url '{}' is not http(s)", ctx(), d.url));
            }

            // ── Polling override ────────────────────────────────
            if let Some(interval) = d.poll_interval_sec {
                if interval <= 0 {
                    errors.push(format!(
                        "{}: poll_interval_sec must be positive, got {interval}",
                        ctx()
                    ));
                } else if self.poller.timeout_ms >= interval as u64 * 1000 {
                    errors.push(format!(
                        "{}: poll_interval_sec ({interval}) is not longer than poller timeout_ms ({})",
                        ctx(),
                        self.poller.timeout_ms
                    ));
                }
            }

            // ── Crop reference ──────────────────────────────────
            if let Some(crop) = &d.crop {
                if !crop_names.contains(crop.as_str()) {
                    errors.push(format!(
                        "{}: crop '{crop}' does not match any defined crop",
                        ctx()
                    ));
                }
            }
        }
    }

    /// Crop profiles keyed by name, for dashboard threshold checks.
    pub fn crop_map(&self) -> HashMap<String, CropEntry> {
        self.crops
            .iter()
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all configured devices into the registry. Runtime state
/// (active flag, failure streak, last contact) is left untouched.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for d in &config.devices {
        db.upsert_device(&DeviceSeed {
            device_id: d.device_id.clone(),
            name: d.name.clone(),
            url: d.url.clone(),
            poll_interval_sec: d.poll_interval_sec,
            crop: d.crop.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    tracing::info!(
        devices = config.devices.len(),
        crops = config.crops.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
