//! Stateful field-condition simulator for local development.
//!
//! Models a plot of soil the way a real ESP32 node would report it:
//! - Temporal coherence via random walk with mean reversion per channel
//! - Diurnal (day/night) temperature swing
//! - Per-reading electronic noise
//! - Occasional implausible glitch readings (sensor flakiness) so the hub's
//!   range filter has something to chew on

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Everything hovers in the comfortable band. Low noise, rare glitches.
    /// Good for exercising the dashboard without tripping alerts.
    Steady,
    /// Moisture drifts steadily down, temperature runs hot. Drives the
    /// dashboard's threshold alerts within a few minutes.
    Drought,
    /// High noise and ~10% glitch rate. Exercises the hub's plausibility
    /// filter and partial-acceptance path.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "drought" => Self::Drought,
            "flaky" => Self::Flaky,
            _ => Self::Steady, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Drought => write!(f, "drought"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// One physical quantity evolving over time.
struct Channel {
    /// Current "true" value. Evolves each tick.
    value: f64,
    /// Value the channel reverts toward.
    center: f64,
    /// Constant drift per tick (drought pulls moisture down, etc.).
    drift: f64,
    /// Random walk step sigma.
    walk_sigma: f64,
    /// Per-reading measurement noise sigma.
    noise_sigma: f64,
    /// Mean-reversion strength toward `center`.
    reversion: f64,
    /// Physical clamp for the true value.
    min: f64,
    max: f64,
}

impl Channel {
    fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + self.drift + pull + walk).clamp(self.min, self.max);
        self.value + gaussian(0.0, self.noise_sigma)
    }
}

// ---------------------------------------------------------------------------
// A reported reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct SimReading {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: f64,
    pub unit: &'static str,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Stateful simulator producing one full sensor report per tick.
pub struct FieldSim {
    moisture: Channel,
    temperature: Channel,
    humidity: Channel,
    ph: Channel,

    /// Probability that one reading in a report is replaced by a glitch
    /// value far outside its physical range.
    glitch_prob: f32,

    /// Day/night temperature swing.
    diurnal_amplitude: f64,
    diurnal_period_s: f64,
}

impl FieldSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (moist_drift, walk, noise, glitch_prob, temp_center) = match scenario {
            Scenario::Steady => (0.0, 0.4, 0.3, 0.01_f32, 22.0),
            Scenario::Drought => (-0.15, 0.5, 0.3, 0.02, 31.0),
            Scenario::Flaky => (0.0, 1.5, 1.2, 0.10, 22.0),
        };

        let start_moisture = match scenario {
            Scenario::Drought => 38.0,
            _ => 55.0,
        };

        Self {
            moisture: Channel {
                value: start_moisture + gaussian(0.0, 3.0),
                center: start_moisture,
                drift: moist_drift,
                walk_sigma: walk,
                noise_sigma: noise,
                reversion: 0.02,
                min: 0.0,
                max: 100.0,
            },
            temperature: Channel {
                value: temp_center + gaussian(0.0, 1.0),
                center: temp_center,
                drift: 0.0,
                walk_sigma: walk * 0.3,
                noise_sigma: noise * 0.4,
                reversion: 0.05,
                min: -10.0,
                max: 55.0,
            },
            humidity: Channel {
                value: 60.0 + gaussian(0.0, 4.0),
                center: 60.0,
                drift: 0.0,
                walk_sigma: walk,
                noise_sigma: noise,
                reversion: 0.03,
                min: 0.0,
                max: 100.0,
            },
            ph: Channel {
                value: 6.5 + gaussian(0.0, 0.2),
                center: 6.5,
                drift: 0.0,
                walk_sigma: walk * 0.05,
                noise_sigma: noise * 0.05,
                reversion: 0.05,
                min: 3.0,
                max: 10.0,
            },
            glitch_prob,
            diurnal_amplitude: 4.0,
            diurnal_period_s,
        }
    }

    /// Produce the next full report. Internal state evolves with each call.
    pub fn sample(&mut self) -> Vec<SimReading> {
        // Diurnal offset on temperature only, peaks at "afternoon".
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = self.diurnal_amplitude * phase.sin();

        let mut readings = vec![
            SimReading {
                kind: "moisture",
                value: round1(self.moisture.step()),
                unit: "%",
            },
            SimReading {
                kind: "temperature",
                value: round1(self.temperature.step() + diurnal),
                unit: "C",
            },
            SimReading {
                kind: "humidity",
                value: round1(self.humidity.step()),
                unit: "%",
            },
            SimReading {
                kind: "ph",
                value: round1(self.ph.step()),
                unit: "pH",
            },
        ];

        // Sensor flakiness: one reading in the report goes wild.
        if fastrand::f32() < self.glitch_prob {
            let i = fastrand::usize(..readings.len());
            readings[i].value = glitch_value();
        }

        readings
    }
}

/// A value no physical sensor would produce, far outside every channel's
/// plausible range.
fn glitch_value() -> f64 {
    if fastrand::bool() {
        999.0
    } else {
        -127.0
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
