//! Device payload parsing and normalization.
//!
//! A field node reports readings as JSON in one of three shapes:
//!
//! ```text
//! {"ts": 1700000000, "readings": [{"type": "moisture", "value": 42.5, "unit": "%"}]}
//! [{"type": "moisture", "value": 42.5}]
//! {"type": "moisture", "value": 42.5}
//! ```
//!
//! Normalization converts every entry to canonical units, range-checks it
//! against the sensor type's plausible physical range, and stamps it with a
//! timestamp (per-entry, else envelope, else server time). A payload mixing
//! valid and invalid entries yields the valid subset plus the rejects —
//! one glitched sensor does not discard the rest of the report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Sensor kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Moisture,
    Temperature,
    Humidity,
    Ph,
}

/// All kinds, in dashboard display order.
pub const ALL_KINDS: [SensorKind; 4] = [
    SensorKind::Moisture,
    SensorKind::Temperature,
    SensorKind::Humidity,
    SensorKind::Ph,
];

impl SensorKind {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "moisture" => Some(Self::Moisture),
            "temperature" | "temp" => Some(Self::Temperature),
            "humidity" => Some(Self::Humidity),
            "ph" => Some(Self::Ph),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moisture => "moisture",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Ph => "ph",
        }
    }

    /// Physically plausible range in canonical units. Values outside are
    /// rejected, not stored.
    pub fn plausible_range(self) -> (f64, f64) {
        match self {
            Self::Moisture => (0.0, 100.0),
            Self::Temperature => (-40.0, 85.0),
            Self::Humidity => (0.0, 100.0),
            Self::Ph => (0.0, 14.0),
        }
    }

    pub fn canonical_unit(self) -> &'static str {
        match self {
            Self::Moisture | Self::Humidity => "%",
            Self::Temperature => "C",
            Self::Ph => "pH",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Canonical reading
// ---------------------------------------------------------------------------

/// A validated reading in canonical units. Immutable once persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub device_id: String,
    pub kind: SensorKind,
    pub value: f64,
    pub unit: &'static str,
    /// Collection time (unix seconds): device-reported, else server-assigned.
    pub ts: i64,
    /// When the hub ingested it (unix seconds).
    pub ingested_at: i64,
}

// ---------------------------------------------------------------------------
// Raw payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: String,
    value: f64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    Envelope {
        #[serde(default)]
        ts: Option<i64>,
        readings: Vec<RawEntry>,
    },
    Many(Vec<RawEntry>),
    One(RawEntry),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The whole payload was unusable. Per-entry problems are `RejectReason`s
/// inside a successful `Normalized` instead.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single entry was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    UnknownKind(String),
    UnknownUnit { kind: SensorKind, unit: String },
    OutOfRange { kind: SensorKind, value: f64 },
    NonFinite { kind: SensorKind },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(s) => write!(f, "unknown sensor type '{s}'"),
            Self::UnknownUnit { kind, unit } => {
                write!(f, "unknown unit '{unit}' for {kind}")
            }
            Self::OutOfRange { kind, value } => {
                let (lo, hi) = kind.plausible_range();
                write!(f, "{kind} value {value} out of range [{lo}, {hi}]")
            }
            Self::NonFinite { kind } => write!(f, "{kind} value is not finite"),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Normalized {
    pub readings: Vec<SensorReading>,
    pub rejected: Vec<RejectReason>,
}

/// Parse and validate a raw device payload. Deterministic for a given
/// (payload, now) pair — no hidden state.
pub fn normalize(
    bytes: &[u8],
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<Normalized, ParseError> {
    let payload: RawPayload = serde_json::from_slice(bytes)?;

    let (envelope_ts, entries) = match payload {
        RawPayload::Envelope { ts, readings } => (ts, readings),
        RawPayload::Many(entries) => (None, entries),
        RawPayload::One(entry) => (None, vec![entry]),
    };

    let server_ts = now.timestamp();
    let mut readings = Vec::with_capacity(entries.len());
    let mut rejected = Vec::new();

    for entry in entries {
        match normalize_entry(&entry) {
            Ok((kind, value)) => readings.push(SensorReading {
                device_id: device_id.to_string(),
                kind,
                value,
                unit: kind.canonical_unit(),
                ts: entry.ts.or(envelope_ts).unwrap_or(server_ts),
                ingested_at: server_ts,
            }),
            Err(reason) => rejected.push(reason),
        }
    }

    Ok(Normalized { readings, rejected })
}

/// Resolve kind, convert to canonical units, and range-check one entry.
fn normalize_entry(entry: &RawEntry) -> Result<(SensorKind, f64), RejectReason> {
    let kind = SensorKind::from_str_opt(&entry.kind)
        .ok_or_else(|| RejectReason::UnknownKind(entry.kind.clone()))?;

    let value = convert_units(kind, entry.value, entry.unit.as_deref())?;

    if !value.is_finite() {
        return Err(RejectReason::NonFinite { kind });
    }
    let (lo, hi) = kind.plausible_range();
    if !(lo..=hi).contains(&value) {
        return Err(RejectReason::OutOfRange { kind, value });
    }

    Ok((kind, value))
}

/// Convert a reported value to canonical units. A missing unit means the
/// device already reports canonically.
fn convert_units(
    kind: SensorKind,
    value: f64,
    unit: Option<&str>,
) -> Result<f64, RejectReason> {
    let Some(unit) = unit else {
        return Ok(value);
    };

    match kind {
        SensorKind::Temperature => match unit {
            "C" | "c" | "°C" | "celsius" => Ok(value),
            "F" | "f" | "°F" | "fahrenheit" => Ok((value - 32.0) * 5.0 / 9.0),
            _ => Err(RejectReason::UnknownUnit {
                kind,
                unit: unit.to_string(),
            }),
        },
        SensorKind::Moisture | SensorKind::Humidity => match unit {
            "%" | "percent" => Ok(value),
            "frac" | "fraction" | "ratio" => Ok(value * 100.0),
            _ => Err(RejectReason::UnknownUnit {
                kind,
                unit: unit.to_string(),
            }),
        },
        SensorKind::Ph => match unit {
            "pH" | "ph" => Ok(value),
            _ => Err(RejectReason::UnknownUnit {
                kind,
                unit: unit.to_string(),
            }),
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_100, 0).unwrap()
    }

    fn norm(json: &str) -> Normalized {
        normalize(json.as_bytes(), "esp32-1", now()).unwrap()
    }

    // -- Happy path ---------------------------------------------------------

    #[test]
    fn single_object_moisture() {
        let n = norm(r#"{"type":"moisture","value":42.5,"unit":"%"}"#);
        assert_eq!(n.readings.len(), 1);
        assert!(n.rejected.is_empty());
        let r = &n.readings[0];
        assert_eq!(r.kind, SensorKind::Moisture);
        assert_eq!(r.value, 42.5);
        assert_eq!(r.unit, "%");
        assert_eq!(r.device_id, "esp32-1");
    }

    #[test]
    fn envelope_with_multiple_readings() {
        let n = norm(
            r#"{"ts":1700000000,"readings":[
                {"type":"moisture","value":40.0},
                {"type":"temperature","value":21.5},
                {"type":"ph","value":6.8}
            ]}"#,
        );
        assert_eq!(n.readings.len(), 3);
        assert!(n.rejected.is_empty());
        // Envelope timestamp applies to entries without their own.
        assert!(n.readings.iter().all(|r| r.ts == 1_700_000_000));
    }

    #[test]
    fn bare_array_form() {
        let n = norm(r#"[{"type":"humidity","value":55.0}]"#);
        assert_eq!(n.readings.len(), 1);
        assert_eq!(n.readings[0].kind, SensorKind::Humidity);
    }

    // -- Timestamps ---------------------------------------------------------

    #[test]
    fn entry_ts_overrides_envelope_ts() {
        let n = norm(
            r#"{"ts":1700000000,"readings":[{"type":"moisture","value":40.0,"ts":1700000050}]}"#,
        );
        assert_eq!(n.readings[0].ts, 1_700_000_050);
    }

    #[test]
    fn missing_ts_falls_back_to_server_time() {
        let n = norm(r#"{"type":"moisture","value":40.0}"#);
        assert_eq!(n.readings[0].ts, now().timestamp());
        assert_eq!(n.readings[0].ingested_at, now().timestamp());
    }

    // -- Unit conversion ----------------------------------------------------

    #[test]
    fn fahrenheit_converted_to_celsius() {
        let n = norm(r#"{"type":"temperature","value":68.0,"unit":"F"}"#);
        assert!((n.readings[0].value - 20.0).abs() < 1e-9);
        assert_eq!(n.readings[0].unit, "C");
    }

    #[test]
    fn moisture_fraction_converted_to_percent() {
        let n = norm(r#"{"type":"moisture","value":0.425,"unit":"frac"}"#);
        assert!((n.readings[0].value - 42.5).abs() < 1e-9);
    }

    #[test]
    fn missing_unit_assumed_canonical() {
        let n = norm(r#"{"type":"temperature","value":21.0}"#);
        assert_eq!(n.readings[0].value, 21.0);
    }

    #[test]
    fn unknown_unit_rejected() {
        let n = norm(r#"{"type":"temperature","value":294.0,"unit":"K"}"#);
        assert!(n.readings.is_empty());
        assert!(matches!(n.rejected[0], RejectReason::UnknownUnit { .. }));
    }

    // -- Range checks -------------------------------------------------------

    #[test]
    fn out_of_range_temperature_rejected() {
        let n = norm(r#"{"type":"temperature","value":999}"#);
        assert!(n.readings.is_empty());
        assert!(matches!(
            n.rejected[0],
            RejectReason::OutOfRange {
                kind: SensorKind::Temperature,
                ..
            }
        ));
    }

    #[test]
    fn range_boundaries_accepted() {
        let n = norm(
            r#"[{"type":"moisture","value":0.0},
                {"type":"moisture","value":100.0},
                {"type":"temperature","value":-40.0},
                {"type":"temperature","value":85.0},
                {"type":"ph","value":14.0}]"#,
        );
        assert_eq!(n.readings.len(), 5);
        assert!(n.rejected.is_empty());
    }

    #[test]
    fn fahrenheit_checked_after_conversion() {
        // 150 °F = 65.6 °C, inside range even though 150 > 85.
        let n = norm(r#"{"type":"temperature","value":150.0,"unit":"F"}"#);
        assert_eq!(n.readings.len(), 1);
    }

    // -- Partial acceptance -------------------------------------------------

    #[test]
    fn one_bad_entry_among_n_accepts_n_minus_one() {
        let n = norm(
            r#"[{"type":"moisture","value":40.0},
                {"type":"temperature","value":999.0},
                {"type":"humidity","value":60.0},
                {"type":"ph","value":7.0}]"#,
        );
        assert_eq!(n.readings.len(), 3);
        assert_eq!(n.rejected.len(), 1);
    }

    #[test]
    fn unknown_sensor_type_dropped_others_kept() {
        let n = norm(
            r#"[{"type":"radiation","value":1.0},{"type":"ph","value":7.0}]"#,
        );
        assert_eq!(n.readings.len(), 1);
        assert!(matches!(n.rejected[0], RejectReason::UnknownKind(_)));
    }

    #[test]
    fn empty_readings_array_is_ok() {
        let n = norm(r#"{"ts":1,"readings":[]}"#);
        assert!(n.readings.is_empty());
        assert!(n.rejected.is_empty());
    }

    // -- Malformed payloads -------------------------------------------------

    #[test]
    fn garbage_json_is_parse_error() {
        assert!(normalize(b"not json", "d", now()).is_err());
    }

    #[test]
    fn wrong_shape_is_parse_error() {
        assert!(normalize(br#"{"foo": 1}"#, "d", now()).is_err());
    }

    // -- Determinism --------------------------------------------------------

    #[test]
    fn same_payload_same_result() {
        let json = r#"[{"type":"moisture","value":40.0},{"type":"ph","value":99.0}]"#;
        let a = norm(json);
        let b = norm(json);
        assert_eq!(a.readings.len(), b.readings.len());
        assert_eq!(a.rejected, b.rejected);
        assert_eq!(a.readings[0].value, b.readings[0].value);
        assert_eq!(a.readings[0].ts, b.readings[0].ts);
    }

    // -- SensorKind ---------------------------------------------------------

    #[test]
    fn kind_parsing_and_aliases() {
        assert_eq!(SensorKind::from_str_opt("moisture"), Some(SensorKind::Moisture));
        assert_eq!(SensorKind::from_str_opt("TEMP"), Some(SensorKind::Temperature));
        assert_eq!(SensorKind::from_str_opt("pH"), Some(SensorKind::Ph));
        assert_eq!(SensorKind::from_str_opt("co2"), None);
    }

    #[test]
    fn kind_round_trips_through_as_str() {
        for kind in ALL_KINDS {
            assert_eq!(SensorKind::from_str_opt(kind.as_str()), Some(kind));
        }
    }
}
