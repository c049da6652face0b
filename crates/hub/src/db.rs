//! Sqlite-backed telemetry store.
//!
//! Readings are append-only and keyed by (device, sensor type, timestamp);
//! duplicate ingestion after a retried poll is a no-op. The pool is shared
//! between the poller (writer) and the web layer (readers), so every write
//! commits a whole record before it becomes visible.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::reading::{SensorKind, SensorReading, ALL_KINDS};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A registered device plus the poller-owned contact bookkeeping.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_id: String,
    pub name: String,
    pub url: String,
    pub poll_interval_sec: Option<i64>,
    pub crop: Option<String>,
    pub active: bool,
    pub last_contact_ts: Option<i64>,
    pub consecutive_failures: i64,
}

/// Config-owned identity of a device; runtime columns are preserved on
/// re-seed.
#[derive(Debug, Clone)]
pub struct DeviceSeed {
    pub device_id: String,
    pub name: String,
    pub url: String,
    pub poll_interval_sec: Option<i64>,
    pub crop: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredReading {
    pub device_id: String,
    pub sensor_type: String,
    pub ts: i64,
    pub value: f64,
    pub unit: String,
    pub ingested_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:soil.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device registry
    // ----------------------------

    pub async fn upsert_device(&self, d: &DeviceSeed) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, url, poll_interval_sec, crop)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              name=excluded.name,
              url=excluded.url,
              poll_interval_sec=excluded.poll_interval_sec,
              crop=excluded.crop
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.name)
        .bind(&d.url)
        .bind(d.poll_interval_sec)
        .bind(&d.crop)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<DeviceRow>> {
        sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, name, url, poll_interval_sec, crop,
                   active, last_contact_ts, consecutive_failures
            FROM devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRow>> {
        sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, name, url, poll_interval_sec, crop,
                   active, last_contact_ts, consecutive_failures
            FROM devices
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")
    }

    /// Successful contact: stamp the time and clear the failure streak.
    pub async fn record_success(&self, device_id: &str, ts: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE devices
            SET last_contact_ts = ?, consecutive_failures = 0
            WHERE device_id = ?
            "#,
        )
        .bind(ts)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("record_success failed")?;
        Ok(())
    }

    /// Failed attempt: bump the streak and return the new count.
    pub async fn record_failure(&self, device_id: &str) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            UPDATE devices
            SET consecutive_failures = consecutive_failures + 1
            WHERE device_id = ?
            RETURNING consecutive_failures
            "#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await
        .context("record_failure failed")
    }

    /// Activate or deactivate a device. Activation clears the failure streak
    /// so the poller restarts from the base interval.
    pub async fn set_active(&self, device_id: &str, active: bool) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE devices
            SET active = ?,
                consecutive_failures = CASE WHEN ? THEN 0 ELSE consecutive_failures END
            WHERE device_id = ?
            "#,
        )
        .bind(active)
        .bind(active)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("set_active failed")?
        .rows_affected();
        Ok(rows > 0)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    /// Append readings. Returns how many were actually inserted; duplicates
    /// of an existing (device, sensor type, ts) key are skipped silently.
    pub async fn insert_readings(&self, readings: &[SensorReading]) -> Result<u64> {
        let mut inserted = 0;
        for r in readings {
            let rows = sqlx::query(
                r#"
                INSERT INTO readings (device_id, sensor_type, ts, value, unit, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(device_id, sensor_type, ts) DO NOTHING
                "#,
            )
            .bind(&r.device_id)
            .bind(r.kind.as_str())
            .bind(r.ts)
            .bind(r.value)
            .bind(r.unit)
            .bind(r.ingested_at)
            .execute(&self.pool)
            .await
            .context("insert_readings failed")?
            .rows_affected();
            inserted += rows;
        }
        Ok(inserted)
    }

    pub async fn latest(
        &self,
        device_id: &str,
        kind: SensorKind,
    ) -> Result<Option<StoredReading>> {
        sqlx::query_as::<_, StoredReading>(
            r#"
            SELECT device_id, sensor_type, ts, value, unit, ingested_at
            FROM readings
            WHERE device_id = ? AND sensor_type = ?
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("latest failed")
    }

    /// Chronological slice of readings with `from <= ts <= to`.
    pub async fn range(
        &self,
        device_id: &str,
        kind: SensorKind,
        from: i64,
        to: i64,
        limit: i64,
    ) -> Result<Vec<StoredReading>> {
        sqlx::query_as::<_, StoredReading>(
            r#"
            SELECT device_id, sensor_type, ts, value, unit, ingested_at
            FROM readings
            WHERE device_id = ? AND sensor_type = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("range failed")
    }

    /// Min/max/average over a window; `None` when the window is empty.
    pub async fn window_stats(
        &self,
        device_id: &str,
        kind: SensorKind,
        from: i64,
        to: i64,
    ) -> Result<Option<WindowStats>> {
        let row: (Option<f64>, Option<f64>, Option<f64>, i64) = sqlx::query_as(
            r#"
            SELECT MIN(value), MAX(value), AVG(value), COUNT(*)
            FROM readings
            WHERE device_id = ? AND sensor_type = ? AND ts >= ? AND ts <= ?
            "#,
        )
        .bind(device_id)
        .bind(kind.as_str())
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("window_stats failed")?;

        Ok(match row {
            (Some(min), Some(max), Some(avg), count) if count > 0 => Some(WindowStats {
                min,
                max,
                avg,
                count,
            }),
            _ => None,
        })
    }

    /// Latest reading for every sensor type a device has reported.
    pub async fn latest_per_kind(&self, device_id: &str) -> Result<Vec<StoredReading>> {
        let mut out = Vec::new();
        for kind in ALL_KINDS {
            if let Some(r) = self.latest(device_id, kind).await? {
                out.push(r);
            }
        }
        Ok(out)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn seed() -> DeviceSeed {
        DeviceSeed {
            device_id: "esp32-1".into(),
            name: "Field 1".into(),
            url: "http://10.0.0.21/api/readings".into(),
            poll_interval_sec: Some(30),
            crop: Some("tomato".into()),
        }
    }

    fn reading(kind: SensorKind, value: f64, ts: i64) -> SensorReading {
        SensorReading {
            device_id: "esp32-1".into(),
            kind,
            value,
            unit: kind.canonical_unit(),
            ts,
            ingested_at: ts + 1,
        }
    }

    // -- Device registry ----------------------------------------------------

    #[tokio::test]
    async fn upsert_and_load_devices() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();

        let devices = db.load_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "esp32-1");
        assert!(devices[0].active);
        assert_eq!(devices[0].consecutive_failures, 0);
        assert_eq!(devices[0].last_contact_ts, None);
    }

    #[tokio::test]
    async fn reseed_preserves_runtime_columns() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.record_failure("esp32-1").await.unwrap();
        db.set_active("esp32-1", false).await.unwrap();

        // Config re-applied with a new URL must not resurrect the device.
        let mut s = seed();
        s.url = "http://10.0.0.99/api/readings".into();
        db.upsert_device(&s).await.unwrap();

        let d = db.get_device("esp32-1").await.unwrap().unwrap();
        assert_eq!(d.url, "http://10.0.0.99/api/readings");
        assert!(!d.active);
        assert_eq!(d.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn failure_streak_and_success_reset() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();

        assert_eq!(db.record_failure("esp32-1").await.unwrap(), 1);
        assert_eq!(db.record_failure("esp32-1").await.unwrap(), 2);
        assert_eq!(db.record_failure("esp32-1").await.unwrap(), 3);

        db.record_success("esp32-1", 1_700_000_000).await.unwrap();
        let d = db.get_device("esp32-1").await.unwrap().unwrap();
        assert_eq!(d.consecutive_failures, 0);
        assert_eq!(d.last_contact_ts, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn activation_clears_failure_streak() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.record_failure("esp32-1").await.unwrap();
        db.set_active("esp32-1", false).await.unwrap();

        assert!(db.set_active("esp32-1", true).await.unwrap());
        let d = db.get_device("esp32-1").await.unwrap().unwrap();
        assert!(d.active);
        assert_eq!(d.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn set_active_unknown_device_is_false() {
        let db = test_db().await;
        assert!(!db.set_active("ghost", true).await.unwrap());
    }

    // -- Readings: write + latest -------------------------------------------

    #[tokio::test]
    async fn insert_then_latest() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();

        let n = db
            .insert_readings(&[reading(SensorKind::Moisture, 42.5, 1_700_000_000)])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let latest = db
            .latest("esp32-1", SensorKind::Moisture)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.value, 42.5);
        assert_eq!(latest.sensor_type, "moisture");
        assert_eq!(latest.unit, "%");
    }

    #[tokio::test]
    async fn duplicate_insert_is_noop() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();

        let r = reading(SensorKind::Moisture, 42.5, 1_700_000_000);
        assert_eq!(db.insert_readings(&[r.clone()]).await.unwrap(), 1);
        assert_eq!(db.insert_readings(&[r]).await.unwrap(), 0);

        let rows = db
            .range("esp32-1", SensorKind::Moisture, 0, i64::MAX, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn latest_picks_newest_timestamp() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.insert_readings(&[
            reading(SensorKind::Temperature, 20.0, 100),
            reading(SensorKind::Temperature, 22.0, 300),
            reading(SensorKind::Temperature, 21.0, 200),
        ])
        .await
        .unwrap();

        let latest = db
            .latest("esp32-1", SensorKind::Temperature)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.ts, 300);
        assert_eq!(latest.value, 22.0);
    }

    #[tokio::test]
    async fn latest_none_for_unknown_sensor() {
        let db = test_db().await;
        assert!(db
            .latest("esp32-1", SensorKind::Ph)
            .await
            .unwrap()
            .is_none());
    }

    // -- Readings: range + stats --------------------------------------------

    #[tokio::test]
    async fn range_is_chronological_and_bounded() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.insert_readings(&[
            reading(SensorKind::Moisture, 10.0, 100),
            reading(SensorKind::Moisture, 30.0, 300),
            reading(SensorKind::Moisture, 20.0, 200),
            reading(SensorKind::Moisture, 40.0, 400),
        ])
        .await
        .unwrap();

        let rows = db
            .range("esp32-1", SensorKind::Moisture, 150, 350, 100)
            .await
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.ts).collect();
        assert_eq!(ts, vec![200, 300]);
    }

    #[tokio::test]
    async fn range_respects_limit() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        let rows: Vec<_> = (0..10)
            .map(|i| reading(SensorKind::Moisture, i as f64, i))
            .collect();
        db.insert_readings(&rows).await.unwrap();

        let got = db
            .range("esp32-1", SensorKind::Moisture, 0, i64::MAX, 3)
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
    }

    #[tokio::test]
    async fn window_stats_min_max_avg() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.insert_readings(&[
            reading(SensorKind::Temperature, 10.0, 100),
            reading(SensorKind::Temperature, 20.0, 200),
            reading(SensorKind::Temperature, 30.0, 300),
        ])
        .await
        .unwrap();

        let stats = db
            .window_stats("esp32-1", SensorKind::Temperature, 0, 1000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
        assert!((stats.avg - 20.0).abs() < 1e-9);
        assert_eq!(stats.count, 3);
    }

    #[tokio::test]
    async fn window_stats_empty_window_is_none() {
        let db = test_db().await;
        assert!(db
            .window_stats("esp32-1", SensorKind::Moisture, 0, 1000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn latest_per_kind_collects_each_sensor() {
        let db = test_db().await;
        db.upsert_device(&seed()).await.unwrap();
        db.insert_readings(&[
            reading(SensorKind::Moisture, 40.0, 100),
            reading(SensorKind::Temperature, 21.0, 100),
        ])
        .await
        .unwrap();

        let latest = db.latest_per_kind("esp32-1").await.unwrap();
        assert_eq!(latest.len(), 2);
        let kinds: Vec<&str> = latest.iter().map(|r| r.sensor_type.as_str()).collect();
        assert!(kinds.contains(&"moisture"));
        assert!(kinds.contains(&"temperature"));
    }
}
