use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::warn;

use crate::history::HistoryAction;
use crate::model::{DayHistory, Device, Location, Sensor, SensorType, Session};
use crate::store::{Store, UnitOfWork};

const OWNER_KEY: &str = "owner_id";
const BASELINE_SYNC_KEY: &str = "last_baseline_sync";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    serial_number: String,
    name: String,
    location_id: String,
}

#[derive(FromRow)]
struct SensorRow {
    id: String,
    device_id: String,
    sensor_type_id: i64,
    enabled: bool,
}

#[derive(FromRow)]
struct SensorTypeRow {
    id: i64,
    parameter_id: i64,
    name: String,
}

#[derive(FromRow)]
struct HistoryRow {
    sensor_id: String,
    location_id: String,
    day_boundary: i64,
    raw_data: Vec<u8>,
}

fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_micros(us)
        .single()
        .with_context(|| format!("timestamp {us}µs out of range"))
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/telemetry-hub/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so an
        // in-memory pool must stay on one connection that never recycles.
        let in_memory = db_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
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
    // Reference data
    // ----------------------------

    pub async fn upsert_sensor_type(&self, t: &SensorType) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_types (id, parameter_id, name)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              parameter_id=excluded.parameter_id,
              name=excluded.name
            "#,
        )
        .bind(t.id)
        .bind(t.parameter_id)
        .bind(t.name.as_str())
        .execute(&self.pool)
        .await
        .context("upsert_sensor_type failed")?;
        Ok(())
    }

    // ----------------------------
    // Session settings
    // ----------------------------

    async fn setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read setting '{key}' failed"))?;
        Ok(value.map(|(v,)| v))
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("write setting '{key}' failed"))?;
        Ok(())
    }

    pub async fn set_owner(&self, owner_id: &str) -> Result<()> {
        self.put_setting(OWNER_KEY, owner_id).await
    }

    /// Called by the remote-sync collaborator once a full download from the
    /// remote store has succeeded.
    pub async fn record_baseline_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.put_setting(BASELINE_SYNC_KEY, &at.to_rfc3339()).await
    }
}

async fn insert_history(conn: &mut SqliteConnection, h: &DayHistory, now: i64) -> Result<()> {
    // A retried insert whose first attempt did land must not wedge every
    // later commit on the primary key.
    sqlx::query(
        r#"
        INSERT INTO sensor_histories (sensor_id, location_id, day_boundary, raw_data, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(sensor_id, day_boundary) DO UPDATE SET
          raw_data=excluded.raw_data,
          updated_at=excluded.updated_at
        "#,
    )
    .bind(h.sensor_id.as_str())
    .bind(h.location_id.as_str())
    .bind(h.day_boundary.timestamp_micros())
    .bind(h.raw_data())
    .bind(now)
    .execute(conn)
    .await
    .with_context(|| format!("insert history failed sensor={}", h.sensor_id))?;
    Ok(())
}

async fn update_history_data(conn: &mut SqliteConnection, h: &DayHistory, now: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        UPDATE sensor_histories
        SET raw_data = ?, updated_at = ?
        WHERE sensor_id = ? AND day_boundary = ?
        "#,
    )
    .bind(h.raw_data())
    .bind(now)
    .bind(h.sensor_id.as_str())
    .bind(h.day_boundary.timestamp_micros())
    .execute(conn)
    .await
    .with_context(|| format!("update history failed sensor={}", h.sensor_id))?;
    Ok(res.rows_affected())
}

#[async_trait]
impl Store for Db {
    async fn load_devices_with_sensors(&self) -> Result<Vec<Device>> {
        let devices: Vec<DeviceRow> = sqlx::query_as(
            "SELECT id, serial_number, name, location_id FROM devices ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load devices failed")?;

        let sensors: Vec<SensorRow> = sqlx::query_as(
            "SELECT id, device_id, sensor_type_id, enabled FROM sensors ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load sensors failed")?;

        let mut by_device: HashMap<String, Vec<Sensor>> = HashMap::new();
        for s in sensors {
            by_device.entry(s.device_id.clone()).or_default().push(Sensor {
                id: s.id,
                device_id: s.device_id,
                sensor_type_id: s.sensor_type_id,
                enabled: s.enabled,
            });
        }

        Ok(devices
            .into_iter()
            .map(|d| Device {
                sensors: by_device.remove(&d.id).unwrap_or_default(),
                id: d.id,
                serial_number: d.serial_number,
                name: d.name,
                location_id: d.location_id,
            })
            .collect())
    }

    async fn load_todays_histories(&self, now: DateTime<Utc>) -> Result<Vec<DayHistory>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT sensor_id, location_id, day_boundary, raw_data
            FROM sensor_histories
            WHERE day_boundary > ?
            ORDER BY sensor_id, day_boundary
            "#,
        )
        .bind(now.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .context("load histories failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let boundary = from_micros(r.day_boundary)?;
            match DayHistory::from_raw(r.sensor_id.clone(), r.location_id, boundary, r.raw_data) {
                Ok(h) => out.push(h),
                Err(e) => warn!(sensor = %r.sensor_id, %boundary, "skipping unreadable history: {e}"),
            }
        }
        Ok(out)
    }

    async fn load_sensor_types(&self) -> Result<Vec<SensorType>> {
        let rows: Vec<SensorTypeRow> =
            sqlx::query_as("SELECT id, parameter_id, name FROM sensor_types ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .context("load sensor types failed")?;

        Ok(rows
            .into_iter()
            .map(|r| SensorType {
                id: r.id,
                parameter_id: r.parameter_id,
                name: r.name,
            })
            .collect())
    }

    async fn load_session(&self) -> Result<Session> {
        let owner_id = self.setting(OWNER_KEY).await?;
        let last_baseline_sync = match self.setting(BASELINE_SYNC_KEY).await? {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("bad {BASELINE_SYNC_KEY} value: {raw}"))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Session {
            owner_id,
            last_baseline_sync,
        })
    }

    async fn add_device(&self, device: &Device, location: &Location) -> Result<()> {
        let now = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await.context("add_device: begin failed")?;

        sqlx::query("INSERT INTO locations (id, name, owner_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(location.id.as_str())
            .bind(location.name.as_str())
            .bind(location.owner_id.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("add_device: insert location failed")?;

        sqlx::query(
            "INSERT INTO devices (id, serial_number, name, location_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(device.id.as_str())
        .bind(device.serial_number.as_str())
        .bind(device.name.as_str())
        .bind(device.location_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("add_device: insert device failed serial={}", device.serial_number))?;

        for s in &device.sensors {
            sqlx::query(
                "INSERT INTO sensors (id, device_id, sensor_type_id, enabled, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(s.id.as_str())
            .bind(s.device_id.as_str())
            .bind(s.sensor_type_id)
            .bind(s.enabled)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("add_device: insert sensor failed type={}", s.sensor_type_id))?;
        }

        tx.commit().await.context("add_device: commit failed")?;
        Ok(())
    }

    async fn commit(&self, work: UnitOfWork) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await.context("commit: begin failed")?;

        for (action, h) in work.into_entries() {
            match action {
                HistoryAction::Insert => insert_history(&mut tx, &h, now).await?,
                HistoryAction::UpdateDataOnly => {
                    if update_history_data(&mut tx, &h, now).await? == 0 {
                        warn!(
                            sensor = %h.sensor_id,
                            boundary = %h.day_boundary,
                            "history row missing on update; re-inserting"
                        );
                        insert_history(&mut tx, &h, now).await?;
                    }
                }
            }
        }

        tx.commit().await.context("commit: transaction commit failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
