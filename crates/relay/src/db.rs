use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::envelope::now_ms;
use crate::telemetry::TelemetrySample;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:ag360.db?mode=rwc"
    /// - "sqlite:file:testdb?mode=memory&cache=shared" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

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
    // Telemetry samples (append-only)
    // ----------------------------

    pub async fn insert_sample(&self, s: &TelemetrySample) -> Result<()> {
        let raw = serde_json::to_string(&s.raw).unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO telemetry
              (device_id, temperature, humidity, soil_pct, ldr_pct, relay1, relay2, raw, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.device_id)
        .bind(s.temperature)
        .bind(s.humidity)
        .bind(s.soil_pct)
        .bind(s.ldr_pct)
        .bind(s.relay1)
        .bind(s.relay2)
        .bind(raw)
        .bind(s.created_at)
        .execute(&self.pool)
        .await
        .context("insert_sample failed")?;
        Ok(())
    }

    pub async fn sample_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM telemetry")
            .fetch_one(&self.pool)
            .await
            .context("sample_count failed")?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn latest_sample_for(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, temperature, humidity, soil_pct, ldr_pct,
                   relay1, relay2, raw, created_at
            FROM telemetry
            WHERE device_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_sample_for failed")?;

        Ok(row.map(|r| TelemetrySample {
            device_id: r.get("device_id"),
            temperature: r.get("temperature"),
            humidity: r.get("humidity"),
            soil_pct: r.get("soil_pct"),
            ldr_pct: r.get("ldr_pct"),
            relay1: r.get("relay1"),
            relay2: r.get("relay2"),
            raw: serde_json::from_str(r.get::<String, _>("raw").as_str())
                .unwrap_or(serde_json::Value::Null),
            created_at: r.get("created_at"),
        }))
    }

    // ----------------------------
    // Retention
    // ----------------------------

    /// Delete samples created before `cutoff_ms`. Returns rows removed.
    pub async fn purge_expired(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM telemetry WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .context("purge_expired failed")?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Fire-and-forget sink
// ---------------------------------------------------------------------------

/// Detached write: the ingestion path never awaits storage. A failed
/// write is logged and the sample dropped; a storage outage must not
/// stall telemetry handling.
pub fn spawn_save(db: &Db, sample: TelemetrySample) {
    let db = db.clone();
    tokio::spawn(async move {
        if let Err(e) = db.insert_sample(&sample).await {
            warn!(device_id = %sample.device_id, "telemetry save failed: {e}");
        }
    });
}

/// Periodic sweep removing samples older than the retention window.
pub fn start_retention_sweep(
    db: Db,
    window: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let cutoff = now_ms() - window.as_millis() as i64;
            match db.purge_expired(cutoff).await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "retention sweep"),
                Err(e) => warn!("retention sweep failed: {e}"),
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
