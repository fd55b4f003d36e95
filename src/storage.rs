//! Durable SQLite outbox.
//!
//! Events that could not be delivered immediately are persisted here and
//! retried by the sender. The schema:
//!
//! - `id`: monotonic row id, also the retry order
//! - `receipt_id`: unique; re-enqueueing the same logical event is a no-op
//! - `payload_json`: the full envelope
//! - `attempts`, `last_error`: delivery history
//! - `created_at`, `next_attempt_at`: epoch seconds; `0` means due now
//!
//! The pool holds a single connection, so every statement runs serialized
//! and read-modify-write sequences never interleave.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::envelope::Envelope;

/// Stored error text is truncated to this many characters.
pub const MAX_ERROR_CHARS: usize = 1000;

/// One pending outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub receipt_id: String,
    pub payload_json: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: f64,
    pub next_attempt_at: f64,
}

impl OutboxRecord {
    pub fn envelope(&self) -> serde_json::Result<Envelope> {
        serde_json::from_str(&self.payload_json)
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Outbox {
    pool: SqlitePool,
}

fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Outbox {
    /// Open (creating if needed) the outbox and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:edge_outbox.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;

        let outbox = Self { pool };
        outbox.initialize_schema().await?;

        Ok(outbox)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                receipt_id TEXT UNIQUE,
                payload_json TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at REAL NOT NULL,
                next_attempt_at REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_next_attempt
            ON outbox(next_attempt_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist an envelope. Returns `false` when a record with the same
    /// receipt id already exists.
    pub async fn enqueue(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        let receipt_id = envelope.receipt();
        let mut stored = envelope.clone();
        stored.receipt_id = Some(receipt_id.clone());
        let payload = serde_json::to_string(&stored)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO outbox (receipt_id, payload_json, created_at, next_attempt_at)
            VALUES (?, ?, ?, 0)
            "#,
        )
        .bind(&receipt_id)
        .bind(payload)
        .bind(epoch_now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records due for delivery now, oldest first.
    pub async fn peek_ready(&self, limit: u32) -> anyhow::Result<Vec<OutboxRecord>> {
        self.peek_ready_at(limit, epoch_now()).await
    }

    /// Records with `next_attempt_at <= now`, oldest first.
    pub async fn peek_ready_at(&self, limit: u32, now: f64) -> anyhow::Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, receipt_id, payload_json, attempts, last_error, created_at, next_attempt_at
            FROM outbox
            WHERE next_attempt_at <= ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(|r| OutboxRecord {
                id: r.get("id"),
                receipt_id: r.get("receipt_id"),
                payload_json: r.get("payload_json"),
                attempts: r.get::<i64, _>("attempts").try_into().unwrap_or(u32::MAX),
                last_error: r.get("last_error"),
                created_at: r.get("created_at"),
                next_attempt_at: r.get("next_attempt_at"),
            })
            .collect();

        Ok(records)
    }

    /// Delete a delivered record.
    pub async fn mark_sent(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed attempt and push the next attempt `backoff_seconds` out.
    pub async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        attempts: u32,
        backoff_seconds: u64,
    ) -> anyhow::Result<()> {
        self.mark_failed_at(id, error, attempts, backoff_seconds, epoch_now())
            .await
    }

    pub async fn mark_failed_at(
        &self,
        id: i64,
        error: &str,
        attempts: u32,
        backoff_seconds: u64,
        now: f64,
    ) -> anyhow::Result<()> {
        let truncated: String = error.chars().take(MAX_ERROR_CHARS).collect();

        sqlx::query(
            r#"
            UPDATE outbox
            SET last_error = ?, attempts = ?, next_attempt_at = ?
            WHERE id = ?
            "#,
        )
        .bind(truncated)
        .bind(i64::from(attempts))
        .bind(now + backoff_seconds as f64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of undelivered records.
    pub async fn pending_count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(1) AS total FROM outbox")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// Close the pool, flushing SQLite state to disk.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
