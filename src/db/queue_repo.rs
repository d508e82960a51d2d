//! Durable mutation queue over SQLite.
//!
//! Every pending create/update/delete lives here until the server accepts it
//! (or a conflict supersedes it). All operations are atomic per record, and a
//! write failure surfaces to the caller; nothing is dropped silently.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{MutationRecord, MutationStatus};

#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    operation_id: String,
    operation_type: String,
    target_id: String,
    payload: String,
    status: String,
    retry_count: i64,
    next_attempt_at: Option<i64>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

const COLUMNS: &str = "operation_id, operation_type, target_id, payload, status, \
                       retry_count, next_attempt_at, last_error, created_at, updated_at";

impl QueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a fresh mutation record.
    pub async fn enqueue(&self, record: &MutationRecord) -> Result<(), sqlx::Error> {
        let payload = serde_json::to_string(&record.payload).map_err(encode_err)?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue
                (operation_id, operation_type, target_id, payload, status,
                 retry_count, next_attempt_at, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.operation_id.to_string())
        .bind(record.operation_type.to_string())
        .bind(record.target_id.to_string())
        .bind(&payload)
        .bind(record.status.to_string())
        .bind(record.retry_count)
        .bind(record.next_attempt_at.map(|t| t.timestamp_millis()))
        .bind(&record.last_error)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, operation_id: Uuid) -> Result<Option<MutationRecord>, sqlx::Error> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE operation_id = ?"
        ))
        .bind(operation_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(hydrate).transpose()
    }

    /// All queued records in enqueue order, regardless of eligibility.
    pub async fn list(&self) -> Result<Vec<MutationRecord>, sqlx::Error> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM sync_queue ORDER BY rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }

    /// Records eligible for delivery at `now`, in enqueue order.
    ///
    /// Only the oldest queued record per target is returned, which both
    /// preserves per-meal ordering and keeps a later mutation out while an
    /// earlier one is in flight. Terminal failures (no `next_attempt_at`)
    /// never match.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<MutationRecord>, sqlx::Error> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS} FROM sync_queue q
            WHERE q.status IN ('pending', 'failed')
              AND q.next_attempt_at IS NOT NULL
              AND q.next_attempt_at <= ?
              AND NOT EXISTS (
                  SELECT 1 FROM sync_queue older
                  WHERE older.target_id = q.target_id AND older.rowid < q.rowid
              )
            ORDER BY q.rowid ASC
            "#
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }

    /// Claims a record for delivery. Returns `false` if the record is gone or
    /// already claimed, so re-entrant drains never double-send.
    pub async fn mark_in_flight(&self, operation_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'in_flight', updated_at = ?
            WHERE operation_id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(operation_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Puts a record back in the retry schedule after a transient failure.
    pub async fn reschedule(
        &self,
        operation_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        retry_count: i64,
        last_error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'failed', retry_count = ?, next_attempt_at = ?,
                last_error = ?, updated_at = ?
            WHERE operation_id = ?
            "#,
        )
        .bind(retry_count)
        .bind(next_attempt_at.timestamp_millis())
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .bind(operation_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parks a record as a terminal failure: retained for visibility, never
    /// auto-retried (`next_attempt_at` is cleared).
    pub async fn mark_failed_terminal(
        &self,
        operation_id: Uuid,
        last_error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'failed', next_attempt_at = NULL, last_error = ?, updated_at = ?
            WHERE operation_id = ?
            "#,
        )
        .bind(last_error)
        .bind(Utc::now().to_rfc3339())
        .bind(operation_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a delivered (or superseded/discarded) record. A completed
    /// record is deleted, not retained; replaying a `complete` on an
    /// already-removed record is a no-op.
    pub async fn complete(&self, operation_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM sync_queue WHERE operation_id = ?")
            .bind(operation_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Makes a terminal failure eligible again (user chose to retry).
    pub async fn retry_now(&self, operation_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', retry_count = 0, next_attempt_at = ?,
                last_error = NULL, updated_at = ?
            WHERE operation_id = ? AND status = 'failed'
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .bind(operation_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns abandoned `in_flight` records to the retry schedule. A request
    /// that was in flight when the process died was simply abandoned; it is
    /// safe to retry on next launch.
    pub async fn recover_in_flight(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'pending', next_attempt_at = ?, updated_at = ?
            WHERE status = 'in_flight'
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of records still waiting to reach the server (the "N pending"
    /// indicator). Terminal failures are excluded; they have their own list.
    pub async fn pending_count(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_queue WHERE status = 'in_flight' OR next_attempt_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Terminal failures awaiting user attention.
    pub async fn needs_attention(&self) -> Result<Vec<MutationRecord>, sqlx::Error> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS} FROM sync_queue
            WHERE status = 'failed' AND next_attempt_at IS NULL
            ORDER BY rowid ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate).collect()
    }
}

fn hydrate(row: QueueRow) -> Result<MutationRecord, sqlx::Error> {
    Ok(MutationRecord {
        operation_id: parse_uuid(&row.operation_id)?,
        operation_type: row.operation_type.parse().map_err(decode_err)?,
        target_id: parse_uuid(&row.target_id)?,
        payload: serde_json::from_str(&row.payload).map_err(|e| decode_err(e.to_string()))?,
        status: row.status.parse().map_err(decode_err)?,
        retry_count: row.retry_count,
        next_attempt_at: row.next_attempt_at.and_then(DateTime::from_timestamp_millis),
        last_error: row.last_error,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(s).map_err(|e| decode_err(e.to_string()))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_err(e.to_string()))
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn encode_err(e: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Encode(Box::new(e))
}

// Status helper used by callers inspecting records.
impl MutationRecord {
    /// True when the record is a terminal failure (retained, never retried).
    pub fn is_terminal(&self) -> bool {
        self.status == MutationStatus::Failed && self.next_attempt_at.is_none()
    }
}
