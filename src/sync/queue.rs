//! Offline Request Queue - legacy raw API requests with retry logic
//!
//! Before the record-level change tracking existed, writes that failed for
//! lack of connectivity were stored as raw `{endpoint, method, body}`
//! requests. The sync cycle still replays them.
//!
//! Features:
//! - SQLite-backed persistent queue
//! - Exponential backoff retry policy
//! - Max retry limit (default: 5 attempts)
//! - Queue status reporting (pending, failed counts)

use crate::db::Database;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: i64 = 30;      // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: i64 = 3600;     // Max retry delay: 1 hour
const DEFAULT_MAX_RETRIES: i32 = 5;   // Max retry attempts

// ============================================================================
// Data Types
// ============================================================================

/// Queued request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A raw API request waiting to be replayed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRequest {
    pub id: Option<i64>,
    pub endpoint: String,
    pub method: String,
    pub body: Option<Value>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OfflineRequest {
    pub fn new(method: &str, endpoint: &str, body: Option<Value>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            endpoint: endpoint.to_string(),
            method: method.to_ascii_uppercase(),
            body,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error_message: None,
            created_at: now,
            next_retry_at: Some(now),
        }
    }

    /// Delay before the next attempt after `retry_count` failures
    pub fn backoff_delay(retry_count: i32) -> Duration {
        let delay_secs = (BASE_DELAY_SECS * 2_i64.pow(retry_count.max(0) as u32)).min(MAX_DELAY_SECS);
        Duration::seconds(delay_secs)
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: i32,
    pub failed_count: i32,
    /// Failed requests that will not be retried automatically
    pub exhausted_count: i32,
    pub total_count: i32,
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Manages the legacy offline request queue
pub struct RequestQueue {
    db: Arc<Database>,
}

impl RequestQueue {
    pub fn new(db: Arc<Database>) -> Result<Self, QueueError> {
        let queue = Self { db };
        queue.initialize_schema()?;
        Ok(queue)
    }

    fn initialize_schema(&self) -> Result<(), QueueError> {
        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS offline_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                body TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                error_message TEXT,
                created_at TEXT NOT NULL,
                next_retry_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_offline_requests_status
                ON offline_requests(status);

            CREATE INDEX IF NOT EXISTS idx_offline_requests_next_retry
                ON offline_requests(next_retry_at);
            "#
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Add a request to the queue
    pub fn enqueue(&self, request: OfflineRequest) -> Result<i64, QueueError> {
        log::info!("Queueing offline request {} {}", request.method, request.endpoint);

        let body = request.body
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        let id = self.db.execute_insert(
            r#"
            INSERT INTO offline_requests (
                endpoint, method, body, status, retry_count, max_retries,
                error_message, created_at, next_retry_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                request.endpoint,
                request.method,
                body,
                request.status.as_str(),
                request.retry_count,
                request.max_retries,
                request.error_message,
                request.created_at.to_rfc3339(),
                request.next_retry_at.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(id)
    }

    /// Requests that are due for a replay attempt, oldest first
    pub fn due_requests(&self) -> Result<Vec<OfflineRequest>, QueueError> {
        self.load(
            r#"
            WHERE retry_count < max_retries
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
            ORDER BY created_at ASC, id ASC
            "#,
            params![Utc::now().to_rfc3339()],
        )
    }

    pub fn get(&self, id: i64) -> Result<OfflineRequest, QueueError> {
        self.load("WHERE id = ?1", params![id])?
            .into_iter()
            .next()
            .ok_or(QueueError::ItemNotFound(id))
    }

    fn load<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<OfflineRequest>, QueueError> {
        self.db.query(
            &format!(
                r#"
                SELECT id, endpoint, method, body, status, retry_count,
                       max_retries, error_message, created_at, next_retry_at
                FROM offline_requests
                {}
                "#,
                filter
            ),
            params,
            |row| {
                Ok(OfflineRequest {
                    id: row.get(0)?,
                    endpoint: row.get(1)?,
                    method: row.get(2)?,
                    body: row.get::<_, Option<String>>(3)?
                        .and_then(|s| serde_json::from_str(&s).ok()),
                    status: QueueStatus::from_str(&row.get::<_, String>(4)?),
                    retry_count: row.get(5)?,
                    max_retries: row.get(6)?,
                    error_message: row.get(7)?,
                    created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(8)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    next_retry_at: row.get::<_, Option<String>>(9)?
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                })
            },
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Mark request as failed and schedule a retry with backoff
    pub fn mark_failed_and_retry(&self, id: i64, error_message: String) -> Result<(), QueueError> {
        log::warn!("Offline request {} failed: {}", id, error_message);

        let request = self.get(id)?;

        let new_retry_count = request.retry_count + 1;
        let next_retry = if new_retry_count < request.max_retries {
            Some(Utc::now() + OfflineRequest::backoff_delay(new_retry_count))
        } else {
            None
        };

        self.db.execute(
            r#"
            UPDATE offline_requests
            SET status = ?1, error_message = ?2, retry_count = ?3,
                next_retry_at = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
            params![
                QueueStatus::Failed.as_str(),
                Some(error_message),
                new_retry_count,
                next_retry.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
                id
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        match next_retry {
            Some(retry_time) => log::info!(
                "Offline request {} will retry at {} (attempt {}/{})",
                id, retry_time, new_retry_count + 1, request.max_retries
            ),
            None => log::warn!("Offline request {} exceeded max retries", id),
        }

        Ok(())
    }

    /// Remove a request once the server accepted it
    pub fn remove(&self, id: i64) -> Result<(), QueueError> {
        self.db.execute(
            "DELETE FROM offline_requests WHERE id = ?1",
            params![id],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::debug!("Removed offline request {}", id);
        Ok(())
    }

    pub fn get_stats(&self) -> Result<QueueStats, QueueError> {
        self.db.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN retry_count >= max_retries THEN 1 ELSE 0 END), 0),
                COUNT(*)
            FROM offline_requests
            "#,
            params![],
            |row| {
                Ok(QueueStats {
                    pending_count: row.get(0)?,
                    failed_count: row.get(1)?,
                    exhausted_count: row.get(2)?,
                    total_count: row.get(3)?,
                })
            },
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Reset failed requests for manual retry
    pub fn retry_failed(&self) -> Result<i32, QueueError> {
        let now = Utc::now().to_rfc3339();

        let updated = self.db.execute(
            r#"
            UPDATE offline_requests
            SET status = 'pending',
                retry_count = 0,
                next_retry_at = ?1,
                updated_at = ?1,
                error_message = NULL
            WHERE status = 'failed'
            "#,
            params![now],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Reset {} failed offline requests for retry", updated);
        Ok(updated as i32)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Queue item not found: {0}")]
    ItemNotFound(i64),
}

// ============================================================================
// Tests
// ============================================================================
