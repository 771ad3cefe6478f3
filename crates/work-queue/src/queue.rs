use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::time::Instant;

use crate::scheduler::ScheduledContext;
use crate::QueueResult;

/// Cap on retained dead-letter entries.
const DEAD_LETTER_KEEP: i64 = 100;
/// Dead-letter payloads are truncated to this many characters.
const DEAD_LETTER_MAX_LEN: usize = 1000;
/// The completed set is trimmed back to this size on startup.
const COMPLETED_KEEP: i64 = 10_000;

/// One unit of work: a reference to a signal thread plus optional
/// reanalysis context carried over from a scheduled delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub thread_id: String,
    #[serde(default)]
    pub thread_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_context: Option<ScheduledContext>,
}

/// A task that has been atomically moved from `pending` to `processing`.
/// Holds the raw payload so `complete`/`fail` can remove the exact row.
#[derive(Debug, Clone)]
pub struct PoppedTask {
    pub queue_id: i64,
    pub task: Task,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub scheduled: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
}

/// Reliable work queue: an atomic pending -> processing move plus a
/// completed set gives at-least-once delivery with deduplication.
///
/// The pending/processing transition, completion, failure and dead-letter
/// writes are each a single transaction, so a crash leaves every task in
/// exactly one state. `reclaim` drains stale `processing` rows back into
/// `pending` on startup and must run before the first pop.
#[derive(Clone)]
pub struct ReliableQueue {
    pool: SqlitePool,
}

impl ReliableQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> QueueResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_pending (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_processing (
                id INTEGER PRIMARY KEY,
                thread_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                started_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_completed (
                thread_id TEXT PRIMARY KEY,
                completed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_failed (
                thread_id TEXT PRIMARY KEY,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                failed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a task to the pending queue.
    pub async fn push(&self, task: &Task) -> QueueResult<()> {
        let payload = serde_json::to_string(task)?;
        self.push_raw(&payload).await
    }

    /// Append a raw payload to the pending queue (the upstream collector
    /// writes JSON it controls; validation happens at pop time).
    pub async fn push_raw(&self, payload: &str) -> QueueResult<()> {
        sqlx::query("INSERT INTO queue_pending (payload) VALUES (?)")
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pop one task, blocking up to `timeout`. Returns `None` when the
    /// queue stays empty for the whole window.
    ///
    /// Payloads that fail to parse or lack a thread_id are moved to the
    /// dead-letter list inside the same transaction and the poll continues.
    pub async fn pop_task(&self, timeout: Duration) -> QueueResult<Option<PoppedTask>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(popped) = self.try_pop().await? {
                return Ok(Some(popped));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn try_pop(&self) -> QueueResult<Option<PoppedTask>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, payload FROM queue_pending ORDER BY id LIMIT 1")
                .fetch_optional(&mut *tx)
                .await?;

        let Some((id, payload)) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM queue_pending WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let task = match serde_json::from_str::<Task>(&payload) {
            Ok(task) if !task.thread_id.trim().is_empty() => task,
            Ok(_) => {
                Self::dead_letter_in(&mut tx, &payload, "missing or empty thread_id").await?;
                tx.commit().await?;
                tracing::warn!("dead-lettered queue entry without thread_id");
                return Ok(None);
            }
            Err(e) => {
                Self::dead_letter_in(&mut tx, &payload, &format!("JSON decode error: {e}")).await?;
                tx.commit().await?;
                tracing::warn!("dead-lettered unparseable queue entry: {e}");
                return Ok(None);
            }
        };

        sqlx::query(
            "INSERT INTO queue_processing (id, thread_id, payload, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&task.thread_id)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(thread_id = %task.thread_id, "popped task");
        Ok(Some(PoppedTask { queue_id: id, task }))
    }

    /// Mark a task completed: remove it from `processing` and record the
    /// thread_id in the completed set for deduplication across restarts.
    pub async fn complete(&self, popped: &PoppedTask) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_processing WHERE id = ?")
            .bind(popped.queue_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT OR IGNORE INTO queue_completed (thread_id, completed_at) VALUES (?, ?)")
            .bind(&popped.task.thread_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(thread_id = %popped.task.thread_id, "completed task");
        Ok(())
    }

    /// Mark a task failed with an error kind; the operator re-enqueues.
    pub async fn fail(&self, popped: &PoppedTask, kind: &str, message: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_processing WHERE id = ?")
            .bind(popped.queue_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO queue_failed (thread_id, error_kind, message, failed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&popped.task.thread_id)
        .bind(kind)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::warn!(thread_id = %popped.task.thread_id, kind, "failed task: {message}");
        Ok(())
    }

    /// Move an unusable payload to the dead-letter list.
    pub async fn dead_letter(&self, payload: &str, reason: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::dead_letter_in(&mut tx, payload, reason).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dead_letter_in(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        payload: &str,
        reason: &str,
    ) -> QueueResult<()> {
        let truncated: String = payload.chars().take(DEAD_LETTER_MAX_LEN).collect();
        sqlx::query("INSERT INTO queue_dead_letter (payload, reason, created_at) VALUES (?, ?, ?)")
            .bind(&truncated)
            .bind(reason)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            "DELETE FROM queue_dead_letter WHERE id NOT IN
             (SELECT id FROM queue_dead_letter ORDER BY id DESC LIMIT ?)",
        )
        .bind(DEAD_LETTER_KEEP)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn is_completed(&self, thread_id: &str) -> QueueResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT thread_id FROM queue_completed WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Drain stale `processing` rows back into `pending` (preserving their
    /// relative order) for entries not already completed. Run at startup,
    /// before the first pop.
    pub async fn reclaim(&self) -> QueueResult<usize> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, thread_id, payload FROM queue_processing ORDER BY id")
                .fetch_all(&mut *tx)
                .await?;

        let mut requeued = 0usize;
        for (id, thread_id, payload) in &rows {
            let done: Option<(String,)> =
                sqlx::query_as("SELECT thread_id FROM queue_completed WHERE thread_id = ?")
                    .bind(thread_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            sqlx::query("DELETE FROM queue_processing WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            if done.is_some() {
                tracing::info!(thread_id = %thread_id, "stale item already completed, dropped");
                continue;
            }

            sqlx::query("INSERT INTO queue_pending (payload) VALUES (?)")
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            requeued += 1;
            tracing::info!(thread_id = %thread_id, "requeued stale item");
        }

        tx.commit().await?;

        if requeued > 0 {
            tracing::warn!("recovered {requeued} stale item(s) from processing");
        }
        Ok(requeued)
    }

    /// Bound the completed set's growth; oldest entries go first.
    pub async fn trim_completed(&self) -> QueueResult<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_completed WHERE thread_id NOT IN
             (SELECT thread_id FROM queue_completed ORDER BY completed_at DESC LIMIT ?)",
        )
        .bind(COMPLETED_KEEP)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let pending: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_pending")
            .fetch_one(&self.pool)
            .await?;
        let processing: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_processing")
            .fetch_one(&self.pool)
            .await?;
        let scheduled: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_scheduled")
            .fetch_one(&self.pool)
            .await
            .unwrap_or((0,));
        let completed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_completed")
            .fetch_one(&self.pool)
            .await?;
        let failed: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_failed")
            .fetch_one(&self.pool)
            .await?;
        let dead_letter: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_dead_letter")
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            pending: pending.0,
            processing: processing.0,
            scheduled: scheduled.0,
            completed: completed.0,
            failed: failed.0,
            dead_letter: dead_letter.0,
        })
    }
}
