use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::queue::Task;
use crate::QueueResult;

/// Context blobs live this long past their due time before being purged.
const CONTEXT_TTL_SECS: i64 = 86_400;

/// Context carried into a scheduled reanalysis. Stored as a JSON blob
/// keyed by thread_id with a 24 h TTL; released together with the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledContext {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub delay_minutes: i64,
    #[serde(default)]
    pub delay_reason: String,
    #[serde(default)]
    pub delay_question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<serde_json::Value>,
    #[serde(default)]
    pub scheduled_at: String,
    #[serde(default)]
    pub reanalyze_at: String,
    #[serde(default)]
    pub thread_name: String,
}

/// Holds delayed tasks and releases them when due.
///
/// Due entries are released in ascending due time; ties break by insertion
/// order. Released tasks re-enter `pending` with their saved context and go
/// through the normal consumer path with no priority over fresh tasks.
#[derive(Clone)]
pub struct ReanalysisScheduler {
    pool: SqlitePool,
}

impl ReanalysisScheduler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> QueueResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_scheduled (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL UNIQUE,
                due_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue_scheduled_data (
                thread_id TEXT PRIMARY KEY,
                context TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Register a delayed reanalysis. Re-scheduling an already scheduled
    /// thread replaces its due time and context.
    pub async fn schedule(
        &self,
        thread_id: &str,
        due_at: DateTime<Utc>,
        context: &ScheduledContext,
    ) -> QueueResult<()> {
        let blob = serde_json::to_string(context)?;
        let score = due_at.timestamp();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_scheduled WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO queue_scheduled (thread_id, due_at) VALUES (?, ?)")
            .bind(thread_id)
            .bind(score)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO queue_scheduled_data (thread_id, context, expires_at)
             VALUES (?, ?, ?)",
        )
        .bind(thread_id)
        .bind(&blob)
        .bind(score + CONTEXT_TTL_SECS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            thread_id,
            due_at = %due_at.to_rfc3339(),
            retry = context.retry_count,
            "scheduled reanalysis"
        );
        Ok(())
    }

    pub async fn cancel(&self, thread_id: &str) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue_scheduled WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue_scheduled_data WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> QueueResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_scheduled")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Release every entry with `due_at <= now` back onto the pending
    /// queue, carrying the saved context. Each release removes the
    /// scheduled row and its blob atomically. Entries already in the
    /// completed set are dropped instead of re-queued.
    pub async fn release_due(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let due: Vec<(String,)> = sqlx::query_as(
            "SELECT thread_id FROM queue_scheduled WHERE due_at <= ? ORDER BY due_at ASC, seq ASC",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        if !due.is_empty() {
            tracing::info!("{} scheduled item(s) due for reanalysis", due.len());
        }

        let mut released = 0usize;
        for (thread_id,) in due {
            let mut tx = self.pool.begin().await?;

            let completed: Option<(String,)> =
                sqlx::query_as("SELECT thread_id FROM queue_completed WHERE thread_id = ?")
                    .bind(&thread_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let blob: Option<(String,)> =
                sqlx::query_as("SELECT context FROM queue_scheduled_data WHERE thread_id = ?")
                    .bind(&thread_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            if completed.is_none() {
                if let Some((blob,)) = &blob {
                    match serde_json::from_str::<ScheduledContext>(blob) {
                        Ok(context) => {
                            let task = Task {
                                thread_id: thread_id.clone(),
                                thread_name: context.thread_name.clone(),
                                scheduled_context: Some(context),
                            };
                            let payload = serde_json::to_string(&task)?;
                            sqlx::query("INSERT INTO queue_pending (payload) VALUES (?)")
                                .bind(&payload)
                                .execute(&mut *tx)
                                .await?;
                            released += 1;
                            tracing::info!(thread_id = %thread_id, "released scheduled reanalysis");
                        }
                        Err(e) => {
                            tracing::error!(thread_id = %thread_id, "corrupt scheduled context: {e}");
                        }
                    }
                } else {
                    tracing::warn!(thread_id = %thread_id, "scheduled context blob missing, dropping");
                }
            } else {
                tracing::info!(thread_id = %thread_id, "scheduled task already completed, dropping");
            }

            sqlx::query("DELETE FROM queue_scheduled WHERE thread_id = ?")
                .bind(&thread_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM queue_scheduled_data WHERE thread_id = ?")
                .bind(&thread_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
        }

        Ok(released)
    }

    /// Drop context blobs past their TTL whose scheduled row is gone.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let result = sqlx::query(
            "DELETE FROM queue_scheduled_data WHERE expires_at < ?
             AND thread_id NOT IN (SELECT thread_id FROM queue_scheduled)",
        )
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Polling loop: release due entries every `poll` interval until the
    /// shutdown signal flips.
    pub async fn run(self, poll: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.purge_expired(now).await {
                        tracing::error!("scheduler purge error: {e}");
                    }
                    if let Err(e) = self.release_due(now).await {
                        tracing::error!("scheduler release error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("scheduler loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ReliableQueue;
    use chrono::Duration as ChronoDuration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (ReliableQueue, ReanalysisScheduler) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = ReliableQueue::new(pool.clone());
        queue.init_tables().await.unwrap();
        let scheduler = ReanalysisScheduler::new(pool);
        scheduler.init_tables().await.unwrap();
        (queue, scheduler)
    }

    fn context(retry: u32) -> ScheduledContext {
        ScheduledContext {
            retry_count: retry,
            delay_minutes: 30,
            delay_reason: "await PCE release".into(),
            delay_question: "has the market reacted?".into(),
            thread_name: "SPY 0DTE".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn due_entry_is_released_with_context() {
        let (queue, scheduler) = setup().await;
        let now = Utc::now();

        scheduler
            .schedule("t1", now - ChronoDuration::seconds(5), &context(1))
            .await
            .unwrap();

        let released = scheduler.release_due(now).await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(scheduler.count().await.unwrap(), 0);

        let popped = queue
            .pop_task(std::time::Duration::ZERO)
            .await
            .unwrap()
            .expect("released task in pending");
        assert_eq!(popped.task.thread_id, "t1");
        assert_eq!(popped.task.thread_name, "SPY 0DTE");
        let ctx = popped.task.scheduled_context.expect("context");
        assert_eq!(ctx.retry_count, 1);
        assert_eq!(ctx.delay_minutes, 30);
    }

    #[tokio::test]
    async fn future_entry_is_not_released() {
        let (_queue, scheduler) = setup().await;
        let now = Utc::now();

        scheduler
            .schedule("t1", now + ChronoDuration::minutes(30), &context(1))
            .await
            .unwrap();

        assert_eq!(scheduler.release_due(now).await.unwrap(), 0);
        assert_eq!(scheduler.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_order_is_ascending_due_time() {
        let (queue, scheduler) = setup().await;
        let now = Utc::now();

        scheduler
            .schedule("later", now - ChronoDuration::seconds(10), &context(1))
            .await
            .unwrap();
        scheduler
            .schedule("earlier", now - ChronoDuration::seconds(60), &context(1))
            .await
            .unwrap();

        scheduler.release_due(now).await.unwrap();

        let first = queue.pop_task(std::time::Duration::ZERO).await.unwrap().unwrap();
        let second = queue.pop_task(std::time::Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task.thread_id, "earlier");
        assert_eq!(second.task.thread_id, "later");
    }

    #[tokio::test]
    async fn completed_thread_is_dropped_not_released() {
        let (queue, scheduler) = setup().await;
        let now = Utc::now();

        queue.push(&Task {
            thread_id: "t1".into(),
            thread_name: "n".into(),
            scheduled_context: None,
        })
        .await
        .unwrap();
        let popped = queue.pop_task(std::time::Duration::ZERO).await.unwrap().unwrap();
        queue.complete(&popped).await.unwrap();

        scheduler
            .schedule("t1", now - ChronoDuration::seconds(5), &context(2))
            .await
            .unwrap();

        assert_eq!(scheduler.release_due(now).await.unwrap(), 0);
        assert_eq!(scheduler.count().await.unwrap(), 0);
        assert!(queue
            .pop_task(std::time::Duration::ZERO)
            .await
            .unwrap()
            .is_none());
    }
}
