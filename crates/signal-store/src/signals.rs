use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::decision::AiResult;
use crate::signal::{Signal, SignalMessage};
use crate::StoreResult;

/// Thread-keyed signal collection. The upstream collector inserts rows;
/// the core reads by thread_id and upserts the decision envelope.
#[derive(Clone)]
pub struct SignalsRepo {
    pool: SqlitePool,
}

impl SignalsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signals (
                thread_id TEXT PRIMARY KEY,
                thread_name TEXT NOT NULL DEFAULT '',
                created_at TEXT,
                messages TEXT NOT NULL DEFAULT '[]',
                ticker TEXT,
                direction TEXT,
                strike REAL,
                expiry TEXT,
                entry_price REAL,
                target_price REAL,
                stop_loss REAL,
                confidence REAL,
                position_size REAL,
                ai_processed INTEGER NOT NULL DEFAULT 0,
                ai_processed_at TEXT,
                ai_result TEXT,
                scheduled_reanalysis TEXT,
                processing_error TEXT,
                trace_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_processed ON signals (ai_processed)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_created ON signals (created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get(&self, thread_id: &str) -> StoreResult<Option<Signal>> {
        let row = sqlx::query("SELECT * FROM signals WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let messages: Vec<SignalMessage> =
            serde_json::from_str(&row.get::<String, _>("messages")).unwrap_or_default();

        let mut signal = Signal {
            thread_id: row.get("thread_id"),
            thread_name: row.get("thread_name"),
            created_at: row.get("created_at"),
            messages,
            ticker: row.get("ticker"),
            direction: row.get("direction"),
            strike: row.get("strike"),
            expiry: row.get("expiry"),
            entry_price: row.get("entry_price"),
            target_price: row.get("target_price"),
            stop_loss: row.get("stop_loss"),
            confidence: row.get("confidence"),
            position_size: row.get("position_size"),
        };
        signal.parse_content();
        Ok(Some(signal))
    }

    /// Insert or replace a signal row; used by tests and seed tooling.
    /// Production rows are written by the upstream collector.
    pub async fn upsert_signal(&self, signal: &Signal) -> StoreResult<()> {
        let messages = serde_json::to_string(&signal.messages)?;
        sqlx::query(
            "INSERT INTO signals (thread_id, thread_name, created_at, messages, ticker,
                direction, strike, expiry, entry_price, target_price, stop_loss,
                confidence, position_size)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                thread_name = excluded.thread_name,
                messages = excluded.messages,
                ticker = excluded.ticker,
                direction = excluded.direction,
                strike = excluded.strike,
                expiry = excluded.expiry,
                entry_price = excluded.entry_price,
                target_price = excluded.target_price,
                stop_loss = excluded.stop_loss,
                confidence = excluded.confidence,
                position_size = excluded.position_size",
        )
        .bind(&signal.thread_id)
        .bind(&signal.thread_name)
        .bind(&signal.created_at)
        .bind(&messages)
        .bind(&signal.ticker)
        .bind(&signal.direction)
        .bind(signal.strike)
        .bind(&signal.expiry)
        .bind(signal.entry_price)
        .bind(signal.target_price)
        .bind(signal.stop_loss)
        .bind(signal.confidence)
        .bind(signal.position_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent envelope upsert: replaying the same envelope leaves the
    /// record unchanged. `scheduled` carries the reanalysis marker for
    /// Delay decisions.
    pub async fn save_result(
        &self,
        thread_id: &str,
        result: &AiResult,
        scheduled: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        let envelope = serde_json::to_string(result)?;
        let scheduled = scheduled.map(serde_json::to_string).transpose()?;

        sqlx::query(
            "UPDATE signals SET
                ai_processed = 1,
                ai_processed_at = ?,
                ai_result = ?,
                scheduled_reanalysis = ?,
                processing_error = NULL,
                trace_id = ?
             WHERE thread_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&envelope)
        .bind(&scheduled)
        .bind(&result.trace_id)
        .bind(thread_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a task-level failure so dashboards see a consistent state.
    /// Does not mark the signal processed; failed tasks stay re-runnable.
    pub async fn record_failure(&self, thread_id: &str, kind: &str, message: &str) -> StoreResult<()> {
        let error = serde_json::json!({
            "kind": kind,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        });
        sqlx::query("UPDATE signals SET processing_error = ? WHERE thread_id = ?")
            .bind(error.to_string())
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_result(&self, thread_id: &str) -> StoreResult<Option<AiResult>> {
        let row = sqlx::query("SELECT ai_result FROM signals WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let raw: Option<String> = row.get("ai_result");
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn is_processed(&self, thread_id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT ai_processed FROM signals WHERE thread_id = ?")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("ai_processed") != 0).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Decision, SkipCategory};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repo() -> SignalsRepo {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SignalsRepo::new(pool);
        repo.init_tables().await.unwrap();
        repo
    }

    fn sample_signal() -> Signal {
        Signal {
            thread_id: "t1".into(),
            thread_name: "SPY 2024-12-09".into(),
            messages: vec![SignalMessage {
                content: "BUY CALLS\nStrike: $605\nConfidence: 90%".into(),
                timestamp: "2024-12-09T09:45:00".into(),
            }],
            ..Default::default()
        }
    }

    fn skip_result() -> AiResult {
        AiResult {
            act: "skip".into(),
            reasoning: "emergency stop is active".into(),
            decision: Decision::Skip {
                reason: "emergency stop is active".into(),
                category: SkipCategory::Other,
            },
            trade_result: None,
            model_used: "deepseek/deepseek-reasoner".into(),
            timestamp: "2024-12-09T10:00:00Z".into(),
            trace_id: Some("req-1".into()),
        }
    }

    #[tokio::test]
    async fn get_parses_stored_messages() {
        let repo = repo().await;
        repo.upsert_signal(&sample_signal()).await.unwrap();

        let signal = repo.get("t1").await.unwrap().expect("signal");
        assert_eq!(signal.ticker.as_deref(), Some("SPY"));
        assert_eq!(signal.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn save_result_marks_processed_and_is_idempotent() {
        let repo = repo().await;
        repo.upsert_signal(&sample_signal()).await.unwrap();

        let result = skip_result();
        repo.save_result("t1", &result, None).await.unwrap();
        assert!(repo.is_processed("t1").await.unwrap());

        let first = repo.get_result("t1").await.unwrap().expect("envelope");

        // Replaying the same envelope leaves the record unchanged.
        repo.save_result("t1", &result, None).await.unwrap();
        let second = repo.get_result("t1").await.unwrap().expect("envelope");
        assert_eq!(
            serde_json::to_value(&first.decision).unwrap(),
            serde_json::to_value(&second.decision).unwrap()
        );
        assert_eq!(first.trace_id, second.trace_id);
    }

    #[tokio::test]
    async fn record_failure_does_not_mark_processed() {
        let repo = repo().await;
        repo.upsert_signal(&sample_signal()).await.unwrap();

        repo.record_failure("t1", "llm_timeout", "no response").await.unwrap();
        assert!(!repo.is_processed("t1").await.unwrap());
    }

    #[tokio::test]
    async fn missing_signal_returns_none() {
        let repo = repo().await;
        assert!(repo.get("nope").await.unwrap().is_none());
    }
}
