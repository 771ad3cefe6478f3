use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::trade::{Trade, TradeStatus};
use crate::StoreResult;

/// Trade collection for P&L tracking: inserted at execute time with a
/// core-assigned id, updated on close.
#[derive(Clone)]
pub struct TradesRepo {
    pool: SqlitePool,
}

impl TradesRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                order_id TEXT,
                client_order_id TEXT,
                conid INTEGER,
                option_symbol TEXT,
                ticker TEXT NOT NULL,
                direction TEXT,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                entry_price REAL NOT NULL,
                take_profit REAL NOT NULL,
                stop_loss REAL NOT NULL,
                model_used TEXT,
                confidence REAL,
                simulated INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'open',
                entry_time TEXT NOT NULL,
                exit_time TEXT,
                exit_price REAL,
                pnl REAL,
                exit_reason TEXT,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_thread ON trades (thread_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_order ON trades (order_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_ticker_created ON trades (ticker, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a trade. Idempotent on the core-assigned id: re-inserting
    /// the same trade is a no-op.
    pub async fn save_trade(&self, trade: &Trade) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO trades (id, thread_id, order_id, client_order_id, conid,
                option_symbol, ticker, direction, side, quantity, entry_price, take_profit,
                stop_loss, model_used, confidence, simulated, status, entry_time, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(&trade.thread_id)
        .bind(&trade.order_id)
        .bind(&trade.client_order_id)
        .bind(trade.conid)
        .bind(&trade.option_symbol)
        .bind(&trade.ticker)
        .bind(&trade.direction)
        .bind(&trade.side)
        .bind(trade.quantity)
        .bind(trade.entry_price)
        .bind(trade.take_profit)
        .bind(trade.stop_loss)
        .bind(&trade.model_used)
        .bind(trade.confidence)
        .bind(trade.simulated as i64)
        .bind(trade.status.as_str())
        .bind(&trade.entry_time)
        .bind(&trade.created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            trade_id = %trade.id,
            ticker = %trade.ticker,
            simulated = trade.simulated,
            "trade saved @ ${:.2}",
            trade.entry_price
        );
        Ok(())
    }

    pub async fn close_trade(
        &self,
        trade_id: &str,
        status: TradeStatus,
        exit_price: f64,
        pnl: f64,
        exit_reason: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE trades SET status = ?, exit_price = ?, exit_time = ?, pnl = ?, exit_reason = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(exit_price)
        .bind(Utc::now().to_rfc3339())
        .bind(pnl)
        .bind(exit_reason)
        .bind(trade_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn open_trades(&self) -> StoreResult<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = 'open' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(trade_from_row).collect())
    }

    pub async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trade_from_row))
    }

    pub async fn find_open_by_thread(&self, thread_id: &str) -> StoreResult<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE thread_id = ? AND status = 'open'")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trade_from_row))
    }

    pub async fn open_trade_exists_for_ticker(&self, ticker: &str) -> StoreResult<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM trades WHERE ticker = ? AND status = 'open' LIMIT 1")
                .bind(ticker)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

fn trade_from_row(row: &SqliteRow) -> Trade {
    Trade {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        order_id: row.get("order_id"),
        client_order_id: row.get("client_order_id"),
        conid: row.get("conid"),
        option_symbol: row.get("option_symbol"),
        ticker: row.get("ticker"),
        direction: row.get("direction"),
        side: row.get("side"),
        quantity: row.get("quantity"),
        entry_price: row.get("entry_price"),
        take_profit: row.get("take_profit"),
        stop_loss: row.get("stop_loss"),
        model_used: row.get("model_used"),
        confidence: row.get("confidence"),
        simulated: row.get::<i64, _>("simulated") != 0,
        status: TradeStatus::parse(&row.get::<String, _>("status")),
        entry_time: row.get("entry_time"),
        exit_time: row.get("exit_time"),
        exit_price: row.get("exit_price"),
        pnl: row.get("pnl"),
        exit_reason: row.get("exit_reason"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn repo() -> TradesRepo {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = TradesRepo::new(pool);
        repo.init_tables().await.unwrap();
        repo
    }

    fn sample_trade(id: &str, ticker: &str) -> Trade {
        let now = Utc::now().to_rfc3339();
        Trade {
            id: id.into(),
            thread_id: "t1".into(),
            order_id: Some("1234".into()),
            client_order_id: Some("bkt-1".into()),
            conid: Some(9988),
            option_symbol: Some("SPY   241209C00605000".into()),
            ticker: ticker.into(),
            direction: Some("CALL".into()),
            side: "BUY".into(),
            quantity: 1,
            entry_price: 1.77,
            take_profit: 2.5,
            stop_loss: 1.2,
            model_used: Some("deepseek/deepseek-reasoner".into()),
            confidence: Some(0.7),
            simulated: false,
            status: TradeStatus::Open,
            entry_time: now.clone(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            exit_reason: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_read_open_trade() {
        let repo = repo().await;
        repo.save_trade(&sample_trade("tr1", "SPY")).await.unwrap();

        let open = repo.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].option_symbol.as_deref(), Some("SPY   241209C00605000"));
        assert!(repo.open_trade_exists_for_ticker("SPY").await.unwrap());
        assert!(!repo.open_trade_exists_for_ticker("QQQ").await.unwrap());
    }

    #[tokio::test]
    async fn save_trade_is_idempotent_by_id() {
        let repo = repo().await;
        let trade = sample_trade("tr1", "SPY");
        repo.save_trade(&trade).await.unwrap();
        repo.save_trade(&trade).await.unwrap();
        assert_eq!(repo.open_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_trade_updates_status_and_pnl() {
        let repo = repo().await;
        repo.save_trade(&sample_trade("tr1", "SPY")).await.unwrap();

        repo.close_trade("tr1", TradeStatus::ClosedTp, 2.5, 73.0, Some("take profit filled"))
            .await
            .unwrap();

        assert!(repo.open_trades().await.unwrap().is_empty());
        let closed = repo.find_by_order_id("1234").await.unwrap().expect("trade");
        assert_eq!(closed.status, TradeStatus::ClosedTp);
        assert_eq!(closed.exit_price, Some(2.5));
        assert_eq!(closed.pnl, Some(73.0));
    }

    #[tokio::test]
    async fn find_open_by_thread_ignores_closed() {
        let repo = repo().await;
        repo.save_trade(&sample_trade("tr1", "SPY")).await.unwrap();
        repo.close_trade("tr1", TradeStatus::ClosedSl, 1.2, -57.0, None)
            .await
            .unwrap();
        assert!(repo.find_open_by_thread("t1").await.unwrap().is_none());
    }
}
