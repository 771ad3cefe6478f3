use std::sync::Arc;

use chrono::Utc;
use ibkr_broker::{occ_symbol, BracketOrder, BrokerError, IbkrClient};
use signal_store::{
    ExecuteOrder, Signal, StoreError, Trade, TradeResult, TradeStatus, TradesRepo,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExecError {
    /// Transport failure before the gateway answered; the task is failed
    /// and the operator re-enqueues.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The trade record could not be written before any order went out.
    #[error("trade persistence failed: {0}")]
    Store(#[from] StoreError),

    /// The broker accepted the order but the trade record write failed.
    #[error("orphaned trade {order_id}: {source}")]
    Orphaned {
        order_id: String,
        source: StoreError,
    },
}

/// Turns an Execute decision into a bracket at the gateway (or a
/// synthesized one in dry-run) and persists the Trade before returning.
pub struct TradeExecutor {
    trades: TradesRepo,
    broker: Arc<IbkrClient>,
}

impl TradeExecutor {
    pub fn new(trades: TradesRepo, broker: Arc<IbkrClient>) -> Self {
        Self { trades, broker }
    }

    pub async fn execute(
        &self,
        signal: &Signal,
        order: &ExecuteOrder,
        live: bool,
        model: &str,
    ) -> Result<TradeResult, ExecError> {
        let symbol = occ_symbol(&order.ticker, order.expiry, order.direction.right(), order.strike);

        if !live {
            return self.execute_dry_run(signal, order, &symbol, model).await;
        }
        self.execute_live(signal, order, &symbol, model).await
    }

    /// Dry-run parity: all bookkeeping happens, nothing reaches the
    /// gateway, and the trade is tagged simulated forever.
    async fn execute_dry_run(
        &self,
        signal: &Signal,
        order: &ExecuteOrder,
        symbol: &str,
        model: &str,
    ) -> Result<TradeResult, ExecError> {
        let order_id = format!("sim-{}", Uuid::new_v4());
        tracing::info!(
            "[DRY RUN] {} {} x{} @ ${:.2} | TP ${:.2} | SL ${:.2}",
            order.side.as_str(),
            symbol,
            order.quantity,
            order.entry_price,
            order.take_profit,
            order.stop_loss
        );

        let trade = self.build_trade(signal, order, symbol, model, Some(order_id.clone()), None, None, true);
        self.trades.save_trade(&trade).await?;

        Ok(TradeResult {
            success: true,
            order_id: Some(order_id),
            trade_id: Some(trade.id),
            error: None,
            simulated: true,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    async fn execute_live(
        &self,
        signal: &Signal,
        order: &ExecuteOrder,
        symbol: &str,
        model: &str,
    ) -> Result<TradeResult, ExecError> {
        let conid = match self
            .broker
            .resolve_option_conid(&order.ticker, order.expiry, order.strike, order.direction.right())
            .await
        {
            Ok(conid) => conid,
            Err(BrokerError::Unreachable(e)) => return Err(ExecError::Unreachable(e)),
            Err(e) => {
                // contract_not_found / rejected: the decision stands but
                // the execution failed; the task still completes.
                tracing::error!("contract resolution failed for {symbol}: {e}");
                return Ok(failure(&e.to_string()));
            }
        };

        let placement = match self
            .broker
            .place_bracket(&BracketOrder {
                conid,
                side: order.side.as_str().to_string(),
                quantity: order.quantity,
                entry_price: order.entry_price,
                take_profit: order.take_profit,
                stop_loss: order.stop_loss,
            })
            .await
        {
            Ok(placement) => placement,
            Err(BrokerError::Unreachable(e)) => return Err(ExecError::Unreachable(e)),
            Err(e) => {
                tracing::error!("bracket placement failed for {symbol}: {e}");
                return Ok(failure(&e.to_string()));
            }
        };

        let trade = self.build_trade(
            signal,
            order,
            symbol,
            model,
            Some(placement.order_id.clone()),
            Some(placement.client_order_id.clone()),
            Some(conid),
            false,
        );
        if let Err(e) = self.trades.save_trade(&trade).await {
            // The order is live but unrecorded; surface it loudly.
            return Err(ExecError::Orphaned {
                order_id: placement.order_id,
                source: e,
            });
        }

        Ok(TradeResult {
            success: true,
            order_id: Some(placement.order_id),
            trade_id: Some(trade.id),
            error: None,
            simulated: false,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_trade(
        &self,
        signal: &Signal,
        order: &ExecuteOrder,
        symbol: &str,
        model: &str,
        order_id: Option<String>,
        client_order_id: Option<String>,
        conid: Option<i64>,
        simulated: bool,
    ) -> Trade {
        let now = Utc::now().to_rfc3339();
        Trade {
            id: Uuid::new_v4().to_string(),
            thread_id: signal.thread_id.clone(),
            order_id,
            client_order_id,
            conid,
            option_symbol: Some(symbol.to_string()),
            ticker: order.ticker.clone(),
            direction: Some(format!("{:?}", order.direction).to_ascii_uppercase()),
            side: order.side.as_str().to_string(),
            quantity: order.quantity as i64,
            entry_price: order.entry_price,
            take_profit: order.take_profit,
            stop_loss: order.stop_loss,
            model_used: Some(model.to_string()),
            confidence: signal.confidence,
            simulated,
            status: TradeStatus::Open,
            entry_time: now.clone(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            exit_reason: None,
            created_at: now,
        }
    }
}

fn failure(error: &str) -> TradeResult {
    TradeResult {
        success: false,
        order_id: None,
        trade_id: None,
        error: Some(error.to_string()),
        simulated: false,
        timestamp: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use signal_store::{Direction, OrderSide};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn executor() -> (TradeExecutor, TradesRepo) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let trades = TradesRepo::new(pool);
        trades.init_tables().await.unwrap();

        // Dry-run never touches the gateway, so a dead endpoint is fine.
        let broker =
            Arc::new(IbkrClient::new("https://localhost:5000".into(), "DU000".into()).unwrap());
        (TradeExecutor::new(trades.clone(), broker), trades)
    }

    fn sample_order() -> ExecuteOrder {
        ExecuteOrder {
            ticker: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2024, 12, 9).unwrap(),
            strike: 605.0,
            direction: Direction::Call,
            side: OrderSide::Buy,
            quantity: 1,
            entry_price: 1.77,
            take_profit: 2.5,
            stop_loss: 1.2,
        }
    }

    fn sample_signal() -> Signal {
        Signal {
            thread_id: "t1".into(),
            thread_name: "SPY 0DTE".into(),
            confidence: Some(0.7),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dry_run_synthesizes_simulated_trade() {
        let (executor, trades) = executor().await;
        let result = executor
            .execute(&sample_signal(), &sample_order(), false, "deepseek/deepseek-reasoner")
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.simulated);
        assert!(result.order_id.as_deref().unwrap().starts_with("sim-"));

        let open = trades.open_trades().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].simulated);
        assert_eq!(open[0].option_symbol.as_deref(), Some("SPY   241209C00605000"));
        assert_eq!(open[0].thread_id, "t1");
        assert_eq!(open[0].status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn live_execute_against_dead_gateway_is_unreachable() {
        let (executor, trades) = executor().await;
        let result = executor
            .execute(&sample_signal(), &sample_order(), true, "m")
            .await;

        assert!(matches!(result, Err(ExecError::Unreachable(_))));
        assert!(trades.open_trades().await.unwrap().is_empty());
    }
}
