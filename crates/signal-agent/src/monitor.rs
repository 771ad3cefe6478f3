use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ibkr_broker::{IbkrClient, IbkrOrder};
use signal_store::{ConfigStore, Trade, TradeStatus, TradesRepo};

/// One hundred shares per option contract.
const CONTRACT_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeExit {
    pub status: TradeStatus,
    pub exit_price: f64,
    pub exit_reason: String,
}

/// Polls the gateway for bracket fills and closes Trade records.
///
/// Runs only while execute_orders is on; simulated trades are never
/// reconciled. Matching is by the stored parent/client order id; a filled
/// take-profit child closes the trade closed_tp, a filled stop child
/// closed_sl, and any unexpected terminal state closed_manual.
pub struct OrderMonitor {
    trades: TradesRepo,
    broker: Arc<IbkrClient>,
    config: ConfigStore,
    poll: Duration,
}

impl OrderMonitor {
    pub fn new(
        trades: TradesRepo,
        broker: Arc<IbkrClient>,
        config: ConfigStore,
        poll: Duration,
    ) -> Self {
        Self { trades, broker, config, poll }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::error!("order monitor error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("order monitor stopped");
                    return;
                }
            }
        }
    }

    async fn check_once(&self) -> Result<()> {
        let settings = self.config.load().await?;
        if !settings.execute_orders {
            return Ok(());
        }

        let open: Vec<Trade> = self
            .trades
            .open_trades()
            .await?
            .into_iter()
            .filter(|t| !t.simulated)
            .collect();
        if open.is_empty() {
            return Ok(());
        }

        tracing::debug!("checking {} open trade(s) for fills", open.len());
        let orders = self.broker.live_orders().await?;

        for trade in open {
            if let Some(exit) = classify_exit(&trade, &orders) {
                let pnl = trade_pnl(&trade, exit.exit_price);
                tracing::info!(
                    trade_id = %trade.id,
                    "closing trade as {} @ ${:.2} (pnl ${:.2})",
                    exit.status.as_str(),
                    exit.exit_price,
                    pnl
                );
                self.trades
                    .close_trade(&trade.id, exit.status, exit.exit_price, pnl, Some(&exit.exit_reason))
                    .await?;
            }
        }

        Ok(())
    }
}

fn is_filled(status: Option<&str>) -> bool {
    matches!(status, Some(s) if s.eq_ignore_ascii_case("filled"))
}

fn is_dead(status: Option<&str>) -> bool {
    matches!(status, Some(s) if s.eq_ignore_ascii_case("cancelled")
        || s.eq_ignore_ascii_case("canceled")
        || s.eq_ignore_ascii_case("inactive"))
}

/// Decide whether a trade should close based on the gateway's live
/// orders. Returns None while the bracket is still working or when the
/// orders are not visible this poll.
pub fn classify_exit(trade: &Trade, orders: &[IbkrOrder]) -> Option<TradeExit> {
    let client_ref = trade.client_order_id.as_deref();
    let parent_id = trade.order_id.as_deref();

    let children: Vec<&IbkrOrder> = orders
        .iter()
        .filter(|o| client_ref.is_some() && o.parent_ref().as_deref() == client_ref)
        .collect();

    // A filled child ends the trade: limit child is the take profit,
    // stop child the stop loss.
    for child in &children {
        if !is_filled(child.status.as_deref()) {
            continue;
        }
        let order_type = child
            .order_type
            .as_deref()
            .or(child.orig_order_type.as_deref())
            .unwrap_or_default()
            .to_ascii_uppercase();
        let exit_price = child
            .avg_price_f64()
            .or(child.price)
            .unwrap_or(trade.entry_price);

        return Some(if order_type.contains("STP") || order_type.contains("STOP") {
            TradeExit {
                status: TradeStatus::ClosedSl,
                exit_price,
                exit_reason: "stop loss filled".into(),
            }
        } else {
            TradeExit {
                status: TradeStatus::ClosedTp,
                exit_price,
                exit_reason: "take profit filled".into(),
            }
        });
    }

    // Parent terminal without a fill (or the whole bracket in an
    // unexpected state) means the position was handled outside the
    // bracket; close manual with the entry as exit fallback.
    let parent = orders.iter().find(|o| {
        parent_id.is_some() && o.order_id.map(|id| id.to_string()).as_deref() == parent_id
    });
    if let Some(parent) = parent {
        if is_dead(parent.status.as_deref()) {
            return Some(TradeExit {
                status: TradeStatus::ClosedManual,
                exit_price: parent.avg_price_f64().unwrap_or(trade.entry_price),
                exit_reason: format!(
                    "parent order {}",
                    parent.status.clone().unwrap_or_default().to_lowercase()
                ),
            });
        }
    }
    if children.iter().any(|c| is_dead(c.status.as_deref()))
        && !children.iter().any(|c| is_filled(c.status.as_deref()))
    {
        let both_dead = children.len() >= 2 && children.iter().all(|c| is_dead(c.status.as_deref()));
        if both_dead {
            return Some(TradeExit {
                status: TradeStatus::ClosedManual,
                exit_price: trade.entry_price,
                exit_reason: "bracket children cancelled".into(),
            });
        }
    }

    None
}

/// Realized P&L in dollars. Long premium gains as price rises; short
/// premium mirrors.
pub fn trade_pnl(trade: &Trade, exit_price: f64) -> f64 {
    let per_contract = match trade.side.as_str() {
        "SELL" => trade.entry_price - exit_price,
        _ => exit_price - trade.entry_price,
    };
    per_contract * trade.quantity as f64 * CONTRACT_MULTIPLIER
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn open_trade() -> Trade {
        let now = Utc::now().to_rfc3339();
        Trade {
            id: "tr1".into(),
            thread_id: "t1".into(),
            order_id: Some("1001".into()),
            client_order_id: Some("bkt-9-1".into()),
            conid: Some(9),
            option_symbol: Some("SPY   241209C00605000".into()),
            ticker: "SPY".into(),
            direction: Some("CALL".into()),
            side: "BUY".into(),
            quantity: 2,
            entry_price: 1.77,
            take_profit: 2.5,
            stop_loss: 1.2,
            model_used: None,
            confidence: None,
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

    fn order(raw: serde_json::Value) -> IbkrOrder {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn filled_limit_child_closes_take_profit() {
        let trade = open_trade();
        let orders = vec![
            order(serde_json::json!({"orderId": 1001, "status": "Filled", "orderType": "LMT"})),
            order(serde_json::json!({"orderId": 1002, "status": "Filled", "orderType": "LMT",
                                      "avgPrice": "2.50", "parentId": "bkt-9-1"})),
            order(serde_json::json!({"orderId": 1003, "status": "Cancelled", "orderType": "STP",
                                      "parentId": "bkt-9-1"})),
        ];

        let exit = classify_exit(&trade, &orders).expect("exit");
        assert_eq!(exit.status, TradeStatus::ClosedTp);
        assert_eq!(exit.exit_price, 2.5);
        // (2.50 - 1.77) * 2 contracts * 100
        assert!((trade_pnl(&trade, exit.exit_price) - 146.0).abs() < 1e-9);
    }

    #[test]
    fn filled_stop_child_closes_stop_loss() {
        let trade = open_trade();
        let orders = vec![order(serde_json::json!({
            "orderId": 1003, "status": "Filled", "orderType": "STP",
            "avgPrice": 1.18, "parentId": "bkt-9-1"
        }))];

        let exit = classify_exit(&trade, &orders).expect("exit");
        assert_eq!(exit.status, TradeStatus::ClosedSl);
        assert_eq!(exit.exit_price, 1.18);
        assert!(trade_pnl(&trade, exit.exit_price) < 0.0);
    }

    #[test]
    fn working_bracket_stays_open() {
        let trade = open_trade();
        let orders = vec![
            order(serde_json::json!({"orderId": 1001, "status": "Submitted", "orderType": "LMT"})),
            order(serde_json::json!({"orderId": 1002, "status": "PreSubmitted", "orderType": "LMT",
                                      "parentId": "bkt-9-1"})),
        ];
        assert!(classify_exit(&trade, &orders).is_none());
    }

    #[test]
    fn invisible_orders_leave_trade_open() {
        // A momentarily empty listing must not spuriously close trades.
        let trade = open_trade();
        assert!(classify_exit(&trade, &[]).is_none());
    }

    #[test]
    fn cancelled_parent_closes_manual() {
        let trade = open_trade();
        let orders = vec![order(serde_json::json!({
            "orderId": 1001, "status": "Cancelled", "orderType": "LMT"
        }))];

        let exit = classify_exit(&trade, &orders).expect("exit");
        assert_eq!(exit.status, TradeStatus::ClosedManual);
        assert_eq!(exit.exit_price, 1.77);
    }

    #[test]
    fn sell_side_pnl_is_mirrored() {
        let mut trade = open_trade();
        trade.side = "SELL".into();
        assert!(trade_pnl(&trade, 1.2) > 0.0);
        assert!(trade_pnl(&trade, 2.5) < 0.0);
    }
}
