use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::US::Eastern;
use ibkr_broker::IbkrClient;
use market_data::{nyse_status, vix_band, MarketData, OptionQuote};
use serde_json::{json, Value};
use signal_store::Signal;
use tokio::time::timeout;

/// Strikes kept on each side of the chain slice handed to the model.
const CHAIN_SLICE: usize = 8;
/// Expiries listed in the bundle.
const MAX_EXPIRIES: usize = 6;

/// Read-only snapshot handed to prompt assembly. Every key is present;
/// failed sub-fetches carry `success: false` plus an `unavailable`
/// record instead of aborting the pipeline.
#[derive(Debug, Clone)]
pub struct PrefetchBundle {
    pub time: Value,
    pub account: Value,
    pub option_chain: Value,
    pub positions: Value,
    pub vix: Value,
}

impl PrefetchBundle {
    /// Flat template context: one object per prefetch key.
    pub fn to_context(&self) -> Value {
        json!({
            "time": self.time,
            "account": self.account,
            "option_chain": self.option_chain,
            "positions": self.positions,
            "vix": self.vix,
        })
    }

}

/// Run the five sub-reads concurrently under one wall-clock budget. Each
/// read that errors or times out degrades to an unavailable record; the
/// others are unaffected.
pub async fn fetch_all(
    broker: &IbkrClient,
    market: &MarketData,
    signal: &Signal,
    budget: Duration,
) -> PrefetchBundle {
    let (time, account, option_chain, positions, vix) = tokio::join!(
        guarded("time", budget, fetch_time()),
        guarded("account", budget, fetch_account(broker)),
        guarded("option_chain", budget, fetch_option_chain(market, signal)),
        guarded("positions", budget, fetch_positions(broker)),
        guarded("vix", budget, fetch_vix(market)),
    );

    PrefetchBundle { time, account, option_chain, positions, vix }
}

async fn guarded(
    kind: &str,
    budget: Duration,
    fut: impl std::future::Future<Output = Result<Value, String>>,
) -> Value {
    match timeout(budget, fut).await {
        Ok(Ok(mut value)) => {
            if let Some(map) = value.as_object_mut() {
                map.insert("success".into(), Value::Bool(true));
            }
            tracing::debug!("prefetch {kind}: ok");
            value
        }
        Ok(Err(reason)) => {
            tracing::warn!("prefetch {kind} failed: {reason}");
            unavailable(kind, &reason)
        }
        Err(_) => {
            tracing::warn!("prefetch {kind} timed out after {budget:?}");
            unavailable(kind, "timed out")
        }
    }
}

fn unavailable(kind: &str, reason: &str) -> Value {
    json!({
        "success": false,
        "error": reason,
        "unavailable": { "kind": kind, "reason": reason },
    })
}

async fn fetch_time() -> Result<Value, String> {
    let now = chrono::Utc::now().with_timezone(&Eastern);
    let status = nyse_status(now);

    Ok(json!({
        "timestamp": now.to_rfc3339(),
        "time_est": now.format("%H:%M:%S").to_string(),
        "date": now.format("%Y-%m-%d").to_string(),
        "day_of_week": now.format("%A").to_string(),
        "timezone": "US/Eastern (ET)",
        "is_market_open": status.is_open,
        "market_status": if status.is_open { "open" } else { "closed" },
        "status_reason": status.reason,
        "opens_at": status.opens_at,
        "closes_at": status.closes_at,
        "holiday": status.holiday,
    }))
}

async fn fetch_account(broker: &IbkrClient) -> Result<Value, String> {
    let ledger = broker.get_ledger().await.map_err(|e| e.to_string())?;
    Ok(json!({
        "available": ledger.cash_balance.unwrap_or(0.0),
        "buying_power": ledger.buying_power.unwrap_or(0.0),
        "net_liquidation": ledger.net_liquidation.unwrap_or(0.0),
        "currency": ledger.currency.unwrap_or_else(|| "USD".into()),
    }))
}

async fn fetch_positions(broker: &IbkrClient) -> Result<Value, String> {
    let positions = broker.get_positions().await.map_err(|e| e.to_string())?;

    let items: Vec<Value> = positions
        .iter()
        .map(|p| {
            json!({
                "ticker": p.ticker.clone().unwrap_or_default(),
                "contract": p.contract_desc.clone().unwrap_or_default(),
                "quantity": p.position.unwrap_or(0.0),
                "avg_cost": p.avg_cost.unwrap_or(0.0),
                "market_value": p.market_value.unwrap_or(0.0),
                "unrealized_pnl": p.unrealized_pnl.unwrap_or(0.0),
                "realized_pnl": p.realized_pnl.unwrap_or(0.0),
            })
        })
        .collect();

    let tickers: Vec<String> = positions
        .iter()
        .filter_map(|p| p.ticker.clone())
        .collect();

    Ok(json!({
        "count": items.len(),
        "items": items,
        "tickers": tickers,
    }))
}

async fn fetch_vix(market: &MarketData) -> Result<Value, String> {
    let value = market.vix().await.map_err(|e| e.to_string())?;
    Ok(json!({
        "value": (value * 100.0).round() / 100.0,
        "level": vix_band(value),
        "is_low": value < 15.0,
        "is_normal": (15.0..20.0).contains(&value),
        "is_elevated": (20.0..25.0).contains(&value),
        "is_high": (25.0..30.0).contains(&value),
        "is_extreme": value >= 30.0,
    }))
}

async fn fetch_option_chain(market: &MarketData, signal: &Signal) -> Result<Value, String> {
    let ticker = signal
        .ticker
        .as_deref()
        .ok_or_else(|| "no ticker parsed from signal".to_string())?;

    let expiry = signal
        .expiry
        .as_deref()
        .and_then(|e| NaiveDate::parse_from_str(e, "%Y-%m-%d").ok());

    let chain = market
        .option_chain(ticker, expiry)
        .await
        .map_err(|e| e.to_string())?;

    // Slice the chain around the signal's strike (or the money).
    let center = signal.strike.unwrap_or(chain.underlying_price);
    let calls = slice_near(&chain.calls, center);
    let puts = slice_near(&chain.puts, center);

    Ok(json!({
        "ticker": chain.symbol,
        "current_price": chain.underlying_price,
        "available_expiries": chain.expiries.iter().take(MAX_EXPIRIES).collect::<Vec<_>>(),
        "calls": calls,
        "puts": puts,
    }))
}

fn slice_near(quotes: &[OptionQuote], center: f64) -> Vec<Value> {
    let mut sorted: Vec<&OptionQuote> = quotes.iter().collect();
    sorted.sort_by(|a, b| {
        (a.strike - center)
            .abs()
            .partial_cmp(&(b.strike - center).abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut nearest: Vec<&OptionQuote> = sorted.into_iter().take(CHAIN_SLICE).collect();
    nearest.sort_by(|a, b| {
        a.strike
            .partial_cmp(&b.strike)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    nearest
        .into_iter()
        .map(|q| serde_json::to_value(q).unwrap_or_default())
        .collect()
}
