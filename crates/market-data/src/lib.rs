pub mod calendar;
pub mod fallback;

pub use calendar::{nyse_status, MarketStatus};
pub use fallback::FallbackClient;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use ibkr_broker::IbkrClient;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("market data request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("market data upstream error: {0}")]
    Upstream(String),

    #[error("no market data for {0}")]
    NoData(String),
}

pub type MarketDataResult<T> = Result<T, MarketDataError>;

#[derive(Debug, Clone, Serialize)]
pub struct OptionQuote {
    pub strike: f64,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub mid: f64,
    pub volume: i64,
    pub open_interest: i64,
    pub implied_volatility: f64,
    pub in_the_money: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionChain {
    pub symbol: String,
    pub underlying_price: f64,
    pub expiries: Vec<String>,
    pub calls: Vec<OptionQuote>,
    pub puts: Vec<OptionQuote>,
}

/// VIX band: low < 15 <= normal < 20 <= elevated < 25 <= high < 30 <= extreme.
pub fn vix_band(value: f64) -> &'static str {
    if value < 15.0 {
        "low"
    } else if value < 20.0 {
        "normal"
    } else if value < 25.0 {
        "elevated"
    } else if value < 30.0 {
        "high"
    } else {
        "extreme"
    }
}

/// Market data with the gateway as primary source and a free delayed
/// provider as fallback.
///
/// The gateway path is only used when enabled by `USE_IBKR_MARKET_DATA`
/// and the connection probed healthy; VIX and option chains always come
/// from the fallback source (no gateway subscription required).
pub struct MarketData {
    broker: Option<Arc<IbkrClient>>,
    fallback: FallbackClient,
    ibkr_enabled: bool,
    ibkr_healthy: AtomicBool,
}

impl MarketData {
    pub fn new(broker: Option<Arc<IbkrClient>>, use_ibkr: bool) -> Self {
        Self {
            broker,
            fallback: FallbackClient::new(),
            ibkr_enabled: use_ibkr,
            ibkr_healthy: AtomicBool::new(false),
        }
    }

    /// Probe the gateway once at startup; on failure everything falls
    /// back to the delayed provider.
    pub async fn probe(&self) {
        if !self.ibkr_enabled {
            tracing::info!("using fallback provider for market data (USE_IBKR_MARKET_DATA=false)");
            return;
        }
        let healthy = match &self.broker {
            Some(broker) => broker.check_health().await,
            None => false,
        };
        self.ibkr_healthy.store(healthy, Ordering::Relaxed);
        if healthy {
            tracing::info!("gateway connection healthy, using gateway for market data");
        } else {
            tracing::warn!("gateway unhealthy, falling back to delayed market data");
        }
    }

    pub fn using_ibkr(&self) -> bool {
        self.ibkr_enabled && self.ibkr_healthy.load(Ordering::Relaxed)
    }

    pub async fn underlying_price(&self, symbol: &str) -> MarketDataResult<f64> {
        if self.using_ibkr() {
            if let Some(price) = self.price_from_gateway(symbol).await {
                return Ok(price);
            }
            tracing::debug!("gateway price fetch failed for {symbol}, trying fallback");
        }
        self.fallback.quote(symbol).await
    }

    async fn price_from_gateway(&self, symbol: &str) -> Option<f64> {
        let broker = self.broker.as_ref()?;
        let contract = broker.search_contract(symbol).await.ok()?;

        // Field 31 = last, 84 = bid, 86 = ask. The first snapshot may be
        // empty while the gateway warms the subscription.
        for attempt in 0..2 {
            if let Ok(snapshot) = broker.market_snapshot(contract.contract_id, &["31", "84", "86"]).await {
                if let Some(last) = field_f64(&snapshot, "31") {
                    return Some(last);
                }
                if let (Some(bid), Some(ask)) =
                    (field_f64(&snapshot, "84"), field_f64(&snapshot, "86"))
                {
                    return Some((bid + ask) / 2.0);
                }
            }
            if attempt == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            }
        }
        None
    }

    /// VIX always comes from the fallback source.
    pub async fn vix(&self) -> MarketDataResult<f64> {
        self.fallback.quote("VIX").await
    }

    pub async fn option_chain(
        &self,
        symbol: &str,
        expiry: Option<NaiveDate>,
    ) -> MarketDataResult<OptionChain> {
        self.fallback.option_chain(symbol, expiry).await
    }
}

fn field_f64(snapshot: &serde_json::Value, field: &str) -> Option<f64> {
    match snapshot.get(field) {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}
