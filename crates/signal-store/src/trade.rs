use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedExpired,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ClosedTp => "closed_tp",
            Self::ClosedSl => "closed_sl",
            Self::ClosedManual => "closed_manual",
            Self::ClosedExpired => "closed_expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "closed_tp" => Self::ClosedTp,
            "closed_sl" => Self::ClosedSl,
            "closed_manual" => Self::ClosedManual,
            "closed_expired" => Self::ClosedExpired,
            _ => Self::Open,
        }
    }
}

/// A materialized trade, created only when an Execute decision succeeds.
/// `id` is core-assigned; `order_id` is the broker-issued parent order id
/// and `client_order_id` the tag linking the bracket children. The
/// `simulated` flag is sticky from creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub conid: Option<i64>,
    #[serde(default)]
    pub option_symbol: Option<String>,
    pub ticker: String,
    #[serde(default)]
    pub direction: Option<String>,
    pub side: String,
    pub quantity: i64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub simulated: bool,
    pub status: TradeStatus,
    pub entry_time: String,
    #[serde(default)]
    pub exit_time: Option<String>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<String>,
    pub created_at: String,
}
