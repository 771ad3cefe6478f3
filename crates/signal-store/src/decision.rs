use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Why a signal was skipped; stored with the envelope for analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCategory {
    NoSignal,
    MarketClosed,
    BadRr,
    LowConfidence,
    Timing,
    PositionExists,
    Other,
}

impl SkipCategory {
    /// Lenient mapping for model-supplied category strings.
    pub fn parse(s: &str) -> Self {
        match s {
            "no_signal" => Self::NoSignal,
            "market_closed" => Self::MarketClosed,
            "bad_rr" => Self::BadRr,
            "low_confidence" => Self::LowConfidence,
            "timing" => Self::Timing,
            "position_exists" => Self::PositionExists,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSignal => "no_signal",
            Self::MarketClosed => "market_closed",
            Self::BadRr => "bad_rr",
            Self::LowConfidence => "low_confidence",
            Self::Timing => "timing",
            Self::PositionExists => "position_exists",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
}

impl Direction {
    pub fn right(&self) -> char {
        match self {
            Self::Call => 'C',
            Self::Put => 'P',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A fully specified bracket order as chosen by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOrder {
    pub ticker: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub direction: Direction,
    pub side: OrderSide,
    pub quantity: u32,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayRequest {
    pub delay_minutes: i64,
    pub reason: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_levels: Option<serde_json::Value>,
}

/// The model's terminal choice for a signal. Parsed from the single tool
/// call in one place and pattern-matched everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Skip {
        reason: String,
        category: SkipCategory,
    },
    Execute {
        #[serde(flatten)]
        order: ExecuteOrder,
    },
    Delay {
        #[serde(flatten)]
        request: DelayRequest,
    },
}

impl Decision {
    pub fn act(&self) -> &'static str {
        match self {
            Self::Skip { .. } => "skip",
            Self::Execute { .. } => "execute",
            Self::Delay { .. } => "schedule",
        }
    }
}

/// Outcome of a bracket submission (live or simulated).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub timestamp: String,
}

/// The envelope appended to the signal record after processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResult {
    pub act: String,
    pub reasoning: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_result: Option<TradeResult>,
    pub model_used: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}
