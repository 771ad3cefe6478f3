use serde::Deserialize;

/// Account entry from `portfolio/accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrAccount {
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "accountTitle")]
    pub account_title: Option<String>,
}

/// Per-currency ledger entry (balance info).
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrLedger {
    #[serde(rename = "cashbalance")]
    pub cash_balance: Option<f64>,
    #[serde(rename = "netliquidationvalue")]
    pub net_liquidation: Option<f64>,
    #[serde(rename = "buyingpower")]
    pub buying_power: Option<f64>,
    pub currency: Option<String>,
}

/// Position from the portfolio endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrPosition {
    #[serde(rename = "conid")]
    pub contract_id: i64,
    pub ticker: Option<String>,
    #[serde(rename = "contractDesc")]
    pub contract_desc: Option<String>,
    pub position: Option<f64>,
    #[serde(rename = "avgCost")]
    pub avg_cost: Option<f64>,
    #[serde(rename = "mktValue")]
    pub market_value: Option<f64>,
    #[serde(rename = "unrealizedPnl")]
    pub unrealized_pnl: Option<f64>,
    #[serde(rename = "realizedPnl")]
    pub realized_pnl: Option<f64>,
}

/// Contract search result (symbol -> conid resolution).
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrContract {
    #[serde(rename = "conid")]
    pub contract_id: i64,
    pub symbol: Option<String>,
    #[serde(rename = "companyName")]
    pub company_name: Option<String>,
}

/// Option contract details from `iserver/secdef/info`.
#[derive(Debug, Clone, Deserialize)]
pub struct SecdefInfo {
    #[serde(rename = "conid")]
    pub contract_id: i64,
    pub ticker: Option<String>,
    pub strike: Option<serde_json::Value>,
    pub right: Option<String>,
    #[serde(rename = "maturityDate")]
    pub maturity_date: Option<String>,
    pub multiplier: Option<serde_json::Value>,
}

impl SecdefInfo {
    /// The gateway returns strike as either a number or a string.
    pub fn strike_f64(&self) -> Option<f64> {
        match &self.strike {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

/// One element of an order placement response; either an order-submitted
/// record or a confirmation question requiring a reply.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSubmitEntry {
    pub order_id: Option<String>,
    pub order_status: Option<String>,
    pub local_order_id: Option<String>,
    /// Confirmation question id; present when the gateway asks to confirm
    /// (price percentage constraint, order value limit, missing market
    /// data, stop order risks).
    pub id: Option<String>,
    #[serde(default)]
    pub message: Vec<String>,
}

/// Live order from `iserver/account/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrOrder {
    #[serde(rename = "orderId")]
    pub order_id: Option<i64>,
    pub ticker: Option<String>,
    pub side: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "orderType")]
    pub order_type: Option<String>,
    #[serde(rename = "origOrderType")]
    pub orig_order_type: Option<String>,
    pub price: Option<f64>,
    #[serde(rename = "avgPrice")]
    pub avg_price: Option<serde_json::Value>,
    #[serde(rename = "filledQuantity")]
    pub filled_qty: Option<f64>,
    #[serde(rename = "remainingQuantity")]
    pub remaining_qty: Option<f64>,
    #[serde(rename = "totalSize")]
    pub total_size: Option<f64>,
    /// Client order id assigned at placement (cOID).
    #[serde(rename = "order_ref")]
    pub order_ref: Option<String>,
    /// Parent linkage for bracket children.
    #[serde(rename = "parentId")]
    pub parent_id: Option<serde_json::Value>,
}

impl IbkrOrder {
    pub fn avg_price_f64(&self) -> Option<f64> {
        match &self.avg_price {
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn parent_ref(&self) -> Option<String> {
        match &self.parent_id {
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveOrdersResponse {
    #[serde(default)]
    pub orders: Vec<IbkrOrder>,
}

/// Strike lists from `iserver/secdef/strikes`.
#[derive(Debug, Clone, Deserialize)]
pub struct IbkrStrikes {
    #[serde(default)]
    pub call: Vec<f64>,
    #[serde(default)]
    pub put: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_map_deserializes() {
        let raw = r#"{"USD": {"cashbalance": 10000.5, "netliquidationvalue": 12000.0,
                      "buyingpower": 40000.0, "currency": "USD"}}"#;
        let ledger: std::collections::HashMap<String, IbkrLedger> =
            serde_json::from_str(raw).unwrap();
        let usd = ledger.get("USD").unwrap();
        assert_eq!(usd.cash_balance, Some(10000.5));
        assert_eq!(usd.buying_power, Some(40000.0));
    }

    #[test]
    fn secdef_strike_accepts_number_or_string() {
        let a: SecdefInfo =
            serde_json::from_str(r#"{"conid": 1, "strike": 605.0, "right": "C"}"#).unwrap();
        let b: SecdefInfo =
            serde_json::from_str(r#"{"conid": 2, "strike": "605", "right": "C"}"#).unwrap();
        assert_eq!(a.strike_f64(), Some(605.0));
        assert_eq!(b.strike_f64(), Some(605.0));
    }

    #[test]
    fn submit_entry_distinguishes_question_from_result() {
        let question: OrderSubmitEntry = serde_json::from_str(
            r#"{"id": "abc123", "message": ["You are about to place a stop order"]}"#,
        )
        .unwrap();
        assert!(question.id.is_some());
        assert!(question.order_id.is_none());

        let placed: OrderSubmitEntry =
            serde_json::from_str(r#"{"order_id": "987654", "order_status": "Submitted"}"#).unwrap();
        assert_eq!(placed.order_id.as_deref(), Some("987654"));
    }

    #[test]
    fn live_order_parent_ref_handles_both_shapes() {
        let by_num: IbkrOrder = serde_json::from_str(r#"{"orderId": 2, "parentId": 1}"#).unwrap();
        let by_ref: IbkrOrder =
            serde_json::from_str(r#"{"orderId": 3, "parentId": "bkt-9-1700000000"}"#).unwrap();
        assert_eq!(by_num.parent_ref().as_deref(), Some("1"));
        assert_eq!(by_ref.parent_ref().as_deref(), Some("bkt-9-1700000000"));
    }
}
