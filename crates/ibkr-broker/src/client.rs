use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde_json::json;

use crate::models::*;
use crate::symbols::{ibkr_month, maturity_date};
use crate::{BrokerError, BrokerResult};

/// Highest number of confirmation questions the gateway is expected to ask
/// per placement: price percentage constraint, order value limit, missing
/// market data, stop order risks.
const MAX_CONFIRM_ROUNDS: usize = 4;

/// A bracket to submit: parent limit entry plus take-profit limit and
/// stop-loss stop children linked through the parent's client order id.
#[derive(Debug, Clone)]
pub struct BracketOrder {
    pub conid: i64,
    pub side: String,
    pub quantity: u32,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
}

#[derive(Debug, Clone)]
pub struct BracketPlacement {
    /// Broker-issued id of the parent order.
    pub order_id: String,
    /// Client order id linking the children to the parent.
    pub client_order_id: String,
}

/// Interactive Brokers client using the Client Portal API.
///
/// Requires the Client Portal Gateway (IBeam) to be running. Not
/// thread-safe per connection: with more than one worker, each worker
/// owns its own client.
pub struct IbkrClient {
    client: Client,
    gateway_url: String,
    account_id: String,
}

impl IbkrClient {
    pub fn new(gateway_url: String, account_id: String) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .danger_accept_invalid_certs(true) // gateway uses self-signed certs
            .build()
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            account_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/api/{}", self.gateway_url, path)
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Session keep-alive; doubles as the health check.
    pub async fn check_health(&self) -> bool {
        match self.client.post(self.url("tickle")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("gateway health check failed: {e}");
                false
            }
        }
    }

    pub async fn get_accounts(&self) -> BrokerResult<Vec<IbkrAccount>> {
        let resp = self.client.get(self.url("portfolio/accounts")).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "accounts listing failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp.json().await?)
    }

    /// USD (or BASE) ledger summary for the account.
    pub async fn get_ledger(&self) -> BrokerResult<IbkrLedger> {
        let url = self.url(&format!("portfolio/{}/ledger", self.account_id));
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "ledger fetch failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }

        let ledger: std::collections::HashMap<String, IbkrLedger> = resp.json().await?;
        ledger
            .get("USD")
            .or_else(|| ledger.get("BASE"))
            .cloned()
            .ok_or_else(|| BrokerError::InvalidResponse("ledger has no USD or BASE entry".into()))
    }

    pub async fn get_positions(&self) -> BrokerResult<Vec<IbkrPosition>> {
        let url = self.url(&format!("portfolio/{}/positions/0", self.account_id));
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "positions fetch failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Resolve a stock symbol to its contract.
    pub async fn search_contract(&self, symbol: &str) -> BrokerResult<IbkrContract> {
        let url = self.url("iserver/secdef/search");
        let body = json!({ "symbol": symbol, "secType": "STK" });
        let resp = self.client.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "contract search failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }

        let contracts: Vec<IbkrContract> = resp.json().await?;
        contracts
            .into_iter()
            .find(|c| c.symbol.as_deref() == Some(symbol))
            .ok_or_else(|| BrokerError::ContractNotFound(symbol.to_string()))
    }

    pub async fn search_strikes(&self, conid: i64, month: &str) -> BrokerResult<IbkrStrikes> {
        let url = self.url("iserver/secdef/strikes");
        let resp = self
            .client
            .get(url)
            .query(&[
                ("conid", conid.to_string()),
                ("sectype", "OPT".to_string()),
                ("month", month.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "strike search failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp.json().await?)
    }

    pub async fn secdef_info(
        &self,
        conid: i64,
        month: &str,
        strike: f64,
        right: char,
    ) -> BrokerResult<Vec<SecdefInfo>> {
        let url = self.url("iserver/secdef/info");
        let resp = self
            .client
            .get(url)
            .query(&[
                ("conid", conid.to_string()),
                ("sectype", "OPT".to_string()),
                ("month", month.to_string()),
                ("strike", strike.to_string()),
                ("right", right.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "secdef info failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Resolve the exact option contract id for (ticker, expiry, strike,
    /// right): underlying lookup first, then secdef info filtered to the
    /// exact month, strike and right.
    pub async fn resolve_option_conid(
        &self,
        ticker: &str,
        expiry: NaiveDate,
        strike: f64,
        right: char,
    ) -> BrokerResult<i64> {
        let underlying = self.search_contract(ticker).await?;
        let month = ibkr_month(expiry);
        let maturity = maturity_date(expiry);

        let candidates = self
            .secdef_info(underlying.contract_id, &month, strike, right)
            .await?;

        let right_str = right.to_ascii_uppercase().to_string();
        candidates
            .into_iter()
            .find(|c| {
                c.maturity_date.as_deref() == Some(maturity.as_str())
                    && c.right.as_deref() == Some(right_str.as_str())
                    && c.strike_f64()
                        .map(|s| (s - strike).abs() < 1e-6)
                        .unwrap_or(false)
            })
            .map(|c| c.contract_id)
            .ok_or_else(|| {
                BrokerError::ContractNotFound(format!("{ticker} {maturity} {strike}{right}"))
            })
    }

    /// Live market data snapshot for a contract. Field 31 = last price,
    /// 84 = bid, 86 = ask. The first request may come back empty while
    /// the gateway warms the subscription; callers retry.
    pub async fn market_snapshot(
        &self,
        conid: i64,
        fields: &[&str],
    ) -> BrokerResult<serde_json::Value> {
        let url = self.url("iserver/marketdata/snapshot");
        let resp = self
            .client
            .get(url)
            .query(&[
                ("conids", conid.to_string()),
                ("fields", fields.join(",")),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "snapshot failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }

        let rows: Vec<serde_json::Value> = resp.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BrokerError::InvalidResponse("empty snapshot response".into()))
    }

    /// Place a bracket: parent LMT entry and two GTC children (LMT take
    /// profit, STP stop loss) referencing the parent's client order id.
    /// Gateway confirmation questions are acknowledged affirmatively.
    pub async fn place_bracket(&self, bracket: &BracketOrder) -> BrokerResult<BracketPlacement> {
        let tag = format!(
            "bkt-{}-{}",
            bracket.conid,
            chrono::Utc::now().timestamp_millis()
        );
        let exit_side = if bracket.side == "BUY" { "SELL" } else { "BUY" };

        let body = json!({
            "orders": [
                {
                    "conid": bracket.conid,
                    "orderType": "LMT",
                    "side": bracket.side,
                    "quantity": bracket.quantity,
                    "price": bracket.entry_price,
                    "tif": "DAY",
                    "cOID": tag,
                },
                {
                    "conid": bracket.conid,
                    "orderType": "LMT",
                    "side": exit_side,
                    "quantity": bracket.quantity,
                    "price": bracket.take_profit,
                    "tif": "GTC",
                    "parentId": tag,
                },
                {
                    "conid": bracket.conid,
                    "orderType": "STP",
                    "side": exit_side,
                    "quantity": bracket.quantity,
                    "price": bracket.stop_loss,
                    "tif": "GTC",
                    "parentId": tag,
                },
            ]
        });

        let url = self.url(&format!("iserver/account/{}/orders", self.account_id));
        let resp = self.client.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "order submission failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }

        let mut entries: Vec<OrderSubmitEntry> = resp.json().await?;

        // The gateway interposes confirmation questions (price percentage
        // constraint, order value limit, missing market data, stop order
        // risks); each is acknowledged until order ids come back.
        for _ in 0..MAX_CONFIRM_ROUNDS {
            let question = entries
                .iter()
                .find(|e| e.id.is_some() && e.order_id.is_none())
                .map(|e| (e.id.clone().unwrap_or_default(), e.message.join(" | ")));
            let Some((reply_id, message)) = question else {
                break;
            };
            tracing::info!("confirming gateway question {reply_id}: {message}");

            let url = self.url(&format!("iserver/reply/{reply_id}"));
            let resp = self
                .client
                .post(url)
                .json(&json!({ "confirmed": true }))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(BrokerError::Rejected(format!(
                    "order confirmation failed: {}",
                    resp.text().await.unwrap_or_default()
                )));
            }
            entries = resp.json().await?;
        }

        let order_id = entries
            .iter()
            .find_map(|e| e.order_id.clone())
            .ok_or_else(|| {
                BrokerError::InvalidResponse("no order id in placement response".into())
            })?;

        tracing::info!(
            conid = bracket.conid,
            side = %bracket.side,
            quantity = bracket.quantity,
            "bracket placed: entry {:.2}, tp {:.2}, sl {:.2} (order {order_id})",
            bracket.entry_price,
            bracket.take_profit,
            bracket.stop_loss
        );

        Ok(BracketPlacement {
            order_id,
            client_order_id: tag,
        })
    }

    pub async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let url = self.url(&format!(
            "iserver/account/{}/order/{}",
            self.account_id, order_id
        ));
        let resp = self.client.delete(url).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "cancel failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        tracing::info!("order {order_id} cancelled");
        Ok(())
    }

    pub async fn live_orders(&self) -> BrokerResult<Vec<IbkrOrder>> {
        let resp = self.client.get(self.url("iserver/account/orders")).send().await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Rejected(format!(
                "live orders fetch failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        let body: LiveOrdersResponse = resp.json().await?;
        Ok(body.orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Needs a running Client Portal gateway
    async fn tickle_round_trip() {
        let client = IbkrClient::new(
            std::env::var("IBEAM_URL").unwrap_or_else(|_| "https://localhost:5000".into()),
            std::env::var("IB_ACCOUNT_ID").unwrap_or_default(),
        )
        .unwrap();
        assert!(client.check_health().await);
    }

    #[test]
    fn gateway_urls_are_versioned() {
        let client = IbkrClient::new("https://localhost:5000/".into(), "DU111".into()).unwrap();
        assert_eq!(
            client.url("portfolio/DU111/ledger"),
            "https://localhost:5000/v1/api/portfolio/DU111/ledger"
        );
    }
}
