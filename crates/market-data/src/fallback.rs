use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

use crate::{MarketDataError, MarketDataResult, OptionChain, OptionQuote};

const BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Index symbols need a caret prefix on the fallback source.
const INDEX_SYMBOLS: &[&str] = &["SPX", "NDX", "RUT", "VIX", "DJX"];

/// Free delayed-quote source used when the gateway has no market-data
/// subscription.
pub struct FallbackClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    result: Vec<ChartEntry>,
}

#[derive(Debug, Deserialize)]
struct ChartEntry {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OptionsResponse {
    #[serde(rename = "optionChain")]
    option_chain: OptionsResult,
}

#[derive(Debug, Deserialize)]
struct OptionsResult {
    #[serde(default)]
    result: Vec<OptionsEntry>,
}

#[derive(Debug, Deserialize)]
struct OptionsEntry {
    #[serde(rename = "expirationDates", default)]
    expiration_dates: Vec<i64>,
    quote: Option<OptionsQuoteMeta>,
    #[serde(default)]
    options: Vec<OptionsSlice>,
}

#[derive(Debug, Deserialize)]
struct OptionsQuoteMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OptionsSlice {
    #[serde(default)]
    calls: Vec<OptionContractRaw>,
    #[serde(default)]
    puts: Vec<OptionContractRaw>,
}

#[derive(Debug, Deserialize)]
struct OptionContractRaw {
    strike: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    #[serde(rename = "lastPrice")]
    last_price: Option<f64>,
    volume: Option<i64>,
    #[serde(rename = "openInterest")]
    open_interest: Option<i64>,
    #[serde(rename = "impliedVolatility")]
    implied_volatility: Option<f64>,
    #[serde(rename = "inTheMoney")]
    in_the_money: Option<bool>,
}

impl OptionContractRaw {
    fn to_quote(&self) -> OptionQuote {
        let bid = self.bid.unwrap_or(0.0);
        let ask = self.ask.unwrap_or(0.0);
        OptionQuote {
            strike: self.strike.unwrap_or(0.0),
            bid,
            ask,
            last: self.last_price.unwrap_or(0.0),
            mid: (bid + ask) / 2.0,
            volume: self.volume.unwrap_or(0),
            open_interest: self.open_interest.unwrap_or(0),
            implied_volatility: self.implied_volatility.unwrap_or(0.0),
            in_the_money: self.in_the_money.unwrap_or(false),
        }
    }
}

impl FallbackClient {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn normalize(symbol: &str) -> String {
        let upper = symbol.to_ascii_uppercase();
        if INDEX_SYMBOLS.contains(&upper.as_str()) {
            format!("^{upper}")
        } else {
            upper
        }
    }

    pub async fn quote(&self, symbol: &str) -> MarketDataResult<f64> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=1d&interval=1d",
            self.base_url,
            Self::normalize(symbol)
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(MarketDataError::Upstream(format!(
                "quote fetch for {symbol} returned {}",
                resp.status()
            )));
        }

        let body: ChartResponse = resp.json().await?;
        body.chart
            .result
            .first()
            .and_then(|r| r.meta.regular_market_price)
            .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))
    }

    pub async fn option_chain(
        &self,
        symbol: &str,
        expiry: Option<NaiveDate>,
    ) -> MarketDataResult<OptionChain> {
        let mut url = format!(
            "{}/v7/finance/options/{}",
            self.base_url,
            Self::normalize(symbol)
        );
        if let Some(expiry) = expiry {
            let ts = expiry
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp())
                .unwrap_or_default();
            url.push_str(&format!("?date={ts}"));
        }

        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(MarketDataError::Upstream(format!(
                "option chain fetch for {symbol} returned {}",
                resp.status()
            )));
        }

        let body: OptionsResponse = resp.json().await?;
        let entry = body
            .option_chain
            .result
            .into_iter()
            .next()
            .ok_or_else(|| MarketDataError::NoData(symbol.to_string()))?;

        let underlying_price = entry
            .quote
            .as_ref()
            .and_then(|q| q.regular_market_price)
            .unwrap_or(0.0);

        let expiries = entry
            .expiration_dates
            .iter()
            .filter_map(|ts| chrono::DateTime::from_timestamp(*ts, 0))
            .map(|dt| dt.date_naive().to_string())
            .collect();

        let (calls, puts) = entry
            .options
            .first()
            .map(|slice| {
                (
                    slice.calls.iter().map(OptionContractRaw::to_quote).collect(),
                    slice.puts.iter().map(OptionContractRaw::to_quote).collect(),
                )
            })
            .unwrap_or_default();

        Ok(OptionChain {
            symbol: symbol.to_ascii_uppercase(),
            underlying_price,
            expiries,
            calls,
            puts,
        })
    }
}

impl Default for FallbackClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_symbols_get_caret_prefix() {
        assert_eq!(FallbackClient::normalize("vix"), "^VIX");
        assert_eq!(FallbackClient::normalize("SPY"), "SPY");
    }

    #[test]
    fn contract_mid_is_bid_ask_midpoint() {
        let raw = OptionContractRaw {
            strike: Some(605.0),
            bid: Some(1.7),
            ask: Some(1.84),
            last_price: Some(1.77),
            volume: Some(1200),
            open_interest: Some(5400),
            implied_volatility: Some(0.22),
            in_the_money: Some(false),
        };
        let quote = raw.to_quote();
        assert!((quote.mid - 1.77).abs() < 1e-9);
        assert_eq!(quote.volume, 1200);
        assert!(!quote.in_the_money);
    }

    #[test]
    fn chain_response_parses() {
        let raw = r#"{"optionChain": {"result": [{
            "expirationDates": [1733702400],
            "quote": {"regularMarketPrice": 604.21},
            "options": [{
                "calls": [{"strike": 605.0, "bid": 1.7, "ask": 1.84, "lastPrice": 1.77,
                           "volume": 100, "openInterest": 400, "impliedVolatility": 0.2,
                           "inTheMoney": false}],
                "puts": []
            }]
        }]}}"#;
        let body: OptionsResponse = serde_json::from_str(raw).unwrap();
        let entry = &body.option_chain.result[0];
        assert_eq!(entry.options[0].calls.len(), 1);
    }
}
