use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static RE_CONFIDENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Confidence:\s*(\d+)%").unwrap());
static RE_STRIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Strike(?:\s*Focus)?:\s*\$?([\d.]+)").unwrap());
static RE_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Entry(?:\s*(?:Price|Range))?:\s*\$?([\d.]+)").unwrap());
static RE_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:Target\s*1|Profit\s*Target):\s*\$?([\d.]+)").unwrap());
static RE_STOP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Stop\s*Loss:\s*\$?([\d.]+)").unwrap());
static RE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:Position\s*)?Size:\s*([\d.]+)%?").unwrap());
static RE_EXPIRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Expiry:\s*([\d-]+)").unwrap());

/// One message from the source thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

/// A queued trading signal. Written by the upstream collector; the core
/// only ever appends the decision envelope.
///
/// Parsed fields are best-effort: absence is valid and is surfaced to the
/// model as NOT SPECIFIED by the prompt template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signal {
    pub thread_id: String,
    #[serde(default)]
    pub thread_name: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<SignalMessage>,

    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub target_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub position_size: Option<f64>,
}

impl Signal {
    pub fn full_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Fill parsed fields from the message stream. Only overwrites fields
    /// that are still unset, so upstream-provided values win.
    pub fn parse_content(&mut self) {
        let content = self.full_content();

        if self.ticker.is_none() {
            // Thread names look like "SPY 2025-11-30".
            if let Some(first) = self.thread_name.split_whitespace().next() {
                if !first.is_empty() && first.chars().all(|c| c.is_ascii_alphabetic()) {
                    self.ticker = Some(first.to_ascii_uppercase());
                }
            }
        }

        if self.direction.is_none() {
            let upper = content.to_ascii_uppercase();
            if upper.contains("BUY CALLS") || upper.contains("DIRECTION: CALL") {
                self.direction = Some("CALL".to_string());
            } else if upper.contains("BUY PUTS") || upper.contains("DIRECTION: PUT") {
                self.direction = Some("PUT".to_string());
            } else if upper.contains("SELL") {
                self.direction = Some("SELL".to_string());
            }
        }

        if self.confidence.is_none() {
            self.confidence = capture_f64(&RE_CONFIDENCE, &content).map(|v| v / 100.0);
        }
        if self.strike.is_none() {
            self.strike = capture_f64(&RE_STRIKE, &content);
        }
        if self.entry_price.is_none() {
            self.entry_price = capture_f64(&RE_ENTRY, &content);
        }
        if self.target_price.is_none() {
            self.target_price = capture_f64(&RE_TARGET, &content);
        }
        if self.stop_loss.is_none() {
            self.stop_loss = capture_f64(&RE_STOP, &content);
        }
        if self.position_size.is_none() {
            self.position_size = capture_f64(&RE_SIZE, &content).map(|v| v / 100.0);
        }
        if self.expiry.is_none() {
            self.expiry = RE_EXPIRY
                .captures(&content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
        }
    }

    /// Template view: the signal fields plus the concatenated content.
    pub fn to_template_value(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "full_content".to_string(),
                serde_json::Value::String(self.full_content()),
            );
        }
        value
    }
}

fn capture_f64(re: &Regex, content: &str) -> Option<f64> {
    re.captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal_with_content(thread_name: &str, content: &str) -> Signal {
        let mut signal = Signal {
            thread_id: "t1".to_string(),
            thread_name: thread_name.to_string(),
            messages: vec![SignalMessage {
                content: content.to_string(),
                timestamp: "2024-12-09T09:45:00".to_string(),
            }],
            ..Default::default()
        };
        signal.parse_content();
        signal
    }

    #[test]
    fn parses_ticker_from_thread_name() {
        let signal = signal_with_content("SPY 2024-12-09", "some content");
        assert_eq!(signal.ticker.as_deref(), Some("SPY"));
    }

    #[test]
    fn parses_numeric_fields() {
        let signal = signal_with_content(
            "SPY 0DTE",
            "BUY CALLS\nStrike: $605.00\nEntry Price: $1.77\nTarget 1: $2.50\n\
             Stop Loss: $1.20\nConfidence: 65%\nExpiry: 2024-12-09",
        );
        assert_eq!(signal.direction.as_deref(), Some("CALL"));
        assert_eq!(signal.strike, Some(605.0));
        assert_eq!(signal.entry_price, Some(1.77));
        assert_eq!(signal.target_price, Some(2.5));
        assert_eq!(signal.stop_loss, Some(1.2));
        assert_eq!(signal.confidence, Some(0.65));
        assert_eq!(signal.expiry.as_deref(), Some("2024-12-09"));
    }

    #[test]
    fn absent_fields_stay_none() {
        let signal = signal_with_content("QQQ watch", "general market commentary, no setup");
        assert!(signal.strike.is_none());
        assert!(signal.entry_price.is_none());
        assert!(signal.confidence.is_none());
    }

    #[test]
    fn upstream_fields_are_not_overwritten() {
        let mut signal = Signal {
            thread_id: "t1".to_string(),
            thread_name: "SPY 0DTE".to_string(),
            ticker: Some("QQQ".to_string()),
            messages: vec![SignalMessage {
                content: "Entry: $3.00".to_string(),
                timestamp: String::new(),
            }],
            ..Default::default()
        };
        signal.parse_content();
        assert_eq!(signal.ticker.as_deref(), Some("QQQ"));
        assert_eq!(signal.entry_price, Some(3.0));
    }

    #[test]
    fn template_value_includes_full_content() {
        let signal = signal_with_content("SPY 0DTE", "line one");
        let value = signal.to_template_value();
        assert_eq!(value["full_content"], "line one");
        assert_eq!(value["ticker"], "SPY");
    }
}
