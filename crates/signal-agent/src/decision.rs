use chrono::NaiveDate;
use llm_client::ChatResponse;
use serde::Deserialize;
use serde_json::{json, Value};
use signal_store::{Decision, Direction, ExecuteOrder, OrderSide, SkipCategory};

pub const MIN_DELAY_MINUTES: i64 = 5;
pub const MAX_DELAY_MINUTES: i64 = 240;
/// A signal is reanalyzed at most this many times before the model has to
/// commit to execute or skip.
pub const MAX_REANALYSIS_RETRIES: u32 = 2;

/// Schemas for the three decision tools. The model must call exactly one.
pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "skip_signal",
                "description": "Skip this signal and do not trade. Use when the signal has no actionable setup, the market is closed, the reward/risk is unfavorable, or confidence is too low.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "reason": {
                            "type": "string",
                            "description": "Clear reason for skipping"
                        },
                        "category": {
                            "type": "string",
                            "enum": ["no_signal", "market_closed", "bad_rr", "low_confidence",
                                     "timing", "position_exists", "other"],
                            "description": "Skip category for analytics"
                        }
                    },
                    "required": ["reason", "category"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "place_bracket_order",
                "description": "Execute this signal with a bracket order: limit entry plus linked take-profit and stop-loss. Specify the exact option contract and your bracket prices.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "ticker": {"type": "string", "description": "Underlying symbol, e.g. SPY"},
                        "expiry": {"type": "string", "description": "Option expiry date, YYYY-MM-DD"},
                        "strike": {"type": "number", "description": "Strike price"},
                        "direction": {"type": "string", "enum": ["CALL", "PUT"]},
                        "side": {"type": "string", "enum": ["BUY", "SELL"]},
                        "quantity": {"type": "integer", "minimum": 1,
                                     "description": "Number of contracts"},
                        "entry_price": {"type": "number", "description": "Limit entry price"},
                        "take_profit": {"type": "number", "description": "Take profit price"},
                        "stop_loss": {"type": "number", "description": "Stop loss price"}
                    },
                    "required": ["ticker", "expiry", "strike", "direction", "side",
                                 "quantity", "entry_price", "take_profit", "stop_loss"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "schedule_reanalysis",
                "description": "Schedule this signal for reanalysis after a delay. Use when entry timing will be valid later today (event release, market open settling). Do not use when the event is more than 4 hours away or the signal has already been reanalyzed twice.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "delay_minutes": {
                            "type": "integer",
                            "description": "Minutes to wait before reanalysis, between 5 and 240"
                        },
                        "reason": {"type": "string", "description": "Why scheduling for later"},
                        "question": {
                            "type": "string",
                            "description": "Question to answer on reanalysis"
                        },
                        "key_levels": {
                            "type": "object",
                            "description": "Key price levels to check on reanalysis",
                            "properties": {
                                "entry_price": {"type": "number"},
                                "target_price": {"type": "number"},
                                "stop_loss": {"type": "number"},
                                "underlying_price": {"type": "number"}
                            }
                        }
                    },
                    "required": ["delay_minutes", "reason", "question"]
                }
            }
        }),
    ]
}

#[derive(Deserialize)]
struct SkipArgs {
    reason: String,
    #[serde(default)]
    category: String,
}

#[derive(Deserialize)]
struct BracketArgs {
    ticker: String,
    expiry: String,
    strike: f64,
    direction: String,
    side: String,
    quantity: i64,
    entry_price: f64,
    take_profit: f64,
    stop_loss: f64,
}

#[derive(Deserialize)]
struct ScheduleArgs {
    delay_minutes: i64,
    reason: String,
    question: String,
    #[serde(default)]
    key_levels: Option<Value>,
}

fn format_error(detail: &str) -> Decision {
    Decision::Skip {
        reason: format!("ai_format_error: {detail}"),
        category: SkipCategory::Other,
    }
}

/// Convert the model's response into a Decision. This is the single place
/// tool calls are parsed; everything downstream pattern-matches.
///
/// Only the first tool call is honored; extras are logged and ignored. A
/// missing, unknown or malformed call becomes Skip(ai_format_error).
pub fn parse_decision(response: &ChatResponse) -> Decision {
    let Some(call) = response.tool_calls.first() else {
        tracing::warn!("model returned no tool call, auto-skip");
        return format_error("model returned no tool call");
    };

    if response.tool_calls.len() > 1 {
        let extras: Vec<&str> = response.tool_calls[1..]
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        tracing::warn!("ignoring {} extra tool call(s): {:?}", extras.len(), extras);
    }

    match call.name.as_str() {
        "skip_signal" => match serde_json::from_str::<SkipArgs>(&call.arguments) {
            Ok(args) => Decision::Skip {
                reason: args.reason,
                category: SkipCategory::parse(&args.category),
            },
            Err(e) => format_error(&format!("bad skip_signal arguments: {e}")),
        },
        "place_bracket_order" => match serde_json::from_str::<BracketArgs>(&call.arguments) {
            Ok(args) => parse_bracket(args),
            Err(e) => format_error(&format!("bad place_bracket_order arguments: {e}")),
        },
        "schedule_reanalysis" => match serde_json::from_str::<ScheduleArgs>(&call.arguments) {
            Ok(args) => parse_schedule(args),
            Err(e) => format_error(&format!("bad schedule_reanalysis arguments: {e}")),
        },
        unknown => {
            tracing::warn!("model called unknown tool: {unknown}");
            format_error(&format!("unknown tool: {unknown}"))
        }
    }
}

fn parse_bracket(args: BracketArgs) -> Decision {
    let Ok(expiry) = NaiveDate::parse_from_str(&args.expiry, "%Y-%m-%d") else {
        return format_error(&format!("unparseable expiry: {}", args.expiry));
    };
    let direction = match args.direction.as_str() {
        "CALL" => Direction::Call,
        "PUT" => Direction::Put,
        other => return format_error(&format!("unknown direction: {other}")),
    };
    let side = match args.side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return format_error(&format!("unknown side: {other}")),
    };
    if args.quantity < 1 {
        return format_error(&format!("quantity must be >= 1, got {}", args.quantity));
    }

    Decision::Execute {
        order: ExecuteOrder {
            ticker: args.ticker.to_ascii_uppercase(),
            expiry,
            strike: args.strike,
            direction,
            side,
            quantity: args.quantity as u32,
            entry_price: args.entry_price,
            take_profit: args.take_profit,
            stop_loss: args.stop_loss,
        },
    }
}

fn parse_schedule(args: ScheduleArgs) -> Decision {
    if !(MIN_DELAY_MINUTES..=MAX_DELAY_MINUTES).contains(&args.delay_minutes) {
        return format_error(&format!(
            "delay_minutes {} outside [{MIN_DELAY_MINUTES},{MAX_DELAY_MINUTES}]",
            args.delay_minutes
        ));
    }
    Decision::Delay {
        request: signal_store::decision::DelayRequest {
            delay_minutes: args.delay_minutes,
            reason: args.reason,
            question: args.question,
            key_levels: args.key_levels,
        },
    }
}

/// Bracket sanity check. For BUY entries the stop must sit below the
/// entry and the target above; mirrored for SELL entries. Reward/risk is
/// the model's responsibility, ordering is not.
pub fn validate_bracket(order: &ExecuteOrder) -> Result<(), String> {
    let ok = match order.side {
        OrderSide::Buy => order.stop_loss < order.entry_price && order.entry_price < order.take_profit,
        OrderSide::Sell => order.take_profit < order.entry_price && order.entry_price < order.stop_loss,
    };
    if ok {
        Ok(())
    } else {
        Err(format!(
            "invalid bracket for {} entry: stop {:.2}, entry {:.2}, target {:.2}",
            order.side.as_str(),
            order.stop_loss,
            order.entry_price,
            order.take_profit
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_client::ToolCall;

    fn response_with(calls: Vec<(&str, &str)>) -> ChatResponse {
        ChatResponse {
            content: None,
            tool_calls: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, args))| ToolCall {
                    id: format!("call_{i}"),
                    name: name.to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
            model: "test-model".into(),
            usage: None,
            request_id: Some("req-1".into()),
        }
    }

    #[test]
    fn no_tool_call_is_format_error() {
        let response = ChatResponse {
            content: Some("I would wait here.".into()),
            tool_calls: vec![],
            model: "m".into(),
            usage: None,
            request_id: None,
        };
        match parse_decision(&response) {
            Decision::Skip { reason, category } => {
                assert!(reason.starts_with("ai_format_error"));
                assert_eq!(category, SkipCategory::Other);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tool_is_format_error() {
        let response = response_with(vec![("buy_everything", "{}")]);
        match parse_decision(&response) {
            Decision::Skip { reason, .. } => assert!(reason.contains("unknown tool")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn skip_tool_parses_category() {
        let response = response_with(vec![(
            "skip_signal",
            r#"{"reason": "market is closed", "category": "market_closed"}"#,
        )]);
        match parse_decision(&response) {
            Decision::Skip { reason, category } => {
                assert_eq!(reason, "market is closed");
                assert_eq!(category, SkipCategory::MarketClosed);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn bracket_tool_parses_to_execute() {
        let response = response_with(vec![(
            "place_bracket_order",
            r#"{"ticker": "spy", "expiry": "2024-12-09", "strike": 605, "direction": "CALL",
                "side": "BUY", "quantity": 1, "entry_price": 1.77, "take_profit": 2.50,
                "stop_loss": 1.20}"#,
        )]);
        match parse_decision(&response) {
            Decision::Execute { order } => {
                assert_eq!(order.ticker, "SPY");
                assert_eq!(order.direction, Direction::Call);
                assert_eq!(order.quantity, 1);
                assert_eq!(order.entry_price, 1.77);
            }
            other => panic!("expected execute, got {other:?}"),
        }
    }

    #[test]
    fn only_first_tool_call_is_honored() {
        let response = response_with(vec![
            (
                "skip_signal",
                r#"{"reason": "first wins", "category": "timing"}"#,
            ),
            (
                "place_bracket_order",
                r#"{"ticker": "SPY", "expiry": "2024-12-09", "strike": 605, "direction": "CALL",
                    "side": "BUY", "quantity": 1, "entry_price": 1.77, "take_profit": 2.5,
                    "stop_loss": 1.2}"#,
            ),
        ]);
        match parse_decision(&response) {
            Decision::Skip { reason, .. } => assert_eq!(reason, "first wins"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn schedule_inside_bounds_is_delay() {
        let response = response_with(vec![(
            "schedule_reanalysis",
            r#"{"delay_minutes": 30, "reason": "await PCE", "question": "valid?"}"#,
        )]);
        match parse_decision(&response) {
            Decision::Delay { request } => {
                assert_eq!(request.delay_minutes, 30);
                assert_eq!(request.question, "valid?");
            }
            other => panic!("expected delay, got {other:?}"),
        }
    }

    #[test]
    fn delay_outside_bounds_is_format_error() {
        for minutes in [2, 300] {
            let args =
                format!(r#"{{"delay_minutes": {minutes}, "reason": "r", "question": "q"}}"#);
            let response = response_with(vec![("schedule_reanalysis", args.as_str())]);
            match parse_decision(&response) {
                Decision::Skip { reason, category } => {
                    assert!(reason.starts_with("ai_format_error"), "got: {reason}");
                    assert_eq!(category, SkipCategory::Other);
                }
                other => panic!("expected skip, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_arguments_are_format_errors() {
        let response = response_with(vec![("place_bracket_order", r#"{"ticker": 42}"#)]);
        match parse_decision(&response) {
            Decision::Skip { reason, .. } => assert!(reason.starts_with("ai_format_error")),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    fn order(side: OrderSide, stop: f64, entry: f64, target: f64) -> ExecuteOrder {
        ExecuteOrder {
            ticker: "SPY".into(),
            expiry: NaiveDate::from_ymd_opt(2024, 12, 9).unwrap(),
            strike: 605.0,
            direction: Direction::Call,
            side,
            quantity: 1,
            entry_price: entry,
            take_profit: target,
            stop_loss: stop,
        }
    }

    #[test]
    fn buy_bracket_requires_stop_below_entry_below_target() {
        assert!(validate_bracket(&order(OrderSide::Buy, 1.2, 1.77, 2.5)).is_ok());
        assert!(validate_bracket(&order(OrderSide::Buy, 1.2, 1.77, 1.5)).is_err());
        assert!(validate_bracket(&order(OrderSide::Buy, 2.0, 1.77, 2.5)).is_err());
    }

    #[test]
    fn sell_bracket_is_mirrored() {
        assert!(validate_bracket(&order(OrderSide::Sell, 2.5, 1.77, 1.2)).is_ok());
        assert!(validate_bracket(&order(OrderSide::Sell, 1.2, 1.77, 2.5)).is_err());
    }
}
