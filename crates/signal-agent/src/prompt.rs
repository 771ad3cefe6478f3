use anyhow::{Context, Result};
use minijinja::Environment;
use serde_json::json;
use signal_store::{PromptStore, RuntimeSettings, Signal};
use work_queue::ScheduledContext;

use crate::prefetch::PrefetchBundle;

/// Renders the user prompt from the stored template with the signal and
/// prefetch bundle as variables. The system prompt is loaded separately
/// as plain text. Rendering is deterministic: the same inputs produce
/// byte-identical output.
pub struct PromptAssembler {
    prompts: PromptStore,
}

fn usd(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("${v:.2}"),
        None => "NOT SPECIFIED".to_string(),
    }
}

fn pct(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.0}%", v * 100.0),
        None => "NOT SPECIFIED".to_string(),
    }
}

impl PromptAssembler {
    pub fn new(prompts: PromptStore) -> Self {
        Self { prompts }
    }

    /// Render (system, user). Any template error is fatal for the current
    /// task; the processor turns it into a Skip(template_error).
    pub async fn render(
        &self,
        signal: &Signal,
        bundle: &PrefetchBundle,
        scheduled: Option<&ScheduledContext>,
        settings: &RuntimeSettings,
    ) -> Result<(String, String)> {
        let system = self.prompts.system_prompt().await;
        let template_src = self.prompts.user_template().await;

        let user = render_user(&template_src, signal, bundle, scheduled, settings)?;
        Ok((system, user))
    }
}

pub fn render_user(
    template_src: &str,
    signal: &Signal,
    bundle: &PrefetchBundle,
    scheduled: Option<&ScheduledContext>,
    settings: &RuntimeSettings,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_filter("usd", usd);
    env.add_filter("pct", pct);

    let mut ctx = bundle.to_context();
    if let Some(map) = ctx.as_object_mut() {
        map.insert("signal".into(), signal.to_template_value());
        map.insert(
            "config".into(),
            serde_json::to_value(settings).unwrap_or_default(),
        );
        map.insert(
            "reanalysis".into(),
            scheduled
                .map(|s| serde_json::to_value(s).unwrap_or_default())
                .unwrap_or(json!(null)),
        );
    }

    let template = env
        .template_from_str(template_src)
        .context("user template failed to compile")?;
    let rendered = template
        .render(minijinja::Value::from_serialize(&ctx))
        .context("user template failed to render")?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signal_store::prompts::DEFAULT_USER_TEMPLATE;
    use signal_store::SignalMessage;

    fn sample_signal() -> Signal {
        let mut signal = Signal {
            thread_id: "t1".into(),
            thread_name: "SPY 2024-12-09".into(),
            messages: vec![SignalMessage {
                content: "BUY CALLS\nStrike: $605.00\nEntry Price: $1.77\nTarget 1: $2.50\n\
                          Stop Loss: $1.20\nConfidence: 65%\nExpiry: 2024-12-09"
                    .into(),
                timestamp: "2024-12-09T09:45:00".into(),
            }],
            ..Default::default()
        };
        signal.parse_content();
        signal
    }

    fn full_bundle() -> PrefetchBundle {
        PrefetchBundle {
            time: json!({
                "success": true, "time_est": "10:15:00", "date": "2024-12-09",
                "day_of_week": "Monday", "is_market_open": true,
                "market_status": "open", "status_reason": "market_open",
                "opens_at": null, "closes_at": "16:00 ET",
            }),
            account: json!({
                "success": true, "available": 25000.0, "buying_power": 100000.0,
                "net_liquidation": 26000.0,
            }),
            option_chain: json!({
                "success": true, "ticker": "SPY", "current_price": 604.2,
                "available_expiries": ["2024-12-09", "2024-12-10"],
                "calls": [{"strike": 605.0, "bid": 1.7, "ask": 1.84, "mid": 1.77,
                           "volume": 1200, "open_interest": 5400, "in_the_money": false}],
                "puts": [{"strike": 605.0, "bid": 2.4, "ask": 2.5, "mid": 2.45,
                          "volume": 900, "open_interest": 4100, "in_the_money": true}],
            }),
            positions: json!({"success": true, "count": 1, "tickers": ["QQQ"], "items": []}),
            vix: json!({"success": true, "value": 14.2, "level": "low"}),
        }
    }

    fn degraded_bundle() -> PrefetchBundle {
        let gone = |kind: &str| {
            json!({"success": false, "error": "gateway unreachable",
                   "unavailable": {"kind": kind, "reason": "gateway unreachable"}})
        };
        PrefetchBundle {
            time: json!({
                "success": true, "time_est": "10:15:00", "date": "2024-12-09",
                "day_of_week": "Monday", "is_market_open": true,
                "market_status": "open", "status_reason": "market_open",
            }),
            account: gone("account"),
            option_chain: gone("option_chain"),
            positions: gone("positions"),
            vix: gone("vix"),
        }
    }

    #[test]
    fn default_template_includes_required_sections() {
        let settings = RuntimeSettings::default();
        let rendered = render_user(
            DEFAULT_USER_TEMPLATE,
            &sample_signal(),
            &full_bundle(),
            None,
            &settings,
        )
        .unwrap();

        assert!(rendered.contains("SPY"));
        assert!(rendered.contains("BUY CALLS"));
        assert!(rendered.contains("$605.00"));
        assert!(rendered.contains("65%"));
        assert!(rendered.contains("10:15:00"));
        assert!(rendered.contains("$604.20"));
        assert!(rendered.contains("$25000.00"));
        assert!(rendered.contains("QQQ"));
        assert!(rendered.contains("14.2"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let settings = RuntimeSettings::default();
        let a = render_user(DEFAULT_USER_TEMPLATE, &sample_signal(), &full_bundle(), None, &settings)
            .unwrap();
        let b = render_user(DEFAULT_USER_TEMPLATE, &sample_signal(), &full_bundle(), None, &settings)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unavailable_sections_render_without_error() {
        let settings = RuntimeSettings::default();
        let rendered = render_user(
            DEFAULT_USER_TEMPLATE,
            &sample_signal(),
            &degraded_bundle(),
            None,
            &settings,
        )
        .unwrap();
        assert!(rendered.contains("unavailable: gateway unreachable"));
    }

    #[test]
    fn missing_parsed_fields_render_as_not_specified() {
        let settings = RuntimeSettings::default();
        let mut signal = sample_signal();
        signal.strike = None;
        signal.entry_price = None;
        signal.confidence = None;
        let rendered =
            render_user(DEFAULT_USER_TEMPLATE, &signal, &degraded_bundle(), None, &settings)
                .unwrap();
        assert!(rendered.contains("NOT SPECIFIED"));
    }

    #[test]
    fn reanalysis_section_appears_for_scheduled_tasks() {
        let settings = RuntimeSettings::default();
        let context = ScheduledContext {
            retry_count: 1,
            delay_minutes: 30,
            delay_reason: "waiting for PCE".into(),
            delay_question: "has the market reacted?".into(),
            ..Default::default()
        };
        let rendered = render_user(
            DEFAULT_USER_TEMPLATE,
            &sample_signal(),
            &full_bundle(),
            Some(&context),
            &settings,
        )
        .unwrap();
        assert!(rendered.contains("SCHEDULED REANALYSIS (attempt #1)"));
        assert!(rendered.contains("has the market reacted?"));

        let fresh = render_user(
            DEFAULT_USER_TEMPLATE,
            &sample_signal(),
            &full_bundle(),
            None,
            &settings,
        )
        .unwrap();
        assert!(!fresh.contains("SCHEDULED REANALYSIS"));
    }

    #[test]
    fn broken_template_is_an_error() {
        let settings = RuntimeSettings::default();
        let result = render_user(
            "{% for x in %}",
            &sample_signal(),
            &full_bundle(),
            None,
            &settings,
        );
        assert!(result.is_err());
    }
}
