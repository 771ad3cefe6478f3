use signal_store::{RuntimeSettings, Signal, SkipCategory};

/// Signals with no parsed ticker still pass TickerPresent when there is
/// enough raw content for the model to work with.
const MIN_CONTENT_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pass,
    Skip { reason: String, category: SkipCategory },
}

/// Facts gathered by the processor before the chain runs, so every check
/// stays a pure function. Live-only fields are `None` in dry-run.
#[derive(Debug, Clone, Default)]
pub struct CheckContext {
    pub live: bool,
    pub vix: Option<f64>,
    pub open_position_count: Option<usize>,
    /// Tickers with an open broker position or an open trade record.
    pub held_tickers: Vec<String>,
}

type CheckFn = fn(&Signal, &RuntimeSettings, &CheckContext) -> Outcome;

pub struct Check {
    pub name: &'static str,
    pub live_only: bool,
    pub run: CheckFn,
}

/// The ordered chain. Order matters: the first non-Pass short-circuits the
/// rest and becomes the final decision without any LLM call, so cheap and
/// absolute checks come first.
pub fn chain() -> &'static [Check] {
    &[
        Check { name: "emergency_stop", live_only: false, run: emergency_stop },
        Check { name: "ticker_present", live_only: false, run: ticker_present },
        Check { name: "whitelist", live_only: false, run: whitelist },
        Check { name: "blacklist", live_only: false, run: blacklist },
        Check { name: "min_confidence", live_only: false, run: min_confidence },
        Check { name: "vix_ceiling", live_only: true, run: vix_ceiling },
        Check { name: "max_positions", live_only: true, run: max_positions },
        Check { name: "duplicate_position", live_only: true, run: duplicate_position },
    ]
}

/// Run the chain; live-only checks are skipped entirely in dry-run.
pub fn run_chain(signal: &Signal, settings: &RuntimeSettings, ctx: &CheckContext) -> Outcome {
    for check in chain() {
        if check.live_only && !ctx.live {
            tracing::debug!("skipping {} (live mode only)", check.name);
            continue;
        }
        let outcome = (check.run)(signal, settings, ctx);
        if let Outcome::Skip { reason, .. } = &outcome {
            tracing::info!("precondition {} failed: {reason}", check.name);
            return outcome;
        }
    }
    Outcome::Pass
}

fn emergency_stop(_signal: &Signal, settings: &RuntimeSettings, _ctx: &CheckContext) -> Outcome {
    if settings.emergency_stop {
        Outcome::Skip {
            reason: "emergency stop is active".into(),
            category: SkipCategory::Other,
        }
    } else {
        Outcome::Pass
    }
}

fn ticker_present(signal: &Signal, _settings: &RuntimeSettings, _ctx: &CheckContext) -> Outcome {
    if signal.ticker.is_some() {
        return Outcome::Pass;
    }
    if signal.full_content().trim().len() >= MIN_CONTENT_LEN {
        return Outcome::Pass;
    }
    Outcome::Skip {
        reason: "no ticker and no usable signal content".into(),
        category: SkipCategory::NoSignal,
    }
}

fn whitelist(signal: &Signal, settings: &RuntimeSettings, _ctx: &CheckContext) -> Outcome {
    // Empty whitelist means unrestricted.
    if settings.whitelist_tickers.is_empty() {
        return Outcome::Pass;
    }
    match &signal.ticker {
        Some(ticker) if !settings.whitelist_tickers.iter().any(|t| t == ticker) => Outcome::Skip {
            reason: format!(
                "ticker {ticker} not in whitelist {:?}",
                settings.whitelist_tickers
            ),
            category: SkipCategory::Other,
        },
        _ => Outcome::Pass,
    }
}

fn blacklist(signal: &Signal, settings: &RuntimeSettings, _ctx: &CheckContext) -> Outcome {
    match &signal.ticker {
        Some(ticker) if settings.blacklist_tickers.iter().any(|t| t == ticker) => Outcome::Skip {
            reason: format!("ticker {ticker} is blacklisted"),
            category: SkipCategory::Other,
        },
        _ => Outcome::Pass,
    }
}

fn min_confidence(signal: &Signal, settings: &RuntimeSettings, _ctx: &CheckContext) -> Outcome {
    match signal.confidence {
        Some(confidence) if confidence < settings.min_ai_confidence_score => Outcome::Skip {
            reason: format!(
                "signal confidence {confidence:.2} below minimum {:.2}",
                settings.min_ai_confidence_score
            ),
            category: SkipCategory::LowConfidence,
        },
        _ => Outcome::Pass,
    }
}

fn vix_ceiling(_signal: &Signal, settings: &RuntimeSettings, ctx: &CheckContext) -> Outcome {
    // Unavailable VIX passes; the model sees the gap as uncertainty.
    match ctx.vix {
        Some(vix) if vix >= settings.max_vix_level => Outcome::Skip {
            reason: format!("VIX {vix:.1} at or above ceiling {:.1}", settings.max_vix_level),
            category: SkipCategory::Other,
        },
        _ => Outcome::Pass,
    }
}

fn max_positions(_signal: &Signal, settings: &RuntimeSettings, ctx: &CheckContext) -> Outcome {
    match ctx.open_position_count {
        Some(count) if count as i64 >= settings.max_concurrent_positions => Outcome::Skip {
            reason: format!(
                "open positions {count} at limit {}",
                settings.max_concurrent_positions
            ),
            category: SkipCategory::Other,
        },
        _ => Outcome::Pass,
    }
}

fn duplicate_position(signal: &Signal, _settings: &RuntimeSettings, ctx: &CheckContext) -> Outcome {
    match &signal.ticker {
        Some(ticker) if ctx.held_tickers.iter().any(|t| t == ticker) => Outcome::Skip {
            reason: format!("open position already exists for {ticker}"),
            category: SkipCategory::PositionExists,
        },
        _ => Outcome::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_store::SignalMessage;

    fn signal(ticker: Option<&str>, confidence: Option<f64>) -> Signal {
        Signal {
            thread_id: "t1".into(),
            thread_name: "test".into(),
            ticker: ticker.map(|t| t.to_string()),
            confidence,
            messages: vec![SignalMessage {
                content: "BUY CALLS entry 1.77 target 2.50 stop 1.20".into(),
                timestamp: String::new(),
            }],
            ..Default::default()
        }
    }

    fn dry_ctx() -> CheckContext {
        CheckContext { live: false, ..Default::default() }
    }

    #[test]
    fn all_pass_on_defaults() {
        let settings = RuntimeSettings::default();
        let outcome = run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &dry_ctx());
        assert_eq!(outcome, Outcome::Pass);
    }

    #[test]
    fn emergency_stop_short_circuits() {
        let settings = RuntimeSettings { emergency_stop: true, ..Default::default() };
        match run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &dry_ctx()) {
            Outcome::Skip { reason, category } => {
                assert!(reason.contains("emergency"));
                assert_eq!(category, SkipCategory::Other);
            }
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn missing_ticker_with_content_passes() {
        let settings = RuntimeSettings { whitelist_tickers: vec![], ..Default::default() };
        let outcome = run_chain(&signal(None, None), &settings, &dry_ctx());
        assert_eq!(outcome, Outcome::Pass);
    }

    #[test]
    fn missing_ticker_and_content_skips_as_no_signal() {
        let settings = RuntimeSettings::default();
        let mut s = signal(None, None);
        s.messages.clear();
        match run_chain(&s, &settings, &dry_ctx()) {
            Outcome::Skip { category, .. } => assert_eq!(category, SkipCategory::NoSignal),
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn whitelist_blocks_unlisted_ticker() {
        let settings = RuntimeSettings {
            whitelist_tickers: vec!["SPY".into()],
            ..Default::default()
        };
        match run_chain(&signal(Some("NVDA"), Some(0.8)), &settings, &dry_ctx()) {
            Outcome::Skip { reason, .. } => assert!(reason.contains("whitelist")),
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn empty_whitelist_allows_all() {
        let settings = RuntimeSettings { whitelist_tickers: vec![], ..Default::default() };
        let outcome = run_chain(&signal(Some("NVDA"), Some(0.8)), &settings, &dry_ctx());
        assert_eq!(outcome, Outcome::Pass);
    }

    #[test]
    fn blacklist_blocks_ticker() {
        let settings = RuntimeSettings {
            whitelist_tickers: vec![],
            blacklist_tickers: vec!["TSLA".into()],
            ..Default::default()
        };
        match run_chain(&signal(Some("TSLA"), Some(0.8)), &settings, &dry_ctx()) {
            Outcome::Skip { reason, .. } => assert!(reason.contains("blacklisted")),
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn low_confidence_skips_but_unknown_confidence_passes() {
        let settings = RuntimeSettings::default();
        match run_chain(&signal(Some("SPY"), Some(0.3)), &settings, &dry_ctx()) {
            Outcome::Skip { category, .. } => assert_eq!(category, SkipCategory::LowConfidence),
            Outcome::Pass => panic!("expected skip"),
        }
        assert_eq!(
            run_chain(&signal(Some("SPY"), None), &settings, &dry_ctx()),
            Outcome::Pass
        );
    }

    #[test]
    fn live_only_checks_are_skipped_in_dry_run() {
        let settings = RuntimeSettings::default();
        // VIX over the ceiling and a duplicate position would both fail
        // live, but the chain never consults them in dry-run.
        let ctx = CheckContext {
            live: false,
            vix: Some(40.0),
            open_position_count: Some(99),
            held_tickers: vec!["SPY".into()],
        };
        assert_eq!(run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &ctx), Outcome::Pass);
    }

    #[test]
    fn vix_ceiling_applies_live() {
        let settings = RuntimeSettings::default();
        let ctx = CheckContext { live: true, vix: Some(26.0), ..Default::default() };
        match run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &ctx) {
            Outcome::Skip { reason, .. } => assert!(reason.contains("VIX")),
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn unavailable_vix_passes_live() {
        let settings = RuntimeSettings::default();
        let ctx = CheckContext { live: true, vix: None, ..Default::default() };
        assert_eq!(run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &ctx), Outcome::Pass);
    }

    #[test]
    fn max_positions_at_limit_skips() {
        let settings = RuntimeSettings::default();
        let ctx = CheckContext { live: true, open_position_count: Some(5), ..Default::default() };
        match run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &ctx) {
            Outcome::Skip { reason, .. } => assert!(reason.contains("limit")),
            Outcome::Pass => panic!("expected skip"),
        }
    }

    #[test]
    fn duplicate_position_skips_with_position_exists() {
        let settings = RuntimeSettings::default();
        let ctx = CheckContext {
            live: true,
            held_tickers: vec!["SPY".into()],
            ..Default::default()
        };
        match run_chain(&signal(Some("SPY"), Some(0.9)), &settings, &ctx) {
            Outcome::Skip { category, .. } => {
                assert_eq!(category, SkipCategory::PositionExists)
            }
            Outcome::Pass => panic!("expected skip"),
        }
    }
}
