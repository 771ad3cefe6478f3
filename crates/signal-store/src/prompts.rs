use sqlx::{Row, SqlitePool};

use crate::StoreResult;

/// Embedded defaults, used when the prompt store has no active rows. The
/// dashboard owns the stored prompts; these keep the agent functional on a
/// fresh database.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a trade execution agent for 0DTE options signals. The signal has already been analyzed upstream; your job is NOT to re-analyze the market. Your job is to:
1. Validate whether the trade can be executed NOW (timing, market status)
2. Check current option prices against the signal's prices
3. Design an optimal bracket (entry, take profit, stop loss)
4. Verify the reward/risk ratio is at least 1.5

All market data has been pre-fetched for you and is included in the user message. Data marked unavailable means uncertainty: treat it as such and lean conservative.

You MUST respond by calling exactly one of these tools:
- skip_signal(reason, category) - do not trade
- place_bracket_order(ticker, expiry, strike, direction, side, quantity, entry_price, take_profit, stop_loss) - trade with a bracket
- schedule_reanalysis(delay_minutes, reason, question, key_levels) - check again later (5-240 minutes)

Rules:
- Market closed and no reopening within the delay window: skip_signal with category "market_closed".
- No actionable setup (analysis only, no entry/target/stop): category "no_signal".
- Reward/risk below 1.5: category "bad_rr".
- Already reanalyzed twice: decide now, EXECUTE or SKIP.
- Respect the configured risk limits included in the prompt.
- LOSE SMALL, WIN BIG."#;

pub const DEFAULT_USER_TEMPLATE: &str = r#"## TRADING SIGNAL

**Ticker:** {{ signal.ticker or 'NOT SPECIFIED' }}
**Direction:** {{ signal.direction or 'NOT SPECIFIED' }}
**Strike:** {{ signal.strike | usd }}
**Expiry:** {{ signal.expiry or 'NOT SPECIFIED' }}
**Entry Price:** {{ signal.entry_price | usd }}
**Target:** {{ signal.target_price | usd }}
**Stop Loss:** {{ signal.stop_loss | usd }}
**Confidence:** {{ signal.confidence | pct }}

### Raw Signal Content

{{ signal.full_content or 'No content available' }}

---

## CURRENT MARKET DATA (pre-fetched)

### Time
{% if time.success %}
- **Current Time (ET):** {{ time.time_est }} on {{ time.date }} ({{ time.day_of_week }})
- **Market Status:** {{ time.market_status }} ({{ time.status_reason }})
{% if time.opens_at %}- **Opens At:** {{ time.opens_at }}{% endif %}
{% if time.closes_at %}- **Closes At:** {{ time.closes_at }}{% endif %}
{% else %}
- Time data unavailable: {{ time.error }}
{% endif %}

### Option Chain
{% if option_chain.success %}
- **Underlying Price:** {{ option_chain.current_price | usd }}
- **Available Expiries:** {% for e in option_chain.available_expiries %}{{ e }}{% if not loop.last %}, {% endif %}{% endfor %}

**Calls (nearest strikes):**
{% for c in option_chain.calls %}- Strike {{ c.strike | usd }}: bid {{ c.bid | usd }} / ask {{ c.ask | usd }} mid {{ c.mid | usd }} vol {{ c.volume }} OI {{ c.open_interest }} {% if c.in_the_money %}ITM{% else %}OTM{% endif %}
{% endfor %}
**Puts (nearest strikes):**
{% for p in option_chain.puts %}- Strike {{ p.strike | usd }}: bid {{ p.bid | usd }} / ask {{ p.ask | usd }} mid {{ p.mid | usd }} vol {{ p.volume }} OI {{ p.open_interest }} {% if p.in_the_money %}ITM{% else %}OTM{% endif %}
{% endfor %}
{% else %}
- Option chain unavailable: {{ option_chain.error }}
{% endif %}

### Account
{% if account.success %}
- **Available for Trading:** {{ account.available | usd }}
- **Buying Power:** {{ account.buying_power | usd }}
- **Net Liquidation:** {{ account.net_liquidation | usd }}
{% else %}
- Account data unavailable: {{ account.error }}
{% endif %}

### Positions
{% if positions.success %}
- **Open Positions:** {{ positions.count }}
- **Tickers:** {% if positions.tickers %}{% for t in positions.tickers %}{{ t }}{% if not loop.last %}, {% endif %}{% endfor %}{% else %}None{% endif %}
{% else %}
- Positions unavailable: {{ positions.error }}
{% endif %}

### Volatility
{% if vix.success %}
- **VIX:** {{ vix.value }} ({{ vix.level }})
{% else %}
- VIX unavailable: {{ vix.error }}
{% endif %}

---

## RISK LIMITS (configured)

- Max loss per trade: {{ config.max_loss_per_trade_percent | pct }} of account
- Max daily trades: {{ config.max_daily_trades }}
- Max loss per day: {{ config.max_loss_per_day_percent | pct }} of account
- Max position size: {{ config.max_position_size_percent | pct }} of account
- Default stop loss: {{ config.default_stop_loss_percent | pct }} / default take profit: {{ config.default_take_profit_percent | pct }}
{% if config.trailing_stop_enabled %}- Trailing stop: activates at {{ config.trailing_stop_activation_percent | pct }}, distance {{ config.trailing_stop_distance_percent | pct }}{% endif %}

{% if reanalysis %}
---

## SCHEDULED REANALYSIS (attempt #{{ reanalysis.retry_count }})

**Original delay reason:** {{ reanalysis.delay_reason }}
**Question to answer now:** {{ reanalysis.delay_question }}
{% if reanalysis.key_levels %}**Key levels:** {{ reanalysis.key_levels }}{% endif %}

Conditions may have changed. Decide now: EXECUTE, SKIP, or SCHEDULE again (max 2 retries).
{% endif %}

---

## YOUR DECISION

Based on ALL the data above, call exactly one tool: skip_signal, place_bracket_order, or schedule_reanalysis. Check current prices, compute reward/risk, and decide."#;

/// Prompt store: two active records, `system_prompt` (plain text) and
/// `user_template` (expression-level template).
#[derive(Clone)]
pub struct PromptStore {
    pool: SqlitePool,
}

impl PromptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS prompts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn system_prompt(&self) -> String {
        self.active("system_prompt")
            .await
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub async fn user_template(&self) -> String {
        self.active("user_template")
            .await
            .unwrap_or_else(|| DEFAULT_USER_TEMPLATE.to_string())
    }

    async fn active(&self, prompt_type: &str) -> Option<String> {
        let row = sqlx::query(
            "SELECT content FROM prompts WHERE type = ? AND is_active = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(prompt_type)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => Some(row.get("content")),
            Ok(None) => {
                tracing::debug!("no active {prompt_type} in store, using embedded default");
                None
            }
            Err(e) => {
                tracing::warn!("prompt store read failed ({e}), using embedded default");
                None
            }
        }
    }

    pub async fn set_prompt(&self, prompt_type: &str, name: &str, content: &str) -> StoreResult<()> {
        sqlx::query("UPDATE prompts SET is_active = 0 WHERE type = ?")
            .bind(prompt_type)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO prompts (type, name, content, is_active, updated_at)
             VALUES (?, ?, ?, 1, datetime('now'))",
        )
        .bind(prompt_type)
        .bind(name)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
