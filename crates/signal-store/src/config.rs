use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::StoreResult;

/// Runtime trading parameters. Owned by the dashboard, re-read by the
/// core on every task so edits take effect without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub emergency_stop: bool,
    pub execute_orders: bool,
    pub max_concurrent_positions: i64,
    pub max_vix_level: f64,
    pub min_ai_confidence_score: f64,
    pub whitelist_tickers: Vec<String>,
    pub blacklist_tickers: Vec<String>,
    pub max_loss_per_trade_percent: f64,
    pub max_daily_trades: i64,
    pub max_loss_per_day_percent: f64,
    pub default_stop_loss_percent: f64,
    pub default_take_profit_percent: f64,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_activation_percent: f64,
    pub trailing_stop_distance_percent: f64,
    pub max_position_size_percent: f64,
    pub current_llm_model: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            emergency_stop: false,
            execute_orders: false,
            max_concurrent_positions: 5,
            max_vix_level: 25.0,
            min_ai_confidence_score: 0.5,
            whitelist_tickers: vec!["SPY".to_string(), "QQQ".to_string()],
            blacklist_tickers: Vec::new(),
            max_loss_per_trade_percent: 0.1,
            max_daily_trades: 10,
            max_loss_per_day_percent: 0.1,
            default_stop_loss_percent: 0.3,
            default_take_profit_percent: 0.5,
            trailing_stop_enabled: false,
            trailing_stop_activation_percent: 0.2,
            trailing_stop_distance_percent: 0.1,
            max_position_size_percent: 0.2,
            current_llm_model: "deepseek/deepseek-reasoner".to_string(),
        }
    }
}

/// The single accessor for runtime config. Values are stored as strings
/// (bools as true/false, lists as JSON) so the dashboard can write them
/// without knowing the types; `load` converts with per-key defaults.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runtime_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Seed any missing keys with their defaults so the dashboard always
    /// sees the full set.
    pub async fn ensure_defaults(&self) -> StoreResult<()> {
        let defaults = RuntimeSettings::default();
        for (key, value) in encode_settings(&defaults) {
            sqlx::query("INSERT OR IGNORE INTO runtime_config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Read a fresh settings snapshot. Unknown or unparseable values fall
    /// back to the key's default.
    pub async fn load(&self) -> StoreResult<RuntimeSettings> {
        let rows = sqlx::query("SELECT key, value FROM runtime_config")
            .fetch_all(&self.pool)
            .await?;

        let mut settings = RuntimeSettings::default();
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            apply_setting(&mut settings, &key, &value);
        }
        Ok(settings)
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO runtime_config (key, value, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        tracing::info!("config updated: {key} = {value}");
        Ok(())
    }
}

fn encode_settings(s: &RuntimeSettings) -> Vec<(&'static str, String)> {
    vec![
        ("emergency_stop", s.emergency_stop.to_string()),
        ("execute_orders", s.execute_orders.to_string()),
        ("max_concurrent_positions", s.max_concurrent_positions.to_string()),
        ("max_vix_level", s.max_vix_level.to_string()),
        ("min_ai_confidence_score", s.min_ai_confidence_score.to_string()),
        (
            "whitelist_tickers",
            serde_json::to_string(&s.whitelist_tickers).unwrap_or_else(|_| "[]".into()),
        ),
        (
            "blacklist_tickers",
            serde_json::to_string(&s.blacklist_tickers).unwrap_or_else(|_| "[]".into()),
        ),
        ("max_loss_per_trade_percent", s.max_loss_per_trade_percent.to_string()),
        ("max_daily_trades", s.max_daily_trades.to_string()),
        ("max_loss_per_day_percent", s.max_loss_per_day_percent.to_string()),
        ("default_stop_loss_percent", s.default_stop_loss_percent.to_string()),
        ("default_take_profit_percent", s.default_take_profit_percent.to_string()),
        ("trailing_stop_enabled", s.trailing_stop_enabled.to_string()),
        (
            "trailing_stop_activation_percent",
            s.trailing_stop_activation_percent.to_string(),
        ),
        (
            "trailing_stop_distance_percent",
            s.trailing_stop_distance_percent.to_string(),
        ),
        ("max_position_size_percent", s.max_position_size_percent.to_string()),
        ("current_llm_model", s.current_llm_model.clone()),
    ]
}

fn apply_setting(settings: &mut RuntimeSettings, key: &str, value: &str) {
    let defaults = RuntimeSettings::default();
    match key {
        "emergency_stop" => settings.emergency_stop = parse_bool(value, defaults.emergency_stop),
        "execute_orders" => settings.execute_orders = parse_bool(value, defaults.execute_orders),
        "max_concurrent_positions" => {
            settings.max_concurrent_positions =
                value.parse().unwrap_or(defaults.max_concurrent_positions)
        }
        "max_vix_level" => settings.max_vix_level = value.parse().unwrap_or(defaults.max_vix_level),
        "min_ai_confidence_score" => {
            settings.min_ai_confidence_score =
                value.parse().unwrap_or(defaults.min_ai_confidence_score)
        }
        "whitelist_tickers" => {
            settings.whitelist_tickers =
                serde_json::from_str(value).unwrap_or(defaults.whitelist_tickers)
        }
        "blacklist_tickers" => {
            settings.blacklist_tickers =
                serde_json::from_str(value).unwrap_or(defaults.blacklist_tickers)
        }
        "max_loss_per_trade_percent" => {
            settings.max_loss_per_trade_percent =
                value.parse().unwrap_or(defaults.max_loss_per_trade_percent)
        }
        "max_daily_trades" => {
            settings.max_daily_trades = value.parse().unwrap_or(defaults.max_daily_trades)
        }
        "max_loss_per_day_percent" => {
            settings.max_loss_per_day_percent =
                value.parse().unwrap_or(defaults.max_loss_per_day_percent)
        }
        "default_stop_loss_percent" => {
            settings.default_stop_loss_percent =
                value.parse().unwrap_or(defaults.default_stop_loss_percent)
        }
        "default_take_profit_percent" => {
            settings.default_take_profit_percent =
                value.parse().unwrap_or(defaults.default_take_profit_percent)
        }
        "trailing_stop_enabled" => {
            settings.trailing_stop_enabled = parse_bool(value, defaults.trailing_stop_enabled)
        }
        "trailing_stop_activation_percent" => {
            settings.trailing_stop_activation_percent = value
                .parse()
                .unwrap_or(defaults.trailing_stop_activation_percent)
        }
        "trailing_stop_distance_percent" => {
            settings.trailing_stop_distance_percent = value
                .parse()
                .unwrap_or(defaults.trailing_stop_distance_percent)
        }
        "max_position_size_percent" => {
            settings.max_position_size_percent =
                value.parse().unwrap_or(defaults.max_position_size_percent)
        }
        "current_llm_model" => settings.current_llm_model = value.to_string(),
        _ => tracing::debug!("ignoring unknown config key: {key}"),
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> ConfigStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ConfigStore::new(pool);
        store.init_tables().await.unwrap();
        store
    }

    #[tokio::test]
    async fn load_on_empty_store_returns_defaults() {
        let store = store().await;
        let settings = store.load().await.unwrap();
        assert!(!settings.emergency_stop);
        assert!(!settings.execute_orders);
        assert_eq!(settings.max_concurrent_positions, 5);
        assert_eq!(settings.whitelist_tickers, vec!["SPY", "QQQ"]);
        assert_eq!(settings.current_llm_model, "deepseek/deepseek-reasoner");
    }

    #[tokio::test]
    async fn set_then_load_reflects_dashboard_edits() {
        let store = store().await;
        store.ensure_defaults().await.unwrap();
        store.set("emergency_stop", "true").await.unwrap();
        store.set("max_vix_level", "30").await.unwrap();
        store.set("whitelist_tickers", "[]").await.unwrap();

        let settings = store.load().await.unwrap();
        assert!(settings.emergency_stop);
        assert_eq!(settings.max_vix_level, 30.0);
        assert!(settings.whitelist_tickers.is_empty());
    }

    #[tokio::test]
    async fn garbage_value_falls_back_to_default() {
        let store = store().await;
        store.set("max_vix_level", "very high").await.unwrap();
        let settings = store.load().await.unwrap();
        assert_eq!(settings.max_vix_level, 25.0);
    }
}
