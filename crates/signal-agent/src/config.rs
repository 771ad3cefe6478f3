use anyhow::{bail, Result};
use std::env;
use std::time::Duration;

/// Process configuration from environment variables. Trading parameters
/// live in the runtime config store instead and are re-read per task.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Storage
    pub queue_url: String,
    pub database_url: String,

    // LLM proxy
    pub litellm_url: String,
    pub litellm_api_key: String,

    // Brokerage gateway
    pub ibeam_url: String,
    pub ib_account_id: String,
    pub use_ibkr_market_data: bool,

    // Logging
    pub log_webhook_url: String,
    pub debug: bool,

    // Pipeline tuning
    pub worker_concurrency: usize,
    pub task_deadline: Duration,
    pub prefetch_budget: Duration,
    pub llm_timeout: Duration,
    pub scheduler_poll: Duration,
    pub pop_timeout: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            queue_url: env::var("QUEUE_URL")
                .unwrap_or_else(|_| "sqlite://queue.db?mode=rwc".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://signals.db?mode=rwc".to_string()),

            litellm_url: env::var("LITELLM_URL")
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            litellm_api_key: env::var("LITELLM_API_KEY").unwrap_or_default(),

            ibeam_url: env::var("IBEAM_URL")
                .unwrap_or_else(|_| "https://localhost:5000".to_string()),
            ib_account_id: env::var("IB_ACCOUNT_ID").unwrap_or_default(),
            use_ibkr_market_data: env::var("USE_IBKR_MARKET_DATA")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false),

            log_webhook_url: env::var("LOG_WEBHOOK_URL").unwrap_or_default(),
            debug: env::var("DEBUG")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),

            worker_concurrency: env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            task_deadline: secs_from_env("TASK_DEADLINE_SECS", 90)?,
            prefetch_budget: secs_from_env("PREFETCH_BUDGET_SECS", 6)?,
            llm_timeout: secs_from_env("LLM_TIMEOUT_SECS", 60)?,
            scheduler_poll: secs_from_env("SCHEDULER_POLL_SECS", 30)?,
            pop_timeout: secs_from_env("POP_TIMEOUT_SECS", 5)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ib_account_id.is_empty() {
            bail!("IB_ACCOUNT_ID is required");
        }
        if self.litellm_url.is_empty() {
            bail!("LITELLM_URL is required");
        }
        if self.worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.task_deadline <= self.llm_timeout {
            bail!(
                "TASK_DEADLINE_SECS ({:?}) must exceed LLM_TIMEOUT_SECS ({:?})",
                self.task_deadline,
                self.llm_timeout
            );
        }
        Ok(())
    }
}

fn secs_from_env(key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()?;
    if secs == 0 {
        bail!("{key} must be > 0");
    }
    Ok(Duration::from_secs(secs))
}
