use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;

mod config;
mod consumer;
mod decision;
mod executor;
mod monitor;
mod notifier;
mod preconditions;
mod prefetch;
mod processor;
mod prompt;

use config::AgentConfig;
use consumer::Consumer;
use ibkr_broker::IbkrClient;
use llm_client::{LlmClient, LlmConfig};
use market_data::MarketData;
use monitor::OrderMonitor;
use notifier::WebhookNotifier;
use processor::{ProcessorContext, SignalProcessor};
use signal_store::{ConfigStore, PromptStore, SignalsRepo, TradesRepo};
use work_queue::{ReanalysisScheduler, ReliableQueue};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Signal execution agent starting");

    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  LLM proxy: {}", config.litellm_url);
    tracing::info!("  Gateway: {}", config.ibeam_url);
    tracing::info!("  Account: {}", config.ib_account_id);
    tracing::info!("  Workers: {}", config.worker_concurrency);

    // Storage pools: queue state and the signal/trade/prompt/config store.
    let queue_pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&config.queue_url)
        .await
        .context("queue database connection failed")?;
    let store_pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("store database connection failed")?;

    let queue = ReliableQueue::new(queue_pool.clone());
    queue.init_tables().await?;
    let scheduler = ReanalysisScheduler::new(queue_pool);
    scheduler.init_tables().await?;

    let signals = SignalsRepo::new(store_pool.clone());
    signals.init_tables().await?;
    let trades = TradesRepo::new(store_pool.clone());
    trades.init_tables().await?;
    let prompts = PromptStore::new(store_pool.clone());
    prompts.init_tables().await?;
    let config_store = ConfigStore::new(store_pool);
    config_store.init_tables().await?;
    config_store.ensure_defaults().await?;

    let settings = config_store.load().await?;
    tracing::info!("  Model: {}", settings.current_llm_model);
    tracing::info!(
        "  Emergency stop: {}",
        if settings.emergency_stop { "ACTIVE" } else { "off" }
    );
    tracing::info!(
        "  Execute orders: {}",
        if settings.execute_orders { "LIVE" } else { "DRY RUN (simulated)" }
    );
    tracing::info!("  Max VIX: {}", settings.max_vix_level);
    tracing::info!(
        "  Min confidence: {:.0}%",
        settings.min_ai_confidence_score * 100.0
    );

    let notifier = Arc::new(WebhookNotifier::new(config.log_webhook_url.clone())?);

    // Reclaim must run before the first pop: stale processing entries
    // from a crashed run go back to pending.
    queue.reclaim().await?;
    queue.trim_completed().await?;
    let stats = queue.stats().await?;
    tracing::info!(
        "Queue stats: pending={} processing={} scheduled={} completed={} failed={} dead_letter={}",
        stats.pending,
        stats.processing,
        stats.scheduled,
        stats.completed,
        stats.failed,
        stats.dead_letter
    );

    notifier
        .send_message(&format!(
            "**Signal Agent Started**\nMode: {}\nModel: {}\nPending tasks: {}",
            if settings.execute_orders { "LIVE" } else { "dry run" },
            settings.current_llm_model,
            stats.pending
        ))
        .await
        .ok();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    // Scheduler release loop on its own task.
    handles.push(tokio::spawn(
        scheduler
            .clone()
            .run(config.scheduler_poll, shutdown_rx.clone()),
    ));

    // Order-fill monitor (no-ops while execute_orders is off).
    let monitor_broker = Arc::new(IbkrClient::new(
        config.ibeam_url.clone(),
        config.ib_account_id.clone(),
    )?);
    let monitor = OrderMonitor::new(
        trades.clone(),
        monitor_broker,
        config_store.clone(),
        config.scheduler_poll,
    );
    handles.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    // Worker pool: each worker owns its own gateway client.
    for worker_id in 0..config.worker_concurrency {
        let broker = Arc::new(IbkrClient::new(
            config.ibeam_url.clone(),
            config.ib_account_id.clone(),
        )?);
        let market = Arc::new(MarketData::new(
            Some(Arc::clone(&broker)),
            config.use_ibkr_market_data,
        ));
        market.probe().await;

        let llm = Arc::new(LlmClient::new(LlmConfig {
            base_url: config.litellm_url.clone(),
            api_key: config.litellm_api_key.clone(),
            timeout: config.llm_timeout,
            ..LlmConfig::default()
        })?);

        let processor = SignalProcessor::new(ProcessorContext {
            signals: signals.clone(),
            trades: trades.clone(),
            config: config_store.clone(),
            prompts: prompts.clone(),
            scheduler: scheduler.clone(),
            broker,
            market,
            llm,
            notifier: Arc::clone(&notifier),
            llm_timeout: config.llm_timeout,
            prefetch_budget: config.prefetch_budget,
        });

        let consumer = Consumer {
            worker_id,
            queue: queue.clone(),
            processor,
            notifier: Arc::clone(&notifier),
            task_deadline: config.task_deadline,
            pop_timeout: config.pop_timeout,
        };
        handles.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    tracing::info!("Agent is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping workers...");
    shutdown_tx.send(true).ok();

    for handle in handles {
        handle.await.ok();
    }

    notifier
        .send_message("**Signal Agent Stopped** — graceful shutdown")
        .await
        .ok();
    tracing::info!("Signal agent shut down.");
    Ok(())
}
