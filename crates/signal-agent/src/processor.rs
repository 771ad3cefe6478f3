use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ibkr_broker::IbkrClient;
use llm_client::{ChatBackend, LlmError};
use market_data::MarketData;
use signal_store::{
    AiResult, ConfigStore, Decision, PromptStore, RuntimeSettings, Signal, SignalsRepo,
    SkipCategory, StoreError, TradeResult, TradesRepo,
};
use thiserror::Error;
use tokio::time::timeout;
use work_queue::{QueueError, ReanalysisScheduler, ScheduledContext, Task};

use crate::decision::{parse_decision, tool_schemas, validate_bracket, MAX_REANALYSIS_RETRIES};
use crate::executor::{ExecError, TradeExecutor};
use crate::notifier::WebhookNotifier;
use crate::preconditions::{run_chain, CheckContext, Outcome};
use crate::prefetch;
use crate::prompt::PromptAssembler;

/// What the consumer does with the task at the queue layer.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed { kind: &'static str, message: String },
}

#[derive(Error, Debug)]
enum ProcessError {
    #[error("signal not found in store: {0}")]
    SignalNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("LLM call timed out")]
    LlmTimeout,

    #[error("LLM transport failure: {0}")]
    LlmTransport(String),

    #[error("gateway unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("orphaned trade {order_id}: {source}")]
    OrphanedTrade { order_id: String, source: StoreError },
}

impl ProcessError {
    fn kind(&self) -> &'static str {
        match self {
            Self::SignalNotFound(_) => "signal_not_found",
            Self::Store(_) => "store_write_error",
            Self::Queue(_) => "queue_error",
            Self::LlmTimeout => "llm_timeout",
            Self::LlmTransport(_) => "llm_transport",
            Self::BrokerUnreachable(_) => "broker_unreachable",
            Self::OrphanedTrade { .. } => "store_write_error",
        }
    }
}

pub struct ProcessorContext {
    pub signals: SignalsRepo,
    pub trades: TradesRepo,
    pub config: ConfigStore,
    pub prompts: PromptStore,
    pub scheduler: ReanalysisScheduler,
    pub broker: Arc<IbkrClient>,
    pub market: Arc<MarketData>,
    pub llm: Arc<dyn ChatBackend>,
    pub notifier: Arc<WebhookNotifier>,
    pub llm_timeout: Duration,
    pub prefetch_budget: Duration,
}

/// Orchestrates one task: preconditions, prefetch, a single model call,
/// dispatch and persistence, strictly in that order.
///
/// This is the only layer that catches errors; below it everything
/// propagates. Each error kind maps to complete, fail or dead-letter at
/// the consumer.
pub struct SignalProcessor {
    signals: SignalsRepo,
    trades: TradesRepo,
    config: ConfigStore,
    scheduler: ReanalysisScheduler,
    broker: Arc<IbkrClient>,
    market: Arc<MarketData>,
    llm: Arc<dyn ChatBackend>,
    notifier: Arc<WebhookNotifier>,
    assembler: PromptAssembler,
    executor: TradeExecutor,
    llm_timeout: Duration,
    prefetch_budget: Duration,
}

impl SignalProcessor {
    pub fn new(ctx: ProcessorContext) -> Self {
        let assembler = PromptAssembler::new(ctx.prompts);
        let executor = TradeExecutor::new(ctx.trades.clone(), Arc::clone(&ctx.broker));
        Self {
            signals: ctx.signals,
            trades: ctx.trades,
            config: ctx.config,
            scheduler: ctx.scheduler,
            broker: ctx.broker,
            market: ctx.market,
            llm: ctx.llm,
            notifier: ctx.notifier,
            assembler,
            executor,
            llm_timeout: ctx.llm_timeout,
            prefetch_budget: ctx.prefetch_budget,
        }
    }

    pub async fn process(&self, task: &Task) -> TaskOutcome {
        match &task.scheduled_context {
            Some(ctx) => tracing::info!(
                thread_id = %task.thread_id,
                "scheduled reanalysis #{}: {}",
                ctx.retry_count,
                task.thread_name
            ),
            None => tracing::info!(
                thread_id = %task.thread_id,
                "signal received: {}",
                task.thread_name
            ),
        }

        match self.run(task).await {
            Ok(()) => TaskOutcome::Completed,
            Err(e) => {
                tracing::error!(thread_id = %task.thread_id, "task failed ({}): {e}", e.kind());
                self.record_failure(&task.thread_id, e.kind(), &e.to_string())
                    .await;
                TaskOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// Best-effort failure marker on the signal record, so dashboards see
    /// a consistent state for every terminal outcome. Also used by the
    /// consumer for deadline kills, which cancel the in-flight `process`
    /// future before its own failure path can run.
    pub async fn record_failure(&self, thread_id: &str, kind: &str, message: &str) {
        if let Err(e) = self.signals.record_failure(thread_id, kind, message).await {
            tracing::warn!("could not record failure on signal: {e}");
        }
    }

    async fn run(&self, task: &Task) -> Result<(), ProcessError> {
        // Fresh settings every task so dashboard edits apply immediately.
        let settings = self.config.load().await?;

        let signal = self
            .signals
            .get(&task.thread_id)
            .await?
            .ok_or_else(|| ProcessError::SignalNotFound(task.thread_id.clone()))?;

        tracing::info!(
            "ticker: {} | direction: {}",
            signal.ticker.as_deref().unwrap_or("N/A"),
            signal.direction.as_deref().unwrap_or("N/A")
        );

        // Preconditions: deterministic gating before any LLM cost.
        let check_ctx = self.gather_check_context(&signal, &settings).await;
        if let Outcome::Skip { reason, category } = run_chain(&signal, &settings, &check_ctx) {
            let decision = Decision::Skip { reason, category };
            return self
                .persist(&signal, decision, None, "", None, None)
                .await;
        }

        // Prefetch: partial failure degrades, never aborts.
        let bundle =
            prefetch::fetch_all(&self.broker, &self.market, &signal, self.prefetch_budget).await;

        // Prompt assembly; a rendering error is fatal for this task only.
        let model = settings.current_llm_model.clone();
        let (system, user) = match self
            .assembler
            .render(&signal, &bundle, task.scheduled_context.as_ref(), &settings)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("template rendering failed: {e:#}");
                let decision = Decision::Skip {
                    reason: format!("template_error: {e}"),
                    category: SkipCategory::Other,
                };
                return self.persist(&signal, decision, None, &model, None, None).await;
            }
        };

        // Exactly one model call, tool_choice=required.
        let response = match timeout(
            self.llm_timeout,
            self.llm.chat(&model, &system, &user, &tool_schemas()),
        )
        .await
        {
            Err(_) => return Err(ProcessError::LlmTimeout),
            Ok(Err(LlmError::Timeout)) => return Err(ProcessError::LlmTimeout),
            Ok(Err(e)) if e.is_retriable() => {
                return Err(ProcessError::LlmTransport(e.to_string()))
            }
            Ok(Err(e)) => {
                // A malformed answer is a decision-level problem, not a
                // transport one: skip instead of failing the task.
                let decision = Decision::Skip {
                    reason: format!("ai_format_error: {e}"),
                    category: SkipCategory::Other,
                };
                return self.persist(&signal, decision, None, &model, None, None).await;
            }
            Ok(Ok(response)) => response,
        };

        let trace_id = response.request_id.clone();
        let decision = parse_decision(&response);
        self.dispatch(task, &signal, &settings, decision, &model, trace_id)
            .await
    }

    async fn dispatch(
        &self,
        task: &Task,
        signal: &Signal,
        settings: &RuntimeSettings,
        decision: Decision,
        model: &str,
        trace_id: Option<String>,
    ) -> Result<(), ProcessError> {
        match decision {
            Decision::Skip { .. } => {
                self.persist(signal, decision, None, model, trace_id, None).await
            }

            Decision::Delay { request } => {
                let retry_count = task
                    .scheduled_context
                    .as_ref()
                    .map(|c| c.retry_count)
                    .unwrap_or(0);
                if retry_count >= MAX_REANALYSIS_RETRIES {
                    let decision = Decision::Skip {
                        reason: format!(
                            "max reanalysis retries ({MAX_REANALYSIS_RETRIES}) reached: {}",
                            request.reason
                        ),
                        category: SkipCategory::Other,
                    };
                    return self.persist(signal, decision, None, model, trace_id, None).await;
                }

                let now = Utc::now();
                let due_at = now + chrono::Duration::minutes(request.delay_minutes);
                let context = ScheduledContext {
                    retry_count: retry_count + 1,
                    delay_minutes: request.delay_minutes,
                    delay_reason: request.reason.clone(),
                    delay_question: request.question.clone(),
                    key_levels: request.key_levels.clone(),
                    scheduled_at: now.to_rfc3339(),
                    reanalyze_at: due_at.to_rfc3339(),
                    thread_name: if task.thread_name.is_empty() {
                        signal.thread_name.clone()
                    } else {
                        task.thread_name.clone()
                    },
                };
                self.scheduler
                    .schedule(&task.thread_id, due_at, &context)
                    .await?;

                let marker = serde_json::json!({
                    "due_at": due_at.to_rfc3339(),
                    "delay_minutes": request.delay_minutes,
                    "question": request.question.clone(),
                });
                self.persist(
                    signal,
                    Decision::Delay { request },
                    None,
                    model,
                    trace_id,
                    Some(marker),
                )
                .await
            }

            Decision::Execute { order } => {
                if let Err(detail) = validate_bracket(&order) {
                    let decision = Decision::Skip {
                        reason: format!("invalid_bracket: {detail}"),
                        category: SkipCategory::Other,
                    };
                    return self.persist(signal, decision, None, model, trace_id, None).await;
                }

                let live = settings.execute_orders;
                let trade_result = match self.executor.execute(signal, &order, live, model).await {
                    Ok(result) => result,
                    Err(ExecError::Unreachable(e)) => {
                        return Err(ProcessError::BrokerUnreachable(e))
                    }
                    Err(ExecError::Store(e)) => return Err(ProcessError::Store(e)),
                    Err(ExecError::Orphaned { order_id, source }) => {
                        self.notify(&format!(
                            "**ORPHANED TRADE** order {order_id} placed but not recorded"
                        ))
                        .await;
                        return Err(ProcessError::OrphanedTrade { order_id, source });
                    }
                };

                if trade_result.success {
                    tracing::info!(
                        "trade executed: {}",
                        trade_result.order_id.as_deref().unwrap_or("?")
                    );
                    self.notify(&format!(
                        "**{} {}** x{} @ ${:.2} (TP ${:.2} / SL ${:.2}){}",
                        order.side.as_str(),
                        order.ticker,
                        order.quantity,
                        order.entry_price,
                        order.take_profit,
                        order.stop_loss,
                        if trade_result.simulated { " [simulated]" } else { "" },
                    ))
                    .await;
                } else {
                    tracing::error!(
                        "trade failed: {}",
                        trade_result.error.as_deref().unwrap_or("unknown")
                    );
                }

                self.persist(
                    signal,
                    Decision::Execute { order },
                    Some(trade_result),
                    model,
                    trace_id,
                    None,
                )
                .await
            }
        }
    }

    /// Gather the live facts the precondition chain needs. Each read is
    /// best-effort: an unavailable source leaves its field unset and the
    /// corresponding check passes.
    async fn gather_check_context(
        &self,
        signal: &Signal,
        settings: &RuntimeSettings,
    ) -> CheckContext {
        let live = settings.execute_orders;
        if !live {
            return CheckContext { live, ..Default::default() };
        }

        let vix = match self.market.vix().await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("VIX unavailable for preconditions: {e}");
                None
            }
        };

        let (open_position_count, mut held_tickers) = match self.broker.get_positions().await {
            Ok(positions) => {
                let tickers: Vec<String> = positions
                    .iter()
                    .filter_map(|p| {
                        p.ticker.clone().or_else(|| {
                            // Option positions carry the underlying as the
                            // first token of the contract description.
                            p.contract_desc
                                .as_deref()
                                .and_then(|d| d.split_whitespace().next())
                                .map(str::to_string)
                        })
                    })
                    .collect();
                (Some(positions.len()), tickers)
            }
            Err(e) => {
                tracing::warn!("positions unavailable for preconditions: {e}");
                (None, Vec::new())
            }
        };

        if let Some(ticker) = &signal.ticker {
            match self.trades.open_trade_exists_for_ticker(ticker).await {
                Ok(true) => held_tickers.push(ticker.clone()),
                Ok(false) => {}
                Err(e) => tracing::warn!("trade lookup failed for preconditions: {e}"),
            }
        }

        CheckContext { live, vix, open_position_count, held_tickers }
    }

    async fn persist(
        &self,
        signal: &Signal,
        decision: Decision,
        trade_result: Option<TradeResult>,
        model: &str,
        trace_id: Option<String>,
        scheduled_marker: Option<serde_json::Value>,
    ) -> Result<(), ProcessError> {
        let reasoning = match &decision {
            Decision::Skip { reason, .. } => reason.clone(),
            Decision::Delay { request } => request.reason.clone(),
            Decision::Execute { .. } => "model placed bracket order via tool call".to_string(),
        };

        tracing::info!("decision: {}", decision.act().to_uppercase());

        let result = AiResult {
            act: decision.act().to_string(),
            reasoning,
            decision,
            trade_result,
            model_used: model.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            trace_id,
        };

        self.signals
            .save_result(&signal.thread_id, &result, scheduled_marker.as_ref())
            .await?;
        Ok(())
    }

    async fn notify(&self, message: &str) {
        if let Err(e) = self.notifier.send_message(message).await {
            tracing::debug!("webhook notification failed: {e}");
        }
    }
}
