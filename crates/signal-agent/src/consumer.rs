use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use work_queue::ReliableQueue;

use crate::notifier::WebhookNotifier;
use crate::processor::{SignalProcessor, TaskOutcome};

/// Queue-level backoff bounds for when the queue itself is unreachable.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// One consumer worker: pops tasks, runs them under the per-task
/// deadline, and settles each as completed or failed. With N workers the
/// atomic pop keeps them from stepping on each other; each worker owns
/// its own processor (and so its own gateway client).
pub struct Consumer {
    pub worker_id: usize,
    pub queue: ReliableQueue,
    pub processor: SignalProcessor,
    pub notifier: Arc<WebhookNotifier>,
    pub task_deadline: Duration,
    pub pop_timeout: Duration,
}

impl Consumer {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("worker {} consuming", self.worker_id);
        let mut backoff = BACKOFF_START;

        loop {
            let popped = tokio::select! {
                result = self.queue.pop_task(self.pop_timeout) => result,
                _ = shutdown.changed() => break,
            };

            let popped = match popped {
                Ok(popped) => {
                    backoff = BACKOFF_START;
                    popped
                }
                Err(e) => {
                    tracing::error!("queue unreachable, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            };

            let Some(popped) = popped else { continue };
            let thread_id = popped.task.thread_id.clone();

            // Dedup before any work: a thread already completed is simply
            // re-completed (removes the processing row) and skipped.
            match self.queue.is_completed(&thread_id).await {
                Ok(true) => {
                    tracing::info!(thread_id = %thread_id, "already completed, skipping");
                    if let Err(e) = self.queue.complete(&popped).await {
                        tracing::error!("dedup complete failed: {e}");
                    }
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("dedup check failed: {e}");
                    continue;
                }
            }

            let outcome = match timeout(self.task_deadline, self.processor.process(&popped.task)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(
                        thread_id = %thread_id,
                        "task exceeded deadline of {:?}",
                        self.task_deadline
                    );
                    // The timeout dropped the in-flight process() future,
                    // so its own failure path never ran: mark the signal
                    // here before settling the queue.
                    let message = format!("no terminal outcome within {:?}", self.task_deadline);
                    self.processor
                        .record_failure(&thread_id, "deadline_exceeded", &message)
                        .await;
                    TaskOutcome::Failed {
                        kind: "deadline_exceeded",
                        message,
                    }
                }
            };

            let settled = match &outcome {
                TaskOutcome::Completed => self.queue.complete(&popped).await,
                TaskOutcome::Failed { kind, message } => {
                    self.notify_failure(&thread_id, kind, message).await;
                    self.queue.fail(&popped, kind, message).await
                }
            };
            if let Err(e) = settled {
                tracing::error!(thread_id = %thread_id, "could not settle task: {e}");
            }
        }

        tracing::info!("worker {} stopped", self.worker_id);
    }

    async fn notify_failure(&self, thread_id: &str, kind: &str, message: &str) {
        let text = format!("**Task failed** `{thread_id}` ({kind}): {message}");
        if let Err(e) = self.notifier.send_message(&text).await {
            tracing::debug!("failure notification not sent: {e}");
        }
    }
}
