pub mod queue;
pub mod scheduler;

pub use queue::{PoppedTask, QueueStats, ReliableQueue, Task};
pub use scheduler::{ReanalysisScheduler, ScheduledContext};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;
