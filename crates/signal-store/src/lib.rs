pub mod config;
pub mod decision;
pub mod prompts;
pub mod signal;
pub mod signals;
pub mod trade;
pub mod trades;

pub use config::{ConfigStore, RuntimeSettings};
pub use decision::{AiResult, Decision, Direction, ExecuteOrder, OrderSide, SkipCategory, TradeResult};
pub use prompts::PromptStore;
pub use signal::{Signal, SignalMessage};
pub use signals::SignalsRepo;
pub use trade::{Trade, TradeStatus};
pub use trades::TradesRepo;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
