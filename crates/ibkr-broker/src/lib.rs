pub mod client;
pub mod models;
pub mod symbols;

pub use client::{BracketOrder, BracketPlacement, IbkrClient};
pub use models::*;
pub use symbols::{ibkr_month, occ_symbol};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// Transport-level failure: the gateway never answered. Retriable.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The gateway answered with a non-success status.
    #[error("gateway rejected request: {0}")]
    Rejected(String),

    /// Symbol resolved to zero candidates after filtering.
    #[error("contract not found: {0}")]
    ContractNotFound(String),

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BrokerError::InvalidResponse(e.to_string())
        } else {
            BrokerError::Unreachable(e.to_string())
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
