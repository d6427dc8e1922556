//! Error taxonomy for the portfolio core.
//!
//! Core components return `Result<_, PortfolioError>`. Constraint violations in
//! the executor are *not* errors; they come back as structured rejections.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortfolioError {
    /// A buy needs more cash than the ledger holds.
    #[error("Insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },

    /// A sell asks for more shares than are held.
    #[error("Insufficient shares of {ticker}: requested {requested}, held {held}")]
    InsufficientShares {
        ticker: String,
        requested: Decimal,
        held: Decimal,
    },

    /// Trade arguments that can never be valid (empty ticker, non-positive size or price).
    #[error("Invalid trade: {0}")]
    InvalidTrade(String),

    /// The decision document could not be parsed or failed schema validation.
    #[error("Invalid decision format: {0}")]
    InvalidDecisionFormat(String),

    /// Market data for a ticker could not be obtained.
    #[error("Data unavailable for {ticker}: {reason}")]
    DataUnavailable { ticker: String, reason: String },

    /// A decision command failed to run or kept failing after retries.
    #[error("Decision source {source_name} failed: {reason}")]
    DecisionSource { source_name: String, reason: String },

    /// Not enough observations to compute risk metrics.
    #[error("Insufficient data: need at least {required} observations, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Invalid thresholds or options.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PortfolioError {
    pub fn data_unavailable(ticker: impl Into<String>, reason: impl ToString) -> Self {
        Self::DataUnavailable {
            ticker: ticker.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors that a retry might clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DataUnavailable { .. })
    }
}

pub type PortfolioResult<T> = std::result::Result<T, PortfolioError>;
