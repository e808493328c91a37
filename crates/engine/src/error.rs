//! Error taxonomy for backtest execution

use persistence::DbError;
use thiserror::Error;

use crate::types::{BacktestStatus, JobId};

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad request shape, date range, capital bounds or allocation sum
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No price data available for: {}", missing.join(", "))]
    DataUnavailable { missing: Vec<String> },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Upstream provider error: {0}")]
    Upstream(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Backtest {0} not found")]
    JobNotFound(JobId),

    #[error("Backtest {0} is running")]
    JobRunning(JobId),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: BacktestStatus,
        to: BacktestStatus,
    },

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors the caller can fix by changing the request
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnknownStrategy(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_unavailable_names_every_symbol() {
        let err = EngineError::DataUnavailable {
            missing: vec!["X".to_string(), "Y".to_string()],
        };
        assert_eq!(err.to_string(), "No price data available for: X, Y");
    }
}
