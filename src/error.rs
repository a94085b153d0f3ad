use thiserror::Error;

use crate::types::{ModelId, ModelStatus, RunId};

pub type Result<T> = std::result::Result<T, ForecastError>;

/// Errors surfaced by the registry, orchestrator, engines and stores.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("model {name} version {version} already exists")]
    DuplicateModel { name: String, version: String },

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("model {0} already has an open training run")]
    AlreadyRunning(ModelId),

    #[error("model {model_id} is not ready (status: {status})")]
    ModelNotReady { model_id: ModelId, status: ModelStatus },

    #[error("artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("ensemble member {member} not ready: {reason}")]
    MemberNotReady { member: ModelId, reason: String },

    #[error("member forecasts are misaligned: {0}")]
    AlignmentError(String),

    #[error("insufficient history for stock {stock_id}: need {required} rows, have {available}")]
    InsufficientHistory {
        stock_id: i64,
        required: usize,
        available: usize,
    },

    #[error("training run {0} timed out")]
    Timeout(RunId),

    #[error("training run {0} was cancelled")]
    Cancelled(RunId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForecastError {
    /// Stable machine-readable kind, used in API payloads and run records.
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::DuplicateModel { .. } => "duplicate_model",
            ForecastError::UnknownArchitecture(_) => "unknown_architecture",
            ForecastError::NotFound(_) => "not_found",
            ForecastError::AlreadyRunning(_) => "already_running",
            ForecastError::ModelNotReady { .. } => "model_not_ready",
            ForecastError::ArtifactMissing(_) => "artifact_missing",
            ForecastError::MemberNotReady { .. } => "member_not_ready",
            ForecastError::AlignmentError(_) => "alignment_error",
            ForecastError::InsufficientHistory { .. } => "insufficient_history",
            ForecastError::Timeout(_) => "timeout",
            ForecastError::Cancelled(_) => "cancelled",
            ForecastError::InvalidInput(_) => "invalid_input",
            ForecastError::Training(_) => "training",
            ForecastError::Storage(_) => "storage",
            ForecastError::Serialization(_) => "serialization",
            ForecastError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        let err = ForecastError::AlreadyRunning(7);
        assert_eq!(err.kind(), "already_running");
        assert_eq!(err.to_string(), "model 7 already has an open training run");

        let err = ForecastError::ModelNotReady { model_id: 3, status: ModelStatus::Failed };
        assert_eq!(err.kind(), "model_not_ready");
        assert!(err.to_string().contains("failed"));
    }

    #[test]
    fn test_insufficient_history_message() {
        let err = ForecastError::InsufficientHistory { stock_id: 1, required: 30, available: 12 };
        assert_eq!(err.to_string(), "insufficient history for stock 1: need 30 rows, have 12");
    }
}
