use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::{ModelId, RunId, StockId};
use crate::error::{ForecastError, Result};

/// A single forecast point. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub batch_id: Uuid,
    pub model_id: ModelId,
    pub stock_id: StockId,
    /// Forecast origin
    pub prediction_timestamp: DateTime<Utc>,
    pub target_timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub features_used: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            _ => Err(ForecastError::InvalidInput(format!("unknown batch status: {}", s))),
        }
    }
}

/// Inference settings recorded with every batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub horizon: usize,
    pub lookback: usize,
    pub step_secs: i64,
    pub features: Vec<String>,
}

/// Groups the predictions produced by one inference invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionBatch {
    pub batch_id: Uuid,
    pub model_id: ModelId,
    pub training_run_id: Option<RunId>,
    pub stock_id: StockId,
    /// When the batch was generated
    pub prediction_timestamp: DateTime<Utc>,
    pub config: BatchConfig,
    pub status: BatchStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionBatchResult {
    pub batch: PredictionBatch,
    pub predictions: Vec<Prediction>,
}
