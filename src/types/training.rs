use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::ModelId;
use crate::error::{ForecastError, Result};

pub type RunId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(ForecastError::InvalidInput(format!("unknown run status: {}", s))),
        }
    }
}

/// Why a run ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    Failed,
    Timeout,
    Cancelled,
}

impl RunErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunErrorKind::Failed => "failed",
            RunErrorKind::Timeout => "timeout",
            RunErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn from_error(err: &ForecastError) -> Self {
        match err {
            ForecastError::Timeout(_) => RunErrorKind::Timeout,
            ForecastError::Cancelled(_) => RunErrorKind::Cancelled,
            _ => RunErrorKind::Failed,
        }
    }
}

impl FromStr for RunErrorKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "failed" => Ok(RunErrorKind::Failed),
            "timeout" => Ok(RunErrorKind::Timeout),
            "cancelled" => Ok(RunErrorKind::Cancelled),
            _ => Err(ForecastError::InvalidInput(format!("unknown run error kind: {}", s))),
        }
    }
}

/// One execution attempt of training a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: RunId,
    pub model_id: ModelId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub error_kind: Option<RunErrorKind>,
    pub error_message: Option<String>,
}

impl TrainingRun {
    pub fn is_open(&self) -> bool {
        self.status == RunStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub model_id: ModelId,
    pub run_id: RunId,
    pub feature_name: String,
    pub score: f64,
}

/// Handle returned by `submit`; the outcome is observed through status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingTicket {
    pub run_id: RunId,
    pub model_id: ModelId,
}
