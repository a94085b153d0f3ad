use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{ForecastError, Result};

pub type ModelId = i64;
pub type ArchitectureId = i64;
pub type StockId = i64;

/// Opaque per-model hyperparameter map, interpreted by each model family.
pub type Hyperparameters = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureCategory {
    Statistical,
    DeepLearning,
    Ensemble,
}

impl ArchitectureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchitectureCategory::Statistical => "statistical",
            ArchitectureCategory::DeepLearning => "deep_learning",
            ArchitectureCategory::Ensemble => "ensemble",
        }
    }
}

impl FromStr for ArchitectureCategory {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "statistical" => Ok(ArchitectureCategory::Statistical),
            "deep_learning" => Ok(ArchitectureCategory::DeepLearning),
            "ensemble" => Ok(ArchitectureCategory::Ensemble),
            _ => Err(ForecastError::InvalidInput(format!("unknown architecture category: {}", s))),
        }
    }
}

/// Catalog entry for a model family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub id: ArchitectureId,
    pub name: String,
    pub category: ArchitectureCategory,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Created,
    Training,
    Ready,
    Failed,
}

impl ModelStatus {
    pub const ALL: [ModelStatus; 4] = [
        ModelStatus::Created,
        ModelStatus::Training,
        ModelStatus::Ready,
        ModelStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Created => "created",
            ModelStatus::Training => "training",
            ModelStatus::Ready => "ready",
            ModelStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(ModelStatus::Created),
            "training" => Ok(ModelStatus::Training),
            "ready" => Ok(ModelStatus::Ready),
            "failed" => Ok(ModelStatus::Failed),
            _ => Err(ForecastError::InvalidInput(format!("unknown model status: {}", s))),
        }
    }
}

/// Which features a model consumes and how far back it looks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

fn default_target() -> String {
    "close".to_string()
}

fn default_lookback() -> usize {
    30
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            features: Vec::new(),
            target: default_target(),
            lookback: default_lookback(),
        }
    }
}

impl FeatureConfig {
    /// Column order of every window handed to a model: target first, then
    /// the remaining configured features without duplicates.
    pub fn input_names(&self) -> Vec<String> {
        let mut names = vec![self.target.clone()];
        for feature in &self.features {
            if !names.contains(feature) {
                names.push(feature.clone());
            }
        }
        names
    }
}

/// Where training data comes from and how it is split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub stock_ids: Vec<StockId>,
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_train_split")]
    pub train_split: f64,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

fn default_history() -> usize {
    250
}

fn default_train_split() -> f64 {
    0.8
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            stock_ids: Vec::new(),
            history: default_history(),
            train_split: default_train_split(),
            end: None,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stock_ids.is_empty() {
            return Err(ForecastError::InvalidInput("dataset config lists no stocks".to_string()));
        }
        if !(self.train_split > 0.0 && self.train_split < 1.0) {
            return Err(ForecastError::InvalidInput(format!(
                "train_split must be in (0, 1), got {}",
                self.train_split
            )));
        }
        if self.history < 2 {
            return Err(ForecastError::InvalidInput("history must be at least 2 rows".to_string()));
        }
        Ok(())
    }
}

/// A configured instance of an architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub architecture_id: ArchitectureId,
    pub architecture: String,
    pub category: ArchitectureCategory,
    pub name: String,
    pub version: String,
    pub hyperparameters: Hyperparameters,
    pub feature_config: FeatureConfig,
    pub training_dataset_config: DatasetConfig,
    pub artifact_location: Option<String>,
    pub status: ModelStatus,
    pub latest_importance_run_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_ready(&self) -> bool {
        self.status == ModelStatus::Ready
    }
}

/// Input to `ModelRegistry::register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewModel {
    pub architecture: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub feature_config: FeatureConfig,
    #[serde(default)]
    pub training_dataset_config: DatasetConfig,
}
