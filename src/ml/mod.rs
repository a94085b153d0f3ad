//! Model families behind a single capability set: fit on a training set,
//! forecast a horizon with bounds, describe feature importance, and
//! serialize to an artifact.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{ForecastError, Result};
use crate::market::FeatureWindow;
use crate::types::{ArchitectureCategory, FeatureConfig, Hyperparameters, RunId};

pub mod arima;
pub mod features;
pub mod mlp;
pub mod persistence;
pub mod stats;

pub use arima::ArimaModel;
pub use mlp::MlpModel;
pub use persistence::{ArtifactStore, FsArtifactStore};

/// Point forecast with its interval for one horizon step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalForecast {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Per-stock history windows plus the chronological split ratio
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub series: Vec<FeatureWindow>,
    pub train_split: f64,
}

impl TrainingSet {
    /// First validation row of a series with `len` rows
    pub fn split_point(&self, len: usize) -> usize {
        ((len as f64) * self.train_split).floor() as usize
    }

    pub fn total_rows(&self) -> usize {
        self.series.iter().map(|s| s.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
}

/// Liveness and cancellation handle shared between a running fit and the
/// orchestrator's watchdog.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    run_id: RunId,
    cancel: Arc<AtomicBool>,
    heartbeat: Arc<AtomicI64>,
}

impl TrainingContext {
    pub fn new(run_id: RunId, cancel: Arc<AtomicBool>, heartbeat: Arc<AtomicI64>) -> Self {
        Self {
            run_id,
            cancel,
            heartbeat,
        }
    }

    /// Detached context for fits that nothing supervises
    pub fn detached(run_id: RunId) -> Self {
        Self::new(
            run_id,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        )
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Record liveness, then stop if cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        self.heartbeat.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ForecastError::Cancelled(self.run_id));
        }
        Ok(())
    }
}

pub trait ForecastModel: Send + Sync {
    fn family(&self) -> &'static str;

    fn fit(&mut self, data: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingReport>;

    /// Forecast `horizon` steps after the last row of `window`
    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<Vec<IntervalForecast>>;

    /// Longest horizon the fitted model can serve, if bounded
    fn max_horizon(&self) -> Option<usize> {
        None
    }

    fn feature_importance(&self) -> BTreeMap<String, f64>;

    fn to_artifact(&self) -> Result<Vec<u8>>;
}

/// Fresh, unfitted model for a trainable category
pub fn build_model(
    category: ArchitectureCategory,
    hyperparameters: &Hyperparameters,
    feature_config: &FeatureConfig,
) -> Result<Box<dyn ForecastModel>> {
    match category {
        ArchitectureCategory::Statistical => Ok(Box::new(ArimaModel::new(hyperparameters, feature_config)?)),
        ArchitectureCategory::DeepLearning => Ok(Box::new(MlpModel::new(hyperparameters, feature_config)?)),
        ArchitectureCategory::Ensemble => Err(ForecastError::InvalidInput(
            "ensemble models are combined, not fitted".to_string(),
        )),
    }
}

/// Rehydrate a fitted model from its artifact bytes
pub fn load_model(category: ArchitectureCategory, blob: &[u8]) -> Result<Box<dyn ForecastModel>> {
    match category {
        ArchitectureCategory::Statistical => Ok(Box::new(ArimaModel::from_artifact(blob)?)),
        ArchitectureCategory::DeepLearning => Ok(Box::new(MlpModel::from_artifact(blob)?)),
        ArchitectureCategory::Ensemble => Err(ForecastError::InvalidInput(
            "ensemble artifacts hold a member specification".to_string(),
        )),
    }
}

pub(crate) fn param_usize(hp: &Hyperparameters, key: &str, default: usize) -> Result<usize> {
    match hp.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| ForecastError::InvalidInput(format!("hyperparameter '{}' must be a non-negative integer", key))),
    }
}

pub(crate) fn param_f64(hp: &Hyperparameters, key: &str, default: f64) -> Result<f64> {
    match hp.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|x| x.is_finite())
            .ok_or_else(|| ForecastError::InvalidInput(format!("hyperparameter '{}' must be a finite number", key))),
    }
}

pub(crate) fn check_confidence(level: f64) -> Result<f64> {
    if level > 0.0 && level < 1.0 {
        Ok(level)
    } else {
        Err(ForecastError::InvalidInput(format!(
            "confidence_level must be in (0, 1), got {}",
            level
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hp(value: Value) -> Hyperparameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_param_defaults_and_types() {
        let params = hp(json!({"p": 3, "dropout": 0.2, "bad": "x"}));
        assert_eq!(param_usize(&params, "p", 5).unwrap(), 3);
        assert_eq!(param_usize(&params, "q", 0).unwrap(), 0);
        assert_eq!(param_f64(&params, "dropout", 0.1).unwrap(), 0.2);
        assert!(param_usize(&params, "bad", 1).is_err());
        assert!(param_f64(&params, "bad", 1.0).is_err());
    }

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let cancel = Arc::new(AtomicBool::new(false));
        let heartbeat = Arc::new(AtomicI64::new(0));
        let ctx = TrainingContext::new(9, cancel.clone(), heartbeat.clone());

        assert!(ctx.checkpoint().is_ok());
        assert!(heartbeat.load(Ordering::SeqCst) > 0);

        cancel.store(true, Ordering::SeqCst);
        assert!(matches!(ctx.checkpoint(), Err(ForecastError::Cancelled(9))));
    }

    #[test]
    fn test_ensemble_category_is_not_buildable() {
        let result = build_model(
            ArchitectureCategory::Ensemble,
            &Hyperparameters::new(),
            &FeatureConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_split_point() {
        let set = TrainingSet {
            series: Vec::new(),
            train_split: 0.8,
        };
        assert_eq!(set.split_point(100), 80);
        assert_eq!(set.split_point(9), 7);
    }
}
