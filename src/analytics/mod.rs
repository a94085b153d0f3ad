//! Model comparison: predictions joined to realized prices, scored per model.

pub mod accuracy;

pub use accuracy::{AccuracyMetrics, MatchedPoint, SHARPE_CONVENTION};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use crate::config::MetricsSettings;
use crate::database::Database;
use crate::error::{ForecastError, Result};
use crate::market::ActualsProvider;
use crate::types::{ModelId, Prediction, StockId};

/// Realized value at one timeline point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// One stored prediction with the actual at its target, if known
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub target_timestamp: DateTime<Utc>,
    pub prediction_timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub actual: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSeries {
    pub model_id: ModelId,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: ModelId,
    #[serde(flatten)]
    pub metrics: AccuracyMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub stock_id: StockId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timeline: Vec<ActualPoint>,
    pub series: Vec<ModelSeries>,
    pub metrics: Vec<ModelMetrics>,
    pub sharpe_convention: String,
}

/// Read-only scorer over stored predictions
pub struct MetricsEngine {
    db: Arc<Database>,
    actuals: Arc<dyn ActualsProvider>,
    settings: MetricsSettings,
}

impl MetricsEngine {
    pub fn new(db: Arc<Database>, actuals: Arc<dyn ActualsProvider>, settings: MetricsSettings) -> Self {
        Self { db, actuals, settings }
    }

    /// Compare models on one stock over target timestamps in `[start, end]`.
    /// Series and metrics follow the requested model order.
    pub async fn compare(
        &self,
        stock_id: StockId,
        model_ids: &[ModelId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ComparisonReport> {
        if start > end {
            return Err(ForecastError::InvalidInput("start must not be after end".to_string()));
        }
        if model_ids.is_empty() {
            return Err(ForecastError::InvalidInput("no models to compare".to_string()));
        }

        let mut requested: Vec<ModelId> = Vec::with_capacity(model_ids.len());
        for &model_id in model_ids {
            if requested.contains(&model_id) {
                continue;
            }
            if self.db.get_model(model_id).await?.is_none() {
                return Err(ForecastError::NotFound(format!("model {}", model_id)));
            }
            requested.push(model_id);
        }

        let snapshot = self.db.predictions_snapshot(&requested, stock_id, start, end).await?;

        let timestamps: BTreeSet<DateTime<Utc>> = snapshot
            .values()
            .flatten()
            .map(|p| p.target_timestamp)
            .collect();

        let mut actuals: BTreeMap<DateTime<Utc>, Option<f64>> = BTreeMap::new();
        for &ts in &timestamps {
            actuals.insert(ts, self.actuals.get_actual(stock_id, ts).await?);
        }

        // Actual at the preceding timeline point
        let mut previous: BTreeMap<DateTime<Utc>, Option<f64>> = BTreeMap::new();
        let mut last: Option<f64> = None;
        for (&ts, &value) in &actuals {
            previous.insert(ts, last);
            last = value;
        }

        let mut series = Vec::with_capacity(requested.len());
        let mut metrics = Vec::with_capacity(requested.len());

        for model_id in requested {
            let predictions = snapshot.get(&model_id).map(Vec::as_slice).unwrap_or_default();

            let points = predictions
                .iter()
                .map(|p| SeriesPoint {
                    target_timestamp: p.target_timestamp,
                    prediction_timestamp: p.prediction_timestamp,
                    predicted_value: p.predicted_value,
                    confidence_lower: p.confidence_lower,
                    confidence_upper: p.confidence_upper,
                    actual: actuals.get(&p.target_timestamp).copied().flatten(),
                })
                .collect();

            let matched: Vec<MatchedPoint> = latest_per_target(predictions)
                .into_iter()
                .filter_map(|(ts, p)| {
                    let actual = actuals.get(&ts).copied().flatten()?;
                    Some(MatchedPoint {
                        predicted: p.predicted_value,
                        actual,
                        previous_actual: previous.get(&ts).copied().flatten(),
                    })
                })
                .collect();

            debug!(
                "Model {} on stock {}: {} predictions, {} matched",
                model_id,
                stock_id,
                predictions.len(),
                matched.len()
            );

            series.push(ModelSeries { model_id, points });
            metrics.push(ModelMetrics {
                model_id,
                metrics: accuracy::evaluate(&matched, self.settings.annualization_factor),
            });
        }

        Ok(ComparisonReport {
            stock_id,
            start,
            end,
            timeline: actuals
                .into_iter()
                .map(|(timestamp, value)| ActualPoint { timestamp, value })
                .collect(),
            series,
            metrics,
            sharpe_convention: SHARPE_CONVENTION.to_string(),
        })
    }
}

/// Most recent prediction for every target timestamp. Input is ordered by
/// prediction time within each target, so later entries win.
fn latest_per_target(predictions: &[Prediction]) -> BTreeMap<DateTime<Utc>, &Prediction> {
    let mut latest: BTreeMap<DateTime<Utc>, &Prediction> = BTreeMap::new();
    for p in predictions {
        match latest.get(&p.target_timestamp) {
            Some(current) if current.prediction_timestamp > p.prediction_timestamp => {}
            _ => {
                latest.insert(p.target_timestamp, p);
            }
        }
    }
    latest
}
