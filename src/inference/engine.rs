use chrono::{DateTime, Duration, SubsecRound, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{ArtifactCache, LoadedArtifact};
use crate::config::InferenceSettings;
use crate::database::Database;
use crate::ensemble::{weighted_combine, EnsembleSpec, ForecastPoint, MemberForecast};
use crate::error::{ForecastError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::market::FeatureSource;
use crate::ml::{ArtifactStore, ForecastModel};
use crate::types::{
    BatchConfig, BatchStatus, Model, ModelId, Prediction, PredictionBatch, PredictionBatchResult,
    StockId,
};

/// Points for one request plus what went into them
struct Forecast {
    points: Vec<ForecastPoint>,
    features: Vec<String>,
    lookback: usize,
}

/// Outcome of one (model, stock) pair inside `predict_many`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub model_id: ModelId,
    pub stock_id: StockId,
    pub batch_id: Option<Uuid>,
    pub predictions: usize,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<PairOutcome>,
}

pub struct PredictionEngine {
    db: Arc<Database>,
    features: Arc<dyn FeatureSource>,
    artifacts: Arc<dyn ArtifactStore>,
    cache: Arc<ArtifactCache>,
    events: EventBus,
    settings: InferenceSettings,
}

impl PredictionEngine {
    pub fn new(
        db: Arc<Database>,
        features: Arc<dyn FeatureSource>,
        artifacts: Arc<dyn ArtifactStore>,
        cache: Arc<ArtifactCache>,
        events: EventBus,
        settings: InferenceSettings,
    ) -> Self {
        Self {
            db,
            features,
            artifacts,
            cache,
            events,
            settings,
        }
    }

    pub fn default_horizon(&self) -> usize {
        self.settings.default_horizon
    }

    /// Forecast `horizon` steps after `as_of` and persist them as one batch.
    /// Stored predictions carry `as_of` as their prediction timestamp so
    /// forecasts from past origins can be scored; the batch records when it
    /// was generated.
    pub async fn predict(
        &self,
        model_id: ModelId,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        horizon: usize,
    ) -> Result<PredictionBatchResult> {
        if horizon == 0 {
            return Err(ForecastError::InvalidInput("horizon must be > 0".to_string()));
        }
        if horizon > self.settings.max_horizon {
            return Err(ForecastError::InvalidInput(format!(
                "horizon {} exceeds the configured maximum of {}",
                horizon, self.settings.max_horizon
            )));
        }
        // Stored with microsecond precision
        let as_of = as_of.trunc_subsecs(6);
        target_timestamps(as_of, self.settings.step_secs, horizon)?;

        let model = self.ready_model(model_id).await?;

        let outcome = match self.forecast(&model, stock_id, as_of, horizon).await {
            Ok(forecast) => self.store(&model, stock_id, as_of, horizon, forecast).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            self.record_failed_batch(&model, stock_id, horizon, e).await;
        }
        outcome
    }

    async fn store(
        &self,
        model: &Model,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        horizon: usize,
        forecast: Forecast,
    ) -> Result<PredictionBatchResult> {
        let model_id = model.id;
        let batch_id = Uuid::new_v4();
        let batch = PredictionBatch {
            batch_id,
            model_id,
            training_run_id: self.db.latest_completed_run(model_id).await?,
            stock_id,
            prediction_timestamp: Utc::now().trunc_subsecs(6),
            config: BatchConfig {
                horizon,
                lookback: forecast.lookback,
                step_secs: self.settings.step_secs,
                features: forecast.features.clone(),
            },
            status: BatchStatus::Completed,
            error: None,
        };

        let predictions: Vec<Prediction> = forecast
            .points
            .iter()
            .map(|p| Prediction {
                batch_id,
                model_id,
                stock_id,
                prediction_timestamp: as_of,
                target_timestamp: p.target_timestamp,
                predicted_value: p.value,
                confidence_lower: p.lower,
                confidence_upper: p.upper,
                features_used: forecast.features.clone(),
            })
            .collect();

        self.db.insert_batch(&batch, &predictions).await?;

        info!(
            "Generated {} predictions for model {} on stock {} (batch {})",
            predictions.len(),
            model_id,
            stock_id,
            batch_id
        );
        self.events.publish(ServiceEvent::PredictionsGenerated {
            batch_id,
            model_id,
            stock_id,
            count: predictions.len(),
        });

        Ok(PredictionBatchResult { batch, predictions })
    }

    /// Every (model, stock) pair; failures are counted, not raised
    pub async fn predict_many(
        &self,
        model_ids: &[ModelId],
        stock_ids: &[StockId],
        as_of: DateTime<Utc>,
        horizon: usize,
    ) -> BatchSummary {
        let mut outcomes = Vec::with_capacity(model_ids.len() * stock_ids.len());

        for &model_id in model_ids {
            for &stock_id in stock_ids {
                let outcome = match self.predict(model_id, stock_id, as_of, horizon).await {
                    Ok(result) => PairOutcome {
                        model_id,
                        stock_id,
                        batch_id: Some(result.batch.batch_id),
                        predictions: result.predictions.len(),
                        error_kind: None,
                        error: None,
                    },
                    Err(e) => {
                        warn!("Prediction failed for model {} on stock {}: {}", model_id, stock_id, e);
                        PairOutcome {
                            model_id,
                            stock_id,
                            batch_id: None,
                            predictions: 0,
                            error_kind: Some(e.kind().to_string()),
                            error: Some(e.to_string()),
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }

        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        BatchSummary {
            requested: outcomes.len(),
            succeeded: outcomes.len() - failed,
            failed,
            outcomes,
        }
    }

    pub async fn predictions(
        &self,
        model_id: ModelId,
        stock_id: StockId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Prediction>> {
        if start > end {
            return Err(ForecastError::InvalidInput("start must not be after end".to_string()));
        }
        self.db.predictions_for(model_id, stock_id, start, end).await
    }

    pub async fn batch(&self, batch_id: Uuid) -> Result<PredictionBatch> {
        self.db
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| ForecastError::NotFound(format!("prediction batch {}", batch_id)))
    }

    async fn ready_model(&self, model_id: ModelId) -> Result<Model> {
        let model = self
            .db
            .get_model(model_id)
            .await?
            .ok_or_else(|| ForecastError::NotFound(format!("model {}", model_id)))?;
        if !model.is_ready() {
            return Err(ForecastError::ModelNotReady {
                model_id,
                status: model.status,
            });
        }
        Ok(model)
    }

    async fn forecast(&self, model: &Model, stock_id: StockId, as_of: DateTime<Utc>, horizon: usize) -> Result<Forecast> {
        match self.cache.get_or_load(model, self.artifacts.as_ref()).await? {
            LoadedArtifact::Forecaster(forecaster) => self.single(model, forecaster, stock_id, as_of, horizon).await,
            LoadedArtifact::Ensemble(spec) => self.ensemble(model, &spec, stock_id, as_of, horizon).await,
        }
    }

    async fn single(
        &self,
        model: &Model,
        forecaster: Arc<dyn ForecastModel>,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        horizon: usize,
    ) -> Result<Forecast> {
        if let Some(max) = forecaster.max_horizon() {
            if horizon > max {
                return Err(ForecastError::InvalidInput(format!(
                    "model {} was trained for at most {} steps, requested {}",
                    model.id, max, horizon
                )));
            }
        }

        let names = model.feature_config.input_names();
        let lookback = model.feature_config.lookback;
        let window = self
            .features
            .get_feature_window(stock_id, as_of, lookback, &names)
            .await?;

        let intervals = tokio::task::spawn_blocking(move || forecaster.forecast(&window, horizon))
            .await
            .map_err(|e| ForecastError::Training(format!("forecast task aborted: {}", e)))??;

        let targets = target_timestamps(as_of, self.settings.step_secs, horizon)?;
        let points = intervals
            .into_iter()
            .zip(targets)
            .map(|(f, target_timestamp)| ForecastPoint {
                target_timestamp,
                value: f.value,
                lower: f.lower,
                upper: f.upper,
            })
            .collect();

        Ok(Forecast {
            points,
            features: names,
            lookback,
        })
    }

    async fn ensemble(
        &self,
        model: &Model,
        spec: &EnsembleSpec,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        horizon: usize,
    ) -> Result<Forecast> {
        let forecasts = try_join_all(spec.members.iter().map(|member| async move {
            self.member_forecast(member.model_id, stock_id, as_of, horizon)
                .await
                .map_err(|e| match e {
                    ForecastError::MemberNotReady { .. } => e,
                    other => ForecastError::MemberNotReady {
                        member: member.model_id,
                        reason: other.to_string(),
                    },
                })
        }))
        .await?;

        let mut members = Vec::with_capacity(forecasts.len());
        let mut features: Vec<String> = Vec::new();
        let mut lookback = 0;
        for (member, forecast) in spec.members.iter().zip(forecasts) {
            for name in &forecast.features {
                if !features.contains(name) {
                    features.push(name.clone());
                }
            }
            lookback = lookback.max(forecast.lookback);
            members.push(MemberForecast {
                model_id: member.model_id,
                weight: member.weight,
                points: forecast.points,
            });
        }

        debug!("Ensemble {} combining {} members", model.id, members.len());
        Ok(Forecast {
            points: weighted_combine(&members)?,
            features,
            lookback,
        })
    }

    async fn member_forecast(
        &self,
        member_id: ModelId,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        horizon: usize,
    ) -> Result<Forecast> {
        let member = self.db.get_model(member_id).await?.ok_or_else(|| ForecastError::MemberNotReady {
            member: member_id,
            reason: "model no longer exists".to_string(),
        })?;
        if !member.is_ready() {
            return Err(ForecastError::MemberNotReady {
                member: member_id,
                reason: format!("status is {}", member.status),
            });
        }

        match self.cache.get_or_load(&member, self.artifacts.as_ref()).await? {
            LoadedArtifact::Forecaster(forecaster) => self.single(&member, forecaster, stock_id, as_of, horizon).await,
            LoadedArtifact::Ensemble(_) => Err(ForecastError::MemberNotReady {
                member: member_id,
                reason: "nested ensembles are not supported".to_string(),
            }),
        }
    }

    async fn record_failed_batch(&self, model: &Model, stock_id: StockId, horizon: usize, err: &ForecastError) {
        let batch = PredictionBatch {
            batch_id: Uuid::new_v4(),
            model_id: model.id,
            training_run_id: None,
            stock_id,
            prediction_timestamp: Utc::now().trunc_subsecs(6),
            config: BatchConfig {
                horizon,
                lookback: model.feature_config.lookback,
                step_secs: self.settings.step_secs,
                features: model.feature_config.input_names(),
            },
            status: BatchStatus::Failed,
            error: Some(err.to_string()),
        };
        if let Err(store_err) = self.db.insert_batch(&batch, &[]).await {
            warn!("Could not record failed batch for model {}: {}", model.id, store_err);
        }
    }
}

/// `as_of + k × step` for k in 1..=horizon; overflow is a bad request
fn target_timestamps(as_of: DateTime<Utc>, step_secs: i64, horizon: usize) -> Result<Vec<DateTime<Utc>>> {
    (1..=horizon)
        .map(|k| {
            i64::try_from(k)
                .ok()
                .and_then(|k| step_secs.checked_mul(k))
                .and_then(Duration::try_seconds)
                .and_then(|offset| as_of.checked_add_signed(offset))
                .ok_or_else(|| {
                    ForecastError::InvalidInput(format!(
                        "{} steps of {}s after {} fall outside the supported time range",
                        horizon, step_secs, as_of
                    ))
                })
        })
        .collect()
}
