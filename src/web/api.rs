use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tracing::info;

use super::{ApiResult, AppState};
use crate::error::ForecastError;
use crate::market::MarketDataUpload;
use crate::types::{DatasetConfig, ModelId, ModelStatus, NewModel, RunId, StockId};

// === Health & catalog ===

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_architectures(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.registry.architectures().await?))
}

// === Models ===

#[derive(Debug, Deserialize)]
pub struct ModelFilter {
    pub status: Option<String>,
    pub architecture: Option<String>,
}

pub async fn post_model(
    State(state): State<AppState>,
    Json(req): Json<NewModel>,
) -> ApiResult<impl IntoResponse> {
    let model = state.service.registry.register(req).await?;
    Ok((StatusCode::CREATED, Json(model)))
}

pub async fn get_models(
    State(state): State<AppState>,
    Query(filter): Query<ModelFilter>,
) -> ApiResult<impl IntoResponse> {
    let status = filter.status.as_deref().map(ModelStatus::from_str).transpose()?;
    let models = state
        .service
        .registry
        .list_filtered(status, filter.architecture.as_deref())
        .await?;
    Ok(Json(models))
}

pub async fn get_model(State(state): State<AppState>, Path(id): Path<ModelId>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.registry.get(id).await?))
}

pub async fn delete_model(State(state): State<AppState>, Path(id): Path<ModelId>) -> ApiResult<impl IntoResponse> {
    state.service.registry.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct TrainRequest {
    pub dataset_config: Option<DatasetConfig>,
}

pub async fn post_train(
    State(state): State<AppState>,
    Path(id): Path<ModelId>,
    body: Option<Json<TrainRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let ticket = state.service.orchestrator.submit(id, req.dataset_config).await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

pub async fn get_runs(State(state): State<AppState>, Path(id): Path<ModelId>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.registry.training_runs(id).await?))
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<RunId>) -> ApiResult<impl IntoResponse> {
    let run = state
        .service
        .db
        .get_run(id)
        .await?
        .ok_or_else(|| ForecastError::NotFound(format!("training run {}", id)))?;
    Ok(Json(run))
}

pub async fn post_cancel_run(State(state): State<AppState>, Path(id): Path<RunId>) -> ApiResult<impl IntoResponse> {
    state.service.orchestrator.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "cancelling", "run_id": id}))))
}

#[derive(Debug, Deserialize)]
pub struct ImportanceQuery {
    #[serde(default)]
    pub history: bool,
}

pub async fn get_feature_importance(
    State(state): State<AppState>,
    Path(id): Path<ModelId>,
    Query(query): Query<ImportanceQuery>,
) -> ApiResult<impl IntoResponse> {
    let registry = &state.service.registry;
    let importance = if query.history {
        registry.feature_importance_history(id).await?
    } else {
        registry.feature_importance(id).await?
    };
    Ok(Json(importance))
}

// === Ensembles ===

#[derive(Debug, Deserialize)]
pub struct EnsembleRequest {
    pub name: String,
    pub version: String,
    pub member_model_ids: Vec<ModelId>,
    pub weights: Option<Vec<f64>>,
}

pub async fn post_ensemble(
    State(state): State<AppState>,
    Json(req): Json<EnsembleRequest>,
) -> ApiResult<impl IntoResponse> {
    let model = state
        .service
        .combiner
        .combine(&req.name, &req.version, &req.member_model_ids, req.weights.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(model)))
}

// === Predictions ===

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub model_id: ModelId,
    pub stock_id: StockId,
    pub as_of: Option<DateTime<Utc>>,
    pub horizon: Option<usize>,
}

pub async fn post_prediction(
    State(state): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> ApiResult<impl IntoResponse> {
    let engine = &state.service.engine;
    let horizon = req.horizon.unwrap_or_else(|| engine.default_horizon());
    let result = engine
        .predict(req.model_id, req.stock_id, req.as_of.unwrap_or_else(Utc::now), horizon)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[derive(Debug, Deserialize)]
pub struct BatchPredictRequest {
    pub model_ids: Vec<ModelId>,
    pub stock_ids: Vec<StockId>,
    pub as_of: Option<DateTime<Utc>>,
    pub horizon: Option<usize>,
}

pub async fn post_prediction_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchPredictRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.model_ids.is_empty() || req.stock_ids.is_empty() {
        return Err(ForecastError::InvalidInput("model_ids and stock_ids must not be empty".to_string()).into());
    }
    let engine = &state.service.engine;
    let horizon = req.horizon.unwrap_or_else(|| engine.default_horizon());
    let summary = engine
        .predict_many(&req.model_ids, &req.stock_ids, req.as_of.unwrap_or_else(Utc::now), horizon)
        .await;

    info!(
        "Batch prediction: {} succeeded, {} failed of {}",
        summary.succeeded, summary.failed, summary.requested
    );
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct PredictionQuery {
    pub model_id: ModelId,
    pub stock_id: StockId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub async fn get_predictions(
    State(state): State<AppState>,
    Query(query): Query<PredictionQuery>,
) -> ApiResult<impl IntoResponse> {
    let predictions = state
        .service
        .engine
        .predictions(query.model_id, query.stock_id, query.start, query.end)
        .await?;
    Ok(Json(predictions))
}

// === Comparison ===

#[derive(Debug, Deserialize)]
pub struct ComparisonQuery {
    pub stock_id: StockId,
    /// Comma-separated model ids
    pub model_ids: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

pub fn parse_model_ids(raw: &str) -> Result<Vec<ModelId>, ForecastError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ModelId>()
                .map_err(|_| ForecastError::InvalidInput(format!("invalid model id: {}", s)))
        })
        .collect()
}

pub async fn get_comparison(
    State(state): State<AppState>,
    Query(query): Query<ComparisonQuery>,
) -> ApiResult<impl IntoResponse> {
    let model_ids = parse_model_ids(&query.model_ids)?;
    let now = Utc::now();
    // Default window: the last 30 days through 5 days ahead
    let start = query.start.unwrap_or(now - Duration::days(30));
    let end = query.end.unwrap_or(now + Duration::days(5));

    let report = state.service.metrics.compare(query.stock_id, &model_ids, start, end).await?;
    Ok(Json(report))
}

// === Market data ===

pub async fn post_market_data(
    State(state): State<AppState>,
    Json(upload): Json<MarketDataUpload>,
) -> ApiResult<impl IntoResponse> {
    let bars = state.service.market.ingest(&upload).await?;
    Ok((StatusCode::CREATED, Json(json!({"stock_id": upload.stock_id, "bars": bars}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_ids() {
        assert_eq!(parse_model_ids("1,2, 3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_model_ids("4,").unwrap(), vec![4]);
        assert!(parse_model_ids("1,x").is_err());
    }
}
