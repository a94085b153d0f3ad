//! Wires the registry, orchestrator, engines and stores into one service.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analytics::MetricsEngine;
use crate::config::ServiceConfig;
use crate::database::Database;
use crate::ensemble::EnsembleCombiner;
use crate::error::Result;
use crate::events::EventBus;
use crate::inference::{ArtifactCache, PredictionEngine};
use crate::market::{ActualsProvider, FeatureSource, SqliteMarketData};
use crate::ml::{ArtifactStore, FsArtifactStore};
use crate::registry::ModelRegistry;
use crate::training::TrainingOrchestrator;

/// Every component of the running service, cheap to clone into handlers
#[derive(Clone)]
pub struct ForecastService {
    pub config: ServiceConfig,
    pub db: Arc<Database>,
    pub events: EventBus,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: TrainingOrchestrator,
    pub combiner: EnsembleCombiner,
    pub engine: Arc<PredictionEngine>,
    pub metrics: Arc<MetricsEngine>,
    pub market: Arc<SqliteMarketData>,
}

impl ForecastService {
    /// Open the configured database and artifact directory. Market data for
    /// training, inference and scoring is served from the same database.
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database.url, config.database.max_connections).await?);
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(&config.artifacts.dir));
        let market = Arc::new(SqliteMarketData::new(db.clone()));

        Ok(Self::assemble(config, db, artifacts, market.clone(), market.clone(), market))
    }

    /// Build from explicit parts; used by tests and embedders with their own
    /// market-data adapters
    pub fn assemble(
        config: ServiceConfig,
        db: Arc<Database>,
        artifacts: Arc<dyn ArtifactStore>,
        features: Arc<dyn FeatureSource>,
        actuals: Arc<dyn ActualsProvider>,
        market: Arc<SqliteMarketData>,
    ) -> Self {
        let events = EventBus::default();
        let cache = Arc::new(ArtifactCache::new());

        let registry = Arc::new(ModelRegistry::new(
            db.clone(),
            artifacts.clone(),
            cache.clone(),
            events.clone(),
        ));
        let orchestrator = TrainingOrchestrator::new(
            db.clone(),
            features.clone(),
            artifacts.clone(),
            cache.clone(),
            events.clone(),
            config.training.clone(),
        );
        let combiner = EnsembleCombiner::new(registry.clone(), orchestrator.clone());
        let engine = Arc::new(PredictionEngine::new(
            db.clone(),
            features,
            artifacts,
            cache,
            events.clone(),
            config.inference.clone(),
        ));
        let metrics = Arc::new(MetricsEngine::new(db.clone(), actuals, config.metrics.clone()));

        Self {
            config,
            db,
            events,
            registry,
            orchestrator,
            combiner,
            engine,
            metrics,
            market,
        }
    }

    /// Seed the catalog and close runs orphaned by a previous process
    pub async fn bootstrap(&self) -> Result<()> {
        self.registry.bootstrap().await?;

        let recovered = self.orchestrator.recover_orphaned_runs().await?;
        if recovered > 0 {
            warn!("Closed {} training runs left open by a previous process", recovered);
        }
        info!("Forecast service ready");
        Ok(())
    }

    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        self.orchestrator.spawn_watchdog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketBar, MarketDataUpload};
    use crate::types::{DatasetConfig, FeatureConfig, ModelStatus, NewModel, RunStatus};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn in_memory_service(dir: &tempfile::TempDir) -> ForecastService {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let market = Arc::new(SqliteMarketData::new(db.clone()));
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
        let service = ForecastService::assemble(
            ServiceConfig::default(),
            db,
            artifacts,
            market.clone(),
            market.clone(),
            market,
        );
        service.bootstrap().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let service = in_memory_service(&dir).await;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let bars = (0..80)
            .map(|i| MarketBar {
                timestamp: start + Duration::days(i),
                close: 200.0 + 0.5 * i as f64 + ((i * 13 % 7) as f64 - 3.0) * 0.6,
                features: BTreeMap::new(),
            })
            .collect();
        service
            .market
            .ingest(&MarketDataUpload { stock_id: 7, bars })
            .await
            .unwrap();

        let model = service
            .registry
            .register(NewModel {
                architecture: "ARIMA".to_string(),
                name: "arima-7".to_string(),
                version: "1".to_string(),
                hyperparameters: json!({"p": 2}).as_object().cloned().unwrap(),
                feature_config: FeatureConfig {
                    lookback: 15,
                    ..FeatureConfig::default()
                },
                training_dataset_config: DatasetConfig {
                    stock_ids: vec![7],
                    history: 60,
                    train_split: 0.8,
                    end: Some(start + Duration::days(59)),
                },
            })
            .await
            .unwrap();

        let ticket = service.orchestrator.submit(model.id, None).await.unwrap();
        let run = service.orchestrator.await_run(ticket.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(service.registry.get(model.id).await.unwrap().status, ModelStatus::Ready);

        // Forecast days 60..=64 from day 59; actuals exist for all of them
        let as_of = start + Duration::days(59);
        let result = service.engine.predict(model.id, 7, as_of, 5).await.unwrap();
        assert_eq!(result.predictions.len(), 5);

        let report = service
            .metrics
            .compare(7, &[model.id], as_of, as_of + Duration::days(5))
            .await
            .unwrap();
        assert_eq!(report.metrics[0].metrics.sample_size, 5);
        assert!(report.metrics[0].metrics.mae.is_some());
        assert!(report.metrics[0].metrics.directional_accuracy.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_recovers_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let service = in_memory_service(&dir).await;
        let model = service
            .registry
            .register(NewModel {
                architecture: "ARIMA".to_string(),
                name: "orphan".to_string(),
                version: "1".to_string(),
                hyperparameters: Default::default(),
                feature_config: FeatureConfig::default(),
                training_dataset_config: DatasetConfig::default(),
            })
            .await
            .unwrap();
        service.db.begin_training(model.id, None, Utc::now()).await.unwrap();

        service.bootstrap().await.unwrap();
        assert_eq!(service.registry.get(model.id).await.unwrap().status, ModelStatus::Failed);
    }
}
