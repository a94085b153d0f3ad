//! Architecture catalog and model instances.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::Database;
use crate::error::{ForecastError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::inference::ArtifactCache;
use crate::ml::{build_model, ArtifactStore};
use crate::types::{
    Architecture, ArchitectureCategory, FeatureImportance, Model, ModelId, ModelStatus, NewModel,
    TrainingRun,
};

/// Catalog seeded at bootstrap
pub const BUILTIN_ARCHITECTURES: &[(&str, ArchitectureCategory, &str)] = &[
    (
        "ARIMA",
        ArchitectureCategory::Statistical,
        "Autoregressive integrated moving average fitted with Yule-Walker estimates",
    ),
    (
        "MLP",
        ArchitectureCategory::DeepLearning,
        "Multi-layer perceptron with direct multi-horizon outputs and Monte-Carlo dropout bounds",
    ),
    (
        "WeightedEnsemble",
        ArchitectureCategory::Ensemble,
        "Weighted mean of member model forecasts",
    ),
];

pub struct ModelRegistry {
    db: Arc<Database>,
    artifacts: Arc<dyn ArtifactStore>,
    cache: Arc<ArtifactCache>,
    events: EventBus,
}

impl ModelRegistry {
    pub fn new(
        db: Arc<Database>,
        artifacts: Arc<dyn ArtifactStore>,
        cache: Arc<ArtifactCache>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            artifacts,
            cache,
            events,
        }
    }

    pub async fn bootstrap(&self) -> Result<()> {
        for (name, category, description) in BUILTIN_ARCHITECTURES {
            self.db.ensure_architecture(name, *category, description).await?;
        }
        info!("Architecture catalog ready ({} built-in)", BUILTIN_ARCHITECTURES.len());
        Ok(())
    }

    /// Register a trainable model in `created` state. Ensembles go through
    /// the combiner so their members are recorded with them.
    pub async fn register(&self, new_model: NewModel) -> Result<Model> {
        let architecture = self.architecture(&new_model.architecture).await?;
        if architecture.category == ArchitectureCategory::Ensemble {
            return Err(ForecastError::InvalidInput(
                "ensemble models are registered through combine".to_string(),
            ));
        }
        validate_identity(&new_model)?;
        if new_model.feature_config.lookback == 0 {
            return Err(ForecastError::InvalidInput("feature_config.lookback must be > 0".to_string()));
        }
        // Surface bad hyperparameters now rather than at the first training run
        build_model(architecture.category, &new_model.hyperparameters, &new_model.feature_config)?;

        self.insert(&architecture, &new_model, &[]).await
    }

    pub(crate) async fn register_ensemble(&self, new_model: NewModel, members: &[(ModelId, f64)]) -> Result<Model> {
        let architecture = self.architecture(&new_model.architecture).await?;
        if architecture.category != ArchitectureCategory::Ensemble {
            return Err(ForecastError::InvalidInput(format!(
                "{} is not an ensemble architecture",
                architecture.name
            )));
        }
        validate_identity(&new_model)?;

        self.insert(&architecture, &new_model, members).await
    }

    async fn insert(&self, architecture: &Architecture, new_model: &NewModel, members: &[(ModelId, f64)]) -> Result<Model> {
        let model_id = self
            .db
            .insert_model(architecture.id, new_model, members, Utc::now())
            .await?;
        let model = self.get(model_id).await?;

        info!(
            "Registered model {} ({} v{}, architecture {})",
            model.id, model.name, model.version, architecture.name
        );
        self.events.publish(ServiceEvent::ModelRegistered {
            model_id: model.id,
            name: model.name.clone(),
            version: model.version.clone(),
        });
        Ok(model)
    }

    async fn architecture(&self, name: &str) -> Result<Architecture> {
        self.db
            .get_architecture_by_name(name)
            .await?
            .ok_or_else(|| ForecastError::UnknownArchitecture(name.to_string()))
    }

    pub async fn get(&self, model_id: ModelId) -> Result<Model> {
        self.db
            .get_model(model_id)
            .await?
            .ok_or_else(|| ForecastError::NotFound(format!("model {}", model_id)))
    }

    pub async fn list(&self, status: Option<ModelStatus>) -> Result<Vec<Model>> {
        self.db.list_models(status, None).await
    }

    pub async fn list_filtered(&self, status: Option<ModelStatus>, architecture: Option<&str>) -> Result<Vec<Model>> {
        if let Some(name) = architecture {
            self.architecture(name).await?;
        }
        self.db.list_models(status, architecture).await
    }

    pub async fn list_by_architecture(&self, name: &str) -> Result<Vec<Model>> {
        self.list_filtered(None, Some(name)).await
    }

    pub async fn find(&self, name: &str, version: &str) -> Result<Option<Model>> {
        self.db.find_model(name, version).await
    }

    pub async fn architectures(&self) -> Result<Vec<Architecture>> {
        self.db.list_architectures().await
    }

    /// Members and normalized weights of an ensemble, in declaration order
    pub async fn ensemble_members(&self, ensemble_id: ModelId) -> Result<Vec<(ModelId, f64)>> {
        self.db.ensemble_members(ensemble_id).await
    }

    pub async fn delete(&self, model_id: ModelId) -> Result<()> {
        let model = self.get(model_id).await?;
        if model.status == ModelStatus::Training {
            return Err(ForecastError::AlreadyRunning(model_id));
        }
        let ensembles = self.db.ensembles_containing(model_id).await?;
        if !ensembles.is_empty() {
            return Err(ForecastError::InvalidInput(format!(
                "model {} is a member of ensemble(s) {:?}",
                model_id, ensembles
            )));
        }

        if !self.db.delete_model(model_id).await? {
            // Lost a race with a submit or a concurrent delete
            return match self.db.get_model(model_id).await? {
                Some(_) => Err(ForecastError::AlreadyRunning(model_id)),
                None => Err(ForecastError::NotFound(format!("model {}", model_id))),
            };
        }

        self.cache.invalidate(model_id).await;
        if let Some(location) = &model.artifact_location {
            if let Err(e) = self.artifacts.delete(location).await {
                warn!("Model {} deleted but artifact {} was not removed: {}", model_id, location, e);
            }
        }

        info!("Deleted model {} ({} v{})", model_id, model.name, model.version);
        self.events.publish(ServiceEvent::ModelDeleted { model_id });
        Ok(())
    }

    /// Importance scores from the run that produced the current artifact
    pub async fn feature_importance(&self, model_id: ModelId) -> Result<Vec<FeatureImportance>> {
        let model = self.get(model_id).await?;
        match model.latest_importance_run_id {
            Some(run_id) => self.db.feature_importance_for_run(model_id, run_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Every run's importance scores, newest run first
    pub async fn feature_importance_history(&self, model_id: ModelId) -> Result<Vec<FeatureImportance>> {
        self.get(model_id).await?;
        self.db.feature_importance_history(model_id).await
    }

    pub async fn training_runs(&self, model_id: ModelId) -> Result<Vec<TrainingRun>> {
        self.get(model_id).await?;
        self.db.list_runs(model_id).await
    }
}

fn validate_identity(new_model: &NewModel) -> Result<()> {
    if new_model.name.trim().is_empty() || new_model.version.trim().is_empty() {
        return Err(ForecastError::InvalidInput("model name and version must be non-empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RunOutcome;
    use crate::ml::FsArtifactStore;
    use crate::types::{DatasetConfig, FeatureConfig, Hyperparameters};
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn registry() -> (ModelRegistry, Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());
        let registry = ModelRegistry::new(
            db.clone(),
            Arc::new(FsArtifactStore::new(dir.path())),
            Arc::new(ArtifactCache::new()),
            EventBus::default(),
        );
        registry.bootstrap().await.unwrap();
        (registry, db, dir)
    }

    fn arima(name: &str, version: &str) -> NewModel {
        NewModel {
            architecture: "ARIMA".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            hyperparameters: json!({"p": 2}).as_object().cloned().unwrap(),
            feature_config: FeatureConfig::default(),
            training_dataset_config: DatasetConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let (registry, _db, _dir) = registry().await;
        registry.bootstrap().await.unwrap();

        let names: Vec<String> = registry.architectures().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["ARIMA", "MLP", "WeightedEnsemble"]);
    }

    #[tokio::test]
    async fn test_register_starts_created() {
        let (registry, _db, _dir) = registry().await;
        let model = registry.register(arima("spy-arima", "1.0")).await.unwrap();

        assert_eq!(model.status, ModelStatus::Created);
        assert_eq!(model.architecture, "ARIMA");
        assert_eq!(model.category, ArchitectureCategory::Statistical);
        assert!(model.artifact_location.is_none());
        assert!(registry.training_runs(model.id).await.unwrap().is_empty());
        assert_eq!(registry.find("spy-arima", "1.0").await.unwrap().unwrap().id, model.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_version_rejected() {
        let (registry, _db, _dir) = registry().await;
        registry.register(arima("m", "1")).await.unwrap();

        let err = registry.register(arima("m", "1")).await.unwrap_err();
        assert!(matches!(err, ForecastError::DuplicateModel { .. }));
        assert!(registry.register(arima("m", "2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_architecture_rejected() {
        let (registry, _db, _dir) = registry().await;
        let mut new_model = arima("m", "1");
        new_model.architecture = "Prophet".to_string();

        let err = registry.register(new_model).await.unwrap_err();
        assert!(matches!(err, ForecastError::UnknownArchitecture(name) if name == "Prophet"));
    }

    #[tokio::test]
    async fn test_invalid_hyperparameters_rejected() {
        let (registry, _db, _dir) = registry().await;
        let mut new_model = arima("m", "1");
        new_model.hyperparameters = Hyperparameters::from_iter([("p".to_string(), json!(42))]);

        assert!(matches!(registry.register(new_model).await, Err(ForecastError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (registry, db, _dir) = registry().await;
        let a = registry.register(arima("a", "1")).await.unwrap();
        let mut mlp = arima("b", "1");
        mlp.architecture = "MLP".to_string();
        mlp.hyperparameters = Hyperparameters::new();
        registry.register(mlp).await.unwrap();

        db.begin_training(a.id, None, Utc::now()).await.unwrap();

        assert_eq!(registry.list(None).await.unwrap().len(), 2);
        let training = registry.list(Some(ModelStatus::Training)).await.unwrap();
        assert_eq!(training.len(), 1);
        assert_eq!(training[0].id, a.id);
        assert_eq!(registry.list_by_architecture("MLP").await.unwrap().len(), 1);
        assert!(registry.list_by_architecture("LSTM").await.is_err());
    }

    #[tokio::test]
    async fn test_get_missing_model() {
        let (registry, _db, _dir) = registry().await;
        assert!(matches!(registry.get(99).await, Err(ForecastError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (registry, db, _dir) = registry().await;
        let a = registry.register(arima("a", "1")).await.unwrap();
        let b = registry.register(arima("b", "1")).await.unwrap();

        let run = db.begin_training(a.id, None, Utc::now()).await.unwrap();
        assert!(matches!(registry.delete(a.id).await, Err(ForecastError::AlreadyRunning(_))));
        db.complete_run(run, a.id, &RunOutcome::default(), "1/1/x.bin", Utc::now())
            .await
            .unwrap();

        let blend = NewModel {
            architecture: "WeightedEnsemble".to_string(),
            name: "blend".to_string(),
            version: "1".to_string(),
            hyperparameters: Hyperparameters::new(),
            feature_config: FeatureConfig::default(),
            training_dataset_config: DatasetConfig::default(),
        };
        let ensemble = registry.register_ensemble(blend, &[(a.id, 0.5), (b.id, 0.5)]).await.unwrap();
        assert!(matches!(registry.delete(a.id).await, Err(ForecastError::InvalidInput(_))));

        registry.delete(ensemble.id).await.unwrap();
        registry.delete(a.id).await.unwrap();
        assert!(matches!(registry.get(a.id).await, Err(ForecastError::NotFound(_))));
        assert!(db.list_runs(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_importance_latest_and_history() {
        let (registry, db, _dir) = registry().await;
        let model = registry.register(arima("a", "1")).await.unwrap();
        assert!(registry.feature_importance(model.id).await.unwrap().is_empty());

        for (i, score) in [0.7, 0.4].iter().enumerate() {
            let run = db.begin_training(model.id, None, Utc::now()).await.unwrap();
            let outcome = RunOutcome {
                feature_importance: BTreeMap::from([
                    ("close_lag_1".to_string(), *score),
                    ("close_lag_2".to_string(), 1.0 - score),
                ]),
                ..RunOutcome::default()
            };
            db.complete_run(run, model.id, &outcome, &format!("{}/1/{}.bin", model.id, i), Utc::now())
                .await
                .unwrap();
        }

        let latest = registry.feature_importance(model.id).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].feature_name, "close_lag_2");
        assert!((latest[0].score - 0.6).abs() < 1e-12);

        let history = registry.feature_importance_history(model.id).await.unwrap();
        assert_eq!(history.len(), 4);
        assert!(history[0].run_id > history[3].run_id);
    }

    #[tokio::test]
    async fn test_plain_register_refuses_ensembles() {
        let (registry, _db, _dir) = registry().await;
        let mut new_model = arima("e", "1");
        new_model.architecture = "WeightedEnsemble".to_string();
        assert!(matches!(registry.register(new_model).await, Err(ForecastError::InvalidInput(_))));
    }
}
