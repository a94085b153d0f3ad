use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ensemble::EnsembleSpec;
use crate::error::{ForecastError, Result};
use crate::ml::{load_model, ArtifactStore, ForecastModel};
use crate::types::{ArchitectureCategory, Model, ModelId};

/// A decoded artifact ready for inference
#[derive(Clone)]
pub enum LoadedArtifact {
    Forecaster(Arc<dyn ForecastModel>),
    Ensemble(Arc<EnsembleSpec>),
}

struct CachedArtifact {
    location: String,
    artifact: LoadedArtifact,
}

/// Decoded artifacts keyed by model. Entries are dropped on retrain and
/// delete, and a location mismatch forces a reload.
#[derive(Default)]
pub struct ArtifactCache {
    entries: RwLock<HashMap<ModelId, CachedArtifact>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(&self, model: &Model, store: &dyn ArtifactStore) -> Result<LoadedArtifact> {
        let location = model
            .artifact_location
            .as_deref()
            .ok_or_else(|| ForecastError::ArtifactMissing(format!("model {} has no artifact", model.id)))?;

        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&model.id) {
                if cached.location == location {
                    return Ok(cached.artifact.clone());
                }
            }
        }

        let blob = store.get(location).await?;
        let artifact = decode(model.category, &blob)
            .map_err(|e| ForecastError::ArtifactMissing(format!("{}: cannot decode ({})", location, e)))?;
        debug!("Loaded artifact {} for model {}", location, model.id);

        self.entries.write().await.insert(
            model.id,
            CachedArtifact {
                location: location.to_string(),
                artifact: artifact.clone(),
            },
        );
        Ok(artifact)
    }

    pub async fn invalidate(&self, model_id: ModelId) {
        if self.entries.write().await.remove(&model_id).is_some() {
            debug!("Invalidated cached artifact for model {}", model_id);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn decode(category: ArchitectureCategory, blob: &[u8]) -> Result<LoadedArtifact> {
    match category {
        ArchitectureCategory::Ensemble => Ok(LoadedArtifact::Ensemble(Arc::new(EnsembleSpec::from_artifact(blob)?))),
        other => Ok(LoadedArtifact::Forecaster(Arc::from(load_model(other, blob)?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::FsArtifactStore;
    use crate::types::{DatasetConfig, FeatureConfig, Hyperparameters, ModelStatus};
    use chrono::Utc;

    fn ensemble_model(location: Option<String>) -> Model {
        Model {
            id: 11,
            architecture_id: 3,
            architecture: "WeightedEnsemble".to_string(),
            category: ArchitectureCategory::Ensemble,
            name: "blend".to_string(),
            version: "1".to_string(),
            hyperparameters: Hyperparameters::new(),
            feature_config: FeatureConfig::default(),
            training_dataset_config: DatasetConfig::default(),
            artifact_location: location,
            status: ModelStatus::Ready,
            latest_importance_run_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_loads_once_then_serves_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let spec = EnsembleSpec::normalized(&[1, 2], None).unwrap();
        let location = store.put(11, "1", &spec.to_artifact().unwrap()).await.unwrap();

        let cache = ArtifactCache::new();
        let model = ensemble_model(Some(location.clone()));
        assert!(matches!(cache.get_or_load(&model, &store).await.unwrap(), LoadedArtifact::Ensemble(_)));
        assert_eq!(cache.len().await, 1);

        // Served from memory even after the file disappears
        store.delete(&location).await.unwrap();
        assert!(cache.get_or_load(&model, &store).await.is_ok());

        cache.invalidate(11).await;
        assert!(matches!(
            cache.get_or_load(&model, &store).await,
            Err(ForecastError::ArtifactMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_location_is_artifact_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let cache = ArtifactCache::new();

        let err = cache.get_or_load(&ensemble_model(None), &store).await.err().unwrap();
        assert!(matches!(err, ForecastError::ArtifactMissing(_)));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_artifact_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let location = store.put(11, "1", b"not json").await.unwrap();

        let cache = ArtifactCache::new();
        let err = cache.get_or_load(&ensemble_model(Some(location)), &store).await.err().unwrap();
        assert!(matches!(err, ForecastError::ArtifactMissing(_)));
    }
}
