//! Weighted ensembles over already-registered models.

pub mod aggregator;

pub use aggregator::{weighted_combine, ForecastPoint, MemberForecast};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{ForecastError, Result};
use crate::registry::ModelRegistry;
use crate::training::TrainingOrchestrator;
use crate::types::{ArchitectureCategory, Model, ModelId, NewModel};

/// Catalog name of the ensemble architecture
pub const ENSEMBLE_ARCHITECTURE: &str = "WeightedEnsemble";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub model_id: ModelId,
    pub weight: f64,
}

/// Member list with weights summing to one; this is the ensemble's artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSpec {
    pub members: Vec<EnsembleMember>,
}

impl EnsembleSpec {
    /// Validate members and weights and normalize the weights. Uniform
    /// weights are used when none are given.
    pub fn normalized(member_ids: &[ModelId], weights: Option<&[f64]>) -> Result<Self> {
        if member_ids.len() < 2 {
            return Err(ForecastError::InvalidInput(
                "an ensemble needs at least two members".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = member_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ForecastError::InvalidInput(format!("model {} listed twice", dup)));
        }

        let raw: Vec<f64> = match weights {
            Some(w) if w.len() != member_ids.len() => {
                return Err(ForecastError::InvalidInput(format!(
                    "{} weights for {} members",
                    w.len(),
                    member_ids.len()
                )));
            }
            Some(w) => w.to_vec(),
            None => vec![1.0; member_ids.len()],
        };

        if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ForecastError::InvalidInput(
                "weights must be finite and non-negative".to_string(),
            ));
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            return Err(ForecastError::InvalidInput("weights must have a positive sum".to_string()));
        }

        let members = member_ids
            .iter()
            .zip(raw)
            .map(|(&model_id, w)| EnsembleMember {
                model_id,
                weight: w / total,
            })
            .collect();
        Ok(Self { members })
    }

    pub fn from_members(members: &[(ModelId, f64)]) -> Result<Self> {
        let ids: Vec<ModelId> = members.iter().map(|(id, _)| *id).collect();
        let weights: Vec<f64> = members.iter().map(|(_, w)| *w).collect();
        Self::normalized(&ids, Some(&weights))
    }

    pub fn member_ids(&self) -> Vec<ModelId> {
        self.members.iter().map(|m| m.model_id).collect()
    }

    pub fn pairs(&self) -> Vec<(ModelId, f64)> {
        self.members.iter().map(|m| (m.model_id, m.weight)).collect()
    }

    pub fn to_artifact(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_artifact(blob: &[u8]) -> Result<Self> {
        let spec: EnsembleSpec = serde_json::from_slice(blob)?;
        if spec.members.len() < 2 {
            return Err(ForecastError::InvalidInput("ensemble artifact has fewer than two members".to_string()));
        }
        Ok(spec)
    }
}

/// Registers ensembles and hands them to the orchestrator to be finalized
#[derive(Clone)]
pub struct EnsembleCombiner {
    registry: Arc<ModelRegistry>,
    orchestrator: TrainingOrchestrator,
}

impl EnsembleCombiner {
    pub fn new(registry: Arc<ModelRegistry>, orchestrator: TrainingOrchestrator) -> Self {
        Self { registry, orchestrator }
    }

    /// Members must exist and must not themselves be ensembles. The
    /// returned model is already `training`; it turns `ready` once its
    /// member specification is stored.
    pub async fn combine(
        &self,
        name: &str,
        version: &str,
        member_ids: &[ModelId],
        weights: Option<&[f64]>,
    ) -> Result<Model> {
        let spec = EnsembleSpec::normalized(member_ids, weights)?;

        for &member_id in member_ids {
            let member = self.registry.get(member_id).await?;
            if member.category == ArchitectureCategory::Ensemble {
                return Err(ForecastError::InvalidInput(format!(
                    "model {} is an ensemble; nested ensembles are not supported",
                    member_id
                )));
            }
        }

        let model = self
            .registry
            .register_ensemble(
                NewModel {
                    architecture: ENSEMBLE_ARCHITECTURE.to_string(),
                    name: name.to_string(),
                    version: version.to_string(),
                    hyperparameters: Default::default(),
                    feature_config: Default::default(),
                    training_dataset_config: Default::default(),
                },
                &spec.pairs(),
            )
            .await?;

        let ticket = self.orchestrator.submit(model.id, None).await?;
        info!(
            "Ensemble {} ({} v{}) combines {:?}, finalizing in run {}",
            model.id,
            model.name,
            model.version,
            spec.member_ids(),
            ticket.run_id
        );
        self.registry.get(model.id).await
    }
}
