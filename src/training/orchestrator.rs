use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::jobs::{JobHandle, JobTable};
use crate::config::TrainingSettings;
use crate::database::{Database, RunOutcome};
use crate::ensemble::EnsembleSpec;
use crate::error::{ForecastError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::inference::ArtifactCache;
use crate::market::FeatureSource;
use crate::ml::{build_model, ArtifactStore, TrainingSet};
use crate::types::{
    ArchitectureCategory, DatasetConfig, Model, ModelId, RunErrorKind, RunId, TrainingRun,
    TrainingTicket,
};

const AWAIT_POLL: Duration = Duration::from_millis(25);

/// Runs training jobs: one open run per model, a bounded worker pool,
/// accelerator permits for deep-learning fits, and a heartbeat watchdog.
#[derive(Clone)]
pub struct TrainingOrchestrator {
    db: Arc<Database>,
    features: Arc<dyn FeatureSource>,
    artifacts: Arc<dyn ArtifactStore>,
    cache: Arc<ArtifactCache>,
    events: EventBus,
    jobs: Arc<JobTable>,
    workers: Arc<Semaphore>,
    accelerators: Option<Arc<Semaphore>>,
    settings: TrainingSettings,
}

impl TrainingOrchestrator {
    pub fn new(
        db: Arc<Database>,
        features: Arc<dyn FeatureSource>,
        artifacts: Arc<dyn ArtifactStore>,
        cache: Arc<ArtifactCache>,
        events: EventBus,
        settings: TrainingSettings,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
        let accelerators = (settings.accelerators > 0).then(|| Arc::new(Semaphore::new(settings.accelerators)));

        Self {
            db,
            features,
            artifacts,
            cache,
            events,
            jobs: Arc::new(JobTable::new()),
            workers,
            accelerators,
            settings,
        }
    }

    /// Open a run for the model and dispatch it. A dataset config, when
    /// given, replaces the model's stored one. Training failures are
    /// recorded on the run, never returned from here.
    pub async fn submit(&self, model_id: ModelId, dataset_config: Option<DatasetConfig>) -> Result<TrainingTicket> {
        let model = self
            .db
            .get_model(model_id)
            .await?
            .ok_or_else(|| ForecastError::NotFound(format!("model {}", model_id)))?;

        let dataset = dataset_config
            .clone()
            .unwrap_or_else(|| model.training_dataset_config.clone());
        if model.category != ArchitectureCategory::Ensemble {
            dataset.validate()?;
        }

        let run_id = self
            .db
            .begin_training(model_id, dataset_config.as_ref(), Utc::now())
            .await?;
        let handle = self.jobs.insert(run_id, model_id).await;

        info!("Training run {} opened for model {} ({} v{})", run_id, model_id, model.name, model.version);
        self.events.publish(ServiceEvent::TrainingStarted { model_id, run_id });

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.execute(handle, model, dataset).await;
        });

        Ok(TrainingTicket { run_id, model_id })
    }

    /// Re-submit with the stored dataset config
    pub async fn retrain(&self, model_id: ModelId) -> Result<TrainingTicket> {
        self.submit(model_id, None).await
    }

    /// Ask a run to stop. Queued jobs stop before fitting; running jobs
    /// stop at their next heartbeat checkpoint.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        if let Some(handle) = self.jobs.get(run_id).await {
            handle.request_cancel();
            info!("Cancellation requested for training run {}", run_id);
            return Ok(());
        }

        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or_else(|| ForecastError::NotFound(format!("training run {}", run_id)))?;
        if !run.is_open() {
            return Err(ForecastError::InvalidInput(format!("training run {} is already closed", run_id)));
        }

        // Open in the store but owned by no worker here
        let message = "cancelled".to_string();
        if self
            .db
            .fail_run(run_id, run.model_id, RunErrorKind::Cancelled, &message, Utc::now())
            .await?
        {
            self.publish_failure(run.model_id, run_id, RunErrorKind::Cancelled, message);
        }
        Ok(())
    }

    /// Close runs left open by a previous process as timed out
    pub async fn recover_orphaned_runs(&self) -> Result<usize> {
        let mut recovered = 0;
        for run in self.db.open_runs().await? {
            if self.jobs.get(run.id).await.is_some() {
                continue;
            }
            let message = "orphaned by a previous process".to_string();
            if self
                .db
                .fail_run(run.id, run.model_id, RunErrorKind::Timeout, &message, Utc::now())
                .await?
            {
                warn!("Recovered orphaned training run {} of model {}", run.id, run.model_id);
                self.publish_failure(run.model_id, run.id, RunErrorKind::Timeout, message);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Wait until the run is closed and return its final record
    pub async fn await_run(&self, run_id: RunId) -> Result<TrainingRun> {
        loop {
            let run = self
                .db
                .get_run(run_id)
                .await?
                .ok_or_else(|| ForecastError::NotFound(format!("training run {}", run_id)))?;
            if !run.is_open() {
                return Ok(run);
            }
            tokio::time::sleep(AWAIT_POLL).await;
        }
    }

    pub async fn active_jobs(&self) -> usize {
        self.jobs.len().await
    }

    /// Fail every started job whose heartbeat is older than the timeout
    pub async fn reap_stale_jobs(&self) -> Result<Vec<RunId>> {
        let timeout_ms = self.settings.heartbeat_timeout().as_millis() as i64;
        let now_ms = Utc::now().timestamp_millis();
        let mut reaped = Vec::new();

        for job in self.jobs.snapshot().await {
            if !job.is_started() || job.millis_since_heartbeat(now_ms) <= timeout_ms {
                continue;
            }

            job.request_cancel();
            let message = format!("no heartbeat for {} ms", job.millis_since_heartbeat(now_ms));
            if self
                .db
                .fail_run(job.run_id(), job.model_id(), RunErrorKind::Timeout, &message, Utc::now())
                .await?
            {
                warn!("Training run {} of model {} timed out: {}", job.run_id(), job.model_id(), message);
                self.publish_failure(job.model_id(), job.run_id(), RunErrorKind::Timeout, message);
                reaped.push(job.run_id());
            }
            self.jobs.remove(job.run_id()).await;
        }
        Ok(reaped)
    }

    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = self.settings.watchdog_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.reap_stale_jobs().await {
                    error!("Training watchdog pass failed: {}", e);
                }
            }
        })
    }

    async fn execute(&self, handle: Arc<JobHandle>, model: Model, dataset: DatasetConfig) {
        let run_id = handle.run_id();

        if let Err(e) = self.run_job(&handle, &model, &dataset).await {
            let kind = RunErrorKind::from_error(&e);
            let message = e.to_string();
            match self.db.fail_run(run_id, model.id, kind, &message, Utc::now()).await {
                Ok(true) => {
                    warn!("Training run {} of model {} failed ({}): {}", run_id, model.id, kind.as_str(), message);
                    self.publish_failure(model.id, run_id, kind, message);
                }
                Ok(false) => debug!("Training run {} was closed before its worker stopped", run_id),
                Err(store_err) => error!("Could not record failure of training run {}: {}", run_id, store_err),
            }
        }

        self.jobs.remove(run_id).await;
    }

    async fn run_job(&self, handle: &JobHandle, model: &Model, dataset: &DatasetConfig) -> Result<()> {
        let run_id = handle.run_id();
        let _worker = self.acquire(&self.workers, handle).await?;
        let _accelerator = match (&self.accelerators, model.category) {
            (Some(pool), ArchitectureCategory::DeepLearning) => Some(self.acquire(pool, handle).await?),
            _ => None,
        };

        handle.mark_started();
        let ctx = handle.context();
        ctx.checkpoint()?;
        debug!("Training run {} started for model {}", run_id, model.id);

        let (blob, outcome) = match model.category {
            ArchitectureCategory::Ensemble => {
                let members = self.db.ensemble_members(model.id).await?;
                let spec = EnsembleSpec::from_members(&members)?;
                let mut metrics = BTreeMap::new();
                metrics.insert("members".to_string(), members.len() as f64);
                (spec.to_artifact()?, RunOutcome { metrics, ..RunOutcome::default() })
            }
            category => {
                let training_set = self.load_training_set(model, dataset).await?;
                ctx.checkpoint()?;

                let hyperparameters = model.hyperparameters.clone();
                let feature_config = model.feature_config.clone();
                let fit_ctx = ctx.clone();
                let (blob, report, importance) = tokio::task::spawn_blocking(move || {
                    let mut forecaster = build_model(category, &hyperparameters, &feature_config)?;
                    let report = forecaster.fit(&training_set, &fit_ctx)?;
                    Ok::<_, ForecastError>((forecaster.to_artifact()?, report, forecaster.feature_importance()))
                })
                .await
                .map_err(|e| ForecastError::Training(format!("training task aborted: {}", e)))??;

                let outcome = RunOutcome {
                    train_loss: report.train_loss,
                    validation_loss: report.validation_loss,
                    metrics: report.metrics,
                    feature_importance: importance,
                };
                (blob, outcome)
            }
        };
        ctx.checkpoint()?;

        let location = self.artifacts.put(model.id, &model.version, &blob).await?;
        let completed = self
            .db
            .complete_run(run_id, model.id, &outcome, &location, Utc::now())
            .await?;

        if !completed {
            // Timed out or cancelled while finishing; drop the orphan blob
            if model.artifact_location.as_deref() != Some(location.as_str()) {
                self.discard_artifact(&location).await;
            }
            return Ok(());
        }

        if let Some(previous) = model.artifact_location.as_deref() {
            if previous != location {
                self.discard_artifact(previous).await;
            }
        }
        self.cache.invalidate(model.id).await;

        info!(
            "Training run {} completed for model {}: train_loss={:?}, validation_loss={:?}",
            run_id, model.id, outcome.train_loss, outcome.validation_loss
        );
        self.events.publish(ServiceEvent::TrainingCompleted {
            model_id: model.id,
            run_id,
            train_loss: outcome.train_loss,
            validation_loss: outcome.validation_loss,
        });
        Ok(())
    }

    /// Wait for a permit unless the job is cancelled first
    async fn acquire(&self, pool: &Arc<Semaphore>, handle: &JobHandle) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = pool.clone().acquire_owned() => {
                permit.map_err(|_| ForecastError::Training("worker pool closed".to_string()))
            }
            _ = handle.cancelled() => Err(ForecastError::Cancelled(handle.run_id())),
        }
    }

    async fn load_training_set(&self, model: &Model, dataset: &DatasetConfig) -> Result<TrainingSet> {
        let names = model.feature_config.input_names();
        let end = dataset.end.unwrap_or_else(Utc::now);

        let mut series = Vec::with_capacity(dataset.stock_ids.len());
        for &stock_id in &dataset.stock_ids {
            let window = self
                .features
                .get_feature_window(stock_id, end, dataset.history, &names)
                .await?;
            series.push(window);
        }

        debug!(
            "Loaded {} training series for model {} ({} features, {} rows each)",
            series.len(),
            model.id,
            names.len(),
            dataset.history
        );
        Ok(TrainingSet {
            series,
            train_split: dataset.train_split,
        })
    }

    async fn discard_artifact(&self, location: &str) {
        if let Err(e) = self.artifacts.delete(location).await {
            warn!("Could not remove artifact {}: {}", location, e);
        }
    }

    fn publish_failure(&self, model_id: ModelId, run_id: RunId, kind: RunErrorKind, message: String) {
        self.events.publish(ServiceEvent::TrainingFailed {
            model_id,
            run_id,
            kind,
            message,
        });
    }
}
