use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

use crate::ml::TrainingContext;
use crate::types::{ModelId, RunId};

/// In-process state of one dispatched run
#[derive(Debug)]
pub struct JobHandle {
    run_id: RunId,
    model_id: ModelId,
    cancel: Arc<AtomicBool>,
    heartbeat: Arc<AtomicI64>,
    started: AtomicBool,
    cancelled: Notify,
}

impl JobHandle {
    fn new(run_id: RunId, model_id: ModelId) -> Self {
        Self {
            run_id,
            model_id,
            cancel: Arc::new(AtomicBool::new(false)),
            heartbeat: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            started: AtomicBool::new(false),
            cancelled: Notify::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    /// Context handed to the fitting code; shares this job's flags
    pub fn context(&self) -> TrainingContext {
        TrainingContext::new(self.run_id, self.cancel.clone(), self.heartbeat.clone())
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.cancelled.notify_one();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        if self.is_cancel_requested() {
            return;
        }
        self.cancelled.notified().await;
    }

    /// The job holds its worker permit; the watchdog starts watching it now
    pub fn mark_started(&self) {
        self.heartbeat.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn millis_since_heartbeat(&self, now_ms: i64) -> i64 {
        now_ms - self.heartbeat.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<RunId, Arc<JobHandle>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run_id: RunId, model_id: ModelId) -> Arc<JobHandle> {
        let handle = Arc::new(JobHandle::new(run_id, model_id));
        self.jobs.write().await.insert(run_id, handle.clone());
        handle
    }

    pub async fn get(&self, run_id: RunId) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(&run_id).cloned()
    }

    pub async fn remove(&self, run_id: RunId) -> Option<Arc<JobHandle>> {
        self.jobs.write().await.remove(&run_id)
    }

    pub async fn snapshot(&self) -> Vec<Arc<JobHandle>> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.run_id);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForecastError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_reaches_context() {
        let table = JobTable::new();
        let job = table.insert(1, 10).await;
        let ctx = job.context();

        assert!(ctx.checkpoint().is_ok());
        table.get(1).await.unwrap().request_cancel();
        assert!(matches!(ctx.checkpoint(), Err(ForecastError::Cancelled(1))));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_late_waiter() {
        let table = JobTable::new();
        let job = table.insert(2, 10).await;
        job.request_cancel();

        tokio::time::timeout(Duration::from_secs(1), job.cancelled())
            .await
            .expect("cancellation should already be visible");
    }

    #[tokio::test]
    async fn test_heartbeat_age() {
        let table = JobTable::new();
        let job = table.insert(3, 10).await;
        assert!(!job.is_started());

        job.mark_started();
        let now = Utc::now().timestamp_millis();
        assert!(job.millis_since_heartbeat(now) >= 0);
        assert!(job.millis_since_heartbeat(now + 5_000) >= 5_000);
    }

    #[tokio::test]
    async fn test_snapshot_and_remove() {
        let table = JobTable::new();
        table.insert(5, 1).await;
        table.insert(4, 2).await;

        let ids: Vec<RunId> = table.snapshot().await.iter().map(|j| j.run_id()).collect();
        assert_eq!(ids, vec![4, 5]);

        assert!(table.remove(4).await.is_some());
        assert_eq!(table.len().await, 1);
    }
}
