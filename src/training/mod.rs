//! Training orchestration: dispatching runs onto a bounded worker pool,
//! heartbeats, cancellation and the timeout watchdog.

pub mod jobs;
pub mod orchestrator;

pub use jobs::{JobHandle, JobTable};
pub use orchestrator::TrainingOrchestrator;
