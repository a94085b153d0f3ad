//! Prediction engine and the decoded-artifact cache it reads through.

pub mod cache;
pub mod engine;

pub use cache::{ArtifactCache, LoadedArtifact};
pub use engine::{BatchSummary, PairOutcome, PredictionEngine};
