pub mod analytics;
pub mod config;
pub mod database;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod inference;
pub mod market;
pub mod ml;
pub mod registry;
pub mod service;
pub mod training;
pub mod types;
pub mod web;

pub use error::{ForecastError, Result};
pub use service::ForecastService;
