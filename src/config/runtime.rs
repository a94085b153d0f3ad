use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub database: DatabaseSettings,
    pub artifacts: ArtifactSettings,
    pub training: TrainingSettings,
    pub inference: InferenceSettings,
    pub metrics: MetricsSettings,
    pub server: ServerSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            artifacts: ArtifactSettings::default(),
            training: TrainingSettings::default(),
            inference: InferenceSettings::default(),
            metrics: MetricsSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be > 0".to_string());
        }
        if self.artifacts.dir.trim().is_empty() {
            errors.push("artifacts.dir must not be empty".to_string());
        }

        if self.training.worker_pool_size == 0 {
            errors.push("training.worker_pool_size must be > 0".to_string());
        }
        if self.training.heartbeat_timeout_secs == 0 {
            errors.push("training.heartbeat_timeout_secs must be > 0".to_string());
        }
        if self.training.watchdog_interval_ms == 0 {
            errors.push("training.watchdog_interval_ms must be > 0".to_string());
        }
        if self.training.watchdog_interval_ms >= self.training.heartbeat_timeout_secs * 1000 {
            errors.push("training.watchdog_interval_ms must be shorter than the heartbeat timeout".to_string());
        }

        if self.inference.default_horizon == 0 {
            errors.push("inference.default_horizon must be > 0".to_string());
        }
        if self.inference.default_horizon > self.inference.max_horizon {
            errors.push("inference.default_horizon must not exceed inference.max_horizon".to_string());
        }
        if self.inference.step_secs <= 0 {
            errors.push("inference.step_secs must be > 0".to_string());
        }

        if self.metrics.annualization_factor <= 0.0 {
            errors.push("metrics.annualization_factor must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:./forecast_service.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    pub dir: String,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            dir: "./artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Concurrent training jobs across all models
    pub worker_pool_size: usize,
    /// Deep-learning jobs additionally hold one of these; 0 disables the limit
    pub accelerators: usize,
    pub heartbeat_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            accelerators: 1,
            heartbeat_timeout_secs: 300,
            watchdog_interval_ms: 5_000,
        }
    }
}

impl TrainingSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub default_horizon: usize,
    /// Upper bound on the steps any single request may ask for
    pub max_horizon: usize,
    /// Spacing between consecutive forecast steps
    pub step_secs: i64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            default_horizon: 5,
            max_horizon: 365,
            step_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Periods per year used to annualize the Sharpe ratio
    pub annualization_factor: f64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            annualization_factor: 252.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}
