use anyhow::{anyhow, Result};
use config::{Config, Environment, File};
use std::path::Path;
use tracing::{debug, info};

use super::runtime::ServiceConfig;

pub const ENV_PREFIX: &str = "FORECAST";

/// Layer defaults, an optional TOML file and `FORECAST__SECTION__KEY`
/// environment variables, then validate the result.
pub fn load_config(path: Option<&str>) -> Result<ServiceConfig> {
    dotenvy::dotenv().ok();

    let mut builder = Config::builder().add_source(Config::try_from(&ServiceConfig::default())?);

    if let Some(path) = path {
        if Path::new(path).exists() {
            info!("Loading configuration from {}", path);
            builder = builder.add_source(File::with_name(path));
        } else {
            debug!("Config file {} not found, using defaults", path);
        }
    }

    let config: ServiceConfig = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config
        .validate()
        .map_err(|errors| anyhow!("invalid configuration: {}", errors.join(", ")))?;

    Ok(config)
}

/// Render the effective configuration as TOML
pub fn to_toml(config: &ServiceConfig) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/nonexistent/forecast.toml")).unwrap();
        assert_eq!(config.training, ServiceConfig::default().training);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[training]\nworker_pool_size = 2\naccelerators = 0\nheartbeat_timeout_secs = 60\nwatchdog_interval_ms = 500").unwrap();
        writeln!(file, "[metrics]\nannualization_factor = 365.0").unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.training.worker_pool_size, 2);
        assert_eq!(config.training.accelerators, 0);
        assert_eq!(config.metrics.annualization_factor, 365.0);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_rendered_toml_parses_back() {
        let rendered = to_toml(&ServiceConfig::default()).unwrap();
        let parsed: ServiceConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, ServiceConfig::default());
    }
}
