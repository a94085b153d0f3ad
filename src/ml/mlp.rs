//! Direct multi-horizon MLP forecaster.
//!
//! One ReLU hidden layer with dropout maps a flattened lookback window to
//! the relative change of the target at every horizon step. Bounds come from
//! Monte-Carlo dropout: the network is sampled `mc_samples` times with
//! dropout active and the empirical quantiles of the outputs are reported.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::features::{build_samples, stack, window_inputs, Normalizer, SampleSet};
use super::stats::quantile;
use super::{
    check_confidence, param_f64, param_usize, ForecastModel, IntervalForecast, TrainingContext,
    TrainingReport, TrainingSet,
};
use crate::error::{ForecastError, Result};
use crate::market::FeatureWindow;
use crate::types::{FeatureConfig, Hyperparameters};

const BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    pub hidden_dim: usize,
    pub dropout: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    pub forecast_horizon: usize,
    pub mc_samples: usize,
    pub confidence_level: f64,
    pub seed: u64,
}

impl MlpConfig {
    pub fn from_hyperparameters(hp: &Hyperparameters) -> Result<Self> {
        let config = Self {
            hidden_dim: param_usize(hp, "hidden_dim", 32)?,
            dropout: param_f64(hp, "dropout", 0.1)?,
            learning_rate: param_f64(hp, "learning_rate", 0.01)?,
            epochs: param_usize(hp, "epochs", 100)?,
            forecast_horizon: param_usize(hp, "forecast_horizon", 5)?,
            mc_samples: param_usize(hp, "mc_samples", 50)?,
            confidence_level: check_confidence(param_f64(hp, "confidence_level", 0.95)?)?,
            seed: param_usize(hp, "seed", 42)? as u64,
        };

        if config.hidden_dim == 0 || config.forecast_horizon == 0 || config.epochs == 0 {
            return Err(ForecastError::InvalidInput(
                "hidden_dim, forecast_horizon and epochs must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(ForecastError::InvalidInput(format!("dropout must be in [0, 1), got {}", config.dropout)));
        }
        if config.learning_rate <= 0.0 {
            return Err(ForecastError::InvalidInput("learning_rate must be positive".to_string()));
        }
        if config.mc_samples < 2 {
            return Err(ForecastError::InvalidInput("mc_samples must be at least 2".to_string()));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct Network {
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

/// Row-major weights for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkWeights {
    n_inputs: usize,
    hidden: usize,
    n_outputs: usize,
    w1: Vec<f64>,
    b1: Vec<f64>,
    w2: Vec<f64>,
    b2: Vec<f64>,
}

impl Network {
    fn init(n_inputs: usize, hidden: usize, n_outputs: usize, rng: &mut StdRng) -> Self {
        let limit1 = (6.0 / (n_inputs + hidden) as f64).sqrt();
        let limit2 = (6.0 / (hidden + n_outputs) as f64).sqrt();
        Self {
            w1: Array2::from_shape_fn((hidden, n_inputs), |_| rng.random_range(-limit1..limit1)),
            b1: Array1::zeros(hidden),
            w2: Array2::from_shape_fn((n_outputs, hidden), |_| rng.random_range(-limit2..limit2)),
            b2: Array1::zeros(n_outputs),
        }
    }

    /// Returns pre-activation, masked hidden activation and output
    fn forward(&self, x: &Array1<f64>, mask: Option<&Array1<f64>>) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
        let z1 = self.w1.dot(x) + &self.b1;
        let mut h = z1.mapv(|v| v.max(0.0));
        if let Some(mask) = mask {
            h *= mask;
        }
        let y = self.w2.dot(&h) + &self.b2;
        (z1, h, y)
    }

    fn to_weights(&self) -> NetworkWeights {
        NetworkWeights {
            n_inputs: self.w1.ncols(),
            hidden: self.w1.nrows(),
            n_outputs: self.w2.nrows(),
            w1: self.w1.iter().copied().collect(),
            b1: self.b1.to_vec(),
            w2: self.w2.iter().copied().collect(),
            b2: self.b2.to_vec(),
        }
    }

    fn from_weights(weights: &NetworkWeights) -> Result<Self> {
        let shape_err = |e: ndarray::ShapeError| ForecastError::InvalidInput(format!("corrupt MLP artifact: {}", e));
        Ok(Self {
            w1: Array2::from_shape_vec((weights.hidden, weights.n_inputs), weights.w1.clone()).map_err(shape_err)?,
            b1: Array1::from_vec(weights.b1.clone()),
            w2: Array2::from_shape_vec((weights.n_outputs, weights.hidden), weights.w2.clone()).map_err(shape_err)?,
            b2: Array1::from_vec(weights.b2.clone()),
        })
    }
}

/// Inverted-dropout mask: kept units are scaled by 1 / (1 - p)
fn dropout_mask(size: usize, p: f64, rng: &mut StdRng) -> Array1<f64> {
    let scale = 1.0 / (1.0 - p);
    Array1::from_shape_fn(size, |_| if rng.random::<f64>() < p { 0.0 } else { scale })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MlpArtifact {
    config: MlpConfig,
    feature_names: Vec<String>,
    target: String,
    lookback: usize,
    normalizer: Normalizer,
    weights: NetworkWeights,
}

pub struct MlpModel {
    config: MlpConfig,
    feature_names: Vec<String>,
    target: String,
    lookback: usize,
    normalizer: Option<Normalizer>,
    network: Option<Network>,
}

impl MlpModel {
    pub fn new(hp: &Hyperparameters, feature_config: &FeatureConfig) -> Result<Self> {
        if feature_config.lookback == 0 {
            return Err(ForecastError::InvalidInput("lookback must be > 0".to_string()));
        }
        Ok(Self {
            config: MlpConfig::from_hyperparameters(hp)?,
            feature_names: feature_config.input_names(),
            target: feature_config.target.clone(),
            lookback: feature_config.lookback,
            normalizer: None,
            network: None,
        })
    }

    pub fn from_artifact(blob: &[u8]) -> Result<Self> {
        let artifact: MlpArtifact = serde_json::from_slice(blob)?;
        let network = Network::from_weights(&artifact.weights)?;
        if artifact.normalizer.dim() != network.w1.ncols() {
            return Err(ForecastError::InvalidInput("MLP artifact normalizer does not match network".to_string()));
        }
        Ok(Self {
            config: artifact.config,
            feature_names: artifact.feature_names,
            target: artifact.target,
            lookback: artifact.lookback,
            normalizer: Some(artifact.normalizer),
            network: Some(network),
        })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    fn target_index(&self, window: &FeatureWindow) -> Result<usize> {
        window
            .column_index(&self.target)
            .ok_or_else(|| ForecastError::InvalidInput(format!("window lacks target column '{}'", self.target)))
    }

    /// Reorder window columns to the fitted feature order
    fn aligned_values(&self, window: &FeatureWindow) -> Result<Array2<f64>> {
        let mut columns = Vec::with_capacity(self.feature_names.len());
        for name in &self.feature_names {
            let idx = window
                .column_index(name)
                .ok_or_else(|| ForecastError::InvalidInput(format!("window lacks feature '{}'", name)))?;
            columns.push(idx);
        }
        Ok(window.values.select(Axis(1), &columns))
    }

    fn samples(&self, data: &TrainingSet) -> Result<(SampleSet, SampleSet)> {
        let n_inputs = self.lookback * self.feature_names.len();
        let horizon = self.config.forecast_horizon;
        let mut train = Vec::new();
        let mut validation = Vec::new();

        for window in &data.series {
            self.target_index(window)?;
            let values = self.aligned_values(window)?;
            let split = data.split_point(values.nrows());
            // Target index 0 after alignment: the target is always the first input name
            let target_idx = 0;

            // Training anchors see only training rows, targets included
            train.push(build_samples(&values, target_idx, self.lookback, horizon, 0..split.saturating_sub(horizon)));
            validation.push(build_samples(
                &values,
                target_idx,
                self.lookback,
                horizon,
                split.saturating_sub(1)..values.nrows(),
            ));
        }

        Ok((stack(&train, n_inputs, horizon), stack(&validation, n_inputs, horizon)))
    }

    fn mse(network: &Network, inputs: &Array2<f64>, targets: &Array2<f64>) -> Option<f64> {
        if inputs.nrows() == 0 {
            return None;
        }
        let mut total = 0.0;
        for (x, t) in inputs.rows().into_iter().zip(targets.rows()) {
            let (_, _, y) = network.forward(&x.to_owned(), None);
            total += (&y - &t).mapv(|e| e * e).sum() / y.len() as f64;
        }
        Some(total / inputs.nrows() as f64)
    }
}

impl ForecastModel for MlpModel {
    fn family(&self) -> &'static str {
        "mlp"
    }

    fn fit(&mut self, data: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingReport> {
        let (train, validation) = self.samples(data)?;
        if train.len() < 2 {
            return Err(ForecastError::Training(format!(
                "MLP needs at least 2 training samples (lookback {}, horizon {}), got {}",
                self.lookback,
                self.config.forecast_horizon,
                train.len()
            )));
        }

        let normalizer = Normalizer::fit(&train.inputs)?;
        let x_train = normalizer.transform(&train.inputs);
        let x_val = normalizer.transform(&validation.inputs);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut network = Network::init(x_train.ncols(), self.config.hidden_dim, self.config.forecast_horizon, &mut rng);
        let mut order: Vec<usize> = (0..x_train.nrows()).collect();
        let lr = self.config.learning_rate;
        let n_out = self.config.forecast_horizon as f64;

        for epoch in 0..self.config.epochs {
            ctx.checkpoint()?;
            order.shuffle(&mut rng);

            for batch in order.chunks(BATCH_SIZE) {
                let mut grad_w1 = Array2::<f64>::zeros(network.w1.raw_dim());
                let mut grad_b1 = Array1::<f64>::zeros(network.b1.len());
                let mut grad_w2 = Array2::<f64>::zeros(network.w2.raw_dim());
                let mut grad_b2 = Array1::<f64>::zeros(network.b2.len());

                for &i in batch {
                    let x = x_train.row(i).to_owned();
                    let t = train.targets.row(i);
                    let mask = dropout_mask(self.config.hidden_dim, self.config.dropout, &mut rng);
                    let (z1, h, y) = network.forward(&x, Some(&mask));

                    let dy = (&y - &t) * (2.0 / n_out);
                    grad_w2 += &outer(&dy, &h);
                    grad_b2 += &dy;

                    let mut dh = network.w2.t().dot(&dy) * &mask;
                    dh.zip_mut_with(&z1, |g, &z| {
                        if z <= 0.0 {
                            *g = 0.0;
                        }
                    });
                    grad_w1 += &outer(&dh, &x);
                    grad_b1 += &dh;
                }

                let scale = lr / batch.len() as f64;
                network.w1.scaled_add(-scale, &grad_w1);
                network.b1.scaled_add(-scale, &grad_b1);
                network.w2.scaled_add(-scale, &grad_w2);
                network.b2.scaled_add(-scale, &grad_b2);
            }

            if epoch % 10 == 0 {
                debug!("MLP run {} epoch {}: train_mse={:?}", ctx.run_id(), epoch, Self::mse(&network, &x_train, &train.targets));
            }
        }

        let train_loss = Self::mse(&network, &x_train, &train.targets);
        let validation_loss = Self::mse(&network, &x_val, &validation.targets);
        info!(
            "MLP fitted: {} train / {} validation samples, train_mse={:?}, validation_mse={:?}",
            train.len(),
            validation.len(),
            train_loss,
            validation_loss
        );

        let mut metrics = BTreeMap::new();
        metrics.insert("train_samples".to_string(), train.len() as f64);
        metrics.insert("validation_samples".to_string(), validation.len() as f64);
        metrics.insert("epochs".to_string(), self.config.epochs as f64);

        self.normalizer = Some(normalizer);
        self.network = Some(network);

        Ok(TrainingReport {
            train_loss,
            validation_loss,
            metrics,
        })
    }

    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<Vec<IntervalForecast>> {
        let (network, normalizer) = match (&self.network, &self.normalizer) {
            (Some(n), Some(z)) => (n, z),
            _ => return Err(ForecastError::InvalidInput("MLP model is not fitted".to_string())),
        };
        if horizon == 0 || horizon > self.config.forecast_horizon {
            return Err(ForecastError::InvalidInput(format!(
                "horizon must be in 1..={}, got {}",
                self.config.forecast_horizon, horizon
            )));
        }
        if window.len() < self.lookback {
            return Err(ForecastError::InvalidInput(format!(
                "MLP needs {} rows of history, window has {}",
                self.lookback,
                window.len()
            )));
        }

        let values = self.aligned_values(window)?;
        let end = values.nrows() - 1;
        let anchor = values[[end, 0]];
        let raw = window_inputs(&values, 0, end, self.lookback)
            .ok_or_else(|| ForecastError::InvalidInput("target is zero at the forecast origin".to_string()))?;
        let x = normalizer.transform_row(&raw);

        let (_, _, point) = network.forward(&x, None);

        // Seed per origin so repeated calls on the same window agree
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (end as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut samples: Vec<Vec<f64>> = vec![Vec::with_capacity(self.config.mc_samples); horizon];
        for _ in 0..self.config.mc_samples {
            let mask = dropout_mask(self.config.hidden_dim, self.config.dropout, &mut rng);
            let (_, _, y) = network.forward(&x, Some(&mask));
            for (step, draws) in samples.iter_mut().enumerate() {
                draws.push(y[step]);
            }
        }

        let alpha = (1.0 - self.config.confidence_level) / 2.0;
        Ok(samples
            .into_iter()
            .enumerate()
            .map(|(step, mut draws)| {
                draws.sort_by(|a, b| a.total_cmp(b));
                let value = anchor * (1.0 + point[step]);
                let lower = anchor * (1.0 + quantile(&draws, alpha));
                let upper = anchor * (1.0 + quantile(&draws, 1.0 - alpha));
                IntervalForecast {
                    value,
                    lower: lower.min(value),
                    upper: upper.max(value),
                }
            })
            .collect())
    }

    fn max_horizon(&self) -> Option<usize> {
        Some(self.config.forecast_horizon)
    }

    /// Mean absolute first-layer weight per input feature, summed over lags
    /// and normalized to one
    fn feature_importance(&self) -> BTreeMap<String, f64> {
        let Some(network) = &self.network else {
            return BTreeMap::new();
        };
        let n_features = self.feature_names.len();
        let mut scores = vec![0.0; n_features];
        for (col, weights) in network.w1.axis_iter(Axis(1)).enumerate() {
            scores[col % n_features] += weights.mapv(f64::abs).mean().unwrap_or(0.0);
        }

        let total: f64 = scores.iter().sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        self.feature_names
            .iter()
            .cloned()
            .zip(scores.into_iter().map(|s| s / total))
            .collect()
    }

    fn to_artifact(&self) -> Result<Vec<u8>> {
        let (network, normalizer) = match (&self.network, &self.normalizer) {
            (Some(n), Some(z)) => (n, z),
            _ => return Err(ForecastError::InvalidInput("cannot serialize an unfitted MLP".to_string())),
        };
        let artifact = MlpArtifact {
            config: self.config.clone(),
            feature_names: self.feature_names.clone(),
            target: self.target.clone(),
            lookback: self.lookback,
            normalizer: normalizer.clone(),
            weights: network.to_weights(),
        };
        Ok(serde_json::to_vec(&artifact)?)
    }
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    let col = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    col.dot(&row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicI64};
    use std::sync::Arc;

    fn feature_config(lookback: usize) -> FeatureConfig {
        FeatureConfig {
            features: vec!["volume".to_string()],
            target: "close".to_string(),
            lookback,
        }
    }

    fn window(n: usize) -> FeatureWindow {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let timestamps = (0..n).map(|i| start + Duration::days(i as i64)).collect();
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let t = i as f64;
                vec![100.0 + 5.0 * (t / 6.0).sin() + 0.1 * t, 1000.0 + 50.0 * (t / 3.0).cos()]
            })
            .collect();
        FeatureWindow::from_rows(3, timestamps, vec!["close".into(), "volume".into()], &rows).unwrap()
    }

    fn small_model() -> MlpModel {
        let hp = json!({"hidden_dim": 8, "epochs": 20, "forecast_horizon": 3, "mc_samples": 20});
        MlpModel::new(hp.as_object().unwrap(), &feature_config(5)).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = MlpConfig::from_hyperparameters(&Hyperparameters::new()).unwrap();
        assert_eq!(config.hidden_dim, 32);
        assert_eq!(config.epochs, 100);
        assert_eq!(config.forecast_horizon, 5);
        assert_eq!(config.seed, 42);
    }

    #[test]
    fn test_invalid_dropout_rejected() {
        let hp = json!({"dropout": 1.0});
        assert!(MlpConfig::from_hyperparameters(hp.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_fit_and_forecast_with_bounds() {
        let data = TrainingSet {
            series: vec![window(120)],
            train_split: 0.8,
        };
        let mut mlp = small_model();
        let report = mlp.fit(&data, &TrainingContext::detached(1)).unwrap();
        assert!(report.train_loss.unwrap().is_finite());
        assert!(report.validation_loss.is_some());

        let forecast = mlp.forecast(&window(120), 3).unwrap();
        assert_eq!(forecast.len(), 3);
        for f in &forecast {
            assert!(f.value.is_finite());
            assert!(f.lower <= f.value && f.value <= f.upper);
        }
        assert_eq!(mlp.max_horizon(), Some(3));
    }

    #[test]
    fn test_horizon_beyond_trained_is_rejected() {
        let data = TrainingSet {
            series: vec![window(80)],
            train_split: 0.8,
        };
        let mut mlp = small_model();
        mlp.fit(&data, &TrainingContext::detached(1)).unwrap();
        assert!(matches!(mlp.forecast(&window(80), 4), Err(ForecastError::InvalidInput(_))));
    }

    #[test]
    fn test_importance_covers_inputs() {
        let data = TrainingSet {
            series: vec![window(80)],
            train_split: 0.8,
        };
        let mut mlp = small_model();
        mlp.fit(&data, &TrainingContext::detached(1)).unwrap();

        let importance = mlp.feature_importance();
        assert_eq!(importance.keys().collect::<Vec<_>>(), vec!["close", "volume"]);
        assert!((importance.values().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let data = TrainingSet {
            series: vec![window(80)],
            train_split: 0.8,
        };
        let mut a = small_model();
        let mut b = small_model();
        a.fit(&data, &TrainingContext::detached(1)).unwrap();
        b.fit(&data, &TrainingContext::detached(2)).unwrap();
        assert_eq!(a.forecast(&window(80), 2).unwrap(), b.forecast(&window(80), 2).unwrap());

        let restored = MlpModel::from_artifact(&a.to_artifact().unwrap()).unwrap();
        assert_eq!(a.forecast(&window(80), 2).unwrap(), restored.forecast(&window(80), 2).unwrap());
    }

    #[test]
    fn test_cancel_stops_between_epochs() {
        let data = TrainingSet {
            series: vec![window(80)],
            train_split: 0.8,
        };
        let ctx = TrainingContext::new(5, Arc::new(AtomicBool::new(true)), Arc::new(AtomicI64::new(0)));
        let mut mlp = small_model();
        assert!(matches!(mlp.fit(&data, &ctx), Err(ForecastError::Cancelled(5))));
    }
}
