//! ARIMA(p, d, q) forecaster.
//!
//! AR coefficients come from the Yule-Walker equations (Levinson-Durbin) on
//! the d-times differenced target, pooled across every training series. MA
//! coefficients are read off the autocorrelation of the AR residuals.
//! Intervals use the psi-weight expansion of the fitted process and the
//! one-step residual variance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::stats::{mean_squared, normal_quantile};
use super::{
    check_confidence, param_f64, param_usize, ForecastModel, IntervalForecast, TrainingContext,
    TrainingReport, TrainingSet,
};
use crate::error::{ForecastError, Result};
use crate::market::FeatureWindow;
use crate::types::{FeatureConfig, Hyperparameters};

const MAX_AR_ORDER: usize = 10;
const MAX_DIFFERENCING: usize = 2;
const MAX_MA_ORDER: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArimaModel {
    p: usize,
    d: usize,
    q: usize,
    confidence_level: f64,
    target: String,
    ar_coeffs: Vec<f64>,
    ma_coeffs: Vec<f64>,
    /// Mean of the differenced series
    constant: f64,
    /// One-step residual variance
    sigma2: f64,
    fitted: bool,
}

impl ArimaModel {
    pub fn new(hp: &Hyperparameters, feature_config: &FeatureConfig) -> Result<Self> {
        let p = param_usize(hp, "p", 5)?;
        let d = param_usize(hp, "d", 1)?;
        let q = param_usize(hp, "q", 0)?;
        let confidence_level = check_confidence(param_f64(hp, "confidence_level", 0.95)?)?;

        if p > MAX_AR_ORDER {
            return Err(ForecastError::InvalidInput(format!("AR order must be <= {}", MAX_AR_ORDER)));
        }
        if d > MAX_DIFFERENCING {
            return Err(ForecastError::InvalidInput(format!(
                "differencing order must be <= {}",
                MAX_DIFFERENCING
            )));
        }
        if q > MAX_MA_ORDER {
            return Err(ForecastError::InvalidInput(format!("MA order must be <= {}", MAX_MA_ORDER)));
        }

        Ok(Self {
            p,
            d,
            q,
            confidence_level,
            target: feature_config.target.clone(),
            ar_coeffs: vec![0.0; p],
            ma_coeffs: vec![0.0; q],
            constant: 0.0,
            sigma2: 0.0,
            fitted: false,
        })
    }

    pub fn from_artifact(blob: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(blob)?;
        if !model.fitted {
            return Err(ForecastError::InvalidInput("ARIMA artifact holds an unfitted model".to_string()));
        }
        Ok(model)
    }

    pub fn order(&self) -> (usize, usize, usize) {
        (self.p, self.d, self.q)
    }

    pub fn ar_coefficients(&self) -> &[f64] {
        &self.ar_coeffs
    }

    /// Shortest target history that still conditions every AR lag
    fn min_history(&self) -> usize {
        self.p + self.d + 1
    }

    fn min_training_rows(&self) -> usize {
        self.p + self.d + self.q + 10
    }

    /// One-step residuals over a differenced series; the first `p` entries
    /// have no full AR context and are left at zero.
    fn residuals(&self, diffed: &[f64]) -> Vec<f64> {
        let mut residuals = vec![0.0; diffed.len()];
        for i in self.p..diffed.len() {
            let mut prediction = self.constant;
            for j in 0..self.p {
                prediction += self.ar_coeffs[j] * (diffed[i - j - 1] - self.constant);
            }
            for j in 0..self.q.min(i) {
                prediction += self.ma_coeffs[j] * residuals[i - j - 1];
            }
            residuals[i] = diffed[i] - prediction;
        }
        residuals
    }

    /// Psi weights of the integrated process, `psi[0] = 1`
    fn psi_weights(&self, horizon: usize) -> Vec<f64> {
        let mut psi = vec![0.0; horizon];
        if horizon == 0 {
            return psi;
        }
        psi[0] = 1.0;
        for j in 1..horizon {
            let mut value = if j <= self.q { self.ma_coeffs[j - 1] } else { 0.0 };
            for i in 1..=self.p.min(j) {
                value += self.ar_coeffs[i - 1] * psi[j - i];
            }
            psi[j] = value;
        }
        for _ in 0..self.d {
            let mut acc = 0.0;
            for w in psi.iter_mut() {
                acc += *w;
                *w = acc;
            }
        }
        psi
    }

    fn target_series(&self, window: &FeatureWindow) -> Result<Vec<f64>> {
        let column = window.column(&self.target).ok_or_else(|| {
            ForecastError::InvalidInput(format!("window lacks target column '{}'", self.target))
        })?;
        let series = column.to_vec();
        if series.iter().any(|x| !x.is_finite()) {
            return Err(ForecastError::InvalidInput("target series contains NaN or infinite values".to_string()));
        }
        Ok(series)
    }
}

impl ForecastModel for ArimaModel {
    fn family(&self) -> &'static str {
        "arima"
    }

    fn fit(&mut self, data: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingReport> {
        let mut train_diffs = Vec::new();
        let mut full_diffs = Vec::new();

        for window in &data.series {
            let series = self.target_series(window)?;
            let split = data.split_point(series.len());
            if split < self.min_training_rows() {
                debug!(
                    "ARIMA: skipping stock {} ({} training rows < {})",
                    window.stock_id,
                    split,
                    self.min_training_rows()
                );
                continue;
            }
            train_diffs.push(difference(&series[..split], self.d));
            // Residuals at index i of the differenced series belong to level row i + d
            full_diffs.push((split.saturating_sub(self.d), difference(&series, self.d)));
        }

        if train_diffs.is_empty() {
            return Err(ForecastError::Training(format!(
                "ARIMA({},{},{}) needs at least {} training rows per stock",
                self.p,
                self.d,
                self.q,
                self.min_training_rows()
            )));
        }
        ctx.checkpoint()?;

        let n_total: usize = train_diffs.iter().map(|s| s.len()).sum();
        self.constant = train_diffs.iter().flatten().sum::<f64>() / n_total as f64;

        let autocov = pooled_autocovariance(&train_diffs, self.constant, self.p);
        self.ar_coeffs = levinson_durbin(&autocov, self.p);
        self.ma_coeffs = vec![0.0; self.q];
        ctx.checkpoint()?;

        if self.q > 0 {
            let ar_residuals: Vec<Vec<f64>> = train_diffs
                .iter()
                .map(|s| self.residuals(s)[self.p..].to_vec())
                .collect();
            self.ma_coeffs = residual_ma_coefficients(&ar_residuals, self.q);
        }

        let mut train_errors = Vec::new();
        let mut validation_errors = Vec::new();
        for (train_len, diffed) in &full_diffs {
            let residuals = self.residuals(diffed);
            for (i, r) in residuals.iter().enumerate().skip(self.p) {
                if i < *train_len {
                    train_errors.push(*r);
                } else {
                    validation_errors.push(*r);
                }
            }
        }
        ctx.checkpoint()?;

        let train_loss = mean_squared(&train_errors);
        self.sigma2 = train_loss.unwrap_or(0.0);
        self.fitted = true;

        let validation_loss = mean_squared(&validation_errors);
        info!(
            "ARIMA({},{},{}) fitted on {} differenced points: sigma2={:.6}, validation_mse={:?}",
            self.p, self.d, self.q, n_total, self.sigma2, validation_loss
        );

        let mut metrics = BTreeMap::new();
        metrics.insert("train_samples".to_string(), train_errors.len() as f64);
        metrics.insert("validation_samples".to_string(), validation_errors.len() as f64);
        metrics.insert("sigma2".to_string(), self.sigma2);
        if let Some(mse) = validation_loss {
            metrics.insert("validation_rmse".to_string(), mse.sqrt());
        }

        Ok(TrainingReport {
            train_loss,
            validation_loss,
            metrics,
        })
    }

    fn forecast(&self, window: &FeatureWindow, horizon: usize) -> Result<Vec<IntervalForecast>> {
        if !self.fitted {
            return Err(ForecastError::InvalidInput("ARIMA model is not fitted".to_string()));
        }
        if horizon == 0 {
            return Err(ForecastError::InvalidInput("horizon must be > 0".to_string()));
        }

        let series = self.target_series(window)?;
        if series.len() < self.min_history() {
            return Err(ForecastError::InvalidInput(format!(
                "ARIMA({},{},{}) needs at least {} rows of history, window has {}",
                self.p,
                self.d,
                self.q,
                self.min_history(),
                series.len()
            )));
        }

        let diffed = difference(&series, self.d);
        let mut extended = diffed.clone();
        let mut extended_residuals = self.residuals(&diffed);

        for _ in 0..horizon {
            let mut forecast = self.constant;
            for j in 0..self.p {
                let idx = extended.len() - j - 1;
                forecast += self.ar_coeffs[j] * (extended[idx] - self.constant);
            }
            for j in 0..self.q.min(extended_residuals.len()) {
                let idx = extended_residuals.len() - j - 1;
                forecast += self.ma_coeffs[j] * extended_residuals[idx];
            }
            extended.push(forecast);
            extended_residuals.push(0.0);
        }

        let mut levels = extended[diffed.len()..].to_vec();
        for order in (0..self.d).rev() {
            let base = difference(&series, order).last().copied().unwrap_or(0.0);
            let mut acc = base;
            for v in levels.iter_mut() {
                acc += *v;
                *v = acc;
            }
        }

        let z = normal_quantile(0.5 + self.confidence_level / 2.0);
        let psi = self.psi_weights(horizon);
        let mut cumulative = 0.0;

        Ok(levels
            .into_iter()
            .zip(psi)
            .map(|(value, weight)| {
                cumulative += weight * weight;
                let half_width = z * (self.sigma2 * cumulative).sqrt();
                IntervalForecast {
                    value,
                    lower: value - half_width,
                    upper: value + half_width,
                }
            })
            .collect())
    }

    /// Normalized absolute AR coefficient per lag of the target
    fn feature_importance(&self) -> BTreeMap<String, f64> {
        let total: f64 = self.ar_coeffs.iter().map(|c| c.abs()).sum();
        if total <= 0.0 {
            return BTreeMap::new();
        }
        self.ar_coeffs
            .iter()
            .enumerate()
            .map(|(k, c)| (format!("{}_lag_{}", self.target, k + 1), c.abs() / total))
            .collect()
    }

    fn to_artifact(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn difference(data: &[f64], order: usize) -> Vec<f64> {
    let mut result = data.to_vec();
    for _ in 0..order {
        result = result.windows(2).map(|w| w[1] - w[0]).collect();
    }
    result
}

fn pooled_autocovariance(series: &[Vec<f64>], mean: f64, max_lag: usize) -> Vec<f64> {
    let n_total: usize = series.iter().map(|s| s.len()).sum();
    let mut autocov = vec![0.0; max_lag + 1];
    for s in series {
        let centered: Vec<f64> = s.iter().map(|x| x - mean).collect();
        for (k, acc) in autocov.iter_mut().enumerate() {
            for i in k..centered.len() {
                *acc += centered[i] * centered[i - k];
            }
        }
    }
    for acc in autocov.iter_mut() {
        *acc /= n_total as f64;
    }
    autocov
}

/// Solve the Yule-Walker system for `order` AR coefficients
fn levinson_durbin(autocov: &[f64], order: usize) -> Vec<f64> {
    let mut phi = vec![0.0; order];
    if order == 0 || autocov[0].abs() < 1e-12 {
        return phi;
    }

    let mut error = autocov[0];
    for k in 0..order {
        let mut acc = autocov[k + 1];
        for j in 0..k {
            acc -= phi[j] * autocov[k - j];
        }
        let reflection = acc / error;

        let previous = phi.clone();
        phi[k] = reflection;
        for j in 0..k {
            phi[j] = previous[j] - reflection * previous[k - 1 - j];
        }

        error *= 1.0 - reflection * reflection;
        if error.abs() < 1e-12 {
            break;
        }
    }
    phi
}

fn residual_ma_coefficients(residuals: &[Vec<f64>], q: usize) -> Vec<f64> {
    let n: usize = residuals.iter().map(|r| r.len()).sum();
    if n == 0 {
        return vec![0.0; q];
    }
    let mean = residuals.iter().flatten().sum::<f64>() / n as f64;
    let autocov = pooled_autocovariance(residuals, mean, q);
    if autocov[0].abs() < 1e-12 {
        return vec![0.0; q];
    }
    autocov[1..]
        .iter()
        .map(|c| (c / autocov[0]).clamp(-0.99, 0.99))
        .collect()
}
