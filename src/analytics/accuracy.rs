use serde::{Deserialize, Serialize};

use crate::ml::stats::{mean, mean_squared, std_dev};

/// Convention for the directional Sharpe ratio; echoed in every report so
/// numbers from different conventions are never compared silently.
pub const SHARPE_CONVENTION: &str = "directional-v1: r = sign(predicted - previous_actual) * \
     (actual - previous_actual) / previous_actual; mean / population stdev * sqrt(annualization_factor)";

/// A prediction joined to the realized value at its target timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPoint {
    pub predicted: f64,
    pub actual: f64,
    /// Actual at the preceding timeline point, when there is one
    pub previous_actual: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub mape: Option<f64>,
    pub directional_accuracy: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sample_size: usize,
}

impl AccuracyMetrics {
    pub fn empty() -> Self {
        Self {
            mae: None,
            rmse: None,
            mape: None,
            directional_accuracy: None,
            sharpe_ratio: None,
            sample_size: 0,
        }
    }
}

pub fn evaluate(points: &[MatchedPoint], annualization_factor: f64) -> AccuracyMetrics {
    if points.is_empty() {
        return AccuracyMetrics::empty();
    }

    AccuracyMetrics {
        mae: mae(points),
        rmse: rmse(points),
        mape: mape(points),
        directional_accuracy: directional_accuracy(points),
        sharpe_ratio: sharpe_ratio(points, annualization_factor),
        sample_size: points.len(),
    }
}

pub fn mae(points: &[MatchedPoint]) -> Option<f64> {
    let errors: Vec<f64> = points.iter().map(|p| (p.predicted - p.actual).abs()).collect();
    average(&errors)
}

pub fn rmse(points: &[MatchedPoint]) -> Option<f64> {
    let errors: Vec<f64> = points.iter().map(|p| p.predicted - p.actual).collect();
    mean_squared(&errors).map(f64::sqrt)
}

/// Mean absolute percentage error ×100; undefined when any actual is zero
pub fn mape(points: &[MatchedPoint]) -> Option<f64> {
    if points.iter().any(|p| p.actual == 0.0) {
        return None;
    }
    let pct: Vec<f64> = points
        .iter()
        .map(|p| ((p.actual - p.predicted) / p.actual).abs())
        .collect();
    average(&pct).map(|m| m * 100.0)
}

/// Share of points whose predicted move from the previous actual has the
/// same sign as the realized move
pub fn directional_accuracy(points: &[MatchedPoint]) -> Option<f64> {
    let eligible: Vec<bool> = points
        .iter()
        .filter_map(|p| {
            let prev = p.previous_actual?;
            Some(sign(p.predicted - prev) == sign(p.actual - prev))
        })
        .collect();

    if eligible.is_empty() {
        return None;
    }
    let hits = eligible.iter().filter(|&&hit| hit).count();
    Some(hits as f64 / eligible.len() as f64)
}

/// Annualized Sharpe of trading the predicted direction at every point
pub fn sharpe_ratio(points: &[MatchedPoint], annualization_factor: f64) -> Option<f64> {
    let returns: Vec<f64> = points
        .iter()
        .filter_map(|p| {
            let prev = p.previous_actual.filter(|v| *v != 0.0)?;
            Some(sign(p.predicted - prev) as f64 * (p.actual - prev) / prev)
        })
        .collect();

    if returns.len() < 2 {
        return None;
    }
    let sd = std_dev(&returns);
    if sd == 0.0 {
        return None;
    }
    Some(mean(&returns) / sd * annualization_factor.sqrt())
}

fn average(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| mean(values))
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(actual: &[f64], predicted: &[f64]) -> Vec<MatchedPoint> {
        actual
            .iter()
            .zip(predicted)
            .enumerate()
            .map(|(i, (&a, &p))| MatchedPoint {
                predicted: p,
                actual: a,
                previous_actual: if i == 0 { None } else { Some(actual[i - 1]) },
            })
            .collect()
    }

    #[test]
    fn test_directional_accuracy_all_moves_called() {
        let points = series(&[100.0, 102.0, 101.0, 105.0], &[100.0, 103.0, 100.0, 106.0]);
        assert_eq!(directional_accuracy(&points), Some(1.0));
    }

    #[test]
    fn test_error_metrics() {
        let points = series(&[100.0, 102.0, 101.0, 105.0], &[100.0, 103.0, 100.0, 106.0]);
        let m = evaluate(&points, 252.0);

        assert_eq!(m.sample_size, 4);
        assert_eq!(m.mae, Some(0.75));
        assert!((m.rmse.unwrap() - 0.75_f64.sqrt()).abs() < 1e-12);
        let expected_mape = (1.0 / 102.0 + 1.0 / 101.0 + 1.0 / 105.0) / 4.0 * 100.0;
        assert!((m.mape.unwrap() - expected_mape).abs() < 1e-12);
    }

    #[test]
    fn test_mape_undefined_with_zero_actual() {
        let points = series(&[0.0, 1.0], &[0.5, 1.0]);
        assert_eq!(mape(&points), None);
        assert_eq!(mae(&points), Some(0.25));
    }

    #[test]
    fn test_directional_accuracy_needs_previous_actual() {
        let points = series(&[100.0], &[101.0]);
        assert_eq!(directional_accuracy(&points), None);

        let points = series(&[100.0, 101.0, 100.0], &[100.0, 99.0, 102.0]);
        assert_eq!(directional_accuracy(&points), Some(0.0));
    }

    #[test]
    fn test_sharpe_of_directional_returns() {
        // Returns: +2%, +1%, +4%
        let points = series(&[100.0, 102.0, 103.02, 107.1408], &[100.0, 103.0, 104.0, 108.0]);
        let s = sharpe_ratio(&points, 252.0).unwrap();

        let returns = [0.02, 0.01, 0.04];
        let mean_r = returns.iter().sum::<f64>() / 3.0;
        let sd = (returns.iter().map(|r| (r - mean_r).powi(2)).sum::<f64>() / 3.0).sqrt();
        assert!((s - mean_r / sd * 252.0_f64.sqrt()).abs() < 1e-6);
        assert!(s > 0.0);
    }

    #[test]
    fn test_sharpe_undefined_cases() {
        // One return only
        assert_eq!(sharpe_ratio(&series(&[100.0, 101.0], &[100.0, 102.0]), 252.0), None);
        // Identical returns: zero spread
        assert_eq!(
            sharpe_ratio(&series(&[100.0, 110.0, 121.0], &[100.0, 111.0, 122.0]), 252.0),
            None
        );
    }

    #[test]
    fn test_wrong_direction_is_a_loss() {
        let points = series(&[100.0, 110.0, 99.0, 102.96], &[100.0, 95.0, 115.0, 95.0]);
        assert!(sharpe_ratio(&points, 252.0).unwrap() < 0.0);
    }

    #[test]
    fn test_empty_is_all_null() {
        assert_eq!(evaluate(&[], 252.0), AccuracyMetrics::empty());
    }
}
