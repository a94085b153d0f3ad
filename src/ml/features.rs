use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{ForecastError, Result};

/// Z-score normalization fitted on training inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Normalizer {
    pub fn fit(samples: &Array2<f64>) -> Result<Self> {
        let means = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| ForecastError::Training("cannot normalize an empty sample set".to_string()))?;
        let stds = samples.std_axis(Axis(0), 0.0);

        Ok(Self {
            means: means.to_vec(),
            stds: stds.to_vec(),
        })
    }

    pub fn dim(&self) -> usize {
        self.means.len()
    }

    pub fn transform_row(&self, row: &[f64]) -> Array1<f64> {
        Array1::from_iter(row.iter().enumerate().map(|(j, &x)| {
            // Constant columns carry no signal
            if self.stds[j] > 1e-10 {
                (x - self.means[j]) / self.stds[j]
            } else {
                0.0
            }
        }))
    }

    pub fn transform(&self, samples: &Array2<f64>) -> Array2<f64> {
        let mut out = samples.clone();
        for mut row in out.rows_mut() {
            let normalized = self.transform_row(&row.to_vec());
            row.assign(&normalized);
        }
        out
    }
}

/// Flattened inputs for the window ending at row `end`, lag-major. The
/// target column is expressed relative to its value at `end`.
pub fn window_inputs(values: &Array2<f64>, target_idx: usize, end: usize, lookback: usize) -> Option<Vec<f64>> {
    if lookback == 0 || end + 1 < lookback || end >= values.nrows() {
        return None;
    }
    let anchor = values[[end, target_idx]];
    if anchor.abs() < 1e-12 {
        return None;
    }

    let mut inputs = Vec::with_capacity(lookback * values.ncols());
    for row in (end + 1 - lookback)..=end {
        for col in 0..values.ncols() {
            let v = values[[row, col]];
            inputs.push(if col == target_idx { v / anchor - 1.0 } else { v });
        }
    }
    Some(inputs)
}

/// Relative change of the target for each step `1..=horizon` after `end`
pub fn relative_targets(values: &Array2<f64>, target_idx: usize, end: usize, horizon: usize) -> Option<Vec<f64>> {
    if end + horizon >= values.nrows() {
        return None;
    }
    let anchor = values[[end, target_idx]];
    if anchor.abs() < 1e-12 {
        return None;
    }
    Some((1..=horizon).map(|k| (values[[end + k, target_idx]] - anchor) / anchor).collect())
}

/// Supervised samples: one row per anchor in `anchors` that has a full
/// lookback behind it and a full horizon ahead of it.
#[derive(Debug, Clone)]
pub struct SampleSet {
    pub inputs: Array2<f64>,
    pub targets: Array2<f64>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

pub fn build_samples(
    values: &Array2<f64>,
    target_idx: usize,
    lookback: usize,
    horizon: usize,
    anchors: Range<usize>,
) -> SampleSet {
    let n_inputs = lookback * values.ncols();
    let mut inputs = Vec::new();
    let mut targets = Vec::new();
    let mut rows = 0;

    for end in anchors {
        if let (Some(x), Some(y)) = (
            window_inputs(values, target_idx, end, lookback),
            relative_targets(values, target_idx, end, horizon),
        ) {
            inputs.extend(x);
            targets.extend(y);
            rows += 1;
        }
    }

    SampleSet {
        inputs: Array2::from_shape_vec((rows, n_inputs), inputs).unwrap_or_else(|_| Array2::zeros((0, n_inputs))),
        targets: Array2::from_shape_vec((rows, horizon), targets).unwrap_or_else(|_| Array2::zeros((0, horizon))),
    }
}

/// Concatenate sample sets row-wise
pub fn stack(sets: &[SampleSet], n_inputs: usize, horizon: usize) -> SampleSet {
    let rows: usize = sets.iter().map(|s| s.len()).sum();
    let mut inputs = Array2::zeros((rows, n_inputs));
    let mut targets = Array2::zeros((rows, horizon));

    let mut offset = 0;
    for set in sets {
        let n = set.len();
        inputs.slice_mut(ndarray::s![offset..offset + n, ..]).assign(&set.inputs);
        targets.slice_mut(ndarray::s![offset..offset + n, ..]).assign(&set.targets);
        offset += n;
    }

    SampleSet { inputs, targets }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_window_inputs_are_relative_to_anchor() {
        let values = array![[100.0, 5.0], [110.0, 6.0], [121.0, 7.0]];
        let inputs = window_inputs(&values, 0, 2, 2).unwrap();
        assert!((inputs[0] - (110.0 / 121.0 - 1.0)).abs() < 1e-12);
        assert_eq!(inputs[1], 6.0);
        assert_eq!(inputs[2], 0.0);
        assert_eq!(inputs[3], 7.0);
        assert!(window_inputs(&values, 0, 0, 2).is_none());
    }

    #[test]
    fn test_relative_targets() {
        let values = array![[100.0], [110.0], [90.0]];
        let targets = relative_targets(&values, 0, 0, 2).unwrap();
        assert!((targets[0] - 0.1).abs() < 1e-12);
        assert!((targets[1] + 0.1).abs() < 1e-12);
        assert!(relative_targets(&values, 0, 1, 2).is_none());
    }

    #[test]
    fn test_build_samples_skips_incomplete_anchors() {
        let values = Array2::from_shape_fn((10, 1), |(i, _)| 100.0 + i as f64);
        let set = build_samples(&values, 0, 3, 2, 0..10);
        // anchors 2..=7 have both a full lookback and a full horizon
        assert_eq!(set.len(), 6);
        assert_eq!(set.inputs.ncols(), 3);
        assert_eq!(set.targets.ncols(), 2);
    }

    #[test]
    fn test_normalizer_zero_variance_column() {
        let samples = array![[1.0, 3.0], [3.0, 3.0]];
        let norm = Normalizer::fit(&samples).unwrap();
        let out = norm.transform(&samples);
        assert_eq!(out[[0, 0]], -1.0);
        assert_eq!(out[[1, 0]], 1.0);
        assert_eq!(out[[0, 1]], 0.0);
    }
}
