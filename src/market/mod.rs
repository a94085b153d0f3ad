//! Boundary with the market-data side of the platform: windowed feature
//! vectors for training and inference, and realized prices for scoring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndarray::{s, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ForecastError, Result};
use crate::types::StockId;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryMarketData;
pub use sqlite::SqliteMarketData;

/// Name of the realized price column every source must serve
pub const PRICE_FEATURE: &str = "close";

#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// The `lookback` most recent rows at or before `as_of`, one column per
    /// requested feature, oldest row first.
    async fn get_feature_window(
        &self,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        lookback: usize,
        feature_names: &[String],
    ) -> Result<FeatureWindow>;
}

#[async_trait]
pub trait ActualsProvider: Send + Sync {
    async fn get_actual(&self, stock_id: StockId, timestamp: DateTime<Utc>) -> Result<Option<f64>>;
}

/// Time-ordered numeric matrix: rows are timestamps, columns are features
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    pub stock_id: StockId,
    pub timestamps: Vec<DateTime<Utc>>,
    pub feature_names: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureWindow {
    pub fn from_rows(
        stock_id: StockId,
        timestamps: Vec<DateTime<Utc>>,
        feature_names: Vec<String>,
        rows: &[Vec<f64>],
    ) -> Result<Self> {
        let n_cols = feature_names.len();
        if rows.len() != timestamps.len() || rows.iter().any(|r| r.len() != n_cols) {
            return Err(ForecastError::InvalidInput("feature window rows are ragged".to_string()));
        }

        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let values = Array2::from_shape_vec((rows.len(), n_cols), flat)
            .map_err(|e| ForecastError::InvalidInput(e.to_string()))?;

        Ok(Self {
            stock_id,
            timestamps,
            feature_names,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_index(name).map(|idx| self.values.column(idx))
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }

    /// Chronological split: rows `[0, at)` and `[at, len)`
    pub fn split_at(&self, at: usize) -> (FeatureWindow, FeatureWindow) {
        let at = at.min(self.len());
        let head = FeatureWindow {
            stock_id: self.stock_id,
            timestamps: self.timestamps[..at].to_vec(),
            feature_names: self.feature_names.clone(),
            values: self.values.slice(s![..at, ..]).to_owned(),
        };
        let tail = FeatureWindow {
            stock_id: self.stock_id,
            timestamps: self.timestamps[at..].to_vec(),
            feature_names: self.feature_names.clone(),
            values: self.values.slice(s![at.., ..]).to_owned(),
        };
        (head, tail)
    }
}

/// Bulk upload payload for the SQLite-backed source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataUpload {
    pub stock_id: StockId,
    pub bars: Vec<MarketBar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketBar {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

pub(crate) fn check_lookback(stock_id: StockId, lookback: usize, available: usize) -> Result<()> {
    if lookback == 0 {
        return Err(ForecastError::InvalidInput("lookback must be > 0".to_string()));
    }
    if available < lookback {
        return Err(ForecastError::InsufficientHistory {
            stock_id,
            required: lookback,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn window() -> FeatureWindow {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let timestamps = (0..4).map(|i| start + Duration::days(i)).collect();
        let rows = vec![
            vec![10.0, 1.0],
            vec![11.0, 2.0],
            vec![12.0, 3.0],
            vec![13.0, 4.0],
        ];
        FeatureWindow::from_rows(1, timestamps, vec!["close".into(), "volume".into()], &rows).unwrap()
    }

    #[test]
    fn test_column_lookup() {
        let w = window();
        assert_eq!(w.column("volume").unwrap().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(w.column("rsi").is_none());
    }

    #[test]
    fn test_split_keeps_order() {
        let (head, tail) = window().split_at(3);
        assert_eq!(head.len(), 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail.values[[0, 0]], 13.0);
        assert!(head.last_timestamp().unwrap() < tail.timestamps[0]);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let result = FeatureWindow::from_rows(1, vec![start], vec!["close".into()], &[vec![1.0, 2.0]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_lookback() {
        assert!(matches!(
            check_lookback(4, 10, 3),
            Err(ForecastError::InsufficientHistory { stock_id: 4, required: 10, available: 3 })
        ));
        assert!(check_lookback(4, 3, 3).is_ok());
        assert!(check_lookback(4, 0, 3).is_err());
    }
}
