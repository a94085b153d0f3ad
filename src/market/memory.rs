use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{check_lookback, ActualsProvider, FeatureSource, FeatureWindow, PRICE_FEATURE};
use crate::error::{ForecastError, Result};
use crate::types::StockId;

#[derive(Debug, Clone, Default)]
struct Bar {
    close: f64,
    features: HashMap<String, f64>,
}

/// Market data held in process memory; backs tests and the CLI demo mode
#[derive(Default)]
pub struct InMemoryMarketData {
    series: RwLock<HashMap<StockId, BTreeMap<DateTime<Utc>, Bar>>>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regularly spaced closing prices starting at `start`
    pub fn with_closes(stock_id: StockId, start: DateTime<Utc>, step: Duration, closes: &[f64]) -> Self {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                (
                    start + step * i as i32,
                    Bar {
                        close,
                        features: HashMap::new(),
                    },
                )
            })
            .collect();

        Self {
            series: RwLock::new(HashMap::from([(stock_id, bars)])),
        }
    }

    pub async fn insert_bar(&self, stock_id: StockId, timestamp: DateTime<Utc>, close: f64) {
        let mut series = self.series.write().await;
        series.entry(stock_id).or_default().entry(timestamp).or_default().close = close;
    }

    pub async fn insert_feature(&self, stock_id: StockId, timestamp: DateTime<Utc>, name: &str, value: f64) {
        let mut series = self.series.write().await;
        series
            .entry(stock_id)
            .or_default()
            .entry(timestamp)
            .or_default()
            .features
            .insert(name.to_string(), value);
    }
}

#[async_trait]
impl FeatureSource for InMemoryMarketData {
    async fn get_feature_window(
        &self,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        lookback: usize,
        feature_names: &[String],
    ) -> Result<FeatureWindow> {
        let series = self.series.read().await;
        let bars: Vec<(&DateTime<Utc>, &Bar)> = match series.get(&stock_id) {
            Some(bars) => {
                let mut recent: Vec<_> = bars.range(..=as_of).rev().take(lookback).collect();
                recent.reverse();
                recent
            }
            None => Vec::new(),
        };
        check_lookback(stock_id, lookback, bars.len())?;

        let mut rows = Vec::with_capacity(bars.len());
        for (timestamp, bar) in &bars {
            let row = feature_names
                .iter()
                .map(|name| {
                    if name == PRICE_FEATURE {
                        return Ok(bar.close);
                    }
                    bar.features.get(name).copied().ok_or_else(|| {
                        ForecastError::InvalidInput(format!(
                            "feature '{}' missing for stock {} at {}",
                            name, stock_id, timestamp
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }

        let timestamps = bars.iter().map(|(ts, _)| **ts).collect();
        FeatureWindow::from_rows(stock_id, timestamps, feature_names.to_vec(), &rows)
    }
}

#[async_trait]
impl ActualsProvider for InMemoryMarketData {
    async fn get_actual(&self, stock_id: StockId, timestamp: DateTime<Utc>) -> Result<Option<f64>> {
        let series = self.series.read().await;
        Ok(series
            .get(&stock_id)
            .and_then(|bars| bars.get(&timestamp))
            .map(|bar| bar.close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_window_and_actuals() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let source = InMemoryMarketData::with_closes(7, start, Duration::days(1), &[1.0, 2.0, 3.0, 4.0]);
        source.insert_feature(7, start + Duration::days(3), "volume", 9.0).await;
        source.insert_feature(7, start + Duration::days(2), "volume", 8.0).await;

        let names = vec!["close".to_string(), "volume".to_string()];
        let window = source
            .get_feature_window(7, start + Duration::days(3), 2, &names)
            .await
            .unwrap();
        assert_eq!(window.column("close").unwrap().to_vec(), vec![3.0, 4.0]);
        assert_eq!(window.column("volume").unwrap().to_vec(), vec![8.0, 9.0]);

        assert_eq!(source.get_actual(7, start).await.unwrap(), Some(1.0));
        assert_eq!(source.get_actual(8, start).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_feature_is_invalid_input() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let source = InMemoryMarketData::with_closes(1, start, Duration::days(1), &[1.0, 2.0]);

        let err = source
            .get_feature_window(1, start + Duration::days(1), 2, &["rsi".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_stock_has_no_history() {
        let source = InMemoryMarketData::new();
        let err = source
            .get_feature_window(3, Utc::now(), 5, &["close".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientHistory { available: 0, .. }));
    }
}
