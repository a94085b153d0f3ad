use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::{check_lookback, ActualsProvider, FeatureSource, FeatureWindow, MarketDataUpload, PRICE_FEATURE};
use crate::database::Database;
use crate::error::{ForecastError, Result};
use crate::types::StockId;

/// Feature source and actuals provider over the `price_bars` and
/// `feature_values` tables.
#[derive(Clone)]
pub struct SqliteMarketData {
    db: Arc<Database>,
}

impl SqliteMarketData {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn ingest(&self, upload: &MarketDataUpload) -> Result<usize> {
        let bars: Vec<(DateTime<Utc>, f64)> = upload.bars.iter().map(|b| (b.timestamp, b.close)).collect();
        let features: Vec<(DateTime<Utc>, String, f64)> = upload
            .bars
            .iter()
            .flat_map(|b| b.features.iter().map(move |(name, v)| (b.timestamp, name.clone(), *v)))
            .collect();

        self.db.upsert_price_bars(upload.stock_id, &bars).await?;
        self.db.upsert_feature_values(upload.stock_id, &features).await?;

        info!(
            "Ingested {} bars ({} feature values) for stock {}",
            bars.len(),
            features.len(),
            upload.stock_id
        );
        Ok(bars.len())
    }
}

#[async_trait]
impl FeatureSource for SqliteMarketData {
    async fn get_feature_window(
        &self,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        lookback: usize,
        feature_names: &[String],
    ) -> Result<FeatureWindow> {
        let bars = self.db.bars_until(stock_id, as_of, lookback).await?;
        check_lookback(stock_id, lookback, bars.len())?;

        let (first, last) = match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => (first.0, last.0),
            _ => return Err(ForecastError::InsufficientHistory { stock_id, required: lookback, available: 0 }),
        };
        let extra = self.db.feature_values_between(stock_id, first, last).await?;

        let mut rows = Vec::with_capacity(bars.len());
        for (timestamp, close) in &bars {
            let mut row = Vec::with_capacity(feature_names.len());
            for name in feature_names {
                if name == PRICE_FEATURE {
                    row.push(*close);
                    continue;
                }
                let value = extra.get(&(*timestamp, name.clone())).ok_or_else(|| {
                    ForecastError::InvalidInput(format!(
                        "feature '{}' missing for stock {} at {}",
                        name, stock_id, timestamp
                    ))
                })?;
                row.push(*value);
            }
            rows.push(row);
        }

        debug!("Feature window for stock {}: {} rows x {} features", stock_id, rows.len(), feature_names.len());
        let timestamps = bars.into_iter().map(|(ts, _)| ts).collect();
        FeatureWindow::from_rows(stock_id, timestamps, feature_names.to_vec(), &rows)
    }
}

#[async_trait]
impl ActualsProvider for SqliteMarketData {
    async fn get_actual(&self, stock_id: StockId, timestamp: DateTime<Utc>) -> Result<Option<f64>> {
        self.db.close_at(stock_id, timestamp).await
    }
}
