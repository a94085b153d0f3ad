use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;

use super::{format_ts, parse_ts, Database};
use crate::error::Result;
use crate::types::StockId;

impl Database {
    pub async fn upsert_price_bars(&self, stock_id: StockId, bars: &[(DateTime<Utc>, f64)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (timestamp, close) in bars {
            sqlx::query(
                r#"
                INSERT INTO price_bars (stock_id, timestamp, close) VALUES (?, ?, ?)
                ON CONFLICT(stock_id, timestamp) DO UPDATE SET close = excluded.close
                "#,
            )
            .bind(stock_id)
            .bind(format_ts(timestamp))
            .bind(close)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_feature_values(
        &self,
        stock_id: StockId,
        values: &[(DateTime<Utc>, String, f64)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (timestamp, name, value) in values {
            sqlx::query(
                r#"
                INSERT INTO feature_values (stock_id, timestamp, name, value) VALUES (?, ?, ?, ?)
                ON CONFLICT(stock_id, timestamp, name) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(stock_id)
            .bind(format_ts(timestamp))
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The last `limit` bars at or before `as_of`, oldest first
    pub async fn bars_until(
        &self,
        stock_id: StockId,
        as_of: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, close FROM price_bars
            WHERE stock_id = ? AND timestamp <= ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(stock_id)
        .bind(format_ts(&as_of))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars = rows
            .iter()
            .map(|row| Ok((parse_ts(row.get("timestamp"))?, row.get("close"))))
            .collect::<Result<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    /// Feature values in `[from, to]` keyed by (timestamp, name)
    pub async fn feature_values_between(
        &self,
        stock_id: StockId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<HashMap<(DateTime<Utc>, String), f64>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, name, value FROM feature_values
            WHERE stock_id = ? AND timestamp >= ? AND timestamp <= ?
            "#,
        )
        .bind(stock_id)
        .bind(format_ts(&from))
        .bind(format_ts(&to))
        .fetch_all(&self.pool)
        .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            values.insert((parse_ts(row.get("timestamp"))?, row.get("name")), row.get("value"));
        }
        Ok(values)
    }

    pub async fn close_at(&self, stock_id: StockId, timestamp: DateTime<Utc>) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT close FROM price_bars WHERE stock_id = ? AND timestamp = ?")
            .bind(stock_id)
            .bind(format_ts(&timestamp))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("close")))
    }
}
