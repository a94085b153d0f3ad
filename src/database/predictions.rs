use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use super::{format_ts, parse_ts, Database};
use crate::error::{ForecastError, Result};
use crate::types::{BatchStatus, ModelId, Prediction, PredictionBatch, StockId};

const PREDICTION_COLUMNS: &str = r#"
    batch_id, model_id, stock_id, prediction_timestamp, target_timestamp,
    predicted_value, confidence_lower, confidence_upper, features_used
"#;

impl Database {
    /// Persist a batch together with its predictions atomically
    pub async fn insert_batch(&self, batch: &PredictionBatch, predictions: &[Prediction]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO prediction_batches (
                batch_id, model_id, training_run_id, stock_id, prediction_timestamp,
                config, status, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(batch.batch_id.to_string())
        .bind(batch.model_id)
        .bind(batch.training_run_id)
        .bind(batch.stock_id)
        .bind(format_ts(&batch.prediction_timestamp))
        .bind(serde_json::to_string(&batch.config)?)
        .bind(batch.status.as_str())
        .bind(&batch.error)
        .execute(&mut *tx)
        .await?;

        for prediction in predictions {
            sqlx::query(
                r#"
                INSERT INTO predictions (
                    batch_id, model_id, stock_id, prediction_timestamp, target_timestamp,
                    predicted_value, confidence_lower, confidence_upper, features_used
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(prediction.batch_id.to_string())
            .bind(prediction.model_id)
            .bind(prediction.stock_id)
            .bind(format_ts(&prediction.prediction_timestamp))
            .bind(format_ts(&prediction.target_timestamp))
            .bind(prediction.predicted_value)
            .bind(prediction.confidence_lower)
            .bind(prediction.confidence_upper)
            .bind(serde_json::to_string(&prediction.features_used)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> Result<Option<PredictionBatch>> {
        let row = sqlx::query(
            r#"
            SELECT batch_id, model_id, training_run_id, stock_id, prediction_timestamp,
                   config, status, error
            FROM prediction_batches
            WHERE batch_id = ?
            "#,
        )
        .bind(batch_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    /// Predictions of one model for one stock whose target falls in `[start, end]`
    pub async fn predictions_for(
        &self,
        model_id: ModelId,
        stock_id: StockId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Prediction>> {
        let mut tx = self.pool.begin().await?;
        let predictions = fetch_predictions(&mut tx, model_id, stock_id, start, end).await?;
        tx.commit().await?;
        Ok(predictions)
    }

    /// Read several models' predictions inside one transaction so the
    /// caller sees a single consistent snapshot.
    pub async fn predictions_snapshot(
        &self,
        model_ids: &[ModelId],
        stock_id: StockId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<ModelId, Vec<Prediction>>> {
        let mut tx = self.pool.begin().await?;
        let mut snapshot = BTreeMap::new();

        for &model_id in model_ids {
            let predictions = fetch_predictions(&mut tx, model_id, stock_id, start, end).await?;
            snapshot.insert(model_id, predictions);
        }

        tx.commit().await?;
        Ok(snapshot)
    }
}

async fn fetch_predictions(
    tx: &mut Transaction<'_, Sqlite>,
    model_id: ModelId,
    stock_id: StockId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Prediction>> {
    let sql = format!(
        "SELECT {} FROM predictions \
         WHERE model_id = ? AND stock_id = ? AND target_timestamp >= ? AND target_timestamp <= ? \
         ORDER BY target_timestamp ASC, prediction_timestamp ASC, id ASC",
        PREDICTION_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(model_id)
        .bind(stock_id)
        .bind(format_ts(&start))
        .bind(format_ts(&end))
        .fetch_all(&mut **tx)
        .await?;

    rows.iter().map(prediction_from_row).collect()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| ForecastError::Storage(sqlx::Error::Decode(Box::new(e))))
}

fn prediction_from_row(row: &SqliteRow) -> Result<Prediction> {
    let features_used: String = row.get("features_used");

    Ok(Prediction {
        batch_id: parse_uuid(row.get("batch_id"))?,
        model_id: row.get("model_id"),
        stock_id: row.get("stock_id"),
        prediction_timestamp: parse_ts(row.get("prediction_timestamp"))?,
        target_timestamp: parse_ts(row.get("target_timestamp"))?,
        predicted_value: row.get("predicted_value"),
        confidence_lower: row.get("confidence_lower"),
        confidence_upper: row.get("confidence_upper"),
        features_used: serde_json::from_str(&features_used)?,
    })
}

fn batch_from_row(row: &SqliteRow) -> Result<PredictionBatch> {
    let config: String = row.get("config");

    Ok(PredictionBatch {
        batch_id: parse_uuid(row.get("batch_id"))?,
        model_id: row.get("model_id"),
        training_run_id: row.get("training_run_id"),
        stock_id: row.get("stock_id"),
        prediction_timestamp: parse_ts(row.get("prediction_timestamp"))?,
        config: serde_json::from_str(&config)?,
        status: BatchStatus::from_str(row.get("status"))?,
        error: row.get("error"),
    })
}
