use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::{format_ts, parse_opt_ts, parse_ts, Database};
use crate::error::{ForecastError, Result};
use crate::types::{
    DatasetConfig, FeatureImportance, ModelId, ModelStatus, RunErrorKind, RunId, RunStatus,
    TrainingRun,
};

const RUN_COLUMNS: &str = r#"
    id, model_id, start_time, end_time, status, train_loss, validation_loss,
    metrics, error_kind, error_message
"#;

/// What a successful run records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub train_loss: Option<f64>,
    pub validation_loss: Option<f64>,
    pub metrics: BTreeMap<String, f64>,
    pub feature_importance: BTreeMap<String, f64>,
}

impl Database {
    /// Compare-and-set the model into `training` and open a run for it.
    /// A model that is already training is rejected, never queued.
    pub async fn begin_training(
        &self,
        model_id: ModelId,
        dataset_config: Option<&DatasetConfig>,
        now: DateTime<Utc>,
    ) -> Result<RunId> {
        let dataset_json = dataset_config.map(serde_json::to_string).transpose()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE models
            SET status = ?,
                training_dataset_config = COALESCE(?, training_dataset_config),
                updated_at = ?
            WHERE id = ? AND status != ?
            "#,
        )
        .bind(ModelStatus::Training.as_str())
        .bind(dataset_json)
        .bind(format_ts(&now))
        .bind(model_id)
        .bind(ModelStatus::Training.as_str())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM models WHERE id = ?")
                .bind(model_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                ForecastError::AlreadyRunning(model_id)
            } else {
                ForecastError::NotFound(format!("model {}", model_id))
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO training_runs (model_id, start_time, status, metrics)
            VALUES (?, ?, ?, '{}')
            "#,
        )
        .bind(model_id)
        .bind(format_ts(&now))
        .bind(RunStatus::Running.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => ForecastError::AlreadyRunning(model_id),
            other => ForecastError::Storage(other),
        })?;

        tx.commit().await?;
        Ok(inserted.last_insert_rowid())
    }

    /// Close a run as completed and make the model ready. Returns false when
    /// the run had already been closed (timed out or cancelled meanwhile).
    pub async fn complete_run(
        &self,
        run_id: RunId,
        model_id: ModelId,
        outcome: &RunOutcome,
        artifact_location: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            r#"
            UPDATE training_runs
            SET status = ?, end_time = ?, train_loss = ?, validation_loss = ?, metrics = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(RunStatus::Completed.as_str())
        .bind(format_ts(&now))
        .bind(outcome.train_loss)
        .bind(outcome.validation_loss)
        .bind(serde_json::to_string(&outcome.metrics)?)
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            return Ok(false);
        }

        for (feature_name, score) in &outcome.feature_importance {
            sqlx::query(
                r#"
                INSERT INTO feature_importance (model_id, run_id, feature_name, score, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(model_id)
            .bind(run_id)
            .bind(feature_name)
            .bind(score)
            .bind(format_ts(&now))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE models
            SET status = ?, artifact_location = ?, latest_importance_run_id = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ModelStatus::Ready.as_str())
        .bind(artifact_location)
        .bind(run_id)
        .bind(format_ts(&now))
        .bind(model_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Close a run as failed and mark the model failed. Returns false when
    /// the run had already been closed.
    pub async fn fail_run(
        &self,
        run_id: RunId,
        model_id: ModelId,
        kind: RunErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let closed = sqlx::query(
            r#"
            UPDATE training_runs
            SET status = ?, end_time = ?, error_kind = ?, error_message = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(RunStatus::Failed.as_str())
        .bind(format_ts(&now))
        .bind(kind.as_str())
        .bind(message)
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE models SET status = ?, updated_at = ? WHERE id = ?")
            .bind(ModelStatus::Failed.as_str())
            .bind(format_ts(&now))
            .bind(model_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<TrainingRun>> {
        let sql = format!("SELECT {} FROM training_runs WHERE id = ?", RUN_COLUMNS);
        let row = sqlx::query(&sql).bind(run_id).fetch_optional(&self.pool).await?;

        row.as_ref().map(run_from_row).transpose()
    }

    /// All runs of a model, newest first
    pub async fn list_runs(&self, model_id: ModelId) -> Result<Vec<TrainingRun>> {
        let sql = format!(
            "SELECT {} FROM training_runs WHERE model_id = ? ORDER BY id DESC",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(model_id).fetch_all(&self.pool).await?;

        rows.iter().map(run_from_row).collect()
    }

    pub async fn open_runs(&self) -> Result<Vec<TrainingRun>> {
        let sql = format!(
            "SELECT {} FROM training_runs WHERE status = ? ORDER BY id",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(RunStatus::Running.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(run_from_row).collect()
    }

    /// The run that produced the model's current artifact
    pub async fn latest_completed_run(&self, model_id: ModelId) -> Result<Option<RunId>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM training_runs
            WHERE model_id = ? AND status = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(model_id)
        .bind(RunStatus::Completed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("id")))
    }

    pub async fn feature_importance_for_run(
        &self,
        model_id: ModelId,
        run_id: RunId,
    ) -> Result<Vec<FeatureImportance>> {
        let rows = sqlx::query(
            r#"
            SELECT model_id, run_id, feature_name, score FROM feature_importance
            WHERE model_id = ? AND run_id = ?
            ORDER BY score DESC, feature_name ASC
            "#,
        )
        .bind(model_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(importance_from_row).collect())
    }

    pub async fn feature_importance_history(&self, model_id: ModelId) -> Result<Vec<FeatureImportance>> {
        let rows = sqlx::query(
            r#"
            SELECT model_id, run_id, feature_name, score FROM feature_importance
            WHERE model_id = ?
            ORDER BY run_id DESC, score DESC, feature_name ASC
            "#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(importance_from_row).collect())
    }
}

fn run_from_row(row: &SqliteRow) -> Result<TrainingRun> {
    let metrics: String = row.get("metrics");

    Ok(TrainingRun {
        id: row.get("id"),
        model_id: row.get("model_id"),
        start_time: parse_ts(row.get("start_time"))?,
        end_time: parse_opt_ts(row.get("end_time"))?,
        status: RunStatus::from_str(row.get("status"))?,
        train_loss: row.get("train_loss"),
        validation_loss: row.get("validation_loss"),
        metrics: serde_json::from_str(&metrics)?,
        error_kind: row
            .get::<Option<String>, _>("error_kind")
            .as_deref()
            .map(RunErrorKind::from_str)
            .transpose()?,
        error_message: row.get("error_message"),
    })
}

fn importance_from_row(row: &SqliteRow) -> FeatureImportance {
    FeatureImportance {
        model_id: row.get("model_id"),
        run_id: row.get("run_id"),
        feature_name: row.get("feature_name"),
        score: row.get("score"),
    }
}
