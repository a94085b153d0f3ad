use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

use super::{format_ts, parse_ts, Database};
use crate::error::{ForecastError, Result};
use crate::types::{
    Architecture, ArchitectureCategory, ArchitectureId, Model, ModelId, ModelStatus, NewModel,
};

const MODEL_COLUMNS: &str = r#"
    m.id, m.architecture_id, a.name AS architecture, a.category, m.name, m.version,
    m.hyperparameters, m.feature_config, m.training_dataset_config, m.artifact_location,
    m.status, m.latest_importance_run_id, m.created_at, m.updated_at
"#;

impl Database {
    /// Seed a catalog entry; existing names are left untouched
    pub async fn ensure_architecture(
        &self,
        name: &str,
        category: ArchitectureCategory,
        description: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO architectures (name, category, description)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(category.as_str())
        .bind(description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_architectures(&self) -> Result<Vec<Architecture>> {
        let rows = sqlx::query("SELECT id, name, category, description FROM architectures ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(architecture_from_row).collect()
    }

    pub async fn get_architecture_by_name(&self, name: &str) -> Result<Option<Architecture>> {
        let row = sqlx::query("SELECT id, name, category, description FROM architectures WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(architecture_from_row).transpose()
    }

    /// Insert a model in `created` state together with its ensemble members, if any
    pub async fn insert_model(
        &self,
        architecture_id: ArchitectureId,
        model: &NewModel,
        members: &[(ModelId, f64)],
        now: DateTime<Utc>,
    ) -> Result<ModelId> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO models (
                architecture_id, name, version, hyperparameters, feature_config,
                training_dataset_config, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(architecture_id)
        .bind(&model.name)
        .bind(&model.version)
        .bind(serde_json::to_string(&model.hyperparameters)?)
        .bind(serde_json::to_string(&model.feature_config)?)
        .bind(serde_json::to_string(&model.training_dataset_config)?)
        .bind(ModelStatus::Created.as_str())
        .bind(format_ts(&now))
        .bind(format_ts(&now))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => ForecastError::DuplicateModel {
                name: model.name.clone(),
                version: model.version.clone(),
            },
            other => ForecastError::Storage(other),
        })?;

        let model_id = result.last_insert_rowid();

        for (position, (member_id, weight)) in members.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO ensemble_members (ensemble_id, member_id, position, weight)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(model_id)
            .bind(member_id)
            .bind(position as i64)
            .bind(weight)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(model_id)
    }

    pub async fn get_model(&self, model_id: ModelId) -> Result<Option<Model>> {
        let sql = format!(
            "SELECT {} FROM models m JOIN architectures a ON a.id = m.architecture_id WHERE m.id = ?",
            MODEL_COLUMNS
        );
        let row = sqlx::query(&sql).bind(model_id).fetch_optional(&self.pool).await?;

        row.as_ref().map(model_from_row).transpose()
    }

    pub async fn find_model(&self, name: &str, version: &str) -> Result<Option<Model>> {
        let sql = format!(
            "SELECT {} FROM models m JOIN architectures a ON a.id = m.architecture_id \
             WHERE m.name = ? AND m.version = ?",
            MODEL_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(model_from_row).transpose()
    }

    pub async fn list_models(
        &self,
        status: Option<ModelStatus>,
        architecture: Option<&str>,
    ) -> Result<Vec<Model>> {
        let sql = format!(
            "SELECT {} FROM models m JOIN architectures a ON a.id = m.architecture_id \
             WHERE (?1 IS NULL OR m.status = ?1) AND (?2 IS NULL OR a.name = ?2) \
             ORDER BY m.id",
            MODEL_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(architecture)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(model_from_row).collect()
    }

    /// Delete a model that is not training; dependent rows go with it
    /// through `ON DELETE CASCADE`. Ensemble membership blocks the delete.
    pub async fn delete_model(&self, model_id: ModelId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM models WHERE id = ? AND status != ?")
            .bind(model_id)
            .bind(ModelStatus::Training.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => ForecastError::InvalidInput(
                    format!("model {} is a member of an ensemble", model_id),
                ),
                other => ForecastError::Storage(other),
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Members of an ensemble in declaration order
    pub async fn ensemble_members(&self, ensemble_id: ModelId) -> Result<Vec<(ModelId, f64)>> {
        let rows = sqlx::query(
            r#"
            SELECT member_id, weight FROM ensemble_members
            WHERE ensemble_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(ensemble_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("member_id"), row.get("weight")))
            .collect())
    }

    /// Ensembles that list `member_id` among their members
    pub async fn ensembles_containing(&self, member_id: ModelId) -> Result<Vec<ModelId>> {
        let rows = sqlx::query("SELECT ensemble_id FROM ensemble_members WHERE member_id = ? ORDER BY ensemble_id")
            .bind(member_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("ensemble_id")).collect())
    }
}

fn architecture_from_row(row: &SqliteRow) -> Result<Architecture> {
    Ok(Architecture {
        id: row.get("id"),
        name: row.get("name"),
        category: ArchitectureCategory::from_str(row.get("category"))?,
        description: row.get("description"),
    })
}

fn model_from_row(row: &SqliteRow) -> Result<Model> {
    let hyperparameters: String = row.get("hyperparameters");
    let feature_config: String = row.get("feature_config");
    let dataset_config: String = row.get("training_dataset_config");

    Ok(Model {
        id: row.get("id"),
        architecture_id: row.get("architecture_id"),
        architecture: row.get("architecture"),
        category: ArchitectureCategory::from_str(row.get("category"))?,
        name: row.get("name"),
        version: row.get("version"),
        hyperparameters: serde_json::from_str(&hyperparameters)?,
        feature_config: serde_json::from_str(&feature_config)?,
        training_dataset_config: serde_json::from_str(&dataset_config)?,
        artifact_location: row.get("artifact_location"),
        status: ModelStatus::from_str(row.get("status"))?,
        latest_importance_run_id: row.get("latest_importance_run_id"),
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}
