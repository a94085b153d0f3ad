use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use crate::error::{ForecastError, Result};

mod market;
mod models;
mod predictions;
mod runs;

pub use runs::RunOutcome;

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database and apply the schema
    pub async fn new(db_url: &str, max_connections: u32) -> Result<Self> {
        info!("Initializing SQLite database at: {}", db_url);

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same memory image.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS architectures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        category TEXT NOT NULL,
        description TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS models (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        architecture_id INTEGER NOT NULL REFERENCES architectures(id) ON DELETE RESTRICT,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        hyperparameters TEXT NOT NULL,
        feature_config TEXT NOT NULL,
        training_dataset_config TEXT NOT NULL,
        artifact_location TEXT,
        status TEXT NOT NULL,
        latest_importance_run_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (name, version)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_models_status ON models(status)",
    r#"
    CREATE TABLE IF NOT EXISTS ensemble_members (
        ensemble_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        member_id INTEGER NOT NULL REFERENCES models(id) ON DELETE RESTRICT,
        position INTEGER NOT NULL,
        weight REAL NOT NULL,
        PRIMARY KEY (ensemble_id, member_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ensemble_members_member ON ensemble_members(member_id)",
    r#"
    CREATE TABLE IF NOT EXISTS training_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        start_time TEXT NOT NULL,
        end_time TEXT,
        status TEXT NOT NULL,
        train_loss REAL,
        validation_loss REAL,
        metrics TEXT NOT NULL DEFAULT '{}',
        error_kind TEXT,
        error_message TEXT
    )
    "#,
    // At most one open run per model
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_training_runs_open
    ON training_runs(model_id) WHERE status = 'running'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_importance (
        model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        run_id INTEGER NOT NULL REFERENCES training_runs(id) ON DELETE CASCADE,
        feature_name TEXT NOT NULL,
        score REAL NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (model_id, run_id, feature_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prediction_batches (
        batch_id TEXT PRIMARY KEY,
        model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        training_run_id INTEGER REFERENCES training_runs(id) ON DELETE SET NULL,
        stock_id INTEGER NOT NULL,
        prediction_timestamp TEXT NOT NULL,
        config TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        batch_id TEXT NOT NULL REFERENCES prediction_batches(batch_id) ON DELETE CASCADE,
        model_id INTEGER NOT NULL REFERENCES models(id) ON DELETE CASCADE,
        stock_id INTEGER NOT NULL,
        prediction_timestamp TEXT NOT NULL,
        target_timestamp TEXT NOT NULL,
        predicted_value REAL NOT NULL,
        confidence_lower REAL NOT NULL,
        confidence_upper REAL NOT NULL,
        features_used TEXT NOT NULL,
        CHECK (target_timestamp > prediction_timestamp)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_predictions_lookup ON predictions(model_id, stock_id, target_timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS price_bars (
        stock_id INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        close REAL NOT NULL,
        PRIMARY KEY (stock_id, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_values (
        stock_id INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        name TEXT NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (stock_id, timestamp, name)
    )
    "#,
];

/// Fixed-width UTC text so lexical order matches chronological order
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ForecastError::Storage(sqlx::Error::Decode(Box::new(e))))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.create_schema().await.unwrap();
    }
}
