use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{api, AppState};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api::health_check))
        .route("/api/architectures", get(api::get_architectures))
        // Models
        .route("/api/models", get(api::get_models).post(api::post_model))
        .route("/api/models/:id", get(api::get_model).delete(api::delete_model))
        .route("/api/models/:id/train", post(api::post_train))
        .route("/api/models/:id/runs", get(api::get_runs))
        .route("/api/models/:id/feature-importance", get(api::get_feature_importance))
        // Training runs
        .route("/api/runs/:id", get(api::get_run))
        .route("/api/runs/:id/cancel", post(api::post_cancel_run))
        // Ensembles
        .route("/api/ensembles", post(api::post_ensemble))
        // Predictions & comparison
        .route("/api/predictions", get(api::get_predictions).post(api::post_prediction))
        .route("/api/predictions/batch", post(api::post_prediction_batch))
        .route("/api/comparison", get(api::get_comparison))
        // Market data
        .route("/api/market-data", post(api::post_market_data))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_api_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API server starting on http://localhost:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::database::Database;
    use crate::market::SqliteMarketData;
    use crate::ml::{ArtifactStore, FsArtifactStore};
    use crate::service::ForecastService;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app(dir: &tempfile::TempDir) -> Router {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let market = Arc::new(SqliteMarketData::new(db.clone()));
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.path()));
        let service = ForecastService::assemble(
            ServiceConfig::default(),
            db,
            artifacts,
            market.clone(),
            market.clone(),
            market,
        );
        service.bootstrap().await.unwrap();
        router(AppState::new(service))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn arima_body(name: &str) -> Value {
        json!({
            "architecture": "ARIMA",
            "name": name,
            "version": "1.0",
            "hyperparameters": {"p": 2},
            "training_dataset_config": {"stock_ids": [1]}
        })
    }

    #[tokio::test]
    async fn test_health_and_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/api/architectures", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_model_crud_and_error_codes() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, model) = call(&app, "POST", "/api/models", Some(arima_body("spy"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(model["status"], "created");
        let id = model["id"].as_i64().unwrap();

        let (status, body) = call(&app, "POST", "/api/models", Some(arima_body("spy"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate_model");

        let mut unknown = arima_body("x");
        unknown["architecture"] = json!("Prophet");
        let (status, body) = call(&app, "POST", "/api/models", Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown_architecture");

        let (status, body) = call(&app, "GET", "/api/models?status=created&architecture=ARIMA", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "GET", "/api/models?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/api/predictions",
            Some(json!({"model_id": id, "stock_id": 1, "horizon": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "model_not_ready");

        let (status, _) = call(&app, "DELETE", &format!("/api/models/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/api/models/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_train_predict_compare() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let bars: Vec<Value> = (0..31)
            .map(|i| {
                json!({
                    "timestamp": format!("2024-01-{:02}T00:00:00Z", 1 + i),
                    "close": 100.0 + i as f64 + ((i * 7 % 5) as f64 - 2.0) * 0.3,
                })
            })
            .collect();
        let (status, body) = call(&app, "POST", "/api/market-data", Some(json!({"stock_id": 1, "bars": bars}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["bars"], 31);

        let mut req = arima_body("spy");
        req["feature_config"] = json!({"lookback": 10});
        req["training_dataset_config"] = json!({
            "stock_ids": [1], "history": 25, "end": "2024-01-25T00:00:00Z"
        });
        let (_, model) = call(&app, "POST", "/api/models", Some(req)).await;
        let id = model["id"].as_i64().unwrap();

        let (status, ticket) = call(&app, "POST", &format!("/api/models/{}/train", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = ticket["run_id"].as_i64().unwrap();

        let mut run = Value::Null;
        for _ in 0..400 {
            let (_, r) = call(&app, "GET", &format!("/api/runs/{}", run_id), None).await;
            if r["status"] != "running" {
                run = r;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(run["status"], "completed", "{}", run);

        let (status, body) = call(
            &app,
            "POST",
            "/api/predictions/batch",
            Some(json!({
                "model_ids": [id],
                "stock_ids": [1, 2],
                "as_of": "2024-01-25T00:00:00Z",
                "horizon": 3
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requested"], 2);
        assert_eq!(body["succeeded"], 1);

        let (status, body) = call(
            &app,
            "GET",
            &format!(
                "/api/comparison?stock_id=1&model_ids={}&start=2024-01-01T00:00:00Z&end=2024-02-01T00:00:00Z",
                id
            ),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sharpe_convention"].as_str().unwrap().starts_with("directional"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "POST", "/api/runs/77/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
}
