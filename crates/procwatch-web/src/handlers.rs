//! HTTP request handlers and the router.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use procwatch_core::query::{MetricPoint, QueryError};
use procwatch_core::storage::StoreError;
use procwatch_core::watch::WatchState;

use crate::openapi::ApiDoc;
use crate::state::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/pids", get(handle_pids))
        .route("/api/v1/metrics", get(handle_metrics))
        .route("/api/v1/watch", get(handle_watch))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

// ============================================================
// Errors
// ============================================================

#[derive(Serialize, utoipa::ToSchema)]
pub(crate) struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        if let QueryError::Store(e) = err {
            return e.into();
        }
        ApiError::BadRequest(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store read failed");
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Pids
// ============================================================

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct PidInfo {
    pid: u32,
    name: String,
    samples: usize,
    /// Timestamp of the most recent sample, epoch milliseconds.
    latest_epoch_ms: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/pids",
    responses(
        (status = 200, description = "Watched pids with sample counts", body = Vec<PidInfo>),
        (status = 500, description = "Store failure", body = ErrorBody)
    )
)]
pub(crate) async fn handle_pids(
    State(state): State<AppState>,
) -> Result<Json<Vec<PidInfo>>, ApiError> {
    let store = state.store;
    let pids = tokio::task::spawn_blocking(move || -> Result<Vec<PidInfo>, StoreError> {
        let mut pids = Vec::new();
        for (pid, samples) in store.pids()? {
            if let Some(latest) = store.latest(pid)? {
                pids.push(PidInfo {
                    pid,
                    name: latest.name.clone(),
                    samples,
                    latest_epoch_ms: latest.epoch_ms(),
                });
            }
        }
        Ok(pids)
    })
    .await
    .map_err(|e| {
        warn!(error = %e, "pids task failed");
        ApiError::Internal(e.to_string())
    })??;
    Ok(Json(pids))
}

// ============================================================
// Metrics
// ============================================================

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub(crate) struct MetricsQuery {
    /// Process id.
    pid: u32,
    /// Range start, epoch milliseconds (inclusive). Defaults to 5 minutes ago.
    start_ts: Option<i64>,
    /// Range end, epoch milliseconds (exclusive). Unbounded when omitted.
    end_ts: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    params(MetricsQuery),
    responses(
        (status = 200, description = "Derived samples, ascending by time", body = Vec<MetricPoint>),
        (status = 400, description = "Invalid range or timestamp", body = ErrorBody),
        (status = 500, description = "Store failure", body = ErrorBody)
    )
)]
pub(crate) async fn handle_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<MetricPoint>>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let points = tokio::task::spawn_blocking(move || {
        engine.metrics(query.pid, query.start_ts, query.end_ts)
    })
    .await
    .map_err(|e| {
        warn!(error = %e, "query task failed");
        ApiError::Internal(e.to_string())
    })??;
    Ok(Json(points))
}

// ============================================================
// Watch
// ============================================================

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct WatchStatus {
    pid: u32,
    state: WatchState,
}

#[utoipa::path(
    get,
    path = "/api/v1/watch",
    responses(
        (status = 200, description = "State of the in-process watch", body = WatchStatus),
        (status = 404, description = "Server was started without --pid", body = ErrorBody)
    )
)]
pub(crate) async fn handle_watch(
    State(state): State<AppState>,
) -> Result<Json<WatchStatus>, ApiError> {
    let watch = state
        .watch
        .ok_or_else(|| ApiError::NotFound("no process is being watched".to_string()))?;
    let current = *watch.state.borrow();
    Ok(Json(WatchStatus {
        pid: watch.pid,
        state: current,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use procwatch_core::config::QueryConfig;
    use procwatch_core::query::QueryEngine;
    use procwatch_core::storage::{Snapshot, Store};
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn sample(ms: i64, utime: u64) -> Snapshot {
        Snapshot {
            name: "worker".to_string(),
            pid: 4242,
            timestamp: DateTime::<Utc>::from_timestamp_millis(ms).unwrap(),
            utime_microseconds: utime,
            num_threads: 4,
            ..Snapshot::default()
        }
    }

    fn app() -> AppState {
        let store = Arc::new(Store::in_memory());
        for (ms, utime) in [(0, 0), (1000, 300_000), (2000, 900_000)] {
            store.insert(sample(ms, utime)).unwrap();
        }
        let engine = QueryEngine::new(Arc::clone(&store), QueryConfig::default());
        AppState::new(store, engine)
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(app(), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_metrics_range() {
        let (status, body) = get(app(), "/api/v1/metrics?pid=4242&start_ts=500&end_ts=2500").await;
        assert_eq!(status, StatusCode::OK);

        let points: Vec<MetricPoint> = serde_json::from_slice(&body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].epoch_ms, 1000);
        assert_eq!(points[0].utime_pct, 30.0);
        assert_eq!(points[1].epoch_ms, 2000);
        assert_eq!(points[1].utime_pct, 60.0);
        assert_eq!(points[1].num_threads, 4);
    }

    #[tokio::test]
    async fn test_metrics_unknown_pid_is_empty() {
        let (status, body) = get(app(), "/api/v1/metrics?pid=1&start_ts=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn test_metrics_end_before_start_is_bad_request() {
        let (status, body) = get(app(), "/api/v1/metrics?pid=4242&start_ts=2000&end_ts=1000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(err["error"].as_str().unwrap().contains("invalid time range"));
    }

    #[tokio::test]
    async fn test_metrics_parameter_validation() {
        let (status, _) = get(app(), "/api/v1/metrics").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app(), "/api/v1/metrics?pid=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app(), &format!("/api/v1/metrics?pid=4242&start_ts={}", i64::MAX)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pids() {
        let (status, body) = get(app(), "/api/v1/pids").await;
        assert_eq!(status, StatusCode::OK);

        let pids: Vec<PidInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(pids.len(), 1);
        assert_eq!(pids[0].pid, 4242);
        assert_eq!(pids[0].name, "worker");
        assert_eq!(pids[0].samples, 3);
        assert_eq!(pids[0].latest_epoch_ms, 2000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pids_with_concurrent_writer() {
        let state = app();
        let store = Arc::clone(&state.store);
        let writer = std::thread::spawn(move || {
            for i in 0..200 {
                store.insert(sample(3000 + i * 1000, 1_000_000)).unwrap();
            }
        });

        let mut last = 0;
        for _ in 0..20 {
            let (status, body) = get(state.clone(), "/api/v1/pids").await;
            assert_eq!(status, StatusCode::OK);
            let pids: Vec<PidInfo> = serde_json::from_slice(&body).unwrap();
            assert!(pids[0].samples >= last);
            last = pids[0].samples;
        }
        writer.join().unwrap();

        let (_, body) = get(state, "/api/v1/pids").await;
        let pids: Vec<PidInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(pids[0].samples, 203);
    }

    #[tokio::test]
    async fn test_watch_status() {
        let (status, _) = get(app(), "/api/v1/watch").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (tx, rx) = watch::channel(WatchState::Running);
        let state = app().with_watch(4242, rx);
        let (status, body) = get(state.clone(), "/api/v1/watch").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["pid"], 4242);
        assert_eq!(json["state"], "running");

        tx.send_replace(WatchState::Terminated);
        let (_, body) = get(state, "/api/v1/watch").await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["state"], "terminated");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_metrics() {
        let (status, body) = get(app(), "/api-docs/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(doc["paths"]["/api/v1/metrics"].is_object());
    }
}
