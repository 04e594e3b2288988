//! HTTP API endpoints

use crate::protocol::{PushRequest, QueryRequest, QueryResponse};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use ingester_core::{Ingester, IngesterError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Header carrying the tenant id
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Application state
pub type AppState = Arc<Ingester>;

/// Create the API router
pub fn create_router(ingester: Arc<Ingester>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Ingest and read
        .route("/api/v1/push", post(push))
        .route("/api/v1/query", post(query))
        .route("/api/v1/label/:name/values", get(label_values))
        // Operations
        .route("/flush", post(flush))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(ingester)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct LabelValuesResponse {
    pub values: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub chunks_flushed: usize,
    pub failed_tenants: Vec<String>,
}

/// Core error rendered as a JSON body with a matching status
pub struct ApiError(IngesterError);

impl From<IngesterError> for ApiError {
    fn from(e: IngesterError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IngesterError::NoTenant => StatusCode::UNAUTHORIZED,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            IngesterError::Stopped | IngesterError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

fn tenant(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(ApiError(IngesterError::NoTenant))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: ingester_core::VERSION.to_string(),
    })
}

async fn ready(State(ingester): State<AppState>) -> StatusCode {
    if ingester.is_stopped() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn push(
    State(ingester): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PushRequest>,
) -> Result<StatusCode, ApiError> {
    let tenant = tenant(&headers)?;
    ingester.append(&tenant, &req.into_samples())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query(
    State(ingester): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let tenant = tenant(&headers)?;
    let matchers = req.matchers()?;
    let streams = ingester.query(&tenant, req.from, req.through, &matchers)?;
    Ok(Json(QueryResponse::from_streams(streams)))
}

async fn label_values(
    State(ingester): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<LabelValuesResponse>, ApiError> {
    let tenant = tenant(&headers)?;
    let values = ingester.label_values(&tenant, &name)?;
    Ok(Json(LabelValuesResponse { values }))
}

async fn flush(State(ingester): State<AppState>) -> Json<FlushResponse> {
    let report = ingester.flush().await;
    Json(FlushResponse {
        chunks_flushed: report.chunks_flushed,
        failed_tenants: report.failed_tenants,
    })
}

async fn metrics(State(ingester): State<AppState>) -> String {
    let stats = ingester.stats();

    // Prometheus format
    let gauges = [
        ("ingester_tenants", "Tenants with buffered series", "gauge", stats.tenants as u64),
        ("ingester_memory_series", "Series held in memory", "gauge", stats.series as u64),
        ("ingester_open_chunks", "Chunks still accepting samples", "gauge", stats.open_chunks as u64),
        ("ingester_open_samples", "Samples in open chunks", "gauge", stats.open_samples as u64),
        ("ingester_pending_chunks", "Closed chunks not yet accepted by the store", "gauge", stats.pending_chunks as u64),
        ("ingester_flushed_chunks_total", "Chunks accepted by the store", "counter", stats.flushed_chunks),
        ("ingester_failed_puts_total", "Failed store writes", "counter", stats.failed_puts),
        ("ingester_flush_sweeps_total", "Flush sweeps run", "counter", stats.sweeps),
    ];

    let mut output = String::new();
    for (name, help, kind, value) in gauges {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
        output.push_str(&format!("{} {}\n", name, value));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ingester_core::store::MemoryChunkStore;
    use ingester_core::IngesterConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let ingester = Ingester::new(IngesterConfig::default(), Arc::new(MemoryChunkStore::new())).unwrap();
        create_router(Arc::new(ingester))
    }

    fn post_json(uri: &str, tenant: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const PUSH: &str = r#"{"timeseries":[{"labels":{"__name__":"up","job":"api"},
        "samples":[{"timestamp":1,"value":1},{"timestamp":2,"value":2}]}]}"#;

    #[tokio::test]
    async fn test_push_then_query() {
        let app = app();

        let response = app.clone().oneshot(post_json("/api/v1/push", Some("1"), PUSH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let query = r#"{"from":0,"through":10,"matchers":[{"type":"=","name":"job","value":"api"}]}"#;
        let response = app.clone().oneshot(post_json("/api/v1/query", Some("1"), query)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["series"][0]["labels"]["job"], "api");
        assert_eq!(body["series"][0]["samples"].as_array().unwrap().len(), 2);

        let response = app.oneshot(post_json("/api/v1/query", Some("2"), query)).await.unwrap();
        assert_eq!(body_json(response).await["series"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();

        let response = app.clone().oneshot(post_json("/api/v1/push", None, PUSH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        app.clone().oneshot(post_json("/api/v1/push", Some("1"), PUSH)).await.unwrap();
        let response = app.clone().oneshot(post_json("/api/v1/push", Some("1"), PUSH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let query = r#"{"from":0,"through":10,"matchers":[{"type":"=~","name":"job","value":"("}]}"#;
        let response = app.oneshot(post_json("/api/v1/query", Some("1"), query)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_label_values_and_metrics() {
        let app = app();
        app.clone().oneshot(post_json("/api/v1/push", Some("1"), PUSH)).await.unwrap();

        let request = Request::builder()
            .uri("/api/v1/label/job/values")
            .header(TENANT_HEADER, "1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(body_json(response).await["values"][0], "api");

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("ingester_memory_series 1"));
        assert!(text.contains("ingester_open_samples 2"));
    }
}
