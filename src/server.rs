//! Web server module for logbill.
//!
//! HTTP ingestion endpoints sharing the wire listeners' batch contract, the
//! administration calls that invalidate the billing index, and health probes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::billing::{BillingEngine, DEFAULT_SNAPSHOT_LIMIT, UnmatchedItem};
use crate::ingest::{BatchOutcome, BatchProcessor, IngestError, RawEvent, Transport};
use crate::metrics::{MetricsBatch, decode_metrics_body};
use crate::ratelimit::{DualRateLimiter, rate_limit_layer};
use crate::storage::{
    BillingStore, IngestStore, MetricsRecord, MetricsStore, NewBillingConfig, ProjectType,
    StorageError,
};

/// Largest accepted batch on the batch endpoints.
pub const MAX_HTTP_BATCH: usize = 100;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BillingEngine>,
    pub ingest: IngestStore,
    pub billing: BillingStore,
    pub metrics: MetricsStore,
    pub limiter: Arc<DualRateLimiter>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

// =============================================================================
// Errors
// =============================================================================

/// Error response rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidData(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Storage(inner) => inner.into(),
            IngestError::Malformed(msg) => Self::bad_request(msg),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /api/v1/logs/batch`.
#[derive(Debug, Deserialize)]
pub struct LogBatchRequest {
    pub logs: Vec<RawEvent>,
}

/// Result of a batch ingestion call.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: usize,
    pub failed: usize,
    pub ids: Vec<i64>,
}

impl From<BatchOutcome> for BatchResponse {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            success: outcome.succeeded,
            failed: outcome.failed,
            ids: outcome.inserted_ids,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct UnmatchedParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct UnmatchedResponse {
    items: Vec<UnmatchedItem>,
    total: usize,
    capacity: usize,
}

/// Body of `PUT /api/v1/tags/{name}/project`. `null` detaches the tag.
#[derive(Debug, Deserialize)]
pub struct TagProjectRequest {
    pub project: Option<String>,
}

/// Body of `POST /api/v1/projects`.
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(rename = "type", default)]
    pub project_type: ProjectType,
    #[serde(default)]
    pub description: String,
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let limiter = Arc::clone(&state.limiter);
    let app_state = Arc::new(state);

    let api = Router::new()
        .route("/api/v1/logs", post(receive_log_handler))
        .route("/api/v1/logs/batch", post(receive_log_batch_handler))
        .route(
            "/api/v1/metrics",
            get(list_metrics_handler).post(receive_metrics_handler),
        )
        .route("/api/v1/metrics/batch", post(receive_metrics_batch_handler))
        .route("/api/v1/billing/unmatched", get(unmatched_handler))
        .route("/api/v1/billing/configs", post(create_config_handler))
        .route(
            "/api/v1/billing/configs/{id}",
            put(update_config_handler).delete(delete_config_handler),
        )
        .route("/api/v1/tags/{name}/project", put(assign_tag_project_handler))
        .route(
            "/api/v1/projects",
            get(list_projects_handler).post(create_project_handler),
        )
        .route("/api/v1/projects/{id}", delete(delete_project_handler))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_layer));

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .merge(api)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// =============================================================================
// Probes
// =============================================================================

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks SQLite availability.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.ingest.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Ingestion
// =============================================================================

/// Receive one log event.
async fn receive_log_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RawEvent>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(event) = payload?;
    if !event.is_valid() {
        return Err(ApiError::bad_request(
            "timestamp and log_line are required",
        ));
    }

    let outcome = state
        .engine
        .process_batch(vec![event.with_transport(Transport::Http)])
        .await?;
    Ok(Json(json!({
        "success": outcome.succeeded > 0,
        "id": outcome.inserted_ids.first(),
    })))
}

/// Receive up to [`MAX_HTTP_BATCH`] log events.
async fn receive_log_batch_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LogBatchRequest>, JsonRejection>,
) -> ApiResult<Json<BatchResponse>> {
    let Json(request) = payload?;
    check_batch_len(request.logs.len())?;

    let events = request
        .logs
        .into_iter()
        .map(|e| e.with_transport(Transport::Http))
        .collect();
    let outcome = state.engine.process_batch(events).await?;
    Ok(Json(outcome.into()))
}

/// Receive a metric report or an array of metric points.
async fn receive_metrics_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload?;
    let records = decode_metrics_body(body)?;
    let ids = state.metrics.insert_batch(&records).await?;
    Ok(Json(json!({ "success": true, "ids": ids })))
}

/// Stored reports for one tag, oldest first.
async fn list_metrics_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<MetricsQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(params) = params?;
    let metrics = state.metrics.list_by_tag(&params.tag).await?;
    Ok(Json(json!({ "metrics": metrics })))
}

/// Receive up to [`MAX_HTTP_BATCH`] metric reports.
async fn receive_metrics_batch_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MetricsBatch>, JsonRejection>,
) -> ApiResult<Json<BatchResponse>> {
    let Json(request) = payload?;
    check_batch_len(request.metrics.len())?;

    let records: Vec<MetricsRecord> = request.metrics.into_iter().map(Into::into).collect();
    let ids = state.metrics.insert_batch(&records).await?;
    Ok(Json(BatchResponse {
        success: ids.len(),
        failed: 0,
        ids,
    }))
}

fn check_batch_len(len: usize) -> ApiResult<()> {
    if len == 0 {
        return Err(ApiError::bad_request("batch is empty"));
    }
    if len > MAX_HTTP_BATCH {
        return Err(ApiError::bad_request(format!(
            "batch of {len} exceeds the limit of {MAX_HTTP_BATCH}"
        )));
    }
    Ok(())
}

// =============================================================================
// Billing Administration
// =============================================================================

/// Most recently touched unmatched classifications.
async fn unmatched_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<UnmatchedParams>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(params) = params?;
    let ring = state.engine.unmatched();
    let limit = params.limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT);
    let response = UnmatchedResponse {
        items: ring.snapshot(limit),
        total: ring.len(),
        capacity: ring.capacity(),
    };
    Ok(Json(json!(response)))
}

async fn create_config_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewBillingConfig>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(config) = payload?;
    let record = state.billing.create_config(&config).await?;
    state.engine.index().invalidate();
    tracing::info!(id = record.id, bill_key = %record.bill_key, "Billing config created");
    Ok((StatusCode::CREATED, Json(json!(record))))
}

async fn update_config_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<NewBillingConfig>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(config) = payload?;
    let record = state.billing.update_config(id, &config).await?;
    state.engine.index().invalidate();
    Ok(Json(json!(record)))
}

async fn delete_config_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if !state.billing.delete_config(id).await? {
        return Err(ApiError::not_found(format!("billing config {id} not found")));
    }
    state.engine.index().invalidate();
    tracing::info!(id, "Billing config deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Move a tag into a project, or out of every project.
async fn assign_tag_project_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<TagProjectRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    state
        .billing
        .assign_tag_project(&name, request.project.as_deref())
        .await?;
    state.engine.index().invalidate();
    Ok(Json(json!({ "success": true })))
}

async fn list_projects_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let projects = state.billing.list_projects().await?;
    Ok(Json(json!({ "projects": projects })))
}

async fn create_project_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateProjectRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(request) = payload?;
    let project = state
        .billing
        .create_project(&request.name, request.project_type, &request.description)
        .await?;
    Ok((StatusCode::CREATED, Json(json!(project))))
}

async fn delete_project_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.billing.delete_project(id).await?;
    state.engine.index().invalidate();
    Ok(StatusCode::NO_CONTENT)
}
