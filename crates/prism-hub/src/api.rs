//! # API Handlers
//!
//! Axum handlers for queries, plans, executions, sources and the cache.
//! Every error leaves as `{ kind, message, execution_id? }` with a status
//! derived from its kind.

use crate::cache::CacheStats;
use crate::executor::ExecutionFailure;
use crate::service::QueryResponse;
use crate::sources::webhook::IngestOutcome;
use crate::store::ExecutionSummary;
use crate::AppState;
use axum::{
    extract::{FromRequest, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prism_core::{DataSourceInfo, QueryError, QueryExecution, QueryPlan, QueryRequest, SourceType};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
                execution_id: None,
            },
        }
    }
}

pub fn status_for(err: &QueryError) -> StatusCode {
    match err {
        QueryError::InvalidRequest(_) | QueryError::CyclicPlan { .. } => StatusCode::BAD_REQUEST,
        QueryError::UnknownDataSource(_) => StatusCode::NOT_FOUND,
        QueryError::AllSourcesFailed { .. } | QueryError::InsufficientSources { .. } => {
            StatusCode::BAD_GATEWAY
        }
        QueryError::NodeExecutionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl From<ExecutionFailure> for ApiError {
    fn from(failure: ExecutionFailure) -> Self {
        Self {
            status: status_for(&failure.error),
            body: ErrorBody {
                kind: failure.error.kind().to_string(),
                message: failure.error.to_string(),
                execution_id: failure.execution_id,
            },
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ExecutionFailure::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// JSON body extractor whose rejections use the `{ kind, message }` error
/// body instead of axum's plain-text one.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(QueryError::InvalidRequest(rejection.body_text()).into()),
        }
    }
}

// =============================================================================
// Queries & Plans
// =============================================================================

pub async fn submit_query(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let response = state.service.submit(&request).await?;
    Ok(Json(response))
}

pub async fn compile_plan(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<Json<QueryPlan>, ApiError> {
    let plan = state.service.compile(&request)?;
    Ok(Json(plan))
}

pub async fn execute_plan(
    State(state): State<Arc<AppState>>,
    ApiJson(plan): ApiJson<QueryPlan>,
) -> Result<Json<QueryExecution>, ApiError> {
    let execution = state.service.execute_plan(plan).await?;
    Ok(Json(execution.as_ref().clone()))
}

// =============================================================================
// Executions
// =============================================================================

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<ExecutionSummary>> {
    Json(state.store.list(params.limit.unwrap_or(50)).await)
}

pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QueryExecution>, ApiError> {
    let execution = state.store.get(&id).await.ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("execution '{}' not found", id),
        )
    })?;
    Ok(Json(execution.as_ref().clone()))
}

// =============================================================================
// Sources
// =============================================================================

pub async fn list_sources(State(state): State<Arc<AppState>>) -> Json<Vec<DataSourceInfo>> {
    Json(state.registry.list().await)
}

#[derive(Serialize)]
pub struct SourceHealth {
    pub source_type: SourceType,
    pub healthy: bool,
}

pub async fn refresh_source_health(State(state): State<Arc<AppState>>) -> Json<Vec<SourceHealth>> {
    let results = state.registry.refresh_health().await;
    Json(
        results
            .into_iter()
            .map(|(source_type, healthy)| SourceHealth {
                source_type,
                healthy,
            })
            .collect(),
    )
}

#[derive(Deserialize)]
pub struct WebhookParams {
    pub provider: Option<String>,
    pub seller_id: Option<String>,
}

pub async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WebhookParams>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<serde_json::Value>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let normalized_headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|value| (k.as_str().to_string(), value.to_string()))
        })
        .collect();
    let provider = params.provider.as_deref().unwrap_or("generic");

    let outcome = state
        .webhook
        .ingest_payload(
            provider,
            params.seller_id.as_deref(),
            payload,
            &normalized_headers,
        )
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "InvalidPayload", e.to_string()))?;

    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

// =============================================================================
// Cache
// =============================================================================

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn post_json(content_type: Option<&str>, body: &'static str) -> Request {
        let mut builder = Request::builder().method("POST").uri("/api/query");
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn rejection<T: DeserializeOwned>(req: Request) -> ApiError {
        match ApiJson::<T>::from_request(req, &()).await {
            Ok(_) => panic!("body should have been rejected"),
            Err(err) => err,
        }
    }

    #[test]
    fn test_error_kinds_map_to_statuses() {
        assert_eq!(
            status_for(&QueryError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&QueryError::UnknownDataSource(SourceType::Cold)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&QueryError::InsufficientSources {
                succeeded: 1,
                failed: 2,
                required: 2
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&QueryError::Timeout {
                elapsed_ms: 10,
                limit_ms: 5
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_failure_body_carries_execution_id() {
        let err = ApiError::from(ExecutionFailure {
            error: QueryError::NodeExecutionFailed {
                node_id: "n3".into(),
                message: "boom".into(),
            },
            execution_id: Some("exec-1".into()),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_value(&err.body).unwrap();
        assert_eq!(body["kind"], "NodeExecutionFailed");
        assert_eq!(body["execution_id"], "exec-1");
    }

    #[tokio::test]
    async fn test_malformed_query_gets_structured_error() {
        let err = rejection::<QueryRequest>(post_json(
            Some("application/json"),
            r#"{"sellerId": "s1", "window": "#,
        ))
        .await;
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let body = serde_json::to_value(&err.body).unwrap();
        assert_eq!(body["kind"], "InvalidRequest");
        assert!(!body["message"].as_str().unwrap().is_empty());
        assert!(body.get("execution_id").is_none());
    }

    #[tokio::test]
    async fn test_wrongly_typed_field_gets_structured_error() {
        let err = rejection::<QueryRequest>(post_json(
            Some("application/json"),
            r#"{"sellerId": "s1", "sources": ["tape"]}"#,
        ))
        .await;
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.kind, "InvalidRequest");
    }

    #[tokio::test]
    async fn test_missing_content_type_gets_structured_error() {
        let err = rejection::<QueryRequest>(post_json(None, r#"{"sellerId": "s1"}"#)).await;
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.body.kind, "InvalidRequest");
    }

    #[tokio::test]
    async fn test_well_formed_query_is_extracted() {
        let req = post_json(Some("application/json"), r#"{"sellerId": "s1"}"#);
        let ApiJson(request) = match ApiJson::<QueryRequest>::from_request(req, &()).await {
            Ok(extracted) => extracted,
            Err(err) => panic!("unexpected rejection: {}", err.body.message),
        };
        assert_eq!(request.seller_id, "s1");
    }
}
