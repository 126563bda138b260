//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::error;
use utoipa::OpenApi;

use crate::app::{AppState, CallerParams};
use crate::domain::{
    AppError, ChainStatus, DataSource, ErrorDetail, ErrorResponse, ExternalServiceError,
    NodeStatus, PingResponse, RateLimitResponse, StatusResponse, UpstreamError,
};
use crate::infra::proxy::{
    ACCESS_ID_HEADER, ACCESS_ID_PARAM, DATA_SOURCE_HEADER, DATA_SOURCE_PARAM,
};
use crate::infra::{OutboundRequest, into_axum_response};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "RPC Balancer API",
        version = "0.1.0",
        description = "Sticky, health-aware JSON-RPC load balancer for blockchain node fleets",
        license(
            name = "MIT"
        )
    ),
    paths(
        ping_handler,
        status_handler,
        proxy_handler,
        chain_ping_handler,
    ),
    components(
        schemas(
            PingResponse,
            StatusResponse,
            ChainStatus,
            NodeStatus,
            DataSource,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "health", description = "Balancer liveness and fleet status"),
        (name = "proxy", description = "Proxied JSON-RPC endpoints")
    )
)]
pub struct ApiDoc;

/// Balancer liveness
#[utoipa::path(
    get,
    path = "/ping",
    tag = "health",
    responses(
        (status = 200, description = "Balancer is up", body = PingResponse)
    )
)]
pub async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse::ok())
}

/// Node fleet and cache status
#[utoipa::path(
    get,
    path = "/status",
    tag = "health",
    responses(
        (status = 200, description = "Per-chain node liveness, heights and cache sizes", body = StatusResponse)
    )
)]
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.service.status())
}

/// Proxy a JSON-RPC request to a node of `chain`
///
/// The caller is identified by the `access_id` query parameter or the
/// `x-access-id` header; `data_source` / `x-data-source` select the routing
/// mode. Query parameters win over headers. Both are removed before the
/// request reaches the node. Batched bodies are checked call by call.
#[utoipa::path(
    post,
    path = "/{chain}/jsonrpc",
    tag = "proxy",
    params(
        ("chain" = String, Path, description = "Chain name"),
        ("access_id" = Option<String>, Query, description = "Caller access identifier"),
        ("data_source" = Option<DataSource>, Query, description = "blockchain (default) or database")
    ),
    request_body(
        content = Object,
        content_type = "application/json",
        description = "JSON-RPC call or batch"
    ),
    responses(
        (status = 200, description = "Upstream node response, passed through"),
        (status = 400, description = "Unknown chain or malformed JSON-RPC body", body = ErrorResponse),
        (status = 401, description = "Missing access id", body = ErrorResponse),
        (status = 403, description = "Access denied or method not allowed", body = ErrorResponse),
        (status = 429, description = "Quota or rate limit exceeded", body = ErrorResponse),
        (status = 501, description = "Data source under development", body = ErrorResponse),
        (status = 503, description = "No node available", body = ErrorResponse)
    )
)]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let caller = caller_params(&query, &headers);
    let request = OutboundRequest::from_inbound(method, &query, &headers, body);
    let upstream = state
        .service
        .route(&chain, &caller, &request, uri.path())
        .await?;
    Ok(into_axum_response(upstream))
}

/// Lightweight status check of a node of `chain`
///
/// Needs the same caller identity as the JSON-RPC endpoint but is not
/// charged to the caller's quota. The node receives an `eth_blockNumber`
/// call; any request body is ignored.
#[utoipa::path(
    get,
    path = "/{chain}/ping",
    tag = "proxy",
    params(
        ("chain" = String, Path, description = "Chain name"),
        ("access_id" = Option<String>, Query, description = "Caller access identifier")
    ),
    responses(
        (status = 200, description = "Upstream node answer to eth_blockNumber"),
        (status = 401, description = "Missing access id", body = ErrorResponse),
        (status = 403, description = "Access denied", body = ErrorResponse),
        (status = 503, description = "No node available", body = ErrorResponse)
    )
)]
pub async fn chain_ping_handler(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = caller_params(&query, &headers);
    let upstream = state.service.ping(&chain, &caller, uri.path()).await?;
    Ok(into_axum_response(upstream))
}

/// Query parameters take precedence over headers
fn caller_params(query: &[(String, String)], headers: &HeaderMap) -> CallerParams {
    let lookup = |param: &str, header: &str| {
        query
            .iter()
            .find(|(key, _)| key == param)
            .map(|(_, value)| value.clone())
            .or_else(|| {
                headers
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
    };

    CallerParams {
        access_id: lookup(ACCESS_ID_PARAM, ACCESS_ID_HEADER),
        data_source: lookup(DATA_SOURCE_PARAM, DATA_SOURCE_HEADER),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Upstream(upstream) => match upstream {
                UpstreamError::NoAvailableNode(_) | UpstreamError::AttemptsExhausted { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no_available_node",
                    self.to_string(),
                ),
                UpstreamError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (StatusCode::BAD_GATEWAY, "upstream_error", self.to_string()),
            },
            AppError::ExternalService(ext_err) => match ext_err {
                ExternalServiceError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                _ => (
                    StatusCode::BAD_GATEWAY,
                    "external_service_error",
                    self.to_string(),
                ),
            },
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::Authorization(_) => (
                StatusCode::FORBIDDEN,
                "authorization_error",
                self.to_string(),
            ),
            AppError::QuotaExceeded(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exceeded",
                self.to_string(),
            ),
            AppError::NotSupported(_) => (
                StatusCode::NOT_IMPLEMENTED,
                "not_supported",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConfigError, ValidationError};
    use axum::http::HeaderValue;

    #[test]
    fn test_query_wins_over_header() {
        let query = vec![
            ("access_id".to_string(), "from-query".to_string()),
            ("foo".to_string(), "bar".to_string()),
        ];
        let mut headers = HeaderMap::new();
        headers.insert("x-access-id", HeaderValue::from_static("from-header"));
        headers.insert("x-data-source", HeaderValue::from_static("database"));

        let caller = caller_params(&query, &headers);
        assert_eq!(caller.access_id.as_deref(), Some("from-query"));
        assert_eq!(caller.data_source.as_deref(), Some("database"));

        let caller = caller_params(&[], &HeaderMap::new());
        assert!(caller.access_id.is_none());
    }

    #[test]
    fn test_openapi_documents_proxy_routes() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let jsonrpc = &doc["paths"]["/{chain}/jsonrpc"]["post"];
        assert!(jsonrpc["requestBody"]["content"]["application/json"].is_object());
        assert!(doc["paths"]["/{chain}/ping"]["get"].is_object());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                AppError::Validation(ValidationError::UnknownChain("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (AppError::Authentication("x".into()), StatusCode::UNAUTHORIZED),
            (AppError::Authorization("x".into()), StatusCode::FORBIDDEN),
            (AppError::QuotaExceeded("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (AppError::NotSupported("x".into()), StatusCode::NOT_IMPLEMENTED),
            (
                AppError::Upstream(UpstreamError::NoAvailableNode("x".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Upstream(UpstreamError::AttemptsExhausted {
                    chain: "x".into(),
                    attempts: 3,
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::ExternalService(ExternalServiceError::Network("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                AppError::Config(ConfigError::EmptyNodeList),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
