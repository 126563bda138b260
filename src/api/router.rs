//! Router construction and middleware stack.

use std::any::Any;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::domain::{ErrorDetail, ErrorResponse, RateLimitResponse, TelemetrySink};

use super::handlers::{ApiDoc, chain_ping_handler, ping_handler, proxy_handler, status_handler};

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

const DEFAULT_RPS: u32 = 100;
const DEFAULT_BURST: u32 = 200;

/// Global request rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_RPS,
            burst_size: DEFAULT_BURST,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        use std::env;

        let requests_per_second = env::var("RATE_LIMIT_RPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(DEFAULT_RPS);

        let burst_size = env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(DEFAULT_BURST);

        Self {
            requests_per_second,
            burst_size,
        }
    }

    fn limiter(&self) -> DefaultDirectRateLimiter {
        let rps = NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(self.burst_size).unwrap_or(rps);
        RateLimiter::direct(Quota::per_second(rps).allow_burst(burst))
    }
}

/// Router without the global rate limit
pub fn create_router(state: Arc<AppState>) -> Router {
    let telemetry = Arc::clone(&state.telemetry);
    with_middleware(routes(state), telemetry)
}

/// Router with a global token-bucket rate limit in front of every route
pub fn create_router_with_rate_limit(state: Arc<AppState>, config: RateLimitConfig) -> Router {
    let telemetry = Arc::clone(&state.telemetry);
    let limiter = Arc::new(config.limiter());
    let router = routes(state).layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
    with_middleware(router, telemetry)
}

fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/status", get(status_handler))
        .route("/{chain}/jsonrpc", any(proxy_handler))
        .route("/{chain}/ping", any(chain_ping_handler))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

fn with_middleware(router: Router, telemetry: Arc<dyn TelemetrySink>) -> Router {
    router
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(telemetry.as_ref(), panic),
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Convert a handler panic into a 500 and report it
fn panic_response(
    telemetry: &dyn TelemetrySink,
    panic: Box<dyn Any + Send + 'static>,
) -> Response<Body> {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic".to_string()
    };

    error!(panic = %message, "Request handler panicked");
    telemetry.report_panic(message);

    let body = Json(ErrorResponse {
        error: ErrorDetail {
            r#type: "internal_error".to_string(),
            message: "Internal server error".to_string(),
        },
    });
    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
}

async fn rate_limit_middleware(
    State(limiter): State<Arc<DefaultDirectRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check().is_ok() {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Global rate limit exceeded");
    let body = Json(RateLimitResponse {
        error: ErrorDetail {
            r#type: "rate_limited".to_string(),
            message: "Rate limit exceeded".to_string(),
        },
        retry_after: 1,
    });
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "1")],
        body,
    )
        .into_response()
}
