//! Route table and middleware assembly.

use std::env;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;
use crate::domain::{ErrorDetail, RateLimitResponse};

use super::handlers::{
    ApiDoc, gateway_webhook_handler, get_transaction_status_handler, health_check_handler,
    initiate_payment_handler, list_transactions_handler, liveness_handler, readiness_handler,
    reconcile_handler,
};

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second across all clients
    pub requests_per_second: u32,
    /// Burst capacity above the sustained rate
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst_size: 100,
        }
    }
}

impl RateLimitConfig {
    /// Read the rate limit settings from the environment, falling back to
    /// the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let requests_per_second = env::var("RATE_LIMIT_RPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.requests_per_second);
        let burst_size = env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.burst_size);
        Self {
            requests_per_second,
            burst_size,
        }
    }
}

type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

async fn rate_limit_middleware(
    State(limiter): State<Arc<GlobalLimiter>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if limiter.check().is_err() {
        let body = Json(RateLimitResponse {
            error: ErrorDetail {
                r#type: "rate_limited".to_string(),
                message: "Rate limit exceeded".to_string(),
            },
            retry_after: 1,
        });
        return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    }
    next.run(request).await
}

fn base_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/transactions", post(initiate_payment_handler))
        .route("/transactions", get(list_transactions_handler))
        .route(
            "/transactions/{reference}/status",
            get(get_transaction_status_handler),
        )
        .route("/reconcile", post(reconcile_handler))
        .route("/webhooks/gateway", post(gateway_webhook_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    base_router(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}

/// Create the application router with global rate limiting
pub fn create_router_with_rate_limit(state: Arc<AppState>, config: RateLimitConfig) -> Router {
    let rps = NonZeroU32::new(config.requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst_size.max(1)).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::per_second(rps).allow_burst(burst);
    let limiter: Arc<GlobalLimiter> = Arc::new(RateLimiter::direct(quota));

    base_router(state)
        .layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}
