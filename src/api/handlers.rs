//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use tracing::{error, info, warn};
use utoipa::OpenApi;
use validator::Validate;

use crate::app::AppState;
use crate::domain::{
    AppError, ErrorDetail, ErrorResponse, GatewayError, HealthResponse, HealthStatus,
    InitiatePaymentRequest, PaginatedResponse, PaginationParams, RateLimitResponse,
    ReconcileRequest, ReconciliationOutcome, StoreError, Transaction, TransactionStatusResponse,
    ValidationError, WebhookEvent,
};

/// Header carrying the hex-encoded HMAC of the raw webhook body
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Payment Reconciler API",
        version = "0.1.0",
        description = "Reconciles payment gateway events against verified charge state and triggers business side effects exactly once",
        contact(
            name = "API Support",
            email = "support@example.com"
        ),
        license(
            name = "MIT"
        )
    ),
    paths(
        initiate_payment_handler,
        list_transactions_handler,
        get_transaction_status_handler,
        reconcile_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            Transaction,
            crate::domain::TransactionStatus,
            crate::domain::SideEffectAction,
            crate::domain::Disposition,
            InitiatePaymentRequest,
            ReconcileRequest,
            ReconciliationOutcome,
            TransactionStatusResponse,
            WebhookEvent,
            crate::domain::WebhookEventData,
            PaginationParams,
            PaginatedResponse<Transaction>,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
        )
    ),
    tags(
        (name = "transactions", description = "Payment transaction endpoints"),
        (name = "reconciliation", description = "Webhook ingestion and manual reconciliation"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Initiate a payment
///
/// Creates the `initiated` transaction row and assigns the reference its
/// deterministic idempotency token. The reference must be unique; replays
/// return `409`.
#[utoipa::path(
    post,
    path = "/transactions",
    tag = "transactions",
    request_body = InitiatePaymentRequest,
    responses(
        (status = 201, description = "Transaction created in 'initiated' status", body = Transaction),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Reference already exists", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn initiate_payment_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<Transaction>), AppError> {
    payload
        .validate()
        .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
    let tx = state.engine.initiate(&payload).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

/// List transactions with pagination
#[utoipa::path(
    get,
    path = "/transactions",
    tag = "transactions",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum number of transactions to return (1-100, default: 20)"),
        ("cursor" = Option<String>, Query, description = "Cursor for pagination (reference to start after)")
    ),
    responses(
        (status = 200, description = "List of transactions", body = PaginatedResponse<Transaction>),
        (status = 400, description = "Invalid pagination parameters", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_transactions_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<PaginatedResponse<Transaction>>, AppError> {
    // Validate limit
    let limit = params.limit.clamp(1, 100);
    let transactions = state
        .engine
        .list_transactions(limit, params.cursor.as_deref())
        .await?;
    Ok(Json(transactions))
}

/// Get the reconciliation status of a transaction
#[utoipa::path(
    get,
    path = "/transactions/{reference}/status",
    tag = "transactions",
    params(
        ("reference" = String, Path, description = "Merchant payment reference")
    ),
    responses(
        (status = 200, description = "Current status projection", body = TransactionStatusResponse),
        (status = 404, description = "Unknown reference", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_transaction_status_handler(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<Json<TransactionStatusResponse>, AppError> {
    let tx = state
        .engine
        .get_transaction(&reference)
        .await?
        .ok_or(AppError::Store(StoreError::NotFound(reference)))?;
    Ok(Json(TransactionStatusResponse::from(&tx)))
}

/// Manually reconcile a transaction
///
/// Runs the same verification and state-machine step a webhook would, on
/// demand. Used by support tooling when a webhook was missed. Accepts either
/// the merchant reference or the gateway transaction id.
#[utoipa::path(
    post,
    path = "/reconcile",
    tag = "reconciliation",
    request_body = ReconcileRequest,
    responses(
        (status = 200, description = "Reconciliation ran; disposition reports what changed", body = ReconciliationOutcome),
        (status = 400, description = "Neither lookup key provided", body = ErrorResponse),
        (status = 404, description = "Unknown reference or transaction id", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 502, description = "Gateway verification unavailable", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReconcileRequest>,
) -> Result<Json<ReconciliationOutcome>, AppError> {
    let outcome = match (&payload.reference, &payload.gateway_transaction_id) {
        (Some(reference), _) => state.engine.reconcile(reference).await?,
        (None, Some(id)) => state.engine.reconcile_by_transaction_id(id).await?,
        (None, None) => {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "reference".to_string(),
                message: "Provide a reference or a gateway_transaction_id".to_string(),
            }));
        }
    };

    info!(
        reference = %outcome.transaction.reference,
        status = %outcome.transaction.status,
        disposition = ?outcome.disposition,
        "Manual reconciliation completed"
    );

    Ok(Json(outcome))
}

/// Handle a payment gateway webhook
///
/// Verifies the HMAC signature over the raw request bytes before the body is
/// parsed, then feeds the event to the reconciliation engine. The claimed
/// status in the payload is never trusted; it only prompts an authoritative
/// verification call.
///
/// Responds `200` for every processed event, including duplicates absorbed
/// as no-ops, so the gateway stops redelivering. A `5xx` is returned only
/// when verification itself was unavailable, which does invite redelivery.
pub async fn gateway_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ReconciliationOutcome>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    if !state.signature_verifier.verify(&body, signature) {
        warn!("Webhook rejected: signature verification failed");
        return Err(AppError::InvalidSignature);
    }

    // Parse only after the bytes are authenticated
    let event: WebhookEvent = serde_json::from_slice(&body).map_err(|e| {
        AppError::Validation(ValidationError::InvalidField {
            field: "body".to_string(),
            message: format!("Malformed webhook payload: {}", e),
        })
    })?;

    let outcome = state.engine.handle_event(&event).await?;

    info!(
        reference = %outcome.transaction.reference,
        status = %outcome.transaction.status,
        disposition = ?outcome.disposition,
        "Webhook processed"
    );

    Ok(Json(outcome))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.engine.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.engine.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Store(store_err) => match store_err {
                StoreError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_error",
                    self.to_string(),
                ),
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
                StoreError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate", self.to_string()),
                StoreError::VersionConflict { .. } => {
                    (StatusCode::CONFLICT, "version_conflict", self.to_string())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_error",
                    self.to_string(),
                ),
            },
            AppError::Gateway(gw_err) => match gw_err {
                GatewayError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                // Unavailable, Auth and Malformed all mean the gateway could
                // not authoritatively answer; the caller should redeliver.
                _ => (StatusCode::BAD_GATEWAY, "gateway_error", self.to_string()),
            },
            AppError::Delivery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "delivery_error",
                self.to_string(),
            ),
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::InvalidSignature => (
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                self.to_string(),
            ),
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Rate limit exceeded".to_string(),
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
