//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, DeliveryError, GatewayError, StoreError, ValidationError};
pub use traits::{Deliverer, GatewayClient, TransactionStore};
pub use types::{
    DeliveryReceipt, Disposition, ErrorDetail, ErrorResponse, GatewayStatus, HealthResponse,
    HealthStatus, InitiatePaymentRequest, PaginatedResponse, PaginationParams, RateLimitResponse,
    ReconcileRequest, ReconciliationOutcome, SideEffectAction, Transaction, TransactionMutation,
    TransactionStatus, TransactionStatusResponse, VerificationResult, WebhookEvent,
    WebhookEventData, idempotency_token_for,
};
