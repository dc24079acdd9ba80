//! Domain types with validation support.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;
use validator::Validate;

/// Lifecycle status of a payment transaction.
///
/// Transitions only move forward along the reconciliation table; `delivered`,
/// `rejected` and `expired` are terminal. `delivery_failed` is recoverable via
/// a manual or scheduled re-trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created at payment initiation, no gateway activity observed yet
    #[default]
    Initiated,
    /// A signed webhook arrived; awaiting authoritative verification
    Pending,
    /// Gateway verification confirmed the charge; side effect not yet done
    Paid,
    /// Side-effect retry budget exhausted; recoverable by re-trigger
    DeliveryFailed,
    /// Side effect completed exactly once; terminal
    Delivered,
    /// Verification window elapsed without confirmation; terminal
    Expired,
    /// Gateway reported failure/cancellation, or amount mismatch; terminal
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::DeliveryFailed => "delivery_failed",
            Self::Delivered => "delivered",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }

    /// Terminal states ignore every transition except the no-op
    /// re-confirmation of `delivered`. This is what makes duplicate webhook
    /// delivery safe.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Expired | Self::Rejected)
    }

    /// The forward-only transition table.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Initiated, Pending)
                | (Initiated, Paid)
                | (Initiated, Rejected)
                | (Pending, Paid)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Paid, Delivered)
                | (Paid, DeliveryFailed)
                | (DeliveryFailed, Delivered)
        )
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "delivery_failed" => Ok(Self::DeliveryFailed),
            "delivered" => Ok(Self::Delivered),
            "expired" => Ok(Self::Expired),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The business effect gated behind a transaction reaching `paid`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectAction {
    /// Send the purchased bill/token to the customer
    #[default]
    DeliverBill,
    /// Activate a subscription plan
    ActivateSubscription,
    /// Credit the customer's wallet balance
    CreditWallet,
}

impl SideEffectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliverBill => "deliver_bill",
            Self::ActivateSubscription => "activate_subscription",
            Self::CreditWallet => "credit_wallet",
        }
    }
}

impl std::str::FromStr for SideEffectAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deliver_bill" => Ok(Self::DeliverBill),
            "activate_subscription" => Ok(Self::ActivateSubscription),
            "credit_wallet" => Ok(Self::CreditWallet),
            _ => Err(format!("Invalid side effect action: {}", s)),
        }
    }
}

impl std::fmt::Display for SideEffectAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Core transaction entity, one row per merchant payment reference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Transaction {
    /// Merchant-issued unique reference, assigned once at initiation
    #[schema(example = "PR-7f3a2c91")]
    pub reference: String,
    /// Gateway-assigned transaction id, reconciled onto the reference
    #[schema(example = "gw_1289004233")]
    pub gateway_transaction_id: Option<String>,
    /// Declared amount in minor currency units (kobo, cents)
    #[schema(example = 100000)]
    pub amount: i64,
    /// ISO currency code declared at initiation
    #[schema(example = "NGN")]
    pub currency: String,
    /// Current lifecycle status
    pub status: TransactionStatus,
    /// Business effect to run once the charge is verified
    pub action: SideEffectAction,
    /// Number of side-effect attempts made so far
    pub delivery_attempts: i32,
    /// Error from the most recent failed delivery attempt
    pub last_delivery_error: Option<String>,
    /// Deterministic token derived from the reference
    pub idempotency_token: String,
    /// Optimistic-concurrency guard, incremented on every accepted write
    pub version: i32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    #[must_use]
    pub fn new(reference: String, amount: i64, currency: String, action: SideEffectAction) -> Self {
        let now = Utc::now();
        let idempotency_token = idempotency_token_for(&reference);
        Self {
            reference,
            gateway_transaction_id: None,
            amount,
            currency,
            status: TransactionStatus::Initiated,
            action,
            delivery_attempts: 0,
            last_delivery_error: None,
            idempotency_token,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive the idempotency token for a reference.
///
/// Deterministic, so repeated processing requests for the same reference
/// collapse to the same unit of work.
#[must_use]
pub fn idempotency_token_for(reference: &str) -> String {
    let digest = Sha256::digest(reference.as_bytes());
    format!("idem_{}", hex::encode(&digest[..16]))
}

/// A conditional mutation applied through `compare_and_swap`.
///
/// Fields left as `None` are untouched; an accepted mutation always bumps
/// `version` and `updated_at`.
#[derive(Debug, Clone, Default)]
pub struct TransactionMutation {
    pub status: Option<TransactionStatus>,
    /// Recorded only when the stored id is still absent; a conflicting
    /// second value is never overwritten.
    pub gateway_transaction_id: Option<String>,
    /// Verified amount, adopted onto rows created without a declared amount
    pub amount: Option<i64>,
    /// Verified currency, adopted onto rows created without a declared
    /// currency
    pub currency: Option<String>,
    pub increment_delivery_attempts: bool,
    /// `Some(None)` clears the error, `Some(Some(_))` records one.
    pub last_delivery_error: Option<Option<String>>,
}

impl TransactionMutation {
    #[must_use]
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_gateway_id(mut self, id: Option<String>) -> Self {
        self.gateway_transaction_id = id;
        self
    }

    /// Apply this mutation in memory. Used by the in-memory store and to
    /// project the post-write row without a re-read.
    pub fn apply(&self, tx: &mut Transaction) {
        if let Some(status) = self.status {
            tx.status = status;
        }
        if let Some(ref id) = self.gateway_transaction_id {
            if tx.gateway_transaction_id.is_none() {
                tx.gateway_transaction_id = Some(id.clone());
            }
        }
        if let Some(amount) = self.amount {
            tx.amount = amount;
        }
        if let Some(ref currency) = self.currency {
            tx.currency = currency.clone();
        }
        if self.increment_delivery_attempts {
            tx.delivery_attempts += 1;
        }
        if let Some(ref error) = self.last_delivery_error {
            tx.last_delivery_error = error.clone();
        }
        tx.version += 1;
        tx.updated_at = Utc::now();
    }
}

/// Status claimed or confirmed by the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Pending,
    Failed,
}

/// Authoritative result of a gateway verification call.
///
/// The webhook payload is never trusted for the `paid` transition; only this
/// result is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VerificationResult {
    pub status: GatewayStatus,
    /// Amount actually charged, in minor units
    pub amount: i64,
    pub currency: String,
    pub gateway_transaction_id: Option<String>,
    pub customer_ref: Option<String>,
}

/// Inbound webhook event body.
///
/// Signature verification happens over the raw bytes before this is parsed.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WebhookEvent {
    /// Event name, e.g. `charge.success`
    #[schema(example = "charge.success")]
    pub event: String,
    pub data: WebhookEventData,
}

/// Payload carried by a webhook event
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventData {
    /// Status the gateway claims; triggers verification, never trusted
    #[schema(example = "successful")]
    pub status: String,
    #[schema(example = "PR-7f3a2c91")]
    pub reference: String,
    pub gateway_transaction_id: Option<String>,
    /// Amount in minor units as claimed by the event
    pub amount: Option<i64>,
    /// Opaque customer blob forwarded by the gateway
    #[serde(default)]
    #[schema(value_type = Object)]
    pub customer: Option<serde_json::Value>,
}

/// Request to initiate a payment (creates the `initiated` row)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct InitiatePaymentRequest {
    /// Merchant-issued unique reference
    #[validate(length(min = 1, max = 128, message = "Reference is required"))]
    #[schema(example = "PR-7f3a2c91")]
    pub reference: String,
    /// Amount in minor currency units
    #[validate(range(min = 1, message = "Amount must be greater than 0"))]
    #[schema(example = 100000)]
    pub amount: i64,
    /// ISO currency code
    #[validate(length(min = 3, max = 3, message = "Currency must be a 3-letter code"))]
    #[schema(example = "NGN")]
    pub currency: String,
    /// Business effect to run once the charge is verified
    #[serde(default)]
    pub action: SideEffectAction,
}

/// Request body for the manual reconciliation endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconcileRequest {
    /// Merchant reference; preferred lookup key
    pub reference: Option<String>,
    /// Gateway transaction id, resolved to a reference first
    pub gateway_transaction_id: Option<String>,
}

/// How a reconciliation call changed (or declined to change) a transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A state transition was applied
    Advanced,
    /// The transaction was already terminal; nothing ran
    AlreadySettled,
    /// Verification produced no new information; state unchanged
    Unchanged,
}

/// Outcome returned by every engine entry point
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReconciliationOutcome {
    pub transaction: Transaction,
    pub disposition: Disposition,
}

/// Read-only status projection for the query endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TransactionStatusResponse {
    pub reference: String,
    pub status: TransactionStatus,
    pub delivery_attempts: i32,
    pub last_delivery_error: Option<String>,
}

impl From<&Transaction> for TransactionStatusResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            reference: tx.reference.clone(),
            status: tx.status,
            delivery_attempts: tx.delivery_attempts,
            last_delivery_error: tx.last_delivery_error.clone(),
        }
    }
}

/// Receipt from a successful side-effect delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeliveryReceipt {
    /// Identifier assigned by the fulfillment backend
    pub receipt_id: String,
    /// Which backend in the ranked list produced the receipt
    pub backend: String,
}

/// Pagination parameters for list requests
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct PaginationParams {
    /// Maximum number of items to return (1-100, default: 20)
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default = "default_limit")]
    #[schema(example = 20)]
    pub limit: i64,
    /// Cursor for pagination (reference to start after)
    #[schema(example = "PR-7f3a2c91")]
    pub cursor: Option<String>,
}

fn default_limit() -> i64 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            cursor: None,
        }
    }
}

/// Paginated response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T: ToSchema> {
    /// List of items
    pub items: Vec<T>,
    /// Cursor for next page (null if no more items)
    pub next_cursor: Option<String>,
    /// Whether more items exist
    pub has_more: bool,
}

impl<T: ToSchema> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>, has_more: bool) -> Self {
        Self {
            items,
            next_cursor,
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Transaction store health
    pub store: HealthStatus,
    /// Gateway API health
    pub gateway: HealthStatus,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(store: HealthStatus, gateway: HealthStatus) -> Self {
        let status = match (&store, &gateway) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            store,
            gateway,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "invalid_signature")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Invalid webhook signature")]
    pub message: String,
}

/// Rate limit exceeded response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RateLimitResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Seconds until rate limit resets
    #[schema(example = 60)]
    pub retry_after: u64,
}
