//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::AppError;
use super::types::{
    DeliveryReceipt, PaginatedResponse, Transaction, TransactionMutation, VerificationResult,
};

/// Durable record of transactions, keyed by merchant reference.
///
/// All state transitions go through `compare_and_swap`; concurrent writers
/// for the same reference are serialized by the version check, no global
/// lock involved.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new transaction. A duplicate reference surfaces
    /// `StoreError::Duplicate`; callers that want idempotent creation fall
    /// back to `get`.
    async fn create(&self, tx: &Transaction) -> Result<Transaction, AppError>;

    /// Fetch a transaction by reference
    async fn get(&self, reference: &str) -> Result<Option<Transaction>, AppError>;

    /// Fetch a transaction by the gateway-assigned id
    async fn get_by_gateway_transaction_id(
        &self,
        id: &str,
    ) -> Result<Option<Transaction>, AppError>;

    /// Conditionally mutate a transaction. The write is accepted only when
    /// the stored version equals `expected_version`; otherwise
    /// `StoreError::VersionConflict` is returned and the caller must
    /// re-fetch and re-evaluate.
    async fn compare_and_swap(
        &self,
        reference: &str,
        expected_version: i32,
        mutation: &TransactionMutation,
    ) -> Result<Transaction, AppError>;

    /// List transactions with cursor-based pagination, newest first
    async fn list(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<Transaction>, AppError>;

    /// Pending transactions last touched before `before`; sweep input for
    /// the expiry pass
    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Paid or delivery-failed transactions whose side effect has not
    /// completed; sweep input for the re-trigger pass
    async fn list_undelivered(&self, limit: i64) -> Result<Vec<Transaction>, AppError>;
}

/// Pull-based authoritative view of the payment gateway.
///
/// Implementations own the bounded-backoff retry policy; callers see either
/// a result or `GatewayError::Unavailable` once the budget is spent.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Check gateway API reachability
    async fn health_check(&self) -> Result<(), AppError>;

    /// Verify a charge by merchant reference
    async fn verify_by_reference(&self, reference: &str)
    -> Result<VerificationResult, AppError>;

    /// Verify a charge by gateway transaction id
    async fn verify_by_transaction_id(&self, id: &str) -> Result<VerificationResult, AppError>;
}

/// A backend capable of performing the business side effect.
///
/// Failures must be classified: `DeliveryError::Transient` is retried by the
/// trigger, `DeliveryError::Permanent` is not.
#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Perform the side effect for a verified transaction
    async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError>;

    /// Human-readable backend name for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SideEffectAction;

    struct NoopDeliverer;

    #[async_trait]
    impl Deliverer for NoopDeliverer {
        async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError> {
            Ok(DeliveryReceipt {
                receipt_id: format!("rcpt_{}", tx.reference),
                backend: self.name().to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[tokio::test]
    async fn test_deliverer_contract() {
        let deliverer = NoopDeliverer;
        let tx = Transaction::new(
            "PR-1".to_string(),
            100_000,
            "NGN".to_string(),
            SideEffectAction::DeliverBill,
        );
        let receipt = deliverer.deliver(&tx).await.unwrap();
        assert_eq!(receipt.receipt_id, "rcpt_PR-1");
        assert_eq!(receipt.backend, "noop");
    }
}
