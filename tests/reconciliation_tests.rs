//! Reconciliation engine behavior tests over mock infrastructure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payment_reconciler::app::{EngineConfig, ReconciliationEngine, SideEffectTrigger, TriggerConfig};
use payment_reconciler::domain::{
    AppError, Disposition, GatewayClient, GatewayStatus, InitiatePaymentRequest, SideEffectAction,
    StoreError, Transaction, TransactionMutation, TransactionStatus, TransactionStore,
    VerificationResult, WebhookEvent, WebhookEventData,
};
use payment_reconciler::test_utils::{MockDeliverer, MockGatewayClient, MockTransactionStore};

struct Harness {
    engine: ReconciliationEngine,
    store: Arc<MockTransactionStore>,
    gateway: Arc<MockGatewayClient>,
    deliverer: Arc<MockDeliverer>,
}

fn harness_with_deliverer(deliverer: MockDeliverer) -> Harness {
    let store = Arc::new(MockTransactionStore::new());
    let gateway = Arc::new(MockGatewayClient::new());
    let deliverer = Arc::new(deliverer);

    let trigger = Arc::new(SideEffectTrigger::new(
        store.clone() as _,
        deliverer.clone() as _,
        TriggerConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
    ));
    let engine = ReconciliationEngine::new(
        store.clone() as _,
        gateway.clone() as _,
        trigger,
        EngineConfig {
            verification_window_secs: 3600,
        },
    );

    Harness {
        engine,
        store,
        gateway,
        deliverer,
    }
}

fn harness() -> Harness {
    harness_with_deliverer(MockDeliverer::new())
}

fn verified_success(amount: i64) -> VerificationResult {
    VerificationResult {
        status: GatewayStatus::Success,
        amount,
        currency: "NGN".to_string(),
        gateway_transaction_id: Some("gw_42".to_string()),
        customer_ref: None,
    }
}

fn webhook(reference: &str, amount: i64) -> WebhookEvent {
    WebhookEvent {
        event: "charge.success".to_string(),
        data: WebhookEventData {
            status: "successful".to_string(),
            reference: reference.to_string(),
            gateway_transaction_id: Some("gw_42".to_string()),
            amount: Some(amount),
            customer: None,
        },
    }
}

async fn initiate(h: &Harness, reference: &str, amount: i64) -> Transaction {
    h.engine
        .initiate(&InitiatePaymentRequest {
            reference: reference.to_string(),
            amount,
            currency: "NGN".to_string(),
            action: SideEffectAction::DeliverBill,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_verified_success_reaches_delivered_with_one_attempt() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
    assert_eq!(outcome.transaction.delivery_attempts, 1);
    assert_eq!(outcome.disposition, Disposition::Advanced);
    assert_eq!(h.deliverer.executions(), 1);
    assert_eq!(
        outcome.transaction.gateway_transaction_id,
        Some("gw_42".to_string())
    );
}

#[tokio::test]
async fn test_duplicate_event_on_terminal_transaction_is_noop() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let first = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(first.transaction.status, TransactionStatus::Delivered);
    let verify_calls_after_first = h.gateway.verify_calls();

    // Redelivery of the same event
    let second = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();

    assert_eq!(second.disposition, Disposition::AlreadySettled);
    assert_eq!(second.transaction.status, TransactionStatus::Delivered);
    assert_eq!(second.transaction.delivery_attempts, 1);
    // No further verification or delivery happened
    assert_eq!(h.gateway.verify_calls(), verify_calls_after_first);
    assert_eq!(h.deliverer.executions(), 1);
}

#[tokio::test]
async fn test_amount_mismatch_rejects_without_side_effect() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    // Gateway confirms a different amount than declared
    h.gateway.set_result(verified_success(50_000));

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
    assert_eq!(h.deliverer.executions(), 0);
    // The declared amount is preserved for audit, never auto-corrected
    assert_eq!(outcome.transaction.amount, 100_000);
}

#[tokio::test]
async fn test_currency_mismatch_rejects() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(VerificationResult {
        currency: "USD".to_string(),
        ..verified_success(100_000)
    });

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
    assert_eq!(h.deliverer.executions(), 0);
}

#[tokio::test]
async fn test_gateway_failure_rejects() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(VerificationResult {
        status: GatewayStatus::Failed,
        ..verified_success(100_000)
    });

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
    assert_eq!(h.deliverer.executions(), 0);
}

#[tokio::test]
async fn test_gateway_pending_leaves_transaction_pending() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(VerificationResult {
        status: GatewayStatus::Pending,
        ..verified_success(100_000)
    });

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::Pending);
    assert_eq!(outcome.disposition, Disposition::Unchanged);
    assert_eq!(h.deliverer.executions(), 0);
}

#[tokio::test]
async fn test_gateway_unavailable_leaves_transaction_for_retry() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    let store = h.store.clone();

    let gateway = Arc::new(MockGatewayClient::failing("connection refused"));
    let trigger = Arc::new(SideEffectTrigger::new(
        store.clone() as _,
        Arc::new(MockDeliverer::new()) as _,
        TriggerConfig::default(),
    ));
    let engine = ReconciliationEngine::new(
        store.clone() as _,
        gateway as _,
        trigger,
        EngineConfig::default(),
    );

    let result = engine.handle_event(&webhook("PR-1", 100_000)).await;
    assert!(matches!(result, Err(AppError::Gateway(_))));

    // Transaction advanced to pending from the signed event, but no further
    let tx = store.get_all().into_iter().find(|t| t.reference == "PR-1").unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_transient_delivery_failure_retries_then_succeeds() {
    let h = harness_with_deliverer(MockDeliverer::failing_times(2));
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
    assert_eq!(outcome.transaction.delivery_attempts, 3);
    assert!(outcome.transaction.last_delivery_error.is_none());
    assert_eq!(h.deliverer.executions(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_mark_delivery_failed_then_recoverable() {
    let h = harness_with_deliverer(MockDeliverer::failing_times(3));
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::DeliveryFailed);
    assert_eq!(outcome.transaction.delivery_attempts, 3);
    assert!(outcome.transaction.last_delivery_error.is_some());

    // A later manual reconcile re-triggers; fourth attempt succeeds
    let recovered = h.engine.reconcile("PR-1").await.unwrap();
    assert_eq!(recovered.transaction.status, TransactionStatus::Delivered);
    assert_eq!(recovered.transaction.delivery_attempts, 4);
    assert!(recovered.transaction.last_delivery_error.is_none());
}

#[tokio::test]
async fn test_permanent_delivery_failure_skips_retries() {
    let h = harness_with_deliverer(MockDeliverer::permanent_failure());
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let outcome = h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::DeliveryFailed);
    assert_eq!(outcome.transaction.delivery_attempts, 1);
    assert_eq!(h.deliverer.executions(), 1);
}

#[tokio::test]
async fn test_concurrent_reconciliation_delivers_once() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(verified_success(100_000));

    let event = webhook("PR-1", 100_000);
    let (a, b) = tokio::join!(
        h.engine.handle_event(&event),
        h.engine.reconcile("PR-1"),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.transaction.status, TransactionStatus::Delivered);
    assert_eq!(b.transaction.status, TransactionStatus::Delivered);
    // The side effect ran exactly once across both entry points
    assert_eq!(h.deliverer.executions(), 1);

    let tx = h.store.get_all().into_iter().find(|t| t.reference == "PR-1").unwrap();
    assert_eq!(tx.delivery_attempts, 1);
}

#[tokio::test]
async fn test_unknown_reference_is_created_lazily_from_event() {
    let h = harness();
    h.gateway.set_result(verified_success(100_000));

    // No initiate call; the webhook arrives first
    let outcome = h.engine.handle_event(&webhook("PR-ghost", 100_000)).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
    assert_eq!(outcome.transaction.amount, 100_000);
    // Verified currency adopted, since no declared value exists
    assert_eq!(outcome.transaction.currency, "NGN");
}

#[tokio::test]
async fn test_webhook_first_charge_adopts_verified_currency() {
    let h = harness();
    h.gateway.set_result(VerificationResult {
        currency: "USD".to_string(),
        ..verified_success(100_000)
    });

    let outcome = h.engine.handle_event(&webhook("PR-usd", 100_000)).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
    assert_eq!(outcome.transaction.currency, "USD");
}

#[tokio::test]
async fn test_webhook_without_claimed_amount_adopts_verified_amount() {
    let h = harness();
    h.gateway.set_result(verified_success(75_000));

    let mut event = webhook("PR-blank", 0);
    event.data.amount = None;
    let outcome = h.engine.handle_event(&event).await.unwrap();

    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
    assert_eq!(outcome.transaction.amount, 75_000);
}

#[tokio::test]
async fn test_manual_reconcile_unknown_reference_is_not_found() {
    let h = harness();
    let result = h.engine.reconcile("PR-missing").await;
    assert!(matches!(
        result,
        Err(AppError::Store(StoreError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_reconcile_by_gateway_transaction_id() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;
    h.gateway.set_result(VerificationResult {
        status: GatewayStatus::Pending,
        ..verified_success(100_000)
    });
    // Attach the gateway id via a first event
    h.engine.handle_event(&webhook("PR-1", 100_000)).await.unwrap();

    h.gateway.set_result(verified_success(100_000));
    let outcome = h.engine.reconcile_by_transaction_id("gw_42").await.unwrap();
    assert_eq!(outcome.transaction.reference, "PR-1");
    assert_eq!(outcome.transaction.status, TransactionStatus::Delivered);
}

#[tokio::test]
async fn test_expire_stale_pending_transactions() {
    let h = harness();
    // Pending row last touched beyond the verification window
    let mut tx = Transaction::new(
        "PR-old".to_string(),
        100_000,
        "NGN".to_string(),
        SideEffectAction::DeliverBill,
    );
    tx.status = TransactionStatus::Pending;
    tx.updated_at = chrono::Utc::now() - chrono::Duration::hours(48);
    h.store.insert(tx);

    // Gateway still has nothing to confirm
    h.gateway.set_result(VerificationResult {
        status: GatewayStatus::Pending,
        ..verified_success(100_000)
    });

    let engine = ReconciliationEngine::new(
        h.store.clone() as _,
        h.gateway.clone() as _,
        Arc::new(SideEffectTrigger::new(
            h.store.clone() as _,
            h.deliverer.clone() as _,
            TriggerConfig::default(),
        )),
        EngineConfig {
            verification_window_secs: 3600,
        },
    );

    let expired = engine.expire_stale(10).await.unwrap();
    assert_eq!(expired, 1);

    let tx = h.store.get_all().into_iter().find(|t| t.reference == "PR-old").unwrap();
    assert_eq!(tx.status, TransactionStatus::Expired);
}

#[tokio::test]
async fn test_expiry_pass_rescues_late_confirmation() {
    let h = harness();
    let mut tx = Transaction::new(
        "PR-late".to_string(),
        100_000,
        "NGN".to_string(),
        SideEffectAction::DeliverBill,
    );
    tx.status = TransactionStatus::Pending;
    tx.updated_at = chrono::Utc::now() - chrono::Duration::hours(48);
    h.store.insert(tx);

    // The charge did eventually go through; the final check catches it
    h.gateway.set_result(verified_success(100_000));

    let expired = h.engine.expire_stale(10).await.unwrap();
    assert_eq!(expired, 0);

    let tx = h.store.get_all().into_iter().find(|t| t.reference == "PR-late").unwrap();
    assert_eq!(tx.status, TransactionStatus::Delivered);
}

#[tokio::test]
async fn test_redelivery_pass_picks_up_failed_deliveries() {
    let h = harness();
    let mut tx = Transaction::new(
        "PR-stuck".to_string(),
        100_000,
        "NGN".to_string(),
        SideEffectAction::DeliverBill,
    );
    tx.status = TransactionStatus::DeliveryFailed;
    tx.delivery_attempts = 3;
    tx.last_delivery_error = Some("fulfillment backend returned 503".to_string());
    h.store.insert(tx);

    let retried = h.engine.redeliver_pending_effects(10).await.unwrap();
    assert_eq!(retried, 1);

    let tx = h.store.get_all().into_iter().find(|t| t.reference == "PR-stuck").unwrap();
    assert_eq!(tx.status, TransactionStatus::Delivered);
    assert_eq!(tx.delivery_attempts, 4);
    assert!(tx.last_delivery_error.is_none());
}

/// Settles the row to a terminal state while the verification call is on
/// the wire, then reports success, forcing the caller's write to lose its
/// compare-and-swap against a terminal row.
struct SettlingGateway {
    store: Arc<MockTransactionStore>,
}

#[async_trait]
impl GatewayClient for SettlingGateway {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn verify_by_reference(
        &self,
        reference: &str,
    ) -> Result<VerificationResult, AppError> {
        let current = self.store.get(reference).await?.unwrap();
        self.store
            .compare_and_swap(
                reference,
                current.version,
                &TransactionMutation::status(TransactionStatus::Rejected),
            )
            .await?;
        Ok(verified_success(100_000))
    }

    async fn verify_by_transaction_id(&self, id: &str) -> Result<VerificationResult, AppError> {
        self.verify_by_reference(id).await
    }
}

#[tokio::test]
async fn test_concurrent_settlement_during_verification_is_noop() {
    let store = Arc::new(MockTransactionStore::new());
    let deliverer = Arc::new(MockDeliverer::new());
    let mut tx = Transaction::new(
        "PR-race".to_string(),
        100_000,
        "NGN".to_string(),
        SideEffectAction::DeliverBill,
    );
    tx.status = TransactionStatus::Pending;
    store.insert(tx);

    let gateway = Arc::new(SettlingGateway {
        store: store.clone(),
    });
    let trigger = Arc::new(SideEffectTrigger::new(
        store.clone() as _,
        deliverer.clone() as _,
        TriggerConfig::default(),
    ));
    let engine = ReconciliationEngine::new(
        store.clone() as _,
        gateway as _,
        trigger,
        EngineConfig::default(),
    );

    // The competing writer's terminal state stands; no error, no effect
    let outcome = engine.reconcile("PR-race").await.unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
    assert_eq!(outcome.disposition, Disposition::AlreadySettled);
    assert_eq!(deliverer.executions(), 0);

    let tx = store.get_all().into_iter().find(|t| t.reference == "PR-race").unwrap();
    assert_eq!(tx.status, TransactionStatus::Rejected);
    assert_eq!(tx.delivery_attempts, 0);
}

#[tokio::test]
async fn test_initiate_duplicate_reference_is_conflict() {
    let h = harness();
    initiate(&h, "PR-1", 100_000).await;

    let result = h
        .engine
        .initiate(&InitiatePaymentRequest {
            reference: "PR-1".to_string(),
            amount: 200_000,
            currency: "NGN".to_string(),
            action: SideEffectAction::DeliverBill,
        })
        .await;

    assert!(matches!(
        result,
        Err(AppError::Store(StoreError::Duplicate(_)))
    ));
}
