//! Reconciliation engine: the state machine and idempotency core.
//!
//! Every entry point (webhook ingestion, manual reconciliation, the sweep)
//! converges on the same algorithm: fetch-or-create the row, short-circuit
//! terminal states, pull the authoritative status from the gateway, apply
//! the transition table through compare-and-swap, and hand `paid` rows to
//! the side-effect trigger.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, instrument, warn};

use crate::domain::{
    AppError, Disposition, GatewayClient, GatewayStatus, HealthResponse, HealthStatus,
    InitiatePaymentRequest, PaginatedResponse, ReconciliationOutcome, StoreError, Transaction,
    TransactionMutation, TransactionStatus, TransactionStore, VerificationResult, WebhookEvent,
};

use super::trigger::{DeliveryResult, SideEffectTrigger};

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a `pending` transaction may wait for confirmation before
    /// the sweep expires it (seconds)
    pub verification_window_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verification_window_secs: 24 * 60 * 60,
        }
    }
}

/// Drives transactions through the reconciliation state machine
pub struct ReconciliationEngine {
    store: Arc<dyn TransactionStore>,
    gateway: Arc<dyn GatewayClient>,
    trigger: Arc<SideEffectTrigger>,
    config: EngineConfig,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        gateway: Arc<dyn GatewayClient>,
        trigger: Arc<SideEffectTrigger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            trigger,
            config,
        }
    }

    /// Create the `initiated` row for a new payment. The reference is
    /// assigned here, exactly once; a duplicate is a client error.
    #[instrument(skip(self, request), fields(reference = %request.reference))]
    pub async fn initiate(&self, request: &InitiatePaymentRequest) -> Result<Transaction, AppError> {
        let tx = Transaction::new(
            request.reference.clone(),
            request.amount,
            request.currency.to_uppercase(),
            request.action,
        );
        let created = self.store.create(&tx).await?;
        info!(amount = %created.amount, currency = %created.currency, "Payment initiated");
        Ok(created)
    }

    /// Webhook ingestion entry point. The signature has already been
    /// verified over the raw bytes by the caller.
    #[instrument(skip(self, event), fields(reference = %event.data.reference, claimed = %event.data.status))]
    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
    ) -> Result<ReconciliationOutcome, AppError> {
        let reference = &event.data.reference;
        let mut tx = self.fetch_or_create(event).await?;

        // Idempotence law: terminal transactions absorb duplicates silently
        if tx.status.is_terminal() {
            info!(status = %tx.status, "Duplicate event for terminal transaction, no-op");
            return Ok(ReconciliationOutcome {
                transaction: tx,
                disposition: Disposition::AlreadySettled,
            });
        }

        // A valid signed event is evidence of gateway activity: advance
        // initiated -> pending before the authoritative check.
        if tx.status == TransactionStatus::Initiated {
            let gateway_id = match (&tx.gateway_transaction_id, &event.data.gateway_transaction_id)
            {
                (Some(stored), Some(claimed)) if stored != claimed => {
                    warn!(stored = %stored, claimed = %claimed, "Conflicting gateway id in event, keeping stored value");
                    None
                }
                (_, claimed) => claimed.clone(),
            };
            let mutation =
                TransactionMutation::status(TransactionStatus::Pending).with_gateway_id(gateway_id);
            tx = self.apply(reference, tx, &mutation).await?;
        }

        self.reconcile_tx(tx).await
    }

    /// Manual / sweep entry point. Unlike webhook ingestion, an unknown
    /// reference here is a client error, not a lazy create.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, reference: &str) -> Result<ReconciliationOutcome, AppError> {
        let tx = self
            .store
            .get(reference)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(reference.to_string())))?;

        if tx.status.is_terminal() {
            return Ok(ReconciliationOutcome {
                transaction: tx,
                disposition: Disposition::AlreadySettled,
            });
        }

        self.reconcile_tx(tx).await
    }

    /// Resolve a gateway transaction id to its reference, then reconcile.
    /// The reference stays the single source of truth; the id is only a
    /// secondary lookup key.
    #[instrument(skip(self))]
    pub async fn reconcile_by_transaction_id(
        &self,
        id: &str,
    ) -> Result<ReconciliationOutcome, AppError> {
        let tx = self
            .store
            .get_by_gateway_transaction_id(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        self.reconcile(&tx.reference).await
    }

    /// Expire stale `pending` transactions whose verification window has
    /// elapsed. Called by the sweep; returns how many rows advanced.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self, batch_size: i64) -> Result<usize, AppError> {
        let cutoff = Utc::now() - Duration::seconds(self.config.verification_window_secs);
        let stale = self.store.list_stale_pending(cutoff, batch_size).await?;
        let mut expired = 0;

        for tx in stale {
            // One last authoritative check before giving up on the charge
            match self.reconcile_tx(tx.clone()).await {
                Ok(outcome) if outcome.transaction.status == TransactionStatus::Pending => {
                    let mutation = TransactionMutation::status(TransactionStatus::Expired);
                    match self.apply(&tx.reference, outcome.transaction, &mutation).await {
                        Ok(_) => {
                            info!(reference = %tx.reference, "Verification window elapsed, transaction expired");
                            expired += 1;
                        }
                        Err(e) => {
                            warn!(reference = %tx.reference, error = %e, "Failed to expire transaction")
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Gateway unavailable: leave the row for the next sweep
                    warn!(reference = %tx.reference, error = %e, "Skipping expiry, verification unavailable");
                }
            }
        }

        Ok(expired)
    }

    /// Re-trigger delivery for paid / delivery-failed rows. Called by the
    /// sweep; each row goes through the same `reconcile` path as a manual
    /// request would.
    #[instrument(skip(self))]
    pub async fn redeliver_pending_effects(&self, batch_size: i64) -> Result<usize, AppError> {
        let undelivered = self.store.list_undelivered(batch_size).await?;
        let count = undelivered.len();

        for tx in undelivered {
            if let Err(e) = self.reconcile(&tx.reference).await {
                error!(reference = %tx.reference, error = %e, "Sweep re-delivery failed");
            }
        }

        Ok(count)
    }

    /// Fetch a transaction for the status endpoint
    #[instrument(skip(self))]
    pub async fn get_transaction(&self, reference: &str) -> Result<Option<Transaction>, AppError> {
        self.store.get(reference).await
    }

    /// List transactions with pagination
    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<Transaction>, AppError> {
        self.store.list(limit, cursor).await
    }

    /// Perform health check on the store and the gateway
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let store_health = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let gateway_health = match self.gateway.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(store_health, gateway_health)
    }

    /// Shared reconciliation step for a non-terminal transaction.
    async fn reconcile_tx(&self, tx: Transaction) -> Result<ReconciliationOutcome, AppError> {
        match tx.status {
            // Already verified: the only remaining work is the side effect
            TransactionStatus::Paid | TransactionStatus::DeliveryFailed => {
                self.run_side_effect(tx).await
            }
            TransactionStatus::Initiated | TransactionStatus::Pending => {
                let verification = self.gateway.verify_by_reference(&tx.reference).await?;
                self.apply_verification(tx, &verification).await
            }
            // Terminal states are filtered by the callers
            _ => Ok(ReconciliationOutcome {
                transaction: tx,
                disposition: Disposition::AlreadySettled,
            }),
        }
    }

    /// Apply the authoritative verification result to the transition table.
    async fn apply_verification(
        &self,
        tx: Transaction,
        verification: &VerificationResult,
    ) -> Result<ReconciliationOutcome, AppError> {
        match verification.status {
            GatewayStatus::Success => {
                // Amount guard: a verified value that differs from the
                // declared one is a hard reject, never auto-corrected.
                // Lazily created rows may lack a declared amount (0) or
                // currency (empty); unknown values adopt the verified ones
                // instead of tripping the guard.
                let amount_known = tx.amount != 0;
                let currency_known = !tx.currency.is_empty();
                let mismatch = (amount_known && tx.amount != verification.amount)
                    || (currency_known
                        && !tx.currency.eq_ignore_ascii_case(&verification.currency));
                if mismatch {
                    error!(
                        reference = %tx.reference,
                        declared_amount = %tx.amount,
                        declared_currency = %tx.currency,
                        verified_amount = %verification.amount,
                        verified_currency = %verification.currency,
                        "Amount mismatch, rejecting transaction for audit"
                    );
                    let mutation = TransactionMutation::status(TransactionStatus::Rejected)
                        .with_gateway_id(verification.gateway_transaction_id.clone());
                    let updated = self.apply(&tx.reference.clone(), tx, &mutation).await?;
                    return Ok(ReconciliationOutcome {
                        transaction: updated,
                        disposition: Disposition::Advanced,
                    });
                }

                let mutation = TransactionMutation {
                    status: Some(TransactionStatus::Paid),
                    gateway_transaction_id: verification.gateway_transaction_id.clone(),
                    amount: (!amount_known).then_some(verification.amount),
                    currency: (!currency_known).then(|| verification.currency.clone()),
                    ..Default::default()
                };
                let paid = self.apply(&tx.reference.clone(), tx, &mutation).await?;
                self.run_side_effect(paid).await
            }
            GatewayStatus::Pending => {
                info!(reference = %tx.reference, "Gateway still reports pending, leaving unchanged");
                Ok(ReconciliationOutcome {
                    transaction: tx,
                    disposition: Disposition::Unchanged,
                })
            }
            GatewayStatus::Failed => {
                info!(reference = %tx.reference, "Gateway reports failure, rejecting");
                let mutation = TransactionMutation::status(TransactionStatus::Rejected)
                    .with_gateway_id(verification.gateway_transaction_id.clone());
                let updated = self.apply(&tx.reference.clone(), tx, &mutation).await?;
                Ok(ReconciliationOutcome {
                    transaction: updated,
                    disposition: Disposition::Advanced,
                })
            }
        }
    }

    /// Invoke the side-effect trigger for a paid / delivery-failed row and
    /// fold its result into a reconciliation outcome.
    async fn run_side_effect(&self, tx: Transaction) -> Result<ReconciliationOutcome, AppError> {
        // A competing writer may have settled the row while our own write
        // was losing its compare-and-swap; their terminal state stands and
        // the effect must not run.
        if !matches!(
            tx.status,
            TransactionStatus::Paid | TransactionStatus::DeliveryFailed
        ) {
            info!(
                reference = %tx.reference,
                status = %tx.status,
                "Side effect skipped, transaction settled by a concurrent writer"
            );
            return Ok(ReconciliationOutcome {
                transaction: tx,
                disposition: Disposition::AlreadySettled,
            });
        }

        match self.trigger.execute(&tx).await? {
            DeliveryResult::Delivered { transaction, .. } => Ok(ReconciliationOutcome {
                transaction,
                disposition: Disposition::Advanced,
            }),
            DeliveryResult::Failed { transaction } => Ok(ReconciliationOutcome {
                transaction,
                disposition: Disposition::Advanced,
            }),
            DeliveryResult::AlreadyDelivered { transaction } => Ok(ReconciliationOutcome {
                transaction,
                disposition: Disposition::AlreadySettled,
            }),
            DeliveryResult::AlreadyInFlight => {
                // The concurrent execution owns the outcome; report the
                // current state without duplicating the effect.
                let current = self
                    .store
                    .get(&tx.reference)
                    .await?
                    .ok_or_else(|| AppError::Store(StoreError::NotFound(tx.reference.clone())))?;
                Ok(ReconciliationOutcome {
                    transaction: current,
                    disposition: Disposition::Unchanged,
                })
            }
        }
    }

    /// Apply a mutation through compare-and-swap. On a version conflict the
    /// whole step is re-evaluated once more against the fresh row; losing
    /// twice means another writer is making progress, so we step aside.
    async fn apply(
        &self,
        reference: &str,
        mut current: Transaction,
        mutation: &TransactionMutation,
    ) -> Result<Transaction, AppError> {
        for _ in 0..2 {
            if let Some(target) = mutation.status {
                if current.status == target {
                    return Ok(current);
                }
                if current.status.is_terminal() {
                    info!(
                        reference = %reference,
                        status = %current.status,
                        attempted = %target,
                        "Transition from terminal state ignored"
                    );
                    return Ok(current);
                }
                if !current.status.can_transition_to(target) {
                    info!(
                        reference = %reference,
                        status = %current.status,
                        attempted = %target,
                        "Transition not in table, ignored"
                    );
                    return Ok(current);
                }
            }

            match self
                .store
                .compare_and_swap(reference, current.version, mutation)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(AppError::Store(StoreError::VersionConflict { .. })) => {
                    current = self.store.get(reference).await?.ok_or_else(|| {
                        AppError::Store(StoreError::NotFound(reference.to_string()))
                    })?;
                }
                Err(e) => return Err(e),
            }
        }

        // The competing writer advanced the row; its state stands.
        info!(reference = %reference, status = %current.status, "Lost compare-and-swap race, yielding");
        Ok(current)
    }

    /// Fetch the row for a webhook event, creating it lazily when the
    /// initiating business operation has not been observed. Duplicate
    /// creates are folded into a fetch, never an error.
    async fn fetch_or_create(&self, event: &WebhookEvent) -> Result<Transaction, AppError> {
        let reference = &event.data.reference;

        if let Some(tx) = self.store.get(reference).await? {
            return Ok(tx);
        }

        info!(reference = %reference, "Unknown reference, creating transaction lazily");
        // No declared currency exists for a webhook-first charge; left
        // empty so verification adopts the gateway's value.
        let mut tx = Transaction::new(
            reference.clone(),
            event.data.amount.unwrap_or(0),
            String::new(),
            Default::default(),
        );
        tx.gateway_transaction_id = event.data.gateway_transaction_id.clone();

        match self.store.create(&tx).await {
            Ok(created) => Ok(created),
            Err(AppError::Store(StoreError::Duplicate(_))) => self
                .store
                .get(reference)
                .await?
                .ok_or_else(|| AppError::Store(StoreError::NotFound(reference.clone()))),
            Err(e) => Err(e),
        }
    }
}
