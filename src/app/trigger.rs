//! Side-effect trigger with in-flight guard and bounded retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::domain::{
    AppError, Deliverer, DeliveryError, DeliveryReceipt, StoreError, Transaction,
    TransactionMutation, TransactionStatus, TransactionStore,
};

/// Retry policy for side-effect delivery
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Total attempts including the first (default: 3)
    pub max_attempts: i32,
    /// First backoff delay; doubles per attempt
    pub backoff_base: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Outcome of a trigger execution
#[derive(Debug)]
pub enum DeliveryResult {
    /// The side effect ran and the transaction is `delivered`
    Delivered {
        receipt: DeliveryReceipt,
        transaction: Transaction,
    },
    /// The retry budget is exhausted or the failure was permanent;
    /// the transaction is `delivery_failed`
    Failed { transaction: Transaction },
    /// The side effect already completed earlier; nothing ran
    AlreadyDelivered { transaction: Transaction },
    /// Another execution for this reference is running; nothing was done
    AlreadyInFlight,
}

/// Wraps the business side effect with at-most-once machinery.
///
/// A per-reference in-flight guard prevents two concurrent executions in
/// this process; across processes the store's compare-and-swap arbitrates.
/// Every attempt is recorded durably (`delivery_attempts`,
/// `last_delivery_error`) before the next one starts.
pub struct SideEffectTrigger {
    store: Arc<dyn TransactionStore>,
    deliverer: Arc<dyn Deliverer>,
    config: TriggerConfig,
    in_flight: DashMap<String, ()>,
}

/// Removes the in-flight marker when the execution scope ends
struct InFlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    reference: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.reference);
    }
}

impl SideEffectTrigger {
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        deliverer: Arc<dyn Deliverer>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            store,
            deliverer,
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Execute the side effect for a transaction in `paid` or
    /// `delivery_failed`. Safe to call repeatedly; a transaction already
    /// `delivered` is returned unchanged without invoking the deliverer.
    #[instrument(skip(self, tx), fields(reference = %tx.reference))]
    pub async fn execute(&self, tx: &Transaction) -> Result<DeliveryResult, AppError> {
        if self
            .in_flight
            .insert(tx.reference.clone(), ())
            .is_some()
        {
            info!("Delivery already in flight, skipping");
            return Ok(DeliveryResult::AlreadyInFlight);
        }
        let _guard = InFlightGuard {
            map: &self.in_flight,
            reference: tx.reference.clone(),
        };

        // Re-read under the guard: a concurrent writer may have settled the
        // transaction between the caller's snapshot and now.
        let mut current = self
            .store
            .get(&tx.reference)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(tx.reference.clone())))?;

        if current.status == TransactionStatus::Delivered {
            info!("Side effect already completed, nothing to do");
            return Ok(DeliveryResult::AlreadyDelivered {
                transaction: current,
            });
        }

        if !matches!(
            current.status,
            TransactionStatus::Paid | TransactionStatus::DeliveryFailed
        ) {
            return Err(AppError::Internal(format!(
                "side effect requested for {} in status {}",
                current.reference, current.status
            )));
        }

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let backoff = self.config.backoff_base * 2u32.pow((attempt - 2) as u32);
                tokio::time::sleep(backoff).await;
            }

            match self.deliverer.deliver(&current).await {
                Ok(receipt) => {
                    info!(
                        attempt,
                        receipt_id = %receipt.receipt_id,
                        backend = %receipt.backend,
                        "Side effect delivered"
                    );
                    let mutation = TransactionMutation {
                        status: Some(TransactionStatus::Delivered),
                        increment_delivery_attempts: true,
                        last_delivery_error: Some(None),
                        ..Default::default()
                    };
                    let updated = self.record(&current.reference, &mutation).await?;
                    return Ok(DeliveryResult::Delivered {
                        receipt,
                        transaction: updated,
                    });
                }
                Err(AppError::Delivery(DeliveryError::Permanent(msg))) => {
                    warn!(attempt, error = %msg, "Permanent delivery failure, not retrying");
                    let mutation = TransactionMutation {
                        status: Some(TransactionStatus::DeliveryFailed),
                        increment_delivery_attempts: true,
                        last_delivery_error: Some(Some(msg)),
                        ..Default::default()
                    };
                    let updated = self.record(&current.reference, &mutation).await?;
                    return Ok(DeliveryResult::Failed {
                        transaction: updated,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(attempt, error = %message, "Transient delivery failure");
                    let exhausted = attempt == self.config.max_attempts;
                    let mutation = TransactionMutation {
                        status: exhausted.then_some(TransactionStatus::DeliveryFailed),
                        increment_delivery_attempts: true,
                        last_delivery_error: Some(Some(message)),
                        ..Default::default()
                    };
                    current = self.record(&current.reference, &mutation).await?;
                    if exhausted {
                        warn!(
                            attempts = self.config.max_attempts,
                            "Delivery retry budget exhausted"
                        );
                        return Ok(DeliveryResult::Failed {
                            transaction: current,
                        });
                    }
                }
            }
        }

        // Loop always returns on the final attempt
        Err(AppError::Internal(
            "delivery loop exited without a result".to_string(),
        ))
    }

    /// Apply a mutation with a bounded re-read on version conflict.
    async fn record(
        &self,
        reference: &str,
        mutation: &TransactionMutation,
    ) -> Result<Transaction, AppError> {
        let mut current = self
            .store
            .get(reference)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(reference.to_string())))?;

        for _ in 0..2 {
            // A racer may already have recorded the same terminal state
            if let Some(target) = mutation.status {
                if current.status == target {
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

        Err(AppError::Internal(format!(
            "persistent version conflict recording delivery outcome for {}",
            reference
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SideEffectAction;
    use crate::test_utils::{MockDeliverer, MockTransactionStore};

    fn trigger_with(
        store: Arc<MockTransactionStore>,
        deliverer: Arc<MockDeliverer>,
    ) -> SideEffectTrigger {
        SideEffectTrigger::new(
            store as _,
            deliverer as _,
            TriggerConfig {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        )
    }

    fn tx_in(status: TransactionStatus) -> Transaction {
        let mut tx = Transaction::new(
            "PR-1".to_string(),
            100_000,
            "NGN".to_string(),
            SideEffectAction::DeliverBill,
        );
        tx.status = status;
        tx
    }

    #[test]
    fn test_trigger_config_default() {
        let config = TriggerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_already_delivered_row_is_a_noop() {
        let store = Arc::new(MockTransactionStore::new());
        let deliverer = Arc::new(MockDeliverer::new());
        let tx = tx_in(TransactionStatus::Delivered);
        store.insert(tx.clone());

        let trigger = trigger_with(store, deliverer.clone());
        let result = trigger.execute(&tx).await.unwrap();

        assert!(matches!(result, DeliveryResult::AlreadyDelivered { .. }));
        assert_eq!(deliverer.executions(), 0);
    }

    #[tokio::test]
    async fn test_paid_row_is_delivered_with_receipt() {
        let store = Arc::new(MockTransactionStore::new());
        let deliverer = Arc::new(MockDeliverer::new());
        let tx = tx_in(TransactionStatus::Paid);
        store.insert(tx.clone());

        let trigger = trigger_with(store.clone(), deliverer.clone());
        let result = trigger.execute(&tx).await.unwrap();

        match result {
            DeliveryResult::Delivered {
                receipt,
                transaction,
            } => {
                assert_eq!(receipt.receipt_id, "rcpt_PR-1");
                assert_eq!(transaction.status, TransactionStatus::Delivered);
                assert_eq!(transaction.delivery_attempts, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(deliverer.executions(), 1);
    }
}
