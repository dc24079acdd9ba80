//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AppError, Deliverer, DeliveryError, DeliveryReceipt, GatewayClient, GatewayError,
    PaginatedResponse, StoreError, Transaction, TransactionMutation, TransactionStatus,
    TransactionStore, VerificationResult,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

/// In-memory transaction store for testing.
///
/// Honors the version check in `compare_and_swap`, so concurrency tests
/// exercise real conflict behavior.
pub struct MockTransactionStore {
    storage: Arc<Mutex<HashMap<String, Transaction>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MockTransactionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(HashMap::new())),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Seed the store with a transaction (for testing)
    pub fn insert(&self, tx: Transaction) {
        self.storage
            .lock()
            .unwrap()
            .insert(tx.reference.clone(), tx);
    }

    /// Get all stored transactions (for testing)
    pub fn get_all(&self) -> Vec<Transaction> {
        self.storage.lock().unwrap().values().cloned().collect()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Store(StoreError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStore for MockTransactionStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Store(StoreError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn create(&self, tx: &Transaction) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        if storage.contains_key(&tx.reference) {
            return Err(AppError::Store(StoreError::Duplicate(tx.reference.clone())));
        }
        storage.insert(tx.reference.clone(), tx.clone());
        Ok(tx.clone())
    }

    async fn get(&self, reference: &str) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        Ok(storage.get(reference).cloned())
    }

    async fn get_by_gateway_transaction_id(
        &self,
        id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        Ok(storage
            .values()
            .find(|tx| tx.gateway_transaction_id.as_deref() == Some(id))
            .cloned())
    }

    async fn compare_and_swap(
        &self,
        reference: &str,
        expected_version: i32,
        mutation: &TransactionMutation,
    ) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        let tx = storage
            .get_mut(reference)
            .ok_or_else(|| AppError::Store(StoreError::NotFound(reference.to_string())))?;

        if tx.version != expected_version {
            return Err(AppError::Store(StoreError::VersionConflict {
                reference: reference.to_string(),
                expected: expected_version,
            }));
        }

        mutation.apply(tx);
        Ok(tx.clone())
    }

    async fn list(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<Transaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<Transaction> = storage.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let items = if let Some(cursor_ref) = cursor {
            match items.iter().position(|i| i.reference == cursor_ref) {
                Some(p) => items.into_iter().skip(p + 1).collect(),
                None => {
                    return Err(AppError::Validation(
                        crate::domain::ValidationError::InvalidField {
                            field: "cursor".to_string(),
                            message: "Invalid cursor".to_string(),
                        },
                    ));
                }
            }
        } else {
            items
        };

        let limit = limit.clamp(1, 100) as usize;
        let has_more = items.len() > limit;
        let items: Vec<Transaction> = items.into_iter().take(limit).collect();
        let next_cursor = if has_more {
            items.last().map(|i| i.reference.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(items, next_cursor, has_more))
    }

    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<Transaction> = storage
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.updated_at < before)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(items.into_iter().take(limit as usize).collect())
    }

    async fn list_undelivered(&self, limit: i64) -> Result<Vec<Transaction>, AppError> {
        self.check_should_fail()?;
        let storage = self.storage.lock().unwrap();
        let mut items: Vec<Transaction> = storage
            .values()
            .filter(|tx| {
                matches!(
                    tx.status,
                    TransactionStatus::Paid | TransactionStatus::DeliveryFailed
                )
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(items.into_iter().take(limit as usize).collect())
    }
}

/// Mock gateway client with a programmable verification result
pub struct MockGatewayClient {
    result: Mutex<Option<VerificationResult>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    verify_calls: AtomicUsize,
}

impl MockGatewayClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            result: Mutex::new(None),
            config,
            is_healthy: AtomicBool::new(true),
            verify_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Program the result the next verification calls will return
    pub fn set_result(&self, result: VerificationResult) {
        *self.result.lock().unwrap() = Some(result);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Number of verification calls made (for testing)
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    fn verify(&self) -> Result<VerificationResult, AppError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Gateway(GatewayError::Unavailable(msg)));
        }
        self.result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::Gateway(GatewayError::Malformed("No result programmed".to_string())))
    }
}

impl Default for MockGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayClient for MockGatewayClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Gateway(GatewayError::Unavailable(
                "Unhealthy".to_string(),
            )));
        }
        Ok(())
    }

    async fn verify_by_reference(
        &self,
        _reference: &str,
    ) -> Result<VerificationResult, AppError> {
        self.verify()
    }

    async fn verify_by_transaction_id(&self, _id: &str) -> Result<VerificationResult, AppError> {
        self.verify()
    }
}

/// Mock deliverer that fails a scripted number of times before succeeding
pub struct MockDeliverer {
    /// Attempts that fail before the first success
    failures_before_success: usize,
    /// Whether scripted failures are permanent instead of transient
    permanent: bool,
    executions: AtomicUsize,
}

impl MockDeliverer {
    /// A deliverer that succeeds on the first attempt
    #[must_use]
    pub fn new() -> Self {
        Self::failing_times(0)
    }

    /// A deliverer that fails transiently `n` times, then succeeds
    #[must_use]
    pub fn failing_times(n: usize) -> Self {
        Self {
            failures_before_success: n,
            permanent: false,
            executions: AtomicUsize::new(0),
        }
    }

    /// A deliverer that always fails permanently
    #[must_use]
    pub fn permanent_failure() -> Self {
        Self {
            failures_before_success: usize::MAX,
            permanent: true,
            executions: AtomicUsize::new(0),
        }
    }

    /// Total delivery attempts observed (for testing)
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Default for MockDeliverer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Deliverer for MockDeliverer {
    async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError> {
        let attempt = self.executions.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            if self.permanent {
                return Err(AppError::Delivery(DeliveryError::Permanent(
                    "Mock permanent failure".to_string(),
                )));
            }
            return Err(AppError::Delivery(DeliveryError::Transient(
                "Mock transient failure".to_string(),
            )));
        }
        Ok(DeliveryReceipt {
            receipt_id: format!("rcpt_{}", tx.reference),
            backend: self.name().to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
