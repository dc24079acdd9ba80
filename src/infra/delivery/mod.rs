//! Side-effect delivery backends.
//!
//! Interchangeable fulfillment backends are modelled as a ranked list of
//! `Deliverer` candidates tried in order, first success short-circuiting the
//! rest. A permanent failure from any candidate stops the fallthrough;
//! retrying a different backend after "invalid recipient" would not help.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::{AppError, Deliverer, DeliveryError, DeliveryReceipt, Transaction};

/// Ordered list of delivery candidates
pub struct RankedDeliverer {
    candidates: Vec<Arc<dyn Deliverer>>,
}

impl RankedDeliverer {
    #[must_use]
    pub fn new(candidates: Vec<Arc<dyn Deliverer>>) -> Self {
        Self { candidates }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[async_trait]
impl Deliverer for RankedDeliverer {
    #[instrument(skip(self, tx), fields(reference = %tx.reference))]
    async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError> {
        let mut last_error: Option<AppError> = None;

        for candidate in &self.candidates {
            match candidate.deliver(tx).await {
                Ok(receipt) => {
                    debug!(backend = %candidate.name(), "Delivery succeeded");
                    return Ok(receipt);
                }
                Err(AppError::Delivery(DeliveryError::Permanent(msg))) => {
                    warn!(backend = %candidate.name(), error = %msg, "Permanent delivery failure");
                    return Err(AppError::Delivery(DeliveryError::Permanent(msg)));
                }
                Err(e) => {
                    warn!(backend = %candidate.name(), error = %e, "Candidate failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::Delivery(DeliveryError::Permanent(
                "no delivery backends configured".to_string(),
            ))
        }))
    }

    fn name(&self) -> &'static str {
        "ranked"
    }
}

/// Configuration for an HTTP fulfillment backend
#[derive(Debug, Clone)]
pub struct HttpDelivererConfig {
    pub fulfillment_url: String,
    pub request_timeout: Duration,
}

/// Posts the business effect to an external fulfillment endpoint
pub struct HttpDeliverer {
    config: HttpDelivererConfig,
    api_key: SecretString,
    http_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct FulfillmentResponse {
    receipt_id: Option<String>,
}

impl HttpDeliverer {
    pub fn new(config: HttpDelivererConfig, api_key: SecretString) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            api_key,
            http_client,
        }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    #[instrument(skip(self, tx), fields(reference = %tx.reference, action = %tx.action))]
    async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError> {
        let body = serde_json::json!({
            "reference": tx.reference,
            "action": tx.action.as_str(),
            "amount": tx.amount,
            "currency": tx.currency,
            "idempotency_token": tx.idempotency_token,
        });

        let response = self
            .http_client
            .post(&self.config.fulfillment_url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Delivery(DeliveryError::Transient(format!("timeout: {}", e)))
                } else {
                    AppError::Delivery(DeliveryError::Transient(e.to_string()))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::Delivery(DeliveryError::Transient(format!(
                "fulfillment backend returned {}",
                status
            ))));
        }
        if status.is_client_error() {
            // Invalid recipient, insufficient upstream balance, bad request:
            // retrying the identical call cannot succeed.
            return Err(AppError::Delivery(DeliveryError::Permanent(format!(
                "fulfillment backend rejected request: {}",
                status
            ))));
        }

        let receipt_id = response
            .json::<FulfillmentResponse>()
            .await
            .ok()
            .and_then(|r| r.receipt_id)
            .unwrap_or_else(|| format!("rcpt_{}", Uuid::new_v4()));

        Ok(DeliveryReceipt {
            receipt_id,
            backend: self.name().to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SideEffectAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDeliverer {
        result: Result<(), DeliveryError>,
        calls: AtomicUsize,
        label: &'static str,
    }

    impl ScriptedDeliverer {
        fn ok(label: &'static str) -> Self {
            Self {
                result: Ok(()),
                calls: AtomicUsize::new(0),
                label,
            }
        }

        fn failing(label: &'static str, error: DeliveryError) -> Self {
            Self {
                result: Err(error),
                calls: AtomicUsize::new(0),
                label,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Deliverer for ScriptedDeliverer {
        async fn deliver(&self, tx: &Transaction) -> Result<DeliveryReceipt, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(()) => Ok(DeliveryReceipt {
                    receipt_id: format!("rcpt_{}_{}", self.label, tx.reference),
                    backend: self.label.to_string(),
                }),
                Err(DeliveryError::Transient(msg)) => {
                    Err(AppError::Delivery(DeliveryError::Transient(msg.clone())))
                }
                Err(DeliveryError::Permanent(msg)) => {
                    Err(AppError::Delivery(DeliveryError::Permanent(msg.clone())))
                }
                Err(DeliveryError::InFlight(msg)) => {
                    Err(AppError::Delivery(DeliveryError::InFlight(msg.clone())))
                }
            }
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    fn test_tx() -> Transaction {
        Transaction::new(
            "PR-1".to_string(),
            100_000,
            "NGN".to_string(),
            SideEffectAction::DeliverBill,
        )
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let primary = Arc::new(ScriptedDeliverer::ok("primary"));
        let fallback = Arc::new(ScriptedDeliverer::ok("fallback"));
        let ranked = RankedDeliverer::new(vec![primary.clone(), fallback.clone()]);

        let receipt = ranked.deliver(&test_tx()).await.unwrap();
        assert_eq!(receipt.backend, "primary");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_through() {
        let primary = Arc::new(ScriptedDeliverer::failing(
            "primary",
            DeliveryError::Transient("502".to_string()),
        ));
        let fallback = Arc::new(ScriptedDeliverer::ok("fallback"));
        let ranked = RankedDeliverer::new(vec![primary.clone(), fallback.clone()]);

        let receipt = ranked.deliver(&test_tx()).await.unwrap();
        assert_eq!(receipt.backend, "fallback");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_fallthrough() {
        let primary = Arc::new(ScriptedDeliverer::failing(
            "primary",
            DeliveryError::Permanent("invalid recipient".to_string()),
        ));
        let fallback = Arc::new(ScriptedDeliverer::ok("fallback"));
        let ranked = RankedDeliverer::new(vec![primary.clone(), fallback.clone()]);

        let result = ranked.deliver(&test_tx()).await;
        assert!(matches!(
            result,
            Err(AppError::Delivery(DeliveryError::Permanent(_)))
        ));
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_transient_failures_surface_last_error() {
        let a = Arc::new(ScriptedDeliverer::failing(
            "a",
            DeliveryError::Transient("503".to_string()),
        ));
        let b = Arc::new(ScriptedDeliverer::failing(
            "b",
            DeliveryError::Transient("504".to_string()),
        ));
        let ranked = RankedDeliverer::new(vec![a, b]);

        let result = ranked.deliver(&test_tx()).await;
        match result {
            Err(AppError::Delivery(DeliveryError::Transient(msg))) => {
                assert!(msg.contains("504"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_candidate_list_is_permanent() {
        let ranked = RankedDeliverer::new(vec![]);
        let result = ranked.deliver(&test_tx()).await;
        assert!(matches!(
            result,
            Err(AppError::Delivery(DeliveryError::Permanent(_)))
        ));
    }
}
