//! HTTP gateway verification client.
//!
//! Pulls the authoritative transaction state from the payment gateway's
//! REST API. Network failures and 5xx responses are retried with bounded
//! exponential backoff before surfacing `GatewayError::Unavailable`, which
//! leaves the transaction untouched for a later reconciliation attempt.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::domain::{
    AppError, GatewayClient, GatewayError, GatewayStatus, VerificationResult,
};

/// Retry and timeout policy for gateway calls
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Total attempts including the first (default: 3)
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub backoff_base: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Bearer-token authenticated client for the gateway verification API
pub struct HttpGatewayClient {
    base_url: String,
    secret_key: SecretString,
    http_client: reqwest::Client,
    config: GatewayConfig,
}

/// Envelope every gateway response is wrapped in
#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    status: bool,
    #[allow(dead_code)]
    message: Option<String>,
    data: Option<GatewayTransactionData>,
}

#[derive(Debug, Deserialize)]
struct GatewayTransactionData {
    status: String,
    amount: i64,
    currency: String,
    id: Option<i64>,
    customer: Option<GatewayCustomer>,
}

#[derive(Debug, Deserialize)]
struct GatewayCustomer {
    customer_code: Option<String>,
}

impl HttpGatewayClient {
    pub fn new(base_url: &str, secret_key: SecretString, config: GatewayConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key,
            http_client,
            config,
        }
    }

    pub fn with_defaults(base_url: &str, secret_key: SecretString) -> Self {
        Self::new(base_url, secret_key, GatewayConfig::default())
    }

    /// GET `path` with bounded-backoff retries on transient failures.
    async fn get_with_retry(&self, path: &str) -> Result<VerificationResult, AppError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let backoff = self.config.backoff_base * 2u32.pow(attempt - 2);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Retrying gateway call");
                tokio::time::sleep(backoff).await;
            }

            let response = self
                .http_client
                .get(&url)
                .bearer_auth(self.secret_key.expose_secret())
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        return Err(AppError::Gateway(GatewayError::Auth(format!(
                            "gateway returned {}",
                            status
                        ))));
                    }

                    // Unknown reference: the gateway has not seen a charge
                    // attempt yet. Reported as pending so the transaction is
                    // left unchanged.
                    if status == reqwest::StatusCode::NOT_FOUND {
                        debug!(url = %url, "Gateway does not know this transaction yet");
                        return Ok(VerificationResult {
                            status: GatewayStatus::Pending,
                            amount: 0,
                            currency: String::new(),
                            gateway_transaction_id: None,
                            customer_ref: None,
                        });
                    }

                    if status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    {
                        last_error = format!("gateway returned {}", status);
                        warn!(attempt, status = %status, "Transient gateway failure");
                        continue;
                    }

                    let envelope = resp.json::<GatewayEnvelope>().await.map_err(|e| {
                        AppError::Gateway(GatewayError::Malformed(e.to_string()))
                    })?;
                    return Self::envelope_to_result(envelope);
                }
                Err(e) if e.is_timeout() => {
                    last_error = format!("request timed out: {}", e);
                    warn!(attempt, error = %e, "Gateway request timed out");
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(attempt, error = %e, "Gateway request failed");
                }
            }
        }

        Err(AppError::Gateway(GatewayError::Unavailable(format!(
            "{} attempts exhausted: {}",
            self.config.max_attempts, last_error
        ))))
    }

    fn envelope_to_result(envelope: GatewayEnvelope) -> Result<VerificationResult, AppError> {
        let data = match (envelope.status, envelope.data) {
            (true, Some(data)) => data,
            _ => {
                return Err(AppError::Gateway(GatewayError::Malformed(
                    "response envelope missing transaction data".to_string(),
                )));
            }
        };

        let status = match data.status.as_str() {
            "success" | "successful" => GatewayStatus::Success,
            "failed" | "abandoned" | "reversed" | "cancelled" => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        };

        Ok(VerificationResult {
            status,
            amount: data.amount,
            currency: data.currency,
            gateway_transaction_id: data.id.map(|id| id.to_string()),
            customer_ref: data.customer.and_then(|c| c.customer_code),
        })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let response = self
            .http_client
            .get(&self.base_url)
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await
            .map_err(|e| AppError::Gateway(GatewayError::Unavailable(e.to_string())))?;

        if response.status().is_server_error() {
            return Err(AppError::Gateway(GatewayError::Unavailable(format!(
                "gateway returned {}",
                response.status()
            ))));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn verify_by_reference(
        &self,
        reference: &str,
    ) -> Result<VerificationResult, AppError> {
        self.get_with_retry(&format!("/transaction/verify/{}", reference))
            .await
    }

    #[instrument(skip(self))]
    async fn verify_by_transaction_id(&self, id: &str) -> Result<VerificationResult, AppError> {
        self.get_with_retry(&format!("/transaction/{}", id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_envelope_status_mapping() {
        for (raw, expected) in [
            ("success", GatewayStatus::Success),
            ("successful", GatewayStatus::Success),
            ("failed", GatewayStatus::Failed),
            ("abandoned", GatewayStatus::Failed),
            ("reversed", GatewayStatus::Failed),
            ("pending", GatewayStatus::Pending),
            ("ongoing", GatewayStatus::Pending),
        ] {
            let envelope = GatewayEnvelope {
                status: true,
                message: None,
                data: Some(GatewayTransactionData {
                    status: raw.to_string(),
                    amount: 100_000,
                    currency: "NGN".to_string(),
                    id: Some(42),
                    customer: None,
                }),
            };
            let result = HttpGatewayClient::envelope_to_result(envelope).unwrap();
            assert_eq!(result.status, expected, "for raw status {raw:?}");
            assert_eq!(result.gateway_transaction_id, Some("42".to_string()));
        }
    }

    #[test]
    fn test_envelope_without_data_is_malformed() {
        let envelope = GatewayEnvelope {
            status: false,
            message: Some("Transaction not found".to_string()),
            data: None,
        };
        let result = HttpGatewayClient::envelope_to_result(envelope);
        assert!(matches!(
            result,
            Err(AppError::Gateway(GatewayError::Malformed(_)))
        ));
    }
}
