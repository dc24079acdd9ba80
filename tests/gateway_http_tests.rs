//! Gateway verification client tests against a wiremock server.

use std::time::Duration;

use secrecy::SecretString;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use payment_reconciler::domain::{AppError, GatewayClient, GatewayError, GatewayStatus};
use payment_reconciler::infra::{GatewayConfig, HttpGatewayClient};

fn test_client(base_url: &str) -> HttpGatewayClient {
    HttpGatewayClient::new(
        base_url,
        SecretString::from("sk_test_secret".to_string()),
        GatewayConfig {
            request_timeout: Duration::from_secs(2),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
    )
}

fn success_envelope(amount: i64) -> serde_json::Value {
    serde_json::json!({
        "status": true,
        "message": "Verification successful",
        "data": {
            "status": "success",
            "amount": amount,
            "currency": "NGN",
            "id": 1289004233i64,
            "customer": {"customer_code": "CUS_abc123"}
        }
    })
}

#[tokio::test]
async fn test_verify_by_reference_parses_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .and(header("authorization", "Bearer sk_test_secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_envelope(100_000)))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await.unwrap();

    assert_eq!(result.status, GatewayStatus::Success);
    assert_eq!(result.amount, 100_000);
    assert_eq!(result.currency, "NGN");
    assert_eq!(result.gateway_transaction_id, Some("1289004233".to_string()));
    assert_eq!(result.customer_ref, Some("CUS_abc123".to_string()));
}

#[tokio::test]
async fn test_transient_failure_is_retried_then_succeeds() {
    let server = MockServer::start().await;

    // First attempt hits a 500, the retry gets the real response
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_envelope(100_000)))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await.unwrap();
    assert_eq!(result.status, GatewayStatus::Success);
}

#[tokio::test]
async fn test_exhausted_retries_surface_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await;
    assert!(matches!(
        result,
        Err(AppError::Gateway(GatewayError::Unavailable(_)))
    ));
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await;
    assert!(matches!(
        result,
        Err(AppError::Gateway(GatewayError::Auth(_)))
    ));
}

#[tokio::test]
async fn test_unknown_reference_maps_to_pending() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-unknown"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-unknown").await.unwrap();
    assert_eq!(result.status, GatewayStatus::Pending);
    assert!(result.gateway_transaction_id.is_none());
}

#[tokio::test]
async fn test_failed_charge_maps_to_failed() {
    let server = MockServer::start().await;
    let envelope = serde_json::json!({
        "status": true,
        "message": "Verification successful",
        "data": {
            "status": "abandoned",
            "amount": 100_000,
            "currency": "NGN",
            "id": 77i64,
            "customer": null
        }
    });
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope))
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await.unwrap();
    assert_eq!(result.status, GatewayStatus::Failed);
}

#[tokio::test]
async fn test_malformed_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/verify/PR-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_reference("PR-1").await;
    assert!(matches!(
        result,
        Err(AppError::Gateway(GatewayError::Malformed(_)))
    ));
}

#[tokio::test]
async fn test_verify_by_transaction_id_uses_id_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transaction/1289004233"))
        .respond_with(ResponseTemplate::new(200).set_body_json(success_envelope(50_000)))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.verify_by_transaction_id("1289004233").await.unwrap();
    assert_eq!(result.status, GatewayStatus::Success);
    assert_eq!(result.amount, 50_000);
}
