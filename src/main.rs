//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use payment_reconciler::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use payment_reconciler::app::{
    AppState, EngineConfig, SweeperConfig, TriggerConfig, spawn_sweeper,
};
use payment_reconciler::domain::Deliverer;
use payment_reconciler::infra::{
    HttpDeliverer, HttpDelivererConfig, HttpGatewayClient, PostgresConfig, PostgresStore,
    RankedDeliverer, WebhookSignatureVerifier,
};

/// Application configuration
struct Config {
    database_url: String,
    gateway_api_url: String,
    gateway_secret_key: SecretString,
    /// Secret for webhook signature verification (optional; webhooks are
    /// rejected when unset)
    webhook_secret: Option<SecretString>,
    /// Primary fulfillment endpoint for the business side effect
    fulfillment_url: String,
    /// Fallback fulfillment endpoint, tried after the primary (optional)
    fulfillment_fallback_url: Option<String>,
    fulfillment_api_key: SecretString,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    /// Enable the background reconciliation sweep
    enable_sweeper: bool,
    /// Interval between sweep cycles in seconds (default: 300)
    sweeper_poll_interval_secs: u64,
    /// Rows processed per sweep pass (default: 50)
    sweeper_batch_size: i64,
    /// Pending transactions expire after this many seconds (default: 86400)
    verification_window_secs: i64,
    /// Side-effect delivery attempts per trigger execution (default: 3)
    delivery_max_attempts: i32,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let gateway_api_url =
            env::var("GATEWAY_API_URL").unwrap_or_else(|_| "https://api.paystack.co".to_string());
        let gateway_secret_key = env::var("GATEWAY_SECRET_KEY")
            .context("GATEWAY_SECRET_KEY not set")
            .map(SecretString::from)?;

        let webhook_secret = env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        let fulfillment_url =
            env::var("FULFILLMENT_URL").context("FULFILLMENT_URL not set")?;
        let fulfillment_fallback_url = env::var("FULFILLMENT_FALLBACK_URL")
            .ok()
            .filter(|u| !u.is_empty());
        let fulfillment_api_key = env::var("FULFILLMENT_API_KEY")
            .context("FULFILLMENT_API_KEY not set")
            .map(SecretString::from)?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let rate_limit_config = RateLimitConfig::from_env();

        let enable_sweeper = env::var("ENABLE_SWEEPER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let sweeper_poll_interval_secs = env::var("SWEEPER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        let sweeper_batch_size = env::var("SWEEPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let verification_window_secs = env::var("VERIFICATION_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24 * 60 * 60);

        let delivery_max_attempts = env::var("DELIVERY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        Ok(Self {
            database_url,
            gateway_api_url,
            gateway_secret_key,
            webhook_secret,
            fulfillment_url,
            fulfillment_fallback_url,
            fulfillment_api_key,
            host,
            port,
            enable_rate_limiting,
            rate_limit_config,
            enable_sweeper,
            sweeper_poll_interval_secs,
            sweeper_batch_size,
            verification_window_secs,
            delivery_max_attempts,
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Payment Reconciler v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("Initializing infrastructure...");

    let store = PostgresStore::new(&config.database_url, PostgresConfig::default()).await?;
    store.run_migrations().await?;
    info!("Database connected and migrations applied");

    let gateway = HttpGatewayClient::with_defaults(
        &config.gateway_api_url,
        config.gateway_secret_key.clone(),
    );
    info!("Gateway verification client created ({})", config.gateway_api_url);

    // Fulfillment backends, tried in order
    let mut candidates: Vec<Arc<dyn Deliverer>> = vec![Arc::new(HttpDeliverer::new(
        HttpDelivererConfig {
            fulfillment_url: config.fulfillment_url.clone(),
            request_timeout: Duration::from_secs(15),
        },
        config.fulfillment_api_key.clone(),
    ))];
    if let Some(ref fallback_url) = config.fulfillment_fallback_url {
        candidates.push(Arc::new(HttpDeliverer::new(
            HttpDelivererConfig {
                fulfillment_url: fallback_url.clone(),
                request_timeout: Duration::from_secs(15),
            },
            config.fulfillment_api_key.clone(),
        )));
        info!("Fulfillment fallback configured");
    }
    let deliverer = Arc::new(RankedDeliverer::new(candidates));
    info!("Delivery backends configured ({})", deliverer.len());

    let signature_verifier = match config.webhook_secret.clone() {
        Some(secret) => {
            info!("Webhook signature verification enabled");
            WebhookSignatureVerifier::new(secret)
        }
        None => {
            warn!("WEBHOOK_SECRET not set; all webhook deliveries will be rejected");
            WebhookSignatureVerifier::disabled()
        }
    };

    let engine_config = EngineConfig {
        verification_window_secs: config.verification_window_secs,
    };
    let trigger_config = TriggerConfig {
        max_attempts: config.delivery_max_attempts,
        ..Default::default()
    };

    let app_state = Arc::new(AppState::with_configs(
        Arc::new(store),
        Arc::new(gateway),
        deliverer,
        signature_verifier,
        engine_config,
        trigger_config,
    ));

    // Start the reconciliation sweep if enabled
    let sweeper_shutdown_tx = if config.enable_sweeper {
        let sweeper_config = SweeperConfig {
            poll_interval: Duration::from_secs(config.sweeper_poll_interval_secs),
            batch_size: config.sweeper_batch_size,
            enabled: true,
        };
        let (_handle, shutdown_tx) = spawn_sweeper(Arc::clone(&app_state.engine), sweeper_config);
        info!(
            "Reconciliation sweep started (poll: {}s, batch: {})",
            config.sweeper_poll_interval_secs, config.sweeper_batch_size
        );
        Some(shutdown_tx)
    } else {
        info!("Reconciliation sweep disabled");
        None
    };

    let router = if config.enable_rate_limiting {
        info!("Rate limiting enabled");
        create_router_with_rate_limit(app_state, config.rate_limit_config)
    } else {
        info!("Rate limiting disabled");
        create_router(app_state)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server starting on http://{}", addr);
    info!("Swagger UI available at http://{}/swagger-ui", addr);
    info!("OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tx) = sweeper_shutdown_tx {
        let _ = tx.send(true);
    }

    info!("Server shutdown complete");
    Ok(())
}
