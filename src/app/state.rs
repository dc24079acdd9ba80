//! Application state management.

use std::sync::Arc;

use crate::domain::{Deliverer, GatewayClient, TransactionStore};
use crate::infra::WebhookSignatureVerifier;

use super::engine::{EngineConfig, ReconciliationEngine};
use super::trigger::{SideEffectTrigger, TriggerConfig};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub store: Arc<dyn TransactionStore>,
    pub gateway: Arc<dyn GatewayClient>,
    /// Verifies webhook signatures over the raw request body
    pub signature_verifier: Arc<WebhookSignatureVerifier>,
}

impl AppState {
    /// Create a new application state with default tuning
    #[must_use]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        gateway: Arc<dyn GatewayClient>,
        deliverer: Arc<dyn Deliverer>,
        signature_verifier: WebhookSignatureVerifier,
    ) -> Self {
        Self::with_configs(
            store,
            gateway,
            deliverer,
            signature_verifier,
            EngineConfig::default(),
            TriggerConfig::default(),
        )
    }

    /// Create a new application state with explicit engine and trigger tuning
    #[must_use]
    pub fn with_configs(
        store: Arc<dyn TransactionStore>,
        gateway: Arc<dyn GatewayClient>,
        deliverer: Arc<dyn Deliverer>,
        signature_verifier: WebhookSignatureVerifier,
        engine_config: EngineConfig,
        trigger_config: TriggerConfig,
    ) -> Self {
        let trigger = Arc::new(SideEffectTrigger::new(
            Arc::clone(&store),
            deliverer,
            trigger_config,
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            trigger,
            engine_config,
        ));
        Self {
            engine,
            store,
            gateway,
            signature_verifier: Arc::new(signature_verifier),
        }
    }
}
