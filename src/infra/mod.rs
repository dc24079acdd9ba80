//! Infrastructure layer: concrete adapters behind the domain traits.

pub mod database;
pub mod delivery;
pub mod gateway;
pub mod signature;

pub use database::postgres::{PostgresConfig, PostgresStore};
pub use delivery::{HttpDeliverer, HttpDelivererConfig, RankedDeliverer};
pub use gateway::{GatewayConfig, HttpGatewayClient};
pub use signature::WebhookSignatureVerifier;
