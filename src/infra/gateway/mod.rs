//! Outbound gateway verification clients.

pub mod http;

pub use http::{GatewayConfig, HttpGatewayClient};
