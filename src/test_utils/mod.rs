//! Shared test doubles, compiled for tests and the `test-utils` feature.

pub mod mocks;

pub use mocks::{MockConfig, MockDeliverer, MockGatewayClient, MockTransactionStore};
