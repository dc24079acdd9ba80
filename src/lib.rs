//! Payment event reconciliation core.
//!
//! Gateway webhooks are hints, not facts: every `paid` transition is backed
//! by an authoritative verification call, every business side effect runs
//! at most once, and concurrent writers are serialized by optimistic
//! compare-and-swap on a per-transaction version.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
