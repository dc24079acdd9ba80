//! Webhook signature verification.
//!
//! The HMAC is computed over the exact raw bytes received, never a
//! re-serialized form, since re-serialization can reorder keys and
//! invalidate the digest.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use tracing::debug;

type HmacSha512 = Hmac<Sha512>;

/// Verifies the keyed hash the gateway attaches to each webhook delivery.
///
/// An absent or invalid signature is a normal rejection path, never a fault:
/// `verify` returns `false` for every malformed input and never errors.
pub struct WebhookSignatureVerifier {
    secret: Option<SecretString>,
}

impl WebhookSignatureVerifier {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret: Some(secret),
        }
    }

    /// A verifier with no secret configured; rejects everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { secret: None }
    }

    /// Check `provided` (hex-encoded HMAC-SHA512) against the raw body.
    /// Comparison is constant-time via `Mac::verify_slice`.
    #[must_use]
    pub fn verify(&self, raw_body: &[u8], provided: &str) -> bool {
        let Some(ref secret) = self.secret else {
            debug!("No webhook secret configured; rejecting event");
            return false;
        };

        let Ok(expected) = hex::decode(provided.trim()) else {
            debug!("Signature header is not valid hex");
            return false;
        };

        let Ok(mut mac) = HmacSha512::new_from_slice(secret.expose_secret().as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        mac.verify_slice(&expected).is_ok()
    }
}
