//! Signing secrets and payload signatures.
//!
//! - Secret generation from the OS RNG
//! - HMAC-SHA256 over `{timestamp}.{body}`, hex encoded

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

/// Bytes of entropy in a generated secret.
pub const SECRET_BYTES: usize = 32;

/// Prefix of the `X-Webhook-Signature` header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Generate a new hex-encoded signing secret.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compute the hex HMAC-SHA256 of `{timestamp}.{body}`.
#[must_use]
pub fn compute_hmac_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };

    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    hex::encode(mac.finalize().into_bytes())
}

/// Header value for `X-Webhook-Signature`.
#[must_use]
pub fn signature_header(secret: &str, timestamp: &str, body: &[u8]) -> String {
    format!(
        "{SIGNATURE_PREFIX}{}",
        compute_hmac_signature(secret, timestamp, body)
    )
}

/// Verify a signature using constant-time comparison.
///
/// Accepts the bare hex digest or the `sha256=` header form.
#[must_use]
pub fn verify_hmac_signature(expected: &str, secret: &str, timestamp: &str, body: &[u8]) -> bool {
    let expected = expected.strip_prefix(SIGNATURE_PREFIX).unwrap_or(expected);
    let computed = compute_hmac_signature(secret, timestamp, body);
    constant_time_eq(expected.as_bytes(), computed.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
