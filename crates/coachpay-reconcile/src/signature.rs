//! HMAC-SHA256 signatures over raw webhook bodies.
//!
//! The gateway sends the hex digest in the `signature` header, optionally
//! prefixed with `sha256=`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "signature";

pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let trimmed = header.trim();
    let hex_sig = trimmed.strip_prefix("sha256=").unwrap_or(trimmed);
    if hex_sig.is_empty() {
        return None;
    }
    hex::decode(hex_sig).ok()
}

/// Raw HMAC digest of `payload`, or `None` if `secret` is not a usable key.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Option<Vec<u8>> {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return None;
    };
    mac.update(payload);
    Some(mac.finalize().into_bytes().to_vec())
}

pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Constant-time check of `signature_header` against the body.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
