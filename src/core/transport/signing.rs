// src/core/transport/signing.rs

//! HMAC-SHA256 request signing, grounded on the same `hmac`/`sha2` pairing
//! the cluster's secure gossip layer uses for message authentication.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_HEADER_NODE_ID: &str = "X-MaxIOFS-Node-ID";
pub const AUTH_HEADER_TIMESTAMP: &str = "X-MaxIOFS-Timestamp";
pub const AUTH_HEADER_NONCE: &str = "X-MaxIOFS-Nonce";
pub const AUTH_HEADER_SIGNATURE: &str = "X-MaxIOFS-Signature";

/// Clock skew tolerance for verifying a request's timestamp (spec.md §6.1:
/// "a reasonable choice is ±5 minutes").
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 300;

/// Computes `hex(HMAC-SHA256(node_token, "{METHOD}\n{PATH}\n{TIMESTAMP}\n{NONCE}"))`.
/// The request body is deliberately excluded (spec.md §4.1, §9 Open Questions).
pub fn sign(node_token: &str, method: &str, path: &str, timestamp: i64, nonce: &str) -> String {
    let message = format!("{method}\n{path}\n{timestamp}\n{nonce}");
    let mut mac =
        HmacSha256::new_from_slice(node_token.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Recomputes the HMAC and compares it to the claimed signature in
/// constant time. Also rejects timestamps outside the skew tolerance.
pub fn verify(
    node_token: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    claimed_signature: &str,
    now: i64,
) -> bool {
    if (now - timestamp).abs() > CLOCK_SKEW_TOLERANCE_SECS {
        return false;
    }

    let message = format!("{method}\n{path}\n{timestamp}\n{nonce}");
    let mut mac = match HmacSha256::new_from_slice(node_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(message.as_bytes());

    let Ok(claimed_bytes) = hex::decode(claimed_signature) else {
        return false;
    };
    mac.verify_slice(&claimed_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_with_same_token_succeeds() {
        let sig = sign("secret-token", "POST", "/api/internal/cluster/tenant-sync", 1_000, "abc");
        assert!(verify("secret-token", "POST", "/api/internal/cluster/tenant-sync", 1_000, "abc", &sig, 1_000));
    }

    #[test]
    fn verify_with_any_other_token_fails() {
        let sig = sign("secret-token", "POST", "/path", 1_000, "abc");
        assert!(!verify("different-token", "POST", "/path", 1_000, "abc", &sig, 1_000));
    }

    #[test]
    fn verify_rejects_timestamps_outside_skew_tolerance() {
        let sig = sign("secret-token", "GET", "/health", 1_000, "n");
        assert!(!verify("secret-token", "GET", "/health", 1_000, "n", &sig, 1_000 + 301));
    }

    #[test]
    fn different_fields_produce_different_signatures() {
        let base = sign("tok", "POST", "/x", 1, "n");
        assert_ne!(base, sign("tok", "GET", "/x", 1, "n"));
        assert_ne!(base, sign("tok", "POST", "/y", 1, "n"));
        assert_ne!(base, sign("tok", "POST", "/x", 2, "n"));
        assert_ne!(base, sign("tok", "POST", "/x", 1, "m"));
    }
}
