//! HMAC-SHA256 payload signing
//!
//! The signature covers `{timestamp}.{body}` so a captured request cannot be
//! replayed with a fresh timestamp. Emitted as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Default replay window accepted by [`verify`]
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("Signing secret is not configured")]
    MissingSecret,
    #[error("Signing secret is malformed: {0}")]
    MalformedSecret(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Header value, `sha256=<hex>`
    pub value: String,
    /// Unix seconds covered by the signature
    pub timestamp: i64,
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SigningError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError::MalformedSecret(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

fn usable_secret(secret: Option<&str>) -> Result<&str, SigningError> {
    let secret = secret.ok_or(SigningError::MissingSecret)?;
    if secret.trim().is_empty() {
        return Err(SigningError::MalformedSecret("empty or whitespace-only".into()));
    }
    Ok(secret)
}

/// Sign a payload. A missing, empty or whitespace-only secret is an error.
pub fn sign(secret: Option<&str>, payload: &[u8], timestamp: i64) -> Result<Signature, SigningError> {
    let secret = usable_secret(secret)?;
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(Signature {
        value: format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())),
        timestamp,
    })
}

/// Check a received signature header.
///
/// Rejects timestamps further than `tolerance_seconds` from `now` in either
/// direction. The digest comparison is constant-time.
pub fn verify(
    header: &str,
    secret: &str,
    timestamp: i64,
    payload: &[u8],
    now: i64,
    tolerance_seconds: i64,
) -> bool {
    if now.abs_diff(timestamp) > tolerance_seconds.max(0) as u64 {
        return false;
    }
    let Some(hex_digest) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(secret) = usable_secret(Some(secret)) else {
        return false;
    };
    match mac_for(secret, timestamp, payload) {
        Ok(mac) => mac.verify_slice(&expected).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const TS: i64 = 1_700_000_000;
    const BODY: &[u8] = br#"{"id":1}"#;

    #[test]
    fn test_known_vector() {
        let sig = sign(Some(SECRET), BODY, TS).unwrap();
        assert_eq!(
            sig.value,
            "sha256=2f441ba4b3b2d50d28a9ab9d9fd8880376ecd1eb5d0435401553f5d8d0a5dcf8"
        );
        assert_eq!(sig.timestamp, TS);
    }

    #[test]
    fn test_signature_depends_on_timestamp() {
        let a = sign(Some(SECRET), BODY, TS).unwrap();
        let b = sign(Some(SECRET), BODY, TS + 1).unwrap();
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn test_missing_secret() {
        assert_eq!(sign(None, BODY, TS), Err(SigningError::MissingSecret));
    }

    #[test]
    fn test_blank_secret_is_malformed() {
        for secret in ["", "   ", "\t\n"] {
            assert!(matches!(
                sign(Some(secret), BODY, TS),
                Err(SigningError::MalformedSecret(_))
            ));
        }
    }

    #[test]
    fn test_verify_accepts_own_signature() {
        let sig = sign(Some(SECRET), BODY, TS).unwrap();
        assert!(verify(&sig.value, SECRET, TS, BODY, TS + 10, DEFAULT_TOLERANCE_SECONDS));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let sig = sign(Some(SECRET), BODY, TS).unwrap();
        assert!(!verify(&sig.value, SECRET, TS, br#"{"id":2}"#, TS, 300));
        assert!(!verify(&sig.value, "other", TS, BODY, TS, 300));
        assert!(!verify(&sig.value, SECRET, TS + 1, BODY, TS, 300));
        assert!(!verify("sha256=zz", SECRET, TS, BODY, TS, 300));
        assert!(!verify(sig.value.trim_start_matches(SIGNATURE_PREFIX), SECRET, TS, BODY, TS, 300));
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let sig = sign(Some(SECRET), BODY, TS).unwrap();
        assert!(!verify(&sig.value, SECRET, TS, BODY, TS + 301, 300));
        assert!(verify(&sig.value, SECRET, TS, BODY, TS + 300, 300));
    }

    #[test]
    fn test_verify_extreme_timestamps() {
        assert!(!verify("sha256=00", SECRET, i64::MIN, BODY, TS, 300));
        assert!(!verify("sha256=00", SECRET, i64::MAX, BODY, TS, 300));
        assert!(!verify("sha256=00", SECRET, i64::MAX, BODY, i64::MIN, i64::MAX));

        let sig = sign(Some(SECRET), BODY, i64::MIN).unwrap();
        assert!(!verify(&sig.value, SECRET, i64::MIN, BODY, TS, 300));
        assert!(verify(&sig.value, SECRET, i64::MIN, BODY, i64::MIN, 0));
    }

    #[test]
    fn test_verify_negative_tolerance_allows_exact_match_only() {
        let sig = sign(Some(SECRET), BODY, TS).unwrap();
        assert!(verify(&sig.value, SECRET, TS, BODY, TS, -5));
        assert!(!verify(&sig.value, SECRET, TS, BODY, TS + 1, -5));
    }
}
