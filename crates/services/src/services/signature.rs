use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;

use super::secret::SecretStore;

/// Header value prefix; the signature itself is base64 HMAC-SHA256 over the
/// exact raw payload bytes.
pub const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureVerification {
    Valid,
    Invalid(String),
    Skipped(String),
}

/// Validates inbound payload authenticity. Fails closed: callers must block
/// admission on `Invalid` and on `Skipped`.
pub struct SignatureVerifier {
    secrets: SecretStore,
    // Keyed HMAC primitive cached per secret value.
    mac_cache: Mutex<Option<(String, HmacSha256)>>,
}

impl SignatureVerifier {
    pub fn new(secrets: SecretStore) -> Self {
        Self {
            secrets,
            mac_cache: Mutex::new(None),
        }
    }

    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> SignatureVerification {
        if payload.is_empty() {
            return SignatureVerification::Invalid("empty payload".to_string());
        }

        let Some(header) = signature_header.map(str::trim).filter(|value| !value.is_empty())
        else {
            return SignatureVerification::Invalid("missing signature".to_string());
        };

        let Some(signature) = header.strip_prefix(SIGNATURE_PREFIX) else {
            return SignatureVerification::Invalid("malformed signature header".to_string());
        };

        let Some(secret) = self.secrets.get() else {
            tracing::error!("webhook signature verification disabled; no secret configured");
            return SignatureVerification::Skipped("secret not configured".to_string());
        };

        let expected = self.compute_signature(payload, secret.expose_secret());
        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            SignatureVerification::Valid
        } else {
            SignatureVerification::Invalid("signature mismatch".to_string())
        }
    }

    fn compute_signature(&self, payload: &[u8], secret: &str) -> String {
        let mut mac = self.keyed_mac(secret);
        mac.update(payload);
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn keyed_mac(&self, secret: &str) -> HmacSha256 {
        let mut cache = self.mac_cache.lock().unwrap();
        if let Some((cached_secret, mac)) = cache.as_ref() {
            if cached_secret == secret {
                return mac.clone();
            }
        }

        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        *cache = Some((secret.to_string(), mac.clone()));
        mac
    }
}

// Equal-length check plus full-width XOR accumulation; never short-circuits
// on the first mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
