use std::sync::{Arc, RwLock};

use secrecy::SecretString;

pub const WEBHOOK_SECRET_ENV: &str = "WEBHOOK_SECRET";

/// Holder of the shared webhook HMAC secret. The explicit value is injected
/// at construction; the environment variable is only a fallback. Nothing is
/// persisted, so callers must re-initialize after a restart.
#[derive(Clone, Default)]
pub struct SecretStore {
    inner: Arc<RwLock<Option<SecretString>>>,
}

impl SecretStore {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(secret.map(SecretString::from))),
        }
    }

    pub fn set(&self, secret: impl Into<String>) {
        *self.inner.write().unwrap() = Some(SecretString::from(secret.into()));
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = None;
    }

    /// The configured value, or the `WEBHOOK_SECRET` environment fallback.
    /// Returns `None` when neither is set; verification then runs in skip
    /// mode, which is logged rather than treated as a failure here.
    pub fn get(&self) -> Option<SecretString> {
        if let Some(secret) = self.inner.read().unwrap().clone() {
            return Some(secret);
        }

        match std::env::var(WEBHOOK_SECRET_ENV) {
            Ok(value) if !value.trim().is_empty() => Some(SecretString::from(value)),
            _ => {
                tracing::warn!(
                    "no webhook secret configured and {WEBHOOK_SECRET_ENV} is unset; \
                     signature verification will be skipped"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn explicit_value_takes_precedence() {
        let store = SecretStore::new(Some("configured".to_string()));
        assert_eq!(store.get().unwrap().expose_secret(), "configured");

        store.set("rotated");
        assert_eq!(store.get().unwrap().expose_secret(), "rotated");
    }

    #[test]
    fn clear_resets_to_unset() {
        let store = SecretStore::new(Some("configured".to_string()));
        store.clear();
        // The environment fallback is not set in the test harness.
        assert!(store.get().is_none());
    }
}
