use std::collections::HashMap;

use thiserror::Error;

use db::events::WebhookEnvelope;
use db::DbErr;

use super::delivery::DeliveryQueue;
use super::signature::{SignatureVerification, SignatureVerifier};

/// Inbound signature header; lookups are case-insensitive.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("webhook signature rejected: {0}")]
    SignatureRejected(String),
    #[error("webhook signature verification skipped: {0}")]
    SignatureSkipped(String),
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// The admission boundary under the HTTP layer: authenticate the raw bytes,
/// validate the envelope, then hand off to the durable queue. Fails closed:
/// events whose signature cannot be positively verified never reach the
/// queue.
pub struct WebhookAdmission {
    verifier: SignatureVerifier,
    queue: DeliveryQueue,
}

impl WebhookAdmission {
    pub fn new(verifier: SignatureVerifier, queue: DeliveryQueue) -> Self {
        Self { verifier, queue }
    }

    pub fn extract_signature_header(headers: &HashMap<String, String>) -> Option<&str> {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
            .map(|(_, value)| value.as_str())
    }

    pub async fn admit(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<i64, AdmissionError> {
        if payload.is_empty() {
            return Err(AdmissionError::InvalidPayload("empty payload".to_string()));
        }

        match self.verifier.verify(payload, signature_header) {
            SignatureVerification::Valid => {}
            SignatureVerification::Invalid(reason) => {
                tracing::error!(reason = %reason, "rejected webhook with invalid signature");
                return Err(AdmissionError::SignatureRejected(reason));
            }
            SignatureVerification::Skipped(reason) => {
                tracing::warn!(reason = %reason, "refusing webhook; verification unavailable");
                return Err(AdmissionError::SignatureSkipped(reason));
            }
        }

        let body = std::str::from_utf8(payload)
            .map_err(|_| AdmissionError::InvalidPayload("payload is not valid UTF-8".to_string()))?;
        let envelope: WebhookEnvelope = serde_json::from_str(body)
            .map_err(|err| AdmissionError::InvalidPayload(err.to_string()))?;
        if envelope.event_type.trim().is_empty() {
            return Err(AdmissionError::InvalidPayload("missing event type".to_string()));
        }

        let id = self
            .queue
            .enqueue(
                &envelope.event_type,
                body,
                envelope.transaction_id.as_deref(),
                Some(&envelope.metadata),
            )
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use db::entities::webhook_event;
    use db::models::webhook_event::WebhookEvent;
    use db::types::WebhookDeliveryStatus;
    use db::DBService;
    use hmac::{Hmac, Mac};
    use sea_orm::{Database, EntityTrait, PaginatorTrait};
    use sea_orm_migration::MigratorTrait;
    use sha2::Sha256;

    use super::*;
    use crate::services::config::WebhookConfig;
    use crate::services::processor::PayloadProcessor;
    use crate::services::secret::SecretStore;

    const SECRET: &str = "admission-secret";

    struct NoopProcessor;

    #[async_trait]
    impl PayloadProcessor for NoopProcessor {
        async fn apply(&self, _event: &webhook_event::Model) -> bool {
            true
        }
    }

    async fn setup_db() -> DBService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        DBService { pool }
    }

    fn admission(db: &DBService, secret: Option<&str>) -> WebhookAdmission {
        let verifier = SignatureVerifier::new(SecretStore::new(secret.map(str::to_string)));
        let queue = DeliveryQueue::new(db.clone(), Arc::new(NoopProcessor), WebhookConfig::default());
        WebhookAdmission::new(verifier, queue)
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn row_count(db: &DBService) -> u64 {
        webhook_event::Entity::find().count(&db.pool).await.unwrap()
    }

    #[tokio::test]
    async fn valid_signature_admits_and_persists_pending() {
        let db = setup_db().await;
        let admission = admission(&db, Some(SECRET));
        let payload = br#"{"eventType":"payment.success","transactionId":"T1"}"#;

        let id = admission
            .admit(payload, Some(&sign(SECRET, payload)))
            .await
            .unwrap();

        let row = WebhookEvent::find_by_id(&db.pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, WebhookDeliveryStatus::Pending);
        assert_eq!(row.event_type, "payment.success");
        assert_eq!(row.transaction_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn wrong_secret_blocks_admission_entirely() {
        let db = setup_db().await;
        let admission = admission(&db, Some(SECRET));
        let payload = br#"{"eventType":"payment.success","transactionId":"T1"}"#;

        let err = admission
            .admit(payload, Some(&sign("some-other-secret", payload)))
            .await
            .expect_err("expected rejection");

        assert!(matches!(err, AdmissionError::SignatureRejected(_)));
        assert_eq!(row_count(&db).await, 0);
    }

    #[tokio::test]
    async fn missing_signature_blocks_admission() {
        let db = setup_db().await;
        let admission = admission(&db, Some(SECRET));
        let payload = br#"{"eventType":"payment.success"}"#;

        let err = admission.admit(payload, None).await.expect_err("expected rejection");
        assert!(matches!(err, AdmissionError::SignatureRejected(_)));
        assert_eq!(row_count(&db).await, 0);
    }

    #[tokio::test]
    async fn unverifiable_signature_blocks_admission() {
        let db = setup_db().await;
        let admission = admission(&db, None);
        let payload = br#"{"eventType":"payment.success"}"#;

        let err = admission
            .admit(payload, Some(&sign(SECRET, payload)))
            .await
            .expect_err("expected rejection");
        assert!(matches!(err, AdmissionError::SignatureSkipped(_)));
        assert_eq!(row_count(&db).await, 0);
    }

    #[tokio::test]
    async fn malformed_envelope_blocks_admission() {
        let db = setup_db().await;
        let admission = admission(&db, Some(SECRET));

        let payload = b"not json";
        let err = admission
            .admit(payload, Some(&sign(SECRET, payload)))
            .await
            .expect_err("expected rejection");
        assert!(matches!(err, AdmissionError::InvalidPayload(_)));

        let payload = br#"{"eventType":"   "}"#;
        let err = admission
            .admit(payload, Some(&sign(SECRET, payload)))
            .await
            .expect_err("expected rejection");
        assert!(matches!(err, AdmissionError::InvalidPayload(_)));

        assert_eq!(row_count(&db).await, 0);
    }

    #[test]
    fn signature_header_lookup_is_case_insensitive() {
        let headers = HashMap::from([
            ("content-type".to_string(), "application/json".to_string()),
            ("x-webhook-signature".to_string(), "sha256=abc".to_string()),
        ]);
        assert_eq!(
            WebhookAdmission::extract_signature_header(&headers),
            Some("sha256=abc")
        );

        let headers = HashMap::from([(
            "X-Webhook-Signature".to_string(),
            "sha256=def".to_string(),
        )]);
        assert_eq!(
            WebhookAdmission::extract_signature_header(&headers),
            Some("sha256=def")
        );

        let headers: HashMap<String, String> = HashMap::new();
        assert_eq!(WebhookAdmission::extract_signature_header(&headers), None);
    }
}
