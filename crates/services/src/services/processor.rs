use async_trait::async_trait;
use db::entities::webhook_event;
use db::events::{
    EVENT_PAYMENT_FAILED, EVENT_PAYMENT_REFUNDED, EVENT_PAYMENT_SUCCESS, WebhookEnvelope,
};
use db::models::transaction::Transaction;
use db::types::PaymentStatus;
use db::DBService;

/// Applies one delivered event to application state. Returning `false` is a
/// processing failure and feeds the retry counter; implementations must not
/// panic on malformed input.
#[async_trait]
pub trait PayloadProcessor: Send + Sync {
    async fn apply(&self, event: &webhook_event::Model) -> bool;
}

/// Canonical processor: decodes the payload and advances the correlated
/// transaction through the payment lifecycle.
pub struct PaymentPayloadProcessor {
    db: DBService,
}

impl PaymentPayloadProcessor {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    async fn update_transaction_status(
        &self,
        transaction_id: Option<&str>,
        status: PaymentStatus,
    ) -> bool {
        let Some(id) = transaction_id.map(str::trim).filter(|id| !id.is_empty()) else {
            tracing::error!("webhook payload has no usable transaction id");
            return false;
        };

        match Transaction::find_by_id(&self.db.pool, id).await {
            Ok(Some(_)) => match Transaction::update_status(&self.db.pool, id, status).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::error!(
                        transaction_id = id,
                        error = %err,
                        "failed to update transaction status"
                    );
                    false
                }
            },
            Ok(None) => {
                tracing::error!(transaction_id = id, "transaction not found");
                false
            }
            Err(err) => {
                tracing::error!(transaction_id = id, error = %err, "transaction lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl PayloadProcessor for PaymentPayloadProcessor {
    async fn apply(&self, event: &webhook_event::Model) -> bool {
        let envelope: WebhookEnvelope = match serde_json::from_str(&event.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(event_id = event.id, error = %err, "invalid webhook payload");
                return false;
            }
        };

        let transaction_id = envelope.transaction_id.as_deref();
        match envelope.event_type.as_str() {
            EVENT_PAYMENT_SUCCESS => {
                self.update_transaction_status(transaction_id, PaymentStatus::Completed)
                    .await
            }
            EVENT_PAYMENT_FAILED => {
                self.update_transaction_status(transaction_id, PaymentStatus::Failed)
                    .await
            }
            EVENT_PAYMENT_REFUNDED => {
                self.update_transaction_status(transaction_id, PaymentStatus::Refunded)
                    .await
            }
            // Event types this system does not understand are acknowledged
            // without side effects; retrying them would never succeed.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use db::models::transaction::CreateTransaction;
    use db::models::webhook_event::{NewWebhookEvent, WebhookEvent};
    use db::types::{PaymentMethod, WebhookDeliveryStatus};
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;

    use super::*;

    async fn setup_db() -> DBService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        DBService { pool }
    }

    async fn seed_transaction(db: &DBService, id: &str) {
        Transaction::create(
            &db.pool,
            &CreateTransaction {
                id: id.to_string(),
                user_id: 1,
                amount_cents: 250_000,
                currency: "IDR".to_string(),
                payment_method: PaymentMethod::EWallet,
                description: "Dues".to_string(),
            },
        )
        .await
        .unwrap();
    }

    async fn event_with_payload(db: &DBService, payload: &str) -> webhook_event::Model {
        WebhookEvent::insert(
            &db.pool,
            &NewWebhookEvent {
                idempotency_key: format!("whk_{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
                event_type: "payment.success".to_string(),
                payload: payload.to_string(),
                transaction_id: None,
                max_retries: 5,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn success_event_completes_the_transaction() {
        let db = setup_db().await;
        seed_transaction(&db, "T1").await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"payment.success","transactionId":"T1"}"#,
        )
        .await;
        assert!(processor.apply(&event).await);

        let transaction = Transaction::find_by_id(&db.pool, "T1").await.unwrap().unwrap();
        assert_eq!(transaction.status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn refund_event_marks_the_transaction_refunded() {
        let db = setup_db().await;
        seed_transaction(&db, "T2").await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"payment.refunded","transactionId":"T2"}"#,
        )
        .await;
        assert!(processor.apply(&event).await);

        let transaction = Transaction::find_by_id(&db.pool, "T2").await.unwrap().unwrap();
        assert_eq!(transaction.status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn unknown_event_type_is_a_successful_no_op() {
        let db = setup_db().await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"invoice.created","transactionId":"T1"}"#,
        )
        .await;
        assert!(processor.apply(&event).await);
    }

    #[tokio::test]
    async fn malformed_json_is_a_failure_not_a_panic() {
        let db = setup_db().await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(&db, "not json at all").await;
        assert!(!processor.apply(&event).await);
    }

    #[tokio::test]
    async fn missing_transaction_is_a_failure() {
        let db = setup_db().await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"payment.failed","transactionId":"nope"}"#,
        )
        .await;
        assert!(!processor.apply(&event).await);
    }

    #[tokio::test]
    async fn blank_transaction_id_is_a_failure() {
        let db = setup_db().await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"payment.success","transactionId":"   "}"#,
        )
        .await;
        assert!(!processor.apply(&event).await);

        let event = event_with_payload(&db, r#"{"eventType":"payment.success"}"#).await;
        assert!(!processor.apply(&event).await);
    }

    #[tokio::test]
    async fn tolerates_unknown_payload_fields() {
        let db = setup_db().await;
        seed_transaction(&db, "T3").await;
        let processor = PaymentPayloadProcessor::new(db.clone());

        let event = event_with_payload(
            &db,
            r#"{"eventType":"payment.failed","transactionId":"T3","gateway":"mock","attempt":3}"#,
        )
        .await;
        assert!(processor.apply(&event).await);

        let transaction = Transaction::find_by_id(&db.pool, "T3").await.unwrap().unwrap();
        assert_eq!(transaction.status, PaymentStatus::Failed);
        // The stored event row itself is untouched by the processor.
        let row = WebhookEvent::find_by_id(&db.pool, event.id).await.unwrap().unwrap();
        assert_eq!(row.status, WebhookDeliveryStatus::Pending);
    }
}
