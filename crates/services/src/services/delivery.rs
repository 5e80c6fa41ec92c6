use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use db::models::webhook_event::{NewWebhookEvent, WebhookEvent};
use db::types::WebhookDeliveryStatus;
use db::{DBService, DbErr};

use super::config::WebhookConfig;
use super::processor::PayloadProcessor;
use super::retry::RetryScheduler;

pub const IDEMPOTENCY_KEY_PREFIX: &str = "whk_";

const PROCESSING_FAILURE_DIAGNOSTIC: &str = "payload processing returned failure";
const RECONCILE_BATCH_LIMIT: u64 = 500;

/// Globally unique admission token: prefix, epoch millis, absolute value of
/// a random integer. Generated once per admitted event, never regenerated.
pub fn generate_idempotency_key() -> String {
    let timestamp = Utc::now().timestamp_millis();
    let random: i32 = rand::random();
    format!("{IDEMPOTENCY_KEY_PREFIX}{timestamp}_{}", random.unsigned_abs())
}

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// The webhook reliability engine: admits events into the durable store and
/// drives a single background worker that delivers them one at a time.
/// Delivery is at-least-once; duplicate admissions collapse on the
/// idempotency key.
#[derive(Clone)]
pub struct DeliveryQueue {
    db: DBService,
    processor: Arc<dyn PayloadProcessor>,
    scheduler: RetryScheduler,
    config: Arc<WebhookConfig>,
    tx: UnboundedSender<i64>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<i64>>>,
    worker: Arc<StdMutex<Option<WorkerHandle>>>,
    // Queue-lifetime token: cancels the worker and any outstanding delayed
    // re-submission timers on destroy().
    shutdown: CancellationToken,
}

impl DeliveryQueue {
    pub fn new(db: DBService, processor: Arc<dyn PayloadProcessor>, config: WebhookConfig) -> Self {
        let scheduler = RetryScheduler::new(&config);
        Self::with_scheduler(db, processor, config, scheduler)
    }

    pub fn with_scheduler(
        db: DBService,
        processor: Arc<dyn PayloadProcessor>,
        config: WebhookConfig,
        scheduler: RetryScheduler,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            db,
            processor,
            scheduler,
            config: Arc::new(config),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            worker: Arc::new(StdMutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Persists one admitted webhook and hands its id to the worker. The
    /// dispatch send is unbounded and never waits on the worker.
    pub async fn enqueue(
        &self,
        event_type: &str,
        payload: &str,
        transaction_id: Option<&str>,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<i64, DbErr> {
        let idempotency_key = generate_idempotency_key();
        let payload = enrich_payload(payload, metadata, &idempotency_key);

        let record = WebhookEvent::insert_or_update(
            &self.db.pool,
            &NewWebhookEvent {
                idempotency_key,
                event_type: event_type.to_string(),
                payload,
                transaction_id: transaction_id.map(str::to_string),
                max_retries: self.config.max_retries,
            },
        )
        .await?;

        self.submit(record.id);
        Ok(record.id)
    }

    /// Starts the single delivery worker; a second call while it is running
    /// is a no-op. Also runs the startup reconciliation sweep so rows left
    /// behind by an abrupt exit re-enter the dispatch queue.
    pub async fn start(&self) {
        {
            let mut worker = self.worker.lock().unwrap();
            if let Some(handle) = worker.as_ref() {
                if !handle.join.is_finished() {
                    tracing::debug!("webhook delivery worker already running");
                    return;
                }
            }

            let cancel = self.shutdown.child_token();
            let queue = self.clone();
            let token = cancel.clone();
            let join = tokio::spawn(async move {
                queue.run_worker(token).await;
            });
            *worker = Some(WorkerHandle { cancel, join });
        }

        if let Err(err) = self.reconcile().await {
            tracing::error!(error = %err, "startup reconciliation failed");
        }
    }

    /// Cancels the worker's wait promptly; an event mid-processing finishes
    /// before the task exits, so no row is left stuck in `processing`.
    /// Safe to call from any thread, and idempotent.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.take() {
            handle.cancel.cancel();
            tracing::debug!("webhook delivery worker stopped");
        }
    }

    /// Stops the worker, cancels outstanding retry timers, and closes the
    /// dispatch queue. Rows left pending are picked up by the next start().
    pub async fn destroy(&self) {
        self.stop();
        self.shutdown.cancel();
        self.rx.lock().await.close();
    }

    /// Administrative bulk reinstatement: failed rows whose retry clock is
    /// unset or due go back to `pending` and re-enter the dispatch queue.
    pub async fn retry_failed_events(&self, limit: Option<u64>) -> Result<usize, DbErr> {
        let limit = limit.unwrap_or(self.config.default_retry_limit);
        let failed = WebhookEvent::list_pending(
            &self.db.pool,
            WebhookDeliveryStatus::Failed,
            Utc::now(),
            limit,
        )
        .await?;

        for event in &failed {
            WebhookEvent::update_status(&self.db.pool, event.id, WebhookDeliveryStatus::Pending)
                .await?;
            self.submit(event.id);
        }

        if !failed.is_empty() {
            tracing::info!(count = failed.len(), "reinstated failed webhook events");
        }
        Ok(failed.len())
    }

    /// Soft-deletes terminal rows older than the retention window. Pending
    /// and processing rows are never touched, regardless of age.
    pub async fn cleanup_old_events(&self) -> Result<usize, DbErr> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        let mut affected = 0;

        for status in [WebhookDeliveryStatus::Delivered, WebhookDeliveryStatus::Failed] {
            for event in WebhookEvent::list_older_than(&self.db.pool, status, cutoff).await? {
                WebhookEvent::soft_delete_by_id(&self.db.pool, event.id).await?;
                affected += 1;
            }
        }

        if affected > 0 {
            tracing::info!(count = affected, "soft-deleted webhook events past retention");
        }
        Ok(affected)
    }

    pub async fn pending_event_count(&self) -> Result<u64, DbErr> {
        WebhookEvent::count_by_status(&self.db.pool, WebhookDeliveryStatus::Pending).await
    }

    pub async fn failed_event_count(&self) -> Result<u64, DbErr> {
        WebhookEvent::count_by_status(&self.db.pool, WebhookDeliveryStatus::Failed).await
    }

    async fn run_worker(self, cancel: CancellationToken) {
        // Holding this lock for the worker's lifetime is what makes the
        // consumer single-flight.
        let mut rx = self.rx.lock().await;
        tracing::debug!("webhook delivery worker started");

        loop {
            let event_id = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(id) => id,
                    None => break,
                },
            };

            // Failures become state transitions; store errors are logged and
            // the loop keeps draining.
            if let Err(err) = self.process_event(event_id).await {
                tracing::error!(event_id, error = %err, "webhook event processing error");
            }
        }

        tracing::debug!("webhook delivery worker exited");
    }

    async fn process_event(&self, event_id: i64) -> Result<(), DbErr> {
        let Some(event) = WebhookEvent::find_by_id(&self.db.pool, event_id).await? else {
            // The id no longer resolves; drop it silently.
            return Ok(());
        };

        // Terminal rows are dropped; failed events re-enter only through
        // retry_failed_events, which resets them to pending first.
        if matches!(
            event.status,
            WebhookDeliveryStatus::Delivered
                | WebhookDeliveryStatus::Cancelled
                | WebhookDeliveryStatus::Failed
        ) {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(next_retry_at) = event.next_retry_at {
            if next_retry_at > now {
                // Not due yet. Hand the id back to the retry clock instead of
                // sleeping in place, so one event cannot stall the queue.
                let wait = (next_retry_at - now).to_std().unwrap_or(Duration::ZERO);
                self.submit_after(event_id, wait);
                return Ok(());
            }
        }

        WebhookEvent::update_status(&self.db.pool, event_id, WebhookDeliveryStatus::Processing)
            .await?;

        let delivered = self.processor.apply(&event).await;
        if delivered {
            WebhookEvent::mark_delivered(&self.db.pool, event_id).await?;
            return Ok(());
        }

        if event.retry_count >= event.max_retries {
            WebhookEvent::mark_failed(&self.db.pool, event_id).await?;
            tracing::error!(
                event_id,
                retry_count = event.retry_count,
                "webhook event failed after maximum retries"
            );
        } else {
            let delay = self.scheduler.next_delay(event.retry_count);
            let next_retry_at =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            WebhookEvent::update_retry_info(
                &self.db.pool,
                event_id,
                event.retry_count + 1,
                Some(next_retry_at),
                Some(PROCESSING_FAILURE_DIAGNOSTIC),
            )
            .await?;
            self.submit_after(event_id, delay);
        }

        Ok(())
    }

    /// Requeues rows stranded by an abrupt process exit: stale `processing`
    /// rows go back to `pending`, and due `pending` rows whose dispatch was
    /// lost with the old channel are re-submitted.
    async fn reconcile(&self) -> Result<(), DbErr> {
        let now = Utc::now();
        let stale_cutoff = now
            - chrono::Duration::from_std(self.config.stale_processing_after)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let stuck = WebhookEvent::list_stale_processing(&self.db.pool, stale_cutoff).await?;
        for event in &stuck {
            WebhookEvent::update_status(&self.db.pool, event.id, WebhookDeliveryStatus::Pending)
                .await?;
            self.submit(event.id);
        }
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "requeued webhook events stuck in processing");
        }

        let due = WebhookEvent::list_pending(
            &self.db.pool,
            WebhookDeliveryStatus::Pending,
            now,
            RECONCILE_BATCH_LIMIT,
        )
        .await?;
        for event in due {
            self.submit(event.id);
        }

        Ok(())
    }

    fn submit(&self, event_id: i64) {
        if self.tx.send(event_id).is_err() {
            tracing::warn!(event_id, "dispatch queue closed; leaving event for reconciliation");
        }
    }

    /// Timer-based re-submission: the worker never blocks on one event's
    /// retry clock. Timers die with the queue's shutdown token.
    fn submit_after(&self, event_id: i64, delay: Duration) {
        let tx = self.tx.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(event_id);
                }
            }
        });
    }
}

fn enrich_payload(
    payload: &str,
    metadata: Option<&HashMap<String, String>>,
    idempotency_key: &str,
) -> String {
    let Some(metadata) = metadata else {
        return payload.to_string();
    };

    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(payload) {
        Ok(mut object) => {
            for (key, value) in metadata {
                object.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
            object.insert(
                "idempotencyKey".to_string(),
                serde_json::Value::String(idempotency_key.to_string()),
            );
            object.insert(
                "enqueuedAt".to_string(),
                serde_json::Value::from(Utc::now().timestamp_millis()),
            );
            serde_json::to_string(&object).unwrap_or_else(|_| payload.to_string())
        }
        Err(_) => {
            // Best effort only: an unparseable body is stored verbatim.
            tracing::warn!("failed to enrich webhook payload; keeping original");
            payload.to_string()
        }
    }
}
