use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use db::models::webhook_event::WebhookEvent;
use db::{DBService, DbErr};

use super::config::WebhookConfig;
use super::delivery::DeliveryQueue;

/// Periodic and administrative upkeep around the delivery queue: reviving
/// retriable failures and the two-phase retention delete. Soft delete first,
/// so there is an audit window before rows are purged for good.
#[derive(Clone)]
pub struct MaintenanceSweeper {
    db: DBService,
    queue: DeliveryQueue,
    config: Arc<WebhookConfig>,
    cancel: CancellationToken,
}

impl MaintenanceSweeper {
    pub fn new(db: DBService, queue: DeliveryQueue, config: WebhookConfig) -> Self {
        Self {
            db,
            queue,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn revive_failed(&self, limit: Option<u64>) -> Result<usize, DbErr> {
        self.queue.retry_failed_events(limit).await
    }

    pub async fn sweep_retention(&self) -> Result<usize, DbErr> {
        self.queue.cleanup_old_events().await
    }

    /// Second phase of the retention delete: irreversibly purges rows that
    /// have already been soft-deleted for longer than the purge window.
    pub async fn purge_soft_deleted(&self) -> Result<u64, DbErr> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.purge_after_days);
        let purged =
            WebhookEvent::hard_delete_soft_deleted_older_than(&self.db.pool, cutoff).await?;
        if purged > 0 {
            tracing::info!(count = purged, "purged soft-deleted webhook events");
        }
        Ok(purged)
    }

    /// Starts the periodic loops: revive + soft-delete on the sweep cadence,
    /// hard delete on the slower purge cadence.
    pub fn spawn(&self) {
        let sweeper = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = sweeper.revive_failed(None).await {
                            tracing::error!(error = %err, "failed-event revival sweep failed");
                        }
                        if let Err(err) = sweeper.sweep_retention().await {
                            tracing::error!(error = %err, "retention sweep failed");
                        }
                    }
                }
            }
        });

        let sweeper = self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.purge_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = sweeper.purge_soft_deleted().await {
                            tracing::error!(error = %err, "soft-delete purge failed");
                        }
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use db::entities::webhook_event;
    use db::types::WebhookDeliveryStatus;
    use sea_orm::{ActiveModelTrait, Database, EntityTrait, Set};
    use sea_orm_migration::MigratorTrait;

    use super::*;
    use crate::services::processor::PayloadProcessor;

    struct NoopProcessor;

    #[async_trait]
    impl PayloadProcessor for NoopProcessor {
        async fn apply(&self, _event: &webhook_event::Model) -> bool {
            true
        }
    }

    async fn setup() -> (DBService, DeliveryQueue, MaintenanceSweeper) {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        let db = DBService { pool };
        let config = WebhookConfig::default();
        let queue = DeliveryQueue::new(db.clone(), Arc::new(NoopProcessor), config.clone());
        let sweeper = MaintenanceSweeper::new(db.clone(), queue.clone(), config);
        (db, queue, sweeper)
    }

    async fn backdate(db: &DBService, id: i64, days: i64) {
        let record = webhook_event::Entity::find_by_id(id)
            .one(&db.pool)
            .await
            .unwrap()
            .unwrap();
        let by = chrono::Duration::days(days);
        let delivered_at = record.delivered_at.map(|at| at - by);
        let mut active: webhook_event::ActiveModel = record.into();
        active.created_at = Set(Utc::now() - by);
        active.updated_at = Set(Utc::now() - by);
        active.delivered_at = Set(delivered_at);
        active.update(&db.pool).await.unwrap();
    }

    #[tokio::test]
    async fn revive_failed_feeds_events_back_through_delivery() {
        let (db, queue, sweeper) = setup().await;

        let id = queue
            .enqueue("payment.success", "{}", None, None)
            .await
            .unwrap();
        WebhookEvent::mark_failed(&db.pool, id).await.unwrap();

        let revived = sweeper.revive_failed(None).await.unwrap();
        assert_eq!(revived, 1);

        queue.start().await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let row = WebhookEvent::find_by_id(&db.pool, id).await.unwrap().unwrap();
            if row.status == WebhookDeliveryStatus::Delivered {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "event never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.destroy().await;
    }

    #[tokio::test]
    async fn two_phase_delete_soft_deletes_then_purges() {
        let (db, queue, sweeper) = setup().await;

        let id = queue
            .enqueue("payment.success", "{}", None, None)
            .await
            .unwrap();
        WebhookEvent::mark_delivered(&db.pool, id).await.unwrap();
        backdate(&db, id, 31).await;

        // Phase one hides the row but keeps it recoverable.
        let swept = sweeper.sweep_retention().await.unwrap();
        assert_eq!(swept, 1);
        assert!(WebhookEvent::find_by_id(&db.pool, id).await.unwrap().is_none());
        assert!(
            webhook_event::Entity::find_by_id(id)
                .one(&db.pool)
                .await
                .unwrap()
                .is_some()
        );

        // Freshly soft-deleted: still inside the purge window.
        assert_eq!(sweeper.purge_soft_deleted().await.unwrap(), 0);

        backdate(&db, id, 8).await;
        assert_eq!(sweeper.purge_soft_deleted().await.unwrap(), 1);
        assert!(
            webhook_event::Entity::find_by_id(id)
                .one(&db.pool)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn purge_leaves_live_rows_alone() {
        let (db, queue, sweeper) = setup().await;

        let id = queue
            .enqueue("payment.success", "{}", None, None)
            .await
            .unwrap();
        backdate(&db, id, 365).await;

        assert_eq!(sweeper.purge_soft_deleted().await.unwrap(), 0);
        assert!(WebhookEvent::find_by_id(&db.pool, id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spawned_loops_stop_on_shutdown() {
        let (_db, _queue, sweeper) = setup().await;
        sweeper.spawn();
        sweeper.shutdown();
        // Cancellation is prompt; nothing to assert beyond not hanging.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
