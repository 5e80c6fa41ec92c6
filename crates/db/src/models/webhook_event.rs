use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::entities::webhook_event;
use crate::types::WebhookDeliveryStatus;

pub const LAST_ERROR_MAX_LEN: usize = 500;

/// Fields supplied by admission when a webhook event is persisted.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub idempotency_key: String,
    pub event_type: String,
    pub payload: String,
    pub transaction_id: Option<String>,
    pub max_retries: i32,
}

pub struct WebhookEvent;

impl WebhookEvent {
    pub async fn insert<C: ConnectionTrait>(
        db: &C,
        data: &NewWebhookEvent,
    ) -> Result<webhook_event::Model, DbErr> {
        let now = Utc::now();
        let active = webhook_event::ActiveModel {
            idempotency_key: Set(data.idempotency_key.clone()),
            event_type: Set(data.event_type.clone()),
            payload: Set(data.payload.clone()),
            transaction_id: Set(data.transaction_id.clone()),
            status: Set(WebhookDeliveryStatus::Pending),
            retry_count: Set(0),
            max_retries: Set(data.max_retries),
            next_retry_at: Set(None),
            delivered_at: Set(None),
            last_error: Set(None),
            is_deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        active.insert(db).await
    }

    /// Upsert keyed on the idempotency key. An existing row is rewritten in
    /// place, keeping its `id` and `created_at`; a lost insert race against a
    /// concurrent admission with the same key falls back to the update path.
    pub async fn insert_or_update<C: ConnectionTrait>(
        db: &C,
        data: &NewWebhookEvent,
    ) -> Result<webhook_event::Model, DbErr> {
        if let Some(existing) = Self::find_by_idempotency_key_any(db, &data.idempotency_key).await?
        {
            return Self::overwrite(db, existing, data).await;
        }

        match Self::insert(db, data).await {
            Ok(model) => Ok(model),
            Err(err) => {
                // Likely a concurrent admission with the same key; take over
                // the row it won.
                if let Some(existing) =
                    Self::find_by_idempotency_key_any(db, &data.idempotency_key).await?
                {
                    tracing::warn!(
                        idempotency_key = data.idempotency_key.as_str(),
                        "concurrent admission shares an idempotency key; updating existing row"
                    );
                    return Self::overwrite(db, existing, data).await;
                }
                Err(err)
            }
        }
    }

    async fn overwrite<C: ConnectionTrait>(
        db: &C,
        existing: webhook_event::Model,
        data: &NewWebhookEvent,
    ) -> Result<webhook_event::Model, DbErr> {
        let mut active: webhook_event::ActiveModel = existing.into();
        active.event_type = Set(data.event_type.clone());
        active.payload = Set(data.payload.clone());
        active.transaction_id = Set(data.transaction_id.clone());
        active.status = Set(WebhookDeliveryStatus::Pending);
        active.retry_count = Set(0);
        active.max_retries = Set(data.max_retries);
        active.next_retry_at = Set(None);
        active.delivered_at = Set(None);
        active.last_error = Set(None);
        active.is_deleted = Set(false);
        active.updated_at = Set(Utc::now());
        active.update(db).await
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        id: i64,
    ) -> Result<Option<webhook_event::Model>, DbErr> {
        webhook_event::Entity::find_by_id(id)
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .one(db)
            .await
    }

    pub async fn find_by_idempotency_key<C: ConnectionTrait>(
        db: &C,
        idempotency_key: &str,
    ) -> Result<Option<webhook_event::Model>, DbErr> {
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IdempotencyKey.eq(idempotency_key))
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .one(db)
            .await
    }

    // Upsert lookup: must also see soft-deleted rows, since they still hold
    // the unique key.
    async fn find_by_idempotency_key_any<C: ConnectionTrait>(
        db: &C,
        idempotency_key: &str,
    ) -> Result<Option<webhook_event::Model>, DbErr> {
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IdempotencyKey.eq(idempotency_key))
            .one(db)
            .await
    }

    /// Rows in the given status whose retry clock is unset or due, oldest
    /// first.
    pub async fn list_pending<C: ConnectionTrait>(
        db: &C,
        status: WebhookDeliveryStatus,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<webhook_event::Model>, DbErr> {
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .filter(webhook_event::Column::Status.eq(status))
            .filter(
                Condition::any()
                    .add(webhook_event::Column::NextRetryAt.is_null())
                    .add(webhook_event::Column::NextRetryAt.lte(now)),
            )
            .order_by_asc(webhook_event::Column::CreatedAt)
            .limit(limit)
            .all(db)
            .await
    }

    pub async fn update_status<C: ConnectionTrait>(
        db: &C,
        id: i64,
        status: WebhookDeliveryStatus,
    ) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let mut active: webhook_event::ActiveModel = record.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }

    /// Records the outcome of a failed attempt and reverts the row to
    /// `pending`; awaiting-retry is pending plus a future `next_retry_at`.
    pub async fn update_retry_info<C: ConnectionTrait>(
        db: &C,
        id: i64,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let mut active: webhook_event::ActiveModel = record.into();
        active.status = Set(WebhookDeliveryStatus::Pending);
        active.retry_count = Set(retry_count);
        active.next_retry_at = Set(next_retry_at);
        active.last_error = Set(last_error.map(truncate_error));
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }

    pub async fn mark_delivered<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let now = Utc::now();
        let mut active: webhook_event::ActiveModel = record.into();
        active.status = Set(WebhookDeliveryStatus::Delivered);
        active.delivered_at = Set(Some(now));
        active.next_retry_at = Set(None);
        active.updated_at = Set(now);
        active.update(db).await?;
        Ok(())
    }

    pub async fn mark_failed<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let mut active: webhook_event::ActiveModel = record.into();
        active.status = Set(WebhookDeliveryStatus::Failed);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }

    /// Administrative terminal state; never assigned by the delivery worker.
    pub async fn mark_cancelled<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let mut active: webhook_event::ActiveModel = record.into();
        active.status = Set(WebhookDeliveryStatus::Cancelled);
        active.next_retry_at = Set(None);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }

    /// Terminal rows older than the cutoff on their relevant clock:
    /// `delivered_at` for delivered rows, `updated_at` otherwise.
    pub async fn list_older_than<C: ConnectionTrait>(
        db: &C,
        status: WebhookDeliveryStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<webhook_event::Model>, DbErr> {
        let clock = match status {
            WebhookDeliveryStatus::Delivered => webhook_event::Column::DeliveredAt,
            _ => webhook_event::Column::UpdatedAt,
        };
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .filter(webhook_event::Column::Status.eq(status))
            .filter(clock.lt(cutoff))
            .order_by_asc(webhook_event::Column::CreatedAt)
            .all(db)
            .await
    }

    /// Crash-recovery query: rows stuck in `processing` since before the
    /// cutoff, e.g. after an abrupt process exit.
    pub async fn list_stale_processing<C: ConnectionTrait>(
        db: &C,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<webhook_event::Model>, DbErr> {
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .filter(webhook_event::Column::Status.eq(WebhookDeliveryStatus::Processing))
            .filter(webhook_event::Column::UpdatedAt.lt(cutoff))
            .order_by_asc(webhook_event::Column::CreatedAt)
            .all(db)
            .await
    }

    pub async fn soft_delete_by_id<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
        let record = Self::require(db, id).await?;
        let mut active: webhook_event::ActiveModel = record.into();
        active.is_deleted = Set(true);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }

    /// Irreversibly purges rows that have been soft-deleted since before the
    /// cutoff. Returns the number of rows removed.
    pub async fn hard_delete_soft_deleted_older_than<C: ConnectionTrait>(
        db: &C,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let result = webhook_event::Entity::delete_many()
            .filter(webhook_event::Column::IsDeleted.eq(true))
            .filter(webhook_event::Column::UpdatedAt.lt(cutoff))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn count_by_status<C: ConnectionTrait>(
        db: &C,
        status: WebhookDeliveryStatus,
    ) -> Result<u64, DbErr> {
        webhook_event::Entity::find()
            .filter(webhook_event::Column::IsDeleted.eq(false))
            .filter(webhook_event::Column::Status.eq(status))
            .count(db)
            .await
    }

    async fn require<C: ConnectionTrait>(db: &C, id: i64) -> Result<webhook_event::Model, DbErr> {
        webhook_event::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound(
                "Webhook event record not found".to_string(),
            ))
    }
}

fn truncate_error(message: &str) -> String {
    message.chars().take(LAST_ERROR_MAX_LEN).collect()
}
