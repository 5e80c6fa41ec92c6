use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, Set,
};

use crate::entities::transaction;
use crate::types::{PaymentMethod, PaymentStatus};

#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub id: String,
    pub user_id: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub description: String,
}

pub struct Transaction;

impl Transaction {
    pub async fn create<C: ConnectionTrait>(
        db: &C,
        data: &CreateTransaction,
    ) -> Result<transaction::Model, DbErr> {
        let now = Utc::now();
        let active = transaction::ActiveModel {
            id: Set(data.id.clone()),
            user_id: Set(data.user_id),
            amount_cents: Set(data.amount_cents),
            currency: Set(data.currency.clone()),
            status: Set(PaymentStatus::Pending),
            payment_method: Set(data.payment_method),
            description: Set(data.description.clone()),
            is_deleted: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };

        active.insert(db).await
    }

    pub async fn find_by_id<C: ConnectionTrait>(
        db: &C,
        id: &str,
    ) -> Result<Option<transaction::Model>, DbErr> {
        transaction::Entity::find_by_id(id)
            .filter(transaction::Column::IsDeleted.eq(false))
            .one(db)
            .await
    }

    pub async fn update_status<C: ConnectionTrait>(
        db: &C,
        id: &str,
        status: PaymentStatus,
    ) -> Result<(), DbErr> {
        let record = transaction::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound(
                "Transaction record not found".to_string(),
            ))?;

        let mut active: transaction::ActiveModel = record.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;
        Ok(())
    }
}
