use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Transactions::Table)
                    .col(
                        ColumnDef::new(Transactions::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Transactions::UserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::AmountCents)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Transactions::Currency)
                            .string_len(8)
                            .not_null()
                            .default(Expr::val("IDR")),
                    )
                    .col(
                        ColumnDef::new(Transactions::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(Transactions::PaymentMethod)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Transactions::Description).text().not_null())
                    .col(bool_col(Transactions::IsDeleted))
                    .col(timestamp_col(Transactions::CreatedAt))
                    .col(timestamp_col(Transactions::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_transactions_status")
                    .table(Transactions::Table)
                    .col(Transactions::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_transactions_user_id")
                    .table(Transactions::Table)
                    .col(Transactions::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(WebhookEvents::Table)
                    .col(pk_id_col(manager, WebhookEvents::Id))
                    .col(
                        ColumnDef::new(WebhookEvents::IdempotencyKey)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::EventType)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Payload).text().not_null())
                    .col(ColumnDef::new(WebhookEvents::TransactionId).string_len(64))
                    .col(
                        ColumnDef::new(WebhookEvents::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::RetryCount)
                            .integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::MaxRetries)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::NextRetryAt).timestamp())
                    .col(ColumnDef::new(WebhookEvents::DeliveredAt).timestamp())
                    .col(ColumnDef::new(WebhookEvents::LastError).text())
                    .col(bool_col(WebhookEvents::IsDeleted))
                    .col(timestamp_col(WebhookEvents::CreatedAt))
                    .col(timestamp_col(WebhookEvents::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_webhook_events_idempotency_key")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::IdempotencyKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_webhook_events_status")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_webhook_events_created_at")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_webhook_events_transaction_id")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::TransactionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Transactions::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn bool_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .boolean()
        .not_null()
        .default(Expr::val(false))
        .to_owned()
}

fn timestamp_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Transactions {
    Table,
    Id,
    UserId,
    AmountCents,
    Currency,
    Status,
    PaymentMethod,
    Description,
    IsDeleted,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum WebhookEvents {
    Table,
    Id,
    IdempotencyKey,
    EventType,
    Payload,
    TransactionId,
    Status,
    RetryCount,
    MaxRetries,
    NextRetryAt,
    DeliveredAt,
    LastError,
    IsDeleted,
    CreatedAt,
    UpdatedAt,
}
