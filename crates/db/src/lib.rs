use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub use sea_orm::DbErr;

pub mod entities;
pub mod events;
pub mod models;
pub mod types;

#[derive(Clone)]
pub struct DBService {
    pub pool: DatabaseConnection,
}

impl DBService {
    /// Connects to the given database URL and brings the schema up to date.
    pub async fn new(database_url: &str) -> Result<DBService, DbErr> {
        let pool = Database::connect(database_url).await?;
        db_migration::Migrator::up(&pool, None).await?;
        Ok(DBService { pool })
    }
}
