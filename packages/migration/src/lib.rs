pub use sea_orm_migration::prelude::*;

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr};

use db_core::{DbError, MigrationRunner};

mod m20250901_000001_create_profile_tables; // keep filename + module name in sync

pub struct Migrator;

#[async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250901_000001_create_profile_tables::Migration)]
    }
}

/// Count the migrations already recorded as applied.
/// Returns 0 if the migration table doesn't exist yet.
pub async fn count_applied_migrations(db: &DatabaseConnection) -> Result<usize, DbErr> {
    match Migrator::get_applied_migrations(db).await {
        Ok(migrations) => Ok(migrations.len()),
        Err(DbErr::Exec(_)) => Ok(0), // Migration table doesn't exist yet
        Err(e) => Err(e),
    }
}

/// Count the migrations not yet applied.
/// If the migration table doesn't exist, every defined migration is pending.
pub async fn count_pending_migrations(db: &DatabaseConnection) -> Result<usize, DbErr> {
    match Migrator::get_pending_migrations(db).await {
        Ok(migrations) => Ok(migrations.len()),
        Err(DbErr::Exec(_)) => Ok(Migrator::migrations().len()),
        Err(e) => Err(e),
    }
}

/// Migration-runner collaborator handed to the coordinator: wraps the
/// `Migrator` over a live connection.
pub struct SchemaRunner {
    db: Arc<DatabaseConnection>,
}

impl SchemaRunner {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn from_shared(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MigrationRunner for SchemaRunner {
    async fn pending(&self) -> Result<usize, DbError> {
        count_pending_migrations(&self.db)
            .await
            .map_err(|e| DbError::migration(format!("could not list pending migrations: {e}")))
    }

    async fn apply_all(&self) -> Result<usize, DbError> {
        let before = count_applied_migrations(&self.db).await.unwrap_or(0);
        Migrator::up(&*self.db, None)
            .await
            .map_err(|e| DbError::migration(format!("migration execution failed: {e}")))?;
        let after = count_applied_migrations(&self.db).await.unwrap_or(before);
        let executed = after.saturating_sub(before);
        tracing::info!(executed, "schema migrations applied");
        Ok(executed)
    }
}
