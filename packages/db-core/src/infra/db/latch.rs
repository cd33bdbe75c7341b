use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use tracing::{info, warn};

use crate::error::DbError;

/// Name of the sentinel table whose existence signals an in-progress
/// database update.
pub const LATCH_TABLE: &str = "db_update_latch";

/// Exclusive-acquisition primitive for a database update cycle.
///
/// The production implementation rides on the atomicity of DDL: creating
/// the sentinel table either succeeds for exactly one process or fails
/// because a peer already created it.
#[async_trait]
pub trait LatchStore: Send + Sync {
    /// Tries to take the latch. `Ok(true)` means this process now owns the
    /// update cycle; `Ok(false)` means a peer holds it.
    async fn try_acquire(&self, caller: &str) -> Result<bool, DbError>;

    /// Whether the latch currently exists.
    async fn is_held(&self) -> Result<bool, DbError>;

    /// Removes the latch. Idempotent: releasing an absent latch is a no-op.
    async fn release(&self, caller: &str) -> Result<(), DbError>;
}

/// Latch backed by the `db_update_latch` sentinel table.
pub struct TableLatch {
    conn: Arc<DatabaseConnection>,
}

impl TableLatch {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    pub(crate) fn from_shared(conn: Arc<DatabaseConnection>) -> Self {
        Self { conn }
    }

    fn stmt(&self, sql: impl Into<String>) -> Statement {
        Statement::from_string(self.conn.get_database_backend(), sql)
    }
}

#[async_trait]
impl LatchStore for TableLatch {
    async fn try_acquire(&self, caller: &str) -> Result<bool, DbError> {
        let create = self.stmt(format!(
            "CREATE TABLE {LATCH_TABLE} (created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP)"
        ));
        match self.conn.execute(create).await {
            Ok(_) => {
                info!(caller, "database update latch set");
                // One timestamped row for observability. Losing it does not
                // affect mutual exclusion, so a failure only logs.
                let insert = self.stmt(format!("INSERT INTO {LATCH_TABLE} VALUES (DEFAULT)"));
                if let Err(e) = self.conn.execute(insert).await {
                    warn!(caller, error = %e, "could not record latch timestamp row");
                }
                Ok(true)
            }
            Err(e) => {
                // The most likely cause is that the table already exists
                // because a peer is updating the database right now.
                info!(caller, error = %e, "could not put update latch on database");
                Ok(false)
            }
        }
    }

    async fn is_held(&self) -> Result<bool, DbError> {
        let check = self.stmt(format!("SELECT to_regclass('{LATCH_TABLE}') IS NOT NULL AS held"));
        let row = self
            .conn
            .query_one(check)
            .await
            .map_err(|e| DbError::coordination(format!("could not check update latch: {e}")))?
            .ok_or_else(|| DbError::coordination("latch check query returned no row"))?;
        row.try_get::<bool>("", "held")
            .map_err(|e| DbError::coordination(format!("could not read latch check result: {e}")))
    }

    async fn release(&self, caller: &str) -> Result<(), DbError> {
        let drop_stmt = self.stmt(format!("DROP TABLE IF EXISTS {LATCH_TABLE}"));
        self.conn.execute(drop_stmt).await.map_err(|e| {
            DbError::coordination(format!("could not remove update latch: {e}"))
        })?;
        info!(caller, "database update latch removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult, RuntimeErr, Value};

    use super::*;

    fn exec_ok() -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected: 0,
        }
    }

    fn held_row(held: bool) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([("held", Value::Bool(Some(held)))])
    }

    #[tokio::test]
    async fn acquire_succeeds_when_table_can_be_created() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok(), exec_ok()])
            .into_connection();
        let latch = TableLatch::new(conn);
        assert!(latch.try_acquire("worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_reports_contention_when_creation_fails() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal(
                "relation \"db_update_latch\" already exists".to_string(),
            ))])
            .into_connection();
        let latch = TableLatch::new(conn);
        assert!(!latch.try_acquire("worker-2").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_survives_a_failed_timestamp_insert() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal("insert failed".to_string()))])
            .into_connection();
        let latch = TableLatch::new(conn);
        assert!(latch.try_acquire("worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn is_held_reads_the_regclass_probe() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![held_row(true)], vec![held_row(false)]])
            .into_connection();
        let latch = TableLatch::new(conn);
        assert!(latch.is_held().await.unwrap());
        assert!(!latch.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn is_held_maps_query_failures_to_coordination_errors() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Conn(RuntimeErr::Internal(
                "connection reset".to_string(),
            ))])
            .into_connection();
        let latch = TableLatch::new(conn);
        let err = latch.is_held().await.unwrap_err();
        assert_eq!(err.code(), "COORDINATION_ERROR");
    }

    #[tokio::test]
    async fn release_maps_drop_failures_to_coordination_errors() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Exec(RuntimeErr::Internal(
                "permission denied".to_string(),
            ))])
            .into_connection();
        let latch = TableLatch::new(conn);
        let err = latch.release("worker-1").await.unwrap_err();
        assert_eq!(err.code(), "COORDINATION_ERROR");
    }

    #[tokio::test]
    async fn release_succeeds_when_drop_succeeds() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .into_connection();
        let latch = TableLatch::new(conn);
        assert!(latch.release("worker-1").await.is_ok());
    }
}
