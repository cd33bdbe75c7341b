use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use tracing::{error, info, warn};

use crate::config::db::{
    build_connect_targets, sanitize_db_url, ConnectTargets, ConnectionSpec, RetryPolicy, Settings,
};
use crate::error::DbError;

/// Lightweight metadata query used to verify liveness and measure latency.
const PING_QUERY: &str = "select max(table_catalog) as x from information_schema.tables";

/// Runs `op` up to `max_attempts` times with a fixed `delay` between
/// attempts. On exhaustion the last failure is wrapped in a `Connectivity`
/// error naming the operation as permanently failed.
pub async fn retry_connection<T, F, Fut>(
    mut op: F,
    max_attempts: u32,
    delay: Duration,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut attempt: u32 = 1;
    loop {
        info!(attempt, max_attempts, "database connection attempt");
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "database connection recovered after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                error!(attempt, max_attempts, error = %e, "database connection attempt failed");
                if attempt >= max_attempts {
                    return Err(DbError::connectivity(format!(
                        "all {attempt} attempts to connect to the database are now expired: {e}"
                    )));
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Hook run once after the first successful connect, before the handle is
/// published. Replaces the connect-then-initialize subclass step with a
/// composed pipeline.
#[async_trait]
pub trait PostConnect: Send + Sync {
    async fn after_connect(&self, handle: &DbHandle) -> Result<(), DbError>;
}

/// Live pool object: one write pool plus zero or more read pools.
#[derive(Clone)]
pub struct DbHandle {
    write: Arc<DatabaseConnection>,
    read: Vec<Arc<DatabaseConnection>>,
    next_read: Arc<AtomicUsize>,
}

impl DbHandle {
    /// Wraps already-established pools into a handle.
    pub fn from_connections(write: DatabaseConnection, read: Vec<DatabaseConnection>) -> Self {
        Self {
            write: Arc::new(write),
            read: read.into_iter().map(Arc::new).collect(),
            next_read: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connects every target and verifies the authentication handshake.
    pub async fn establish(targets: ConnectTargets) -> Result<Self, DbError> {
        let write_url = sanitize_db_url(targets.write.get_url());
        info!(url = %write_url, read_pools = targets.read.len(), "establishing database pools");

        let write = Database::connect(targets.write)
            .await
            .map_err(|e| DbError::connectivity(format!("failed to open write pool: {e}")))?;
        let mut read = Vec::with_capacity(targets.read.len());
        for target in targets.read {
            let pool = Database::connect(target)
                .await
                .map_err(|e| DbError::connectivity(format!("failed to open read pool: {e}")))?;
            read.push(pool);
        }

        let handle = Self::from_connections(write, read);
        handle.authenticate().await?;
        Ok(handle)
    }

    /// Verifies liveness of every pool in the handle.
    pub async fn authenticate(&self) -> Result<(), DbError> {
        self.write
            .ping()
            .await
            .map_err(|e| DbError::connectivity(format!("write pool authentication failed: {e}")))?;
        for (idx, pool) in self.read.iter().enumerate() {
            pool.ping().await.map_err(|e| {
                DbError::connectivity(format!("read pool {idx} authentication failed: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn write(&self) -> &DatabaseConnection {
        &self.write
    }

    /// Shared handle to the write pool, for collaborators that need to own
    /// a connection without requiring `DatabaseConnection: Clone`.
    pub fn write_shared(&self) -> Arc<DatabaseConnection> {
        self.write.clone()
    }

    /// Round-robins over the read pools; falls back to the write pool when
    /// no replica topology was configured.
    pub fn read(&self) -> &DatabaseConnection {
        if self.read.is_empty() {
            return &self.write;
        }
        let idx = self.next_read.fetch_add(1, Ordering::Relaxed) % self.read.len();
        &self.read[idx]
    }

    /// Round-trip latency of the metadata ping in milliseconds, or -1 on
    /// any failure. Ping is a health signal, never a hard failure.
    pub async fn ping_ms(&self) -> i64 {
        let start = Instant::now();
        let stmt = Statement::from_string(self.write.get_database_backend(), PING_QUERY);
        match self.write.query_one(stmt).await {
            Ok(_) => start.elapsed().as_millis() as i64,
            Err(e) => {
                error!(error = %e, "ping query failed");
                -1
            }
        }
    }

    async fn close(self) -> Result<(), DbError> {
        let mut first_err = None;
        for pool in self.read {
            if let Err(e) = pool.close_by_ref().await {
                warn!(error = %e, "failed to close read pool");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.write.close_by_ref().await {
            warn!(error = %e, "failed to close write pool");
            first_err.get_or_insert(e);
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(DbError::connectivity(format!(
                "failed to close database pools: {e}"
            ))),
        }
    }
}

/// Owns the database handle for one service process.
///
/// The handle is created once; later `connect` calls reuse it and only
/// re-run the authentication retry, so every call re-verifies liveness.
pub struct ConnectionManager {
    settings: Arc<dyn Settings>,
    post_connect: Option<Arc<dyn PostConnect>>,
    handle: Option<DbHandle>,
}

impl ConnectionManager {
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self {
            settings,
            post_connect: None,
            handle: None,
        }
    }

    pub fn with_post_connect(mut self, hook: Arc<dyn PostConnect>) -> Self {
        self.post_connect = Some(hook);
        self
    }

    pub fn handle(&self) -> Option<&DbHandle> {
        self.handle.as_ref()
    }

    /// Validates the spec, assembles the dialect options and connects with
    /// the bounded retry budget. Idempotent: an existing handle is kept and
    /// only re-authenticated.
    pub async fn connect(&mut self, spec: &ConnectionSpec) -> Result<(), DbError> {
        spec.validate()?;
        let retry = spec
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from_settings(&*self.settings));

        match &self.handle {
            None => {
                let targets = build_connect_targets(spec, &*self.settings)?;
                let handle = retry_connection(
                    || {
                        let targets = targets.clone();
                        async move { DbHandle::establish(targets).await }
                    },
                    retry.max_attempts,
                    retry.delay,
                )
                .await?;
                if let Some(hook) = &self.post_connect {
                    hook.after_connect(&handle).await?;
                }
                info!(database = %spec.database, "database pool connected");
                self.handle = Some(handle);
            }
            Some(handle) => {
                let handle = handle.clone();
                retry_connection(
                    || {
                        let handle = handle.clone();
                        async move { handle.authenticate().await }
                    },
                    retry.max_attempts,
                    retry.delay,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Closes the handle and clears it so a later `connect` re-creates it.
    /// Calling without an active handle is a programming error.
    pub async fn disconnect(&mut self) -> Result<(), DbError> {
        match self.handle.take() {
            None => Err(DbError::config(
                "disconnect called without an active database handle",
            )),
            Some(handle) => {
                handle.close().await?;
                info!("database pools closed");
                Ok(())
            }
        }
    }

    /// Round-trip latency in milliseconds, or -1 when disconnected or when
    /// the ping query fails.
    pub async fn ping(&self) -> i64 {
        match &self.handle {
            None => -1,
            Some(handle) => handle.ping_ms().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, RuntimeErr, Value};

    use super::*;

    fn flaky_op(
        counter: Arc<AtomicU32>,
        failures: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, DbError>> + Send>> {
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= failures {
                    Err(DbError::connectivity("authentication failed"))
                } else {
                    Ok(attempt)
                }
            })
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result =
            retry_connection(flaky_op(attempts.clone(), 2), 5, Duration::from_millis(1)).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_after_budget_is_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result =
            retry_connection(flaky_op(attempts.clone(), u32::MAX), 3, Duration::from_millis(1))
                .await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "CONNECTIVITY_ERROR");
        assert!(err.to_string().contains("all 3 attempts"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success_without_sleeping() {
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let result =
            retry_connection(flaky_op(attempts.clone(), 0), 3, Duration::from_secs(30)).await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retry_sleeps_between_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let delay = Duration::from_millis(20);
        let start = Instant::now();
        let _ = retry_connection(flaky_op(attempts.clone(), 2), 5, delay).await;
        // Two failures, so two inter-attempt delays.
        assert!(start.elapsed() >= delay * 2);
    }

    #[tokio::test]
    async fn ping_reports_latency_on_success() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![BTreeMap::from([(
                "x",
                Value::String(Some(Box::new("profiles".to_string()))),
            )])]])
            .into_connection();
        let handle = DbHandle::from_connections(conn, vec![]);
        assert!(handle.ping_ms().await >= 0);
    }

    #[tokio::test]
    async fn ping_on_broken_connection_returns_minus_one() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Conn(RuntimeErr::Internal(
                "connection refused".to_string(),
            ))])
            .into_connection();
        let handle = DbHandle::from_connections(conn, vec![]);
        assert_eq!(handle.ping_ms().await, -1);
    }

    #[tokio::test]
    async fn manager_ping_without_handle_returns_minus_one() {
        let manager = ConnectionManager::new(Arc::new(crate::config::db::EnvSettings));
        assert_eq!(manager.ping().await, -1);
    }

    #[tokio::test]
    async fn disconnect_without_handle_is_a_config_error() {
        let mut manager = ConnectionManager::new(Arc::new(crate::config::db::EnvSettings));
        let err = manager.disconnect().await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn connect_rejects_invalid_spec_before_any_io() {
        let mut manager = ConnectionManager::new(Arc::new(crate::config::db::EnvSettings));
        let spec = ConnectionSpec {
            host: "localhost".to_string(),
            port: 5432,
            database: "profiles".to_string(),
            database_modifier_key: None,
            user: "app".to_string(),
            password: "pwd".to_string(),
            ssl_mode: true,
            cert_path: None,
            retry: None,
            replication: None,
        };
        let err = manager.connect(&spec).await.unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(manager.handle().is_none());
    }

    #[tokio::test]
    async fn read_falls_back_to_write_pool_without_replicas() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres).into_connection();
        let handle = DbHandle::from_connections(conn, vec![]);
        // No replicas configured: read() must still hand out a usable pool.
        let _ = handle.read();
    }
}
