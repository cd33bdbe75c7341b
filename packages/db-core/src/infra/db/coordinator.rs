use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::db::{
    Settings, DEFAULT_UPDATE_CHECK_ATTEMPTS, DEFAULT_UPDATE_PAUSE_DURATION_MS,
    KEY_UPDATE_CHECK_ATTEMPTS, KEY_UPDATE_PAUSE_DURATION_MS,
};
use crate::error::DbError;
use crate::infra::db::latch::{LatchStore, TableLatch};
use crate::infra::db::manager::DbHandle;

/// Migration-runner collaborator. Owns the migration format and the
/// applied/pending bookkeeping; the coordinator only triggers "run all
/// pending" and reads back counts.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Number of migration units not yet applied.
    async fn pending(&self) -> Result<usize, DbError>;

    /// Applies every pending unit in its defined order, returning how many
    /// were executed.
    async fn apply_all(&self) -> Result<usize, DbError>;
}

/// Poll budget for a process waiting on a peer's update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl WaitPolicy {
    pub fn from_settings(settings: &dyn Settings) -> Self {
        let max_attempts = settings
            .get_i64(KEY_UPDATE_CHECK_ATTEMPTS)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_UPDATE_CHECK_ATTEMPTS);
        let pause_ms = settings
            .get_i64(KEY_UPDATE_PAUSE_DURATION_MS)
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(DEFAULT_UPDATE_PAUSE_DURATION_MS);
        Self {
            max_attempts,
            pause: Duration::from_millis(pause_ms),
        }
    }
}

/// How an update cycle ended for this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// This process won the latch and executed the pending migrations.
    Applied { executed: usize },
    /// A peer held the latch and finished the update while we polled.
    CompletedByPeer,
}

/// Runs one coordinated database update cycle against the handle's write
/// pool, using the sentinel-table latch for cross-process exclusion.
pub async fn update_database(
    handle: &DbHandle,
    runner: &dyn MigrationRunner,
    settings: &dyn Settings,
    caller: &str,
) -> Result<UpdateOutcome, DbError> {
    let latch = TableLatch::from_shared(handle.write_shared());
    let wait = WaitPolicy::from_settings(settings);
    update_with_latch(&latch, runner, wait, caller).await
}

/// Latch-generic update cycle: acquire-and-migrate, or wait for the peer
/// that holds the latch.
pub async fn update_with_latch<L>(
    latch: &L,
    runner: &dyn MigrationRunner,
    wait: WaitPolicy,
    caller: &str,
) -> Result<UpdateOutcome, DbError>
where
    L: LatchStore + ?Sized,
{
    if latch.try_acquire(caller).await? {
        let executed = migrate_and_release(latch, runner, caller).await?;
        Ok(UpdateOutcome::Applied { executed })
    } else {
        info!(caller, "update latch held by another process, waiting");
        wait_for_peer(latch, wait, caller).await?;
        Ok(UpdateOutcome::CompletedByPeer)
    }
}

/// Owned path: run the pending migrations, then drop the latch no matter
/// what. When the runner fails, the latch is still removed and the runner's
/// error is what the caller observes (a cleanup failure on that path only
/// logs).
async fn migrate_and_release<L>(
    latch: &L,
    runner: &dyn MigrationRunner,
    caller: &str,
) -> Result<usize, DbError>
where
    L: LatchStore + ?Sized,
{
    let run = async {
        let pending = runner.pending().await?;
        info!(caller, pending, "pending migrations found");
        let executed = runner.apply_all().await?;
        info!(caller, executed, "migrations executed on the database");
        Ok(executed)
    };

    match run.await {
        Ok(executed) => {
            latch.release(caller).await?;
            Ok(executed)
        }
        Err(migration_err) => {
            if let Err(release_err) = latch.release(caller).await {
                warn!(
                    caller,
                    error = %release_err,
                    "could not remove update latch after migration failure"
                );
            }
            Err(migration_err)
        }
    }
}

/// Waiting path: poll latch existence on a fixed interval until it
/// disappears or the budget runs out. A check error counts as "still
/// updating" for that poll, so a transient read failure never flaps the
/// wait into a hard failure.
async fn wait_for_peer<L>(latch: &L, wait: WaitPolicy, caller: &str) -> Result<(), DbError>
where
    L: LatchStore + ?Sized,
{
    let mut attempt: u32 = 1;
    while attempt <= wait.max_attempts {
        info!(caller, attempt, "waiting for peer database update to finish");
        match latch.is_held().await {
            Ok(false) => {
                info!(
                    caller,
                    attempt,
                    waited_ms = (attempt as u64) * wait.pause.as_millis() as u64,
                    "peer database update finished"
                );
                return Ok(());
            }
            Ok(true) => {}
            Err(e) => {
                error!(caller, attempt, error = %e, "latch check failed while waiting, assuming update still running");
            }
        }
        tokio::time::sleep(wait.pause).await;
        attempt += 1;
    }
    error!(
        caller,
        attempts = wait.max_attempts,
        "peer database update still running, giving up"
    );
    Err(DbError::wait_expired(format!(
        "all {} attempts to wait for the database update are now expired",
        wait.max_attempts
    )))
}
