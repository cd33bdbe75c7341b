//! Shared database connection and migration-coordination infrastructure.
//! Used by service binaries and the dbctl CLI.

pub mod config;
pub mod error;
pub mod infra;

pub use config::db::{ConnectionSpec, EnvSettings, ReplicaTopology, RetryPolicy, Settings};
pub use error::DbError;
pub use infra::db::coordinator::{update_database, MigrationRunner, UpdateOutcome, WaitPolicy};
pub use infra::db::latch::{LatchStore, TableLatch};
pub use infra::db::manager::{ConnectionManager, DbHandle, PostConnect};
