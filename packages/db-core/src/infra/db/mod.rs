pub mod coordinator;
pub mod latch;
pub mod manager;

pub use coordinator::{update_database, MigrationRunner, UpdateOutcome, WaitPolicy};
pub use latch::{LatchStore, TableLatch};
pub use manager::{retry_connection, ConnectionManager, DbHandle, PostConnect};
