use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// Invalid or incomplete connection spec, or API misuse. Never retried;
    /// raised before any network I/O.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Authentication/handshake failure that survived the retry budget.
    #[error("Connectivity error: {message}")]
    Connectivity { message: String },

    /// Latch check or removal failure while coordinating a database update.
    #[error("Coordination error: {message}")]
    Coordination { message: String },

    /// Migration execution failure reported by the migration runner.
    #[error("Migration error: {message}")]
    Migration { message: String },

    /// The poll budget ran out while a peer still held the update latch.
    #[error("Wait expired: {message}")]
    WaitExpired { message: String },
}

impl DbError {
    pub fn config(message: impl Into<String>) -> Self {
        DbError::Config {
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        DbError::Connectivity {
            message: message.into(),
        }
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        DbError::Coordination {
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        DbError::Migration {
            message: message.into(),
        }
    }

    pub fn wait_expired(message: impl Into<String>) -> Self {
        DbError::WaitExpired {
            message: message.into(),
        }
    }

    /// Stable machine-checkable code for each error kind.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Config { .. } => "CONFIG_ERROR",
            DbError::Connectivity { .. } => "CONNECTIVITY_ERROR",
            DbError::Coordination { .. } => "COORDINATION_ERROR",
            DbError::Migration { .. } => "MIGRATION_ERROR",
            DbError::WaitExpired { .. } => "WAIT_EXPIRED",
        }
    }
}
