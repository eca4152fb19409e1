//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The scope token is held by another job.
    #[error("scope '{0}' is held by another job")]
    ScopeConflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Map a unique-constraint violation to [`DbError::Duplicate`].
    pub(crate) fn on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match err.as_database_error() {
            Some(db) if db.is_unique_violation() => DbError::Duplicate(what()),
            _ => DbError::Database(err),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
