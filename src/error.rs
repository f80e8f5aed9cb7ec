//! Error taxonomy for the reorder sync core.
//!
//! Remote failures are classified up front so the sync engine can decide
//! between retrying, going offline, routing to the conflict resolver, or
//! dropping an operation. Read paths generally swallow these and fall back
//! to a best-effort value; mutation paths surface only local failures.

use thiserror::Error;

/// Crate-wide result type.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Connectivity, timeout, throttling or 5xx. Retryable with backoff.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials rejected. Triggers a token refresh, then offline mode.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Local table not provisioned yet.
    #[error("Local table missing: {0}")]
    SchemaMissing(String),

    /// Remote copy changed underneath us.
    #[error("Data conflict: {0}")]
    DataConflict(String),

    #[error("Operation {operation_id} dropped after {retries} retries: {last_error}")]
    MaxRetriesExceeded {
        operation_id: i64,
        retries: i64,
        last_error: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Request refused outright (other 4xx, unreadable body). Not retried.
    #[error("Remote rejected request: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Local settings or file-system failure outside a SQL statement.
    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl SyncError {
    /// Whether the failed operation should be requeued with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::AuthExpired(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::DataConflict(_))
    }

    /// Map a rusqlite failure, turning "no such table" into `SchemaMissing`.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if let Some((_, rest)) = message.split_once("no such table: ") {
            let table = rest.split_whitespace().next().unwrap_or_default();
            return SyncError::SchemaMissing(table.to_string());
        }
        SyncError::Database(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned(err.to_string())
    }
}
