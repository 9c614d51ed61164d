//! Error types for the maintenance jobs.
//!
//! A [`JobError`] returned from a job entry point is fatal (the binary exits
//! with status 1). Per-resource failures use the same type but are logged and
//! counted instead of propagated.

use razeedash_core::error::{DbError, HandlerError, KeyError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The document store failed.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// A key could not be resolved.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Reading, decrypting, or writing a resource payload failed.
    #[error("storage error: {0}")]
    Handler(#[from] HandlerError),

    /// A record is internally inconsistent.
    #[error("resource '{id}' is invalid: {reason}")]
    InvalidRecord { id: String, reason: String },
}
