//! Crate-wide error type.
//!
//! Mirrors the error kinds named in the storage/sync engine's design:
//! each component (`blob_store`, `catalog`, `lock_manager`, `remote`,
//! `sync`) defines operations that fail in ways a caller can match on,
//! while internally mapping lower-level errors (`sqlx`, I/O, JSON, HTTP)
//! into one of these variants via `#[from]` or explicit construction.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error enum.
#[derive(Debug, Error)]
pub enum Error {
    /// Catalog entry, blob, or lock not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint was violated (e.g. stable_id collision that
    /// survived retry, or a duplicate gold designation).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed input: unknown file_type, bad regex, invalid cutoff, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Edit attempted against a lock held by another session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock could not be acquired within the allotted timeout/attempts.
    #[error("lock failed: {0}")]
    LockFailed(String),

    /// An invariant was violated (ref-count underflow, blob missing while
    /// refs > 0, etc). Logged and counted, never a panic; the garbage
    /// collector is the recovery path.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// A recoverable I/O or database "busy" condition, already retried
    /// internally with bounded backoff before surfacing here.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The remote replica (WebDAV endpoint) is unreachable or refused
    /// the connection; sync should report this as a sync error, not a
    /// local failure.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Underlying filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of a metadata bag column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error talking to the remote replica.
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Archive (zip) error during import/export.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    /// True if this error represents a condition a caller may usefully
    /// retry (transient I/O, a busy database, or a temporarily
    /// unreachable remote).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientIo(_) | Error::RemoteUnavailable(_)
        ) || matches!(self, Error::Database(sqlx::Error::PoolTimedOut))
    }
}
