//! Event Chain Error Hierarchy
//!
//! Errors are grouped by the concern that raised them: infrastructure
//! (stores, cache, background tasks), configuration, cursor codec, the
//! upstream change feed and consumer facing watch requests.

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (storage, cache, background tasks)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed or unencodable cursor
    #[error(transparent)]
    Cursor(#[from] CursorError),

    /// Upstream change feed failures
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Consumer facing watch failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// A document did not satisfy the resource policy
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Primary store failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Fast cache failures
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// Sequence lock was not obtained before its ttl elapsed
    #[error("Acquire lock {key} timeout after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Node is shutting down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Unique index rejected a write. The message names the index and the
    /// offending key, e.g. `index_cursor dup key: <cursor>`.
    #[error("Duplicate key error: {0}")]
    DuplicateKey(String),

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Document payload (de)serialization failures
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Transaction was aborted for a reason other than a duplicate key
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A pipelined write partially failed
    #[error("Cache pipeline failed: {0}")]
    Pipeline(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    /// Resume point fell out of the source's retention, the feed must
    /// restart from a timestamp
    #[error("Resume point lost: {0}")]
    ResumePointLost(String),

    /// Feed was invalidated (collection dropped or renamed)
    #[error("Change stream invalidated")]
    Invalidated,

    #[error("Change stream closed")]
    Closed,

    /// Transient source failures, retried by re-watching from the last token
    #[error("Change stream source error: {0}")]
    Source(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Invalid watch parameter: {0}")]
    InvalidParam(String),

    /// The start cursor expired out of the chain or never existed
    #[error("Chain node of cursor {0} does not exist")]
    ChainNodeNotExist(String),

    /// Detail was evicted from the cache and could not be rebuilt
    #[error("Event detail of cursor {0} does not exist")]
    EventDetailNotExist(String),

    #[error("Start from time {start_from} is out of the retention window of {ttl_secs} seconds")]
    StartFromOutOfRange { start_from: i64, ttl_secs: u64 },

    /// The caller went away before any event was hit
    #[error("Watch request cancelled")]
    Cancelled,
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<CacheError> for Error {
    fn from(e: CacheError) -> Self {
        Error::System(SystemError::Cache(e))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::System(SystemError::Storage(StorageError::DbError(e.to_string())))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        StorageError::BincodeError(e).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        StorageError::JsonError(e).into()
    }
}

impl Error {
    /// Message of a unique index violation, if this is one.
    pub fn duplicate_key_message(&self) -> Option<&str> {
        match self {
            Error::System(SystemError::Storage(StorageError::DuplicateKey(msg))) => Some(msg),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Watch(WatchError::ChainNodeNotExist(_))
                | Error::Watch(WatchError::EventDetailNotExist(_))
        )
    }
}
