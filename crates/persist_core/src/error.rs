//! Error types for the Persist engine.

use crate::types::{EntityKey, TransactionId, TypeName};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the engine.
///
/// Callers must be ready for [`CoreError::TransactionKilled`] from any call
/// that can block, and should retry the whole transaction when they see it.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] persist_storage::StorageError),

    /// Freeze/thaw error.
    #[error("codec error: {0}")]
    Codec(#[from] persist_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine is not running.
    #[error("engine is down")]
    EngineDown,

    /// Another engine instance already owns the directory.
    #[error("engine already running: instance directory is locked")]
    AlreadyRunning,

    /// The transaction does not own the entity, or is no longer alive.
    #[error("access violation on {key}")]
    AccessViolation {
        /// Entity accessed.
        key: EntityKey,
    },

    /// The value's type differs from the entity's declared type.
    #[error("type mismatch on {key}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Entity written.
        key: EntityKey,
        /// Declared type.
        expected: TypeName,
        /// Type of the rejected value.
        actual: String,
    },

    /// The transaction was chosen as a deadlock victim and has been rolled back.
    #[error("{txid} killed to break a deadlock")]
    TransactionKilled {
        /// The victim.
        txid: TransactionId,
    },

    /// Commit was attempted on a transaction that was no longer alive.
    #[error("{txid} aborted")]
    TransactionAborted {
        /// The transaction.
        txid: TransactionId,
    },

    /// Prepare or logging failed; the transaction has been rolled back.
    #[error("{txid} commit failed: {reason}")]
    CommitFailed {
        /// The transaction.
        txid: TransactionId,
        /// Why.
        reason: String,
    },

    /// `read_existing` found no such entity.
    #[error("entity not found: {key}")]
    NotFound {
        /// The missing entity.
        key: EntityKey,
    },

    /// Snapshot or recovery I/O failed.
    #[error("storage I/O failure: {message}")]
    StorageIoFailure {
        /// What failed.
        message: String,
    },

    /// A log segment is corrupt.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// A checkpoint file is corrupt.
    #[error("checkpoint corruption: {message}")]
    CheckpointCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The snapshot file is corrupt.
    #[error("snapshot corruption: {message}")]
    SnapshotCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in a persisted record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a checkpoint corruption error.
    pub fn checkpoint_corruption(message: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            message: message.into(),
        }
    }

    /// Creates a snapshot corruption error.
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(txid: TransactionId, reason: impl Into<String>) -> Self {
        Self::CommitFailed {
            txid,
            reason: reason.into(),
        }
    }

    /// Creates a storage I/O failure error.
    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self::StorageIoFailure {
            message: message.into(),
        }
    }

    /// Checks whether this error is a storage I/O failure in the broad sense:
    /// raw I/O, backend errors and on-disk corruption.
    #[must_use]
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::Io(_)
                | Self::StorageIoFailure { .. }
                | Self::LogCorruption { .. }
                | Self::CheckpointCorruption { .. }
                | Self::SnapshotCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Checks whether the failing transaction has already been rolled back,
    /// so the caller must start over.
    #[must_use]
    pub fn ends_transaction(&self) -> bool {
        matches!(
            self,
            Self::TransactionKilled { .. } | Self::TransactionAborted { .. } | Self::CommitFailed { .. }
        )
    }
}
