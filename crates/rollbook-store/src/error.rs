// ABOUTME: Error taxonomy shared by every rollbook-store component.
// ABOUTME: NotFound, Corrupt, WriteFailed, and AppendFailed map one-to-one onto the store's failure policy.

use std::path::PathBuf;

use rollbook_core::{CodecError, ValidationError};
use thiserror::Error;

/// Errors that can occur in store, changelog, backup, and recovery operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("corrupt data at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The target file still holds its previous content.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The entry is kept in memory and persisted with the next append or flush.
    #[error("changelog append failed: {source}")]
    AppendFailed {
        #[source]
        source: Box<StoreError>,
    },

    #[error("invalid entity: {0}")]
    Invalid(#[from] ValidationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Map a codec failure on a specific file to `Corrupt`.
    pub(crate) fn codec(path: impl Into<PathBuf>, err: CodecError) -> Self {
        Self::corrupt(path, err)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
