//! Error types for the persistence subsystem.

use thiserror::Error;

/// Errors raised by the persistence environment and its drivers.
#[derive(Debug, Error)]
pub enum PersistError {
    /// A path or resource id already exists.
    #[error("duplicate entry: {key}")]
    Duplicate {
        /// Offending path or id.
        key: String,
    },

    /// A path or resource id does not exist.
    #[error("not found: {key}")]
    NotFound {
        /// Missing path or id.
        key: String,
    },

    /// The transaction touched something outside its declared scope.
    #[error("{key} is outside the transaction scope")]
    OutOfScope {
        /// Offending path or id.
        key: String,
    },

    /// A wildcard path was used where a concrete path is required.
    #[error("wildcard path not allowed here: {path}")]
    WildcardNotAllowed {
        /// Offending path.
        path: String,
    },

    /// A path string could not be parsed.
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// Offending input.
        path: String,
        /// Parse failure detail.
        reason: String,
    },

    /// The configured block size is not usable.
    #[error("invalid block size {block_size} (minimum {minimum})")]
    InvalidBlockSize {
        /// Requested block size.
        block_size: usize,
        /// Smallest accepted block size.
        minimum: usize,
    },

    /// Durable data failed validation.
    #[error("corrupted store: {reason}")]
    Corrupted {
        /// Validation failure detail.
        reason: String,
    },

    /// Encoding or decoding a record failed.
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Codec failure detail.
        reason: String,
    },

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistError {
    pub(crate) fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    pub(crate) fn duplicate(key: impl ToString) -> Self {
        Self::Duplicate {
            key: key.to_string(),
        }
    }

    pub(crate) fn out_of_scope(key: impl ToString) -> Self {
        Self::OutOfScope {
            key: key.to_string(),
        }
    }
}

impl From<bincode::Error> for PersistError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type for persistence operations.
pub type PersistResult<T> = std::result::Result<T, PersistError>;
