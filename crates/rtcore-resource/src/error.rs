use rtcore_persist::{PersistError, ResourceId};
use thiserror::Error;

/// Errors from the resource layer.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource is not loaded in memory.
    #[error("resource {id} is not resident")]
    NotResident {
        /// Resource id.
        id: ResourceId,
    },

    /// A resource could not be encoded or decoded.
    #[error("resource {id} could not be encoded: {reason}")]
    Serialization {
        /// Resource id.
        id: ResourceId,
        /// Codec failure detail.
        reason: String,
    },

    /// The task was dropped before it ran.
    #[error("task was cancelled before completing")]
    TaskCancelled,

    /// The task panicked.
    #[error("task panicked: {reason}")]
    TaskPanicked {
        /// Panic message.
        reason: String,
    },

    /// Runtime setup failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Persistence failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl ResourceError {
    /// True when the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResourceError::Persist(PersistError::NotFound { .. }))
    }
}

/// Result alias for the resource layer.
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;
