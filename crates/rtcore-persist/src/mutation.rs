//! Logical mutations recorded by write transactions.
//!
//! A committed transaction is an ordered batch of mutations. Both drivers
//! persist the batch atomically and replay it through [`Catalog::apply`],
//! so application must be deterministic.
//!
//! [`Catalog::apply`]: crate::catalog::Catalog::apply

use serde::{Deserialize, Serialize};

use crate::types::{ResourceId, ResourcePath, TaskId};

/// One change to durable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Registers a new, empty resource.
    CreateResource {
        /// New resource.
        id: ResourceId,
    },
    /// Replaces a resource's serialized contents.
    PutContents {
        /// Target resource.
        id: ResourceId,
        /// Serialized state.
        contents: Vec<u8>,
    },
    /// Links `path` to `id`.
    LinkPath {
        /// Concrete path.
        path: ResourcePath,
        /// Linked resource.
        id: ResourceId,
    },
    /// Removes the link at `path`.
    UnlinkPath {
        /// Concrete path.
        path: ResourcePath,
        /// Resource the path pointed at.
        id: ResourceId,
    },
    /// Drops a resource and its contents.
    DeleteResource {
        /// Removed resource.
        id: ResourceId,
    },
    /// Records a pending task.
    PutTask {
        /// Task id.
        task: TaskId,
    },
    /// Clears a pending task.
    DeleteTask {
        /// Task id.
        task: TaskId,
    },
}

impl Mutation {
    /// Resource this mutation touches.
    pub fn resource_id(&self) -> ResourceId {
        match self {
            Mutation::CreateResource { id }
            | Mutation::PutContents { id, .. }
            | Mutation::LinkPath { id, .. }
            | Mutation::UnlinkPath { id, .. }
            | Mutation::DeleteResource { id } => *id,
            Mutation::PutTask { task } | Mutation::DeleteTask { task } => task.resource_id,
        }
    }
}
