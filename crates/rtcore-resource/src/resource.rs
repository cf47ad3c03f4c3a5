//! The resource contract and a general-purpose document resource.

use std::collections::BTreeMap;

use rtcore_persist::ResourceId;
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, ResourceResult};

/// Stateful object managed by the resource service.
///
/// While resident a resource is owned by the service; it is serialized
/// when the last holder releases it and rebuilt with [`Resource::deserialize`]
/// on the next acquire.
pub trait Resource: Send + 'static {
    /// Stable id.
    fn id(&self) -> ResourceId;

    /// Encodes the current state.
    fn serialize(&self) -> ResourceResult<Vec<u8>>;

    /// Rebuilds a resource from bytes produced by [`Resource::serialize`].
    fn deserialize(id: ResourceId, bytes: &[u8]) -> ResourceResult<Self>
    where
        Self: Sized;

    /// Called once when the resource leaves memory.
    fn unload(&mut self) {}
}

/// Resource holding string attributes and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentResource {
    id: ResourceId,
    /// Named string attributes.
    pub attributes: BTreeMap<String, String>,
    /// Opaque application state.
    pub payload: Vec<u8>,
}

impl DocumentResource {
    /// Empty document with a fresh id.
    pub fn new() -> Self {
        Self::with_id(ResourceId::new_random())
    }

    /// Empty document with `id`.
    pub fn with_id(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    /// Sets an attribute, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.attributes.insert(key.into(), value.into())
    }

    /// Attribute value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl Default for DocumentResource {
    fn default() -> Self {
        Self::new()
    }
}

impl Resource for DocumentResource {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn serialize(&self) -> ResourceResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ResourceError::Serialization {
            id: self.id,
            reason: e.to_string(),
        })
    }

    fn deserialize(id: ResourceId, bytes: &[u8]) -> ResourceResult<Self> {
        let document: DocumentResource =
            bincode::deserialize(bytes).map_err(|e| ResourceError::Serialization {
                id,
                reason: e.to_string(),
            })?;
        if document.id != id {
            return Err(ResourceError::Serialization {
                id,
                reason: format!("stored document belongs to {}", document.id),
            });
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip() {
        let mut doc = DocumentResource::new();
        doc.set("name", "arena");
        doc.payload = vec![1, 2, 3];
        let bytes = Resource::serialize(&doc).unwrap();
        assert_eq!(<DocumentResource as Resource>::deserialize(doc.id(), &bytes).unwrap(), doc);
    }

    #[test]
    fn test_document_rejects_foreign_id() {
        let doc = DocumentResource::new();
        let bytes = Resource::serialize(&doc).unwrap();
        assert!(matches!(
            <DocumentResource as Resource>::deserialize(ResourceId::new_random(), &bytes),
            Err(ResourceError::Serialization { .. })
        ));
        assert!(<DocumentResource as Resource>::deserialize(doc.id(), b"\xff").is_err());
    }
}
