//! Embedded-database driver on top of [`KvStore`].
//!
//! Key layout:
//!
//! | key | value |
//! |---|---|
//! | `r/{id}` | bincode `ResourceMeta` |
//! | `c/{id}/{chunk:08}` | one `resource_block_size` slice of contents |
//! | `p/{path}` | bincode `(ResourcePath, ResourceId)` |
//! | `t/{id}/{task:020}` | empty |
//!
//! A committed batch becomes a single WAL record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::EmbeddedConfig;
use crate::driver::PersistenceDriver;
use crate::error::{PersistError, PersistResult};
use crate::kv_store::{KvOp, KvStore};
use crate::mutation::Mutation;
use crate::types::{ResourceId, ResourcePath, TaskId};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ResourceMeta {
    len: u64,
    chunks: u32,
}

fn resource_key(id: ResourceId) -> Vec<u8> {
    format!("r/{id}").into_bytes()
}

fn chunk_key(id: ResourceId, chunk: u32) -> Vec<u8> {
    format!("c/{id}/{chunk:08}").into_bytes()
}

fn path_key(path: &ResourcePath) -> Vec<u8> {
    format!("p/{path}").into_bytes()
}

fn task_key(task: TaskId) -> Vec<u8> {
    format!("t/{}/{:020}", task.resource_id, task.task).into_bytes()
}

/// Persistence driver storing resources as chunked key-value entries.
pub struct EmbeddedDriver {
    store: KvStore,
    block_size: usize,
    checkpoint_interval: u64,
}

impl EmbeddedDriver {
    /// Opens or creates the store at `config.path`.
    pub fn open(config: &EmbeddedConfig, block_size: usize) -> PersistResult<Self> {
        let store = KvStore::open(&config.path, config.sync_mode)?;
        Ok(Self {
            store,
            block_size,
            checkpoint_interval: config.checkpoint_interval,
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &KvStore {
        &self.store
    }

    fn meta(&self, id: ResourceId) -> PersistResult<Option<ResourceMeta>> {
        self.store
            .get(&resource_key(id))
            .map(bincode::deserialize)
            .transpose()
            .map_err(Into::into)
    }

    fn translate(&self, batch: &[Mutation]) -> PersistResult<Vec<KvOp>> {
        // Chunk counts as of earlier mutations in the same batch.
        let mut chunks: HashMap<ResourceId, u32> = HashMap::new();
        let mut ops = Vec::new();

        for mutation in batch {
            match mutation {
                Mutation::CreateResource { id } => {
                    chunks.insert(*id, 0);
                    ops.push(KvOp::Put {
                        key: resource_key(*id),
                        value: bincode::serialize(&ResourceMeta::default())?,
                    });
                }
                Mutation::PutContents { id, contents } => {
                    let old = match chunks.get(id) {
                        Some(count) => *count,
                        None => self.meta(*id)?.map(|m| m.chunks).unwrap_or(0),
                    };
                    let mut count = 0u32;
                    for (index, chunk) in contents.chunks(self.block_size).enumerate() {
                        count = index as u32 + 1;
                        ops.push(KvOp::Put {
                            key: chunk_key(*id, index as u32),
                            value: chunk.to_vec(),
                        });
                    }
                    ops.extend((count..old).map(|index| KvOp::Delete {
                        key: chunk_key(*id, index),
                    }));
                    chunks.insert(*id, count);
                    let meta = ResourceMeta {
                        len: contents.len() as u64,
                        chunks: count,
                    };
                    ops.push(KvOp::Put {
                        key: resource_key(*id),
                        value: bincode::serialize(&meta)?,
                    });
                }
                Mutation::LinkPath { path, id } => ops.push(KvOp::Put {
                    key: path_key(path),
                    value: bincode::serialize(&(path, id))?,
                }),
                Mutation::UnlinkPath { path, .. } => ops.push(KvOp::Delete { key: path_key(path) }),
                Mutation::DeleteResource { id } => {
                    let old = match chunks.get(id) {
                        Some(count) => *count,
                        None => self.meta(*id)?.map(|m| m.chunks).unwrap_or(0),
                    };
                    ops.extend((0..old).map(|index| KvOp::Delete {
                        key: chunk_key(*id, index),
                    }));
                    ops.push(KvOp::Delete { key: resource_key(*id) });
                    chunks.insert(*id, 0);
                }
                Mutation::PutTask { task } => ops.push(KvOp::Put {
                    key: task_key(*task),
                    value: Vec::new(),
                }),
                Mutation::DeleteTask { task } => ops.push(KvOp::Delete { key: task_key(*task) }),
            }
        }
        Ok(ops)
    }
}

impl PersistenceDriver for EmbeddedDriver {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn load_catalog(&self) -> PersistResult<Catalog> {
        let mut catalog = Catalog::new();

        for (key, _) in self.store.scan_prefix(b"r/") {
            let id = parse_id(&key[2..])?;
            catalog.apply(&Mutation::CreateResource { id });
        }
        for (_, value) in self.store.scan_prefix(b"p/") {
            let (path, id): (ResourcePath, ResourceId) = bincode::deserialize(value)?;
            if !catalog.contains(id) {
                warn!(%path, %id, "path links a missing resource; skipping");
                continue;
            }
            catalog.apply(&Mutation::LinkPath { path, id });
        }
        for (key, _) in self.store.scan_prefix(b"t/") {
            let text = std::str::from_utf8(&key[2..]).map_err(|e| PersistError::Corrupted {
                reason: format!("task key: {e}"),
            })?;
            let (id, task) = text.split_once('/').ok_or_else(|| PersistError::Corrupted {
                reason: format!("task key: {text}"),
            })?;
            let task = task.parse::<u64>().map_err(|e| PersistError::Corrupted {
                reason: format!("task number {task}: {e}"),
            })?;
            let id = parse_id(id.as_bytes())?;
            catalog.apply(&Mutation::PutTask {
                task: TaskId::new(id, task),
            });
        }

        debug!(
            resources = catalog.resource_count(),
            paths = catalog.path_count(),
            "embedded catalog loaded"
        );
        Ok(catalog)
    }

    fn load_contents(&self, id: ResourceId) -> PersistResult<Option<Vec<u8>>> {
        let Some(meta) = self.meta(id)? else {
            return Ok(None);
        };
        let mut contents = Vec::with_capacity(meta.len as usize);
        for index in 0..meta.chunks {
            let chunk = self
                .store
                .get(&chunk_key(id, index))
                .ok_or_else(|| PersistError::Corrupted {
                    reason: format!("resource {id} is missing chunk {index}"),
                })?;
            contents.extend_from_slice(chunk);
        }
        if contents.len() as u64 != meta.len {
            return Err(PersistError::Corrupted {
                reason: format!("resource {id}: expected {} bytes, found {}", meta.len, contents.len()),
            });
        }
        Ok(Some(contents))
    }

    fn apply(&mut self, batch: &[Mutation]) -> PersistResult<()> {
        let ops = self.translate(batch)?;
        self.store.write_batch(ops)?;
        if self.checkpoint_interval > 0 && self.store.batches_since_checkpoint() >= self.checkpoint_interval {
            if let Err(e) = self.store.checkpoint() {
                warn!(error = %e, "embedded checkpoint failed");
            }
        }
        Ok(())
    }

    fn compact(&mut self) -> PersistResult<()> {
        self.store.checkpoint()
    }
}

fn parse_id(bytes: &[u8]) -> PersistResult<ResourceId> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PersistError::Corrupted {
            reason: format!("bad resource id key: {}", String::from_utf8_lossy(bytes)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use std::path::Path;

    fn config(path: &Path) -> EmbeddedConfig {
        EmbeddedConfig {
            path: path.to_path_buf(),
            sync_mode: SyncMode::Sync,
            checkpoint_interval: 0,
        }
    }

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    #[test]
    fn test_contents_are_chunked() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = EmbeddedDriver::open(&config(dir.path()), 64).unwrap();
        let id = ResourceId::new_random();
        let contents: Vec<u8> = (0..200u8).collect();
        driver
            .apply(&[
                Mutation::CreateResource { id },
                Mutation::PutContents {
                    id,
                    contents: contents.clone(),
                },
                Mutation::LinkPath { path: p("/a"), id },
            ])
            .unwrap();
        assert_eq!(driver.store().scan_prefix(b"c/").count(), 4);
        assert_eq!(driver.load_contents(id).unwrap(), Some(contents));

        driver
            .apply(&[Mutation::PutContents {
                id,
                contents: b"short".to_vec(),
            }])
            .unwrap();
        assert_eq!(driver.store().scan_prefix(b"c/").count(), 1);
        assert_eq!(driver.load_contents(id).unwrap(), Some(b"short".to_vec()));
    }

    #[test]
    fn test_catalog_rebuilt_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = ResourceId::new_random();
        {
            let mut driver = EmbeddedDriver::open(&config(dir.path()), 64).unwrap();
            driver
                .apply(&[
                    Mutation::CreateResource { id },
                    Mutation::LinkPath {
                        path: p("node://users/1"),
                        id,
                    },
                    Mutation::PutTask {
                        task: TaskId::new(id, 3),
                    },
                ])
                .unwrap();
        }
        let driver = EmbeddedDriver::open(&config(dir.path()), 64).unwrap();
        let catalog = driver.load_catalog().unwrap();
        assert_eq!(catalog.resource_id(&p("node://users/1")), Some(id));
        assert_eq!(catalog.tasks(id), vec![TaskId::new(id, 3)]);
    }

    #[test]
    fn test_delete_resource_removes_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = EmbeddedDriver::open(&config(dir.path()), 64).unwrap();
        let id = ResourceId::new_random();
        driver
            .apply(&[
                Mutation::CreateResource { id },
                Mutation::PutContents {
                    id,
                    contents: vec![1; 130],
                },
            ])
            .unwrap();
        driver
            .apply(&[Mutation::DeleteResource { id }])
            .unwrap();
        assert!(driver.store().is_empty());
        assert_eq!(driver.load_contents(id).unwrap(), None);
    }
}
