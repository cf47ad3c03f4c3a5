//! Persistence configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PersistError, PersistResult};

/// Default size of a persistence block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest accepted block size; one journal header plus a commit payload must fit.
pub const MIN_BLOCK_SIZE: usize = 64;

/// When writes are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync data, then fsync the commit record (safest, slowest).
    #[default]
    Sync,
    /// One fsync after the commit record; torn data is caught by checksums.
    BatchSync,
    /// Leave flushing to the OS (fastest, recent commits may be lost).
    AsyncSync,
}

/// Which driver backs the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Append-only journal of fixed-size blocks.
    #[default]
    Journal,
    /// Embedded key-value store with a write-ahead log.
    Embedded,
}

/// Journal-file driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding `journal.log` and `checkpoint.bin`.
    pub root: PathBuf,
    /// Sync strategy.
    pub sync_mode: SyncMode,
    /// Journal size that triggers a checkpoint (default 64MB).
    pub compact_threshold_bytes: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/journal"),
            sync_mode: SyncMode::Sync,
            compact_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Embedded-database driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    /// Directory holding the store's WAL and snapshot.
    pub path: PathBuf,
    /// Sync strategy for the WAL.
    pub sync_mode: SyncMode,
    /// WAL batches between automatic checkpoints (default 1024).
    pub checkpoint_interval: u64,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/embedded"),
            sync_mode: SyncMode::Sync,
            checkpoint_interval: 1024,
        }
    }
}

/// Persistence environment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Driver selection.
    pub backend: BackendKind,
    /// Size of one persistence block in bytes.
    pub resource_block_size: usize,
    /// Journal-file driver settings.
    pub journal: JournalConfig,
    /// Embedded-database driver settings.
    pub embedded: EmbeddedConfig,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            resource_block_size: DEFAULT_BLOCK_SIZE,
            journal: JournalConfig::default(),
            embedded: EmbeddedConfig::default(),
        }
    }
}

impl PersistenceConfig {
    /// Journal-backed config rooted at `root`.
    pub fn journal(root: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendKind::Journal,
            journal: JournalConfig {
                root: root.as_ref().to_path_buf(),
                ..JournalConfig::default()
            },
            ..Self::default()
        }
    }

    /// Embedded-store config at `path`.
    pub fn embedded(path: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendKind::Embedded,
            embedded: EmbeddedConfig {
                path: path.as_ref().to_path_buf(),
                ..EmbeddedConfig::default()
            },
            ..Self::default()
        }
    }

    /// Overrides the block size.
    pub fn with_block_size(mut self, resource_block_size: usize) -> Self {
        self.resource_block_size = resource_block_size;
        self
    }

    /// Configured block size.
    pub fn block_size(&self) -> usize {
        self.resource_block_size
    }

    /// Rejects block sizes below [`MIN_BLOCK_SIZE`].
    pub fn validate(&self) -> PersistResult<()> {
        let block_size = self.block_size();
        if block_size < MIN_BLOCK_SIZE {
            return Err(PersistError::InvalidBlockSize {
                block_size,
                minimum: MIN_BLOCK_SIZE,
            });
        }
        Ok(())
    }
}
