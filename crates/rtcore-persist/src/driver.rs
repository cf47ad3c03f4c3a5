//! Storage backend contract.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::warn;

use crate::catalog::Catalog;
use crate::config::SyncMode;
use crate::error::PersistResult;
use crate::mutation::Mutation;
use crate::types::ResourceId;

/// Durable backend behind a persistence environment.
///
/// The environment serializes every call; drivers need no internal locking.
pub trait PersistenceDriver: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Catalog of the recovered durable state.
    fn load_catalog(&self) -> PersistResult<Catalog>;

    /// Serialized contents of `id`, if present.
    fn load_contents(&self, id: ResourceId) -> PersistResult<Option<Vec<u8>>>;

    /// Makes `batch` durable as one atomic unit.
    ///
    /// On error none of the batch is visible after recovery.
    fn apply(&mut self, batch: &[Mutation]) -> PersistResult<()>;

    /// Folds the log into a checkpoint and resets it.
    fn compact(&mut self) -> PersistResult<()>;
}

/// Forces `file` to disk as `mode` requires.
pub(crate) fn sync_file(file: &File, mode: SyncMode) -> io::Result<()> {
    match mode {
        SyncMode::Sync | SyncMode::BatchSync => file.sync_data(),
        SyncMode::AsyncSync => Ok(()),
    }
}

/// Writes `bytes` to `path` through a temp file and an atomic rename.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        // Directory fsync is best effort; some filesystems refuse it.
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!(dir = %dir.display(), error = %e, "directory sync failed");
        }
    }
    Ok(())
}

/// Encodes a checksummed snapshot: `magic u32 | crc32 u32 | len u64 | body`.
pub(crate) fn encode_snapshot(magic: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Validates and unwraps a snapshot written by [`encode_snapshot`].
pub(crate) fn decode_snapshot(magic: u32, bytes: &[u8]) -> Result<&[u8], String> {
    if bytes.len() < 16 {
        return Err(format!("snapshot too short: {} bytes", bytes.len()));
    }
    let read_u32 = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    let found = read_u32(0);
    if found != magic {
        return Err(format!("invalid magic: expected {magic:#x}, got {found:#x}"));
    }
    let crc = read_u32(4);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let body = bytes
        .get(16..16usize.saturating_add(len))
        .ok_or_else(|| format!("snapshot truncated: want {len} bytes"))?;
    let computed = crc32fast::hash(body);
    if computed != crc {
        return Err(format!("checksum mismatch: expected {crc:#x}, got {computed:#x}"));
    }
    Ok(body)
}
