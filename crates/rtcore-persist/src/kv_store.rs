//! Embedded key-value store with a write-ahead log and checkpoints.
//!
//! Reads are served from an in-memory `BTreeMap`. Each write batch is one
//! WAL record, `len u32 LE | crc32 u32 LE | bincode(WalEntry)`, so a batch is
//! either fully replayed or not at all. A checkpoint snapshots the map and
//! empties the WAL.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncMode;
use crate::driver::{decode_snapshot, encode_snapshot, sync_file, write_atomically};
use crate::error::{PersistError, PersistResult};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";
const WAL_RECORD_HEADER: usize = 8;

/// Magic number of the store checkpoint.
pub const KV_CHECKPOINT_MAGIC: u32 = 0x5254_4B56;

/// One change in a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    /// Insert or overwrite a key.
    Put {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key; missing keys are ignored.
    Delete {
        /// Key bytes.
        key: Vec<u8>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    seq: u64,
    ops: Vec<KvOp>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// File-backed ordered key-value store.
pub struct KvStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    dir: PathBuf,
    wal: File,
    wal_len: u64,
    seq: u64,
    sync_mode: SyncMode,
    batches_since_checkpoint: u64,
}

impl KvStore {
    /// Opens or creates a store in `dir`, loading the checkpoint and
    /// replaying complete WAL batches.
    pub fn open(dir: &Path, sync_mode: SyncMode) -> PersistResult<Self> {
        fs::create_dir_all(dir)?;
        let checkpoint = load_checkpoint(&dir.join(CHECKPOINT_FILENAME))?;

        let mut wal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(WAL_FILENAME))?;
        let mut bytes = Vec::new();
        wal.read_to_end(&mut bytes)?;

        let mut data: BTreeMap<Vec<u8>, Vec<u8>> = checkpoint.entries.into_iter().collect();
        let mut seq = checkpoint.seq;
        let mut offset = 0usize;
        let mut replayed = 0usize;

        while let Some((entry, next)) = read_record(&bytes, offset) {
            if entry.seq > seq {
                apply_ops(&mut data, entry.ops);
                seq = entry.seq;
                replayed += 1;
            }
            offset = next;
        }

        if offset < bytes.len() {
            warn!(
                dir = %dir.display(),
                discarded = bytes.len() - offset,
                "discarding torn WAL tail"
            );
            wal.set_len(offset as u64)?;
            wal.sync_all()?;
        }
        wal.seek(SeekFrom::Start(offset as u64))?;
        info!(dir = %dir.display(), seq, replayed, keys = data.len(), "kv store opened");

        Ok(Self {
            data,
            dir: dir.to_path_buf(),
            wal,
            wal_len: offset as u64,
            seq,
            sync_mode,
            batches_since_checkpoint: replayed as u64,
        })
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.data
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Batches written since the last checkpoint.
    pub fn batches_since_checkpoint(&self) -> u64 {
        self.batches_since_checkpoint
    }

    /// Current WAL size in bytes.
    pub fn wal_len(&self) -> u64 {
        self.wal_len
    }

    /// Path of the WAL file.
    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILENAME)
    }

    /// Logs `ops` as one record, then applies them.
    pub fn write_batch(&mut self, ops: Vec<KvOp>) -> PersistResult<()> {
        let entry = WalEntry {
            seq: self.seq + 1,
            ops,
        };
        let body = bincode::serialize(&entry)?;
        let mut record = Vec::with_capacity(WAL_RECORD_HEADER + body.len());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        record.extend_from_slice(&body);

        let written = self
            .wal
            .seek(SeekFrom::Start(self.wal_len))
            .and_then(|_| self.wal.write_all(&record))
            .and_then(|_| sync_file(&self.wal, self.sync_mode));
        if let Err(e) = written {
            if let Err(trim) = self.wal.set_len(self.wal_len) {
                warn!(error = %trim, "could not trim failed WAL append");
            }
            return Err(e.into());
        }

        self.wal_len += record.len() as u64;
        self.seq = entry.seq;
        self.batches_since_checkpoint += 1;
        debug!(seq = self.seq, ops = entry.ops.len(), bytes = record.len(), "wal batch");
        apply_ops(&mut self.data, entry.ops);
        Ok(())
    }

    /// Snapshots the map and truncates the WAL.
    pub fn checkpoint(&mut self) -> PersistResult<()> {
        let checkpoint = Checkpoint {
            seq: self.seq,
            entries: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let body = bincode::serialize(&checkpoint)?;
        write_atomically(
            &self.dir.join(CHECKPOINT_FILENAME),
            &encode_snapshot(KV_CHECKPOINT_MAGIC, &body),
        )?;

        self.wal.set_len(0)?;
        self.wal.sync_all()?;
        self.wal_len = 0;
        self.batches_since_checkpoint = 0;
        info!(dir = %self.dir.display(), seq = self.seq, keys = self.data.len(), "kv checkpoint");
        Ok(())
    }
}

fn load_checkpoint(path: &Path) -> PersistResult<Checkpoint> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
        Err(e) => return Err(e.into()),
    };
    let body =
        decode_snapshot(KV_CHECKPOINT_MAGIC, &bytes).map_err(|reason| PersistError::Corrupted { reason })?;
    Ok(bincode::deserialize(body)?)
}

/// Decodes the WAL record at `offset`; `None` for a torn or corrupt record.
fn read_record(bytes: &[u8], offset: usize) -> Option<(WalEntry, usize)> {
    let header = bytes.get(offset..offset.checked_add(WAL_RECORD_HEADER)?)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let start = offset + WAL_RECORD_HEADER;
    let body = bytes.get(start..start.checked_add(len)?)?;
    if crc32fast::hash(body) != crc {
        return None;
    }
    let entry = bincode::deserialize(body).ok()?;
    Some((entry, start + len))
}

fn apply_ops(data: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: Vec<KvOp>) {
    for op in ops {
        match op {
            KvOp::Put { key, value } => {
                data.insert(key, value);
            }
            KvOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(k: &str, v: &str) -> KvOp {
        KvOp::Put {
            key: k.as_bytes().to_vec(),
            value: v.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_write_batch_and_get() {
        let dir = tempdir().unwrap();
        let mut store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
        store.write_batch(vec![put("a", "1"), put("b", "2")]).unwrap();
        store
            .write_batch(vec![KvOp::Delete { key: b"a".to_vec() }])
            .unwrap();
        assert_eq!(store.get(b"a"), None);
        assert_eq!(store.get(b"b"), Some(&b"2"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_scan_prefix() {
        let dir = tempdir().unwrap();
        let mut store = KvStore::open(dir.path(), SyncMode::AsyncSync).unwrap();
        store
            .write_batch(vec![put("p/1", "x"), put("p/2", "y"), put("q/1", "z")])
            .unwrap();
        let keys: Vec<&[u8]> = store.scan_prefix(b"p/").map(|(k, _)| k).collect();
        assert_eq!(keys, vec![&b"p/1"[..], &b"p/2"[..]]);
        assert_eq!(store.scan_prefix(b"r/").count(), 0);
    }

    #[test]
    fn test_wal_replay_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
            store.write_batch(vec![put("k1", "v1"), put("k2", "v2")]).unwrap();
            store
                .write_batch(vec![KvOp::Delete { key: b"k1".to_vec() }])
                .unwrap();
        }
        let store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
        assert_eq!(store.get(b"k1"), None);
        assert_eq!(store.get(b"k2"), Some(&b"v2"[..]));
        assert_eq!(store.batches_since_checkpoint(), 2);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempdir().unwrap();
        {
            let mut store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
            store.write_batch(vec![put("key", "value")]).unwrap();
            store.checkpoint().unwrap();
            assert_eq!(store.wal_len(), 0);
            store.write_batch(vec![put("after", "cp")]).unwrap();
        }
        let store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
        assert_eq!(store.get(b"key"), Some(&b"value"[..]));
        assert_eq!(store.get(b"after"), Some(&b"cp"[..]));
    }

    #[test]
    fn test_torn_batch_is_discarded() {
        let dir = tempdir().unwrap();
        let first_len;
        {
            let mut store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
            store.write_batch(vec![put("a", "1")]).unwrap();
            first_len = store.wal_len();
            store.write_batch(vec![put("b", "2"), put("c", "3")]).unwrap();
        }
        let wal = dir.path().join(WAL_FILENAME);
        let file = OpenOptions::new().write(true).open(&wal).unwrap();
        file.set_len(first_len + 5).unwrap();
        drop(file);

        let store = KvStore::open(dir.path(), SyncMode::Sync).unwrap();
        assert_eq!(store.get(b"a"), Some(&b"1"[..]));
        assert_eq!(store.get(b"b"), None);
        assert_eq!(store.get(b"c"), None);
        assert_eq!(fs::metadata(&wal).unwrap().len(), first_len);
    }
}
