//! Journal-file driver: an append-only log of fixed-size blocks.
//!
//! Each committed transaction is its bincode-encoded mutation batch split
//! across `Data` blocks, followed by one `Commit` block. Every block starts
//! with a 32-byte header:
//!
//! ```text
//! 0  magic       u32 LE  "RTJ1"
//! 4  kind        u8      0 = Data, 1 = Commit
//! 5  reserved    [u8; 3]
//! 8  txn_id      u64 LE
//! 16 index       u32 LE  block number within the transaction
//! 20 payload_len u32 LE
//! 24 crc32       u32 LE  over bytes 0..24, 28..32 and the payload
//! 28 block_size  u32 LE  size of this block including the header
//! ```
//!
//! A commit payload is `data_blocks u32 LE | record_len u64 LE`. Blocks carry
//! their own size, so a journal written with one `resource_block_size` is
//! still read correctly after the setting changes; new transactions use the
//! configured size. Recovery replays complete transactions and truncates the
//! file at the first torn, corrupt or uncommitted block. Compaction folds the
//! image into `checkpoint.bin` and empties the journal.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{JournalConfig, SyncMode, MIN_BLOCK_SIZE};
use crate::driver::{decode_snapshot, encode_snapshot, sync_file, write_atomically, PersistenceDriver};
use crate::error::{PersistError, PersistResult};
use crate::mutation::Mutation;
use crate::types::ResourceId;

/// Magic number at the start of every journal block.
pub const JOURNAL_BLOCK_MAGIC: u32 = 0x5254_4A31;

/// Magic number of the checkpoint file.
pub const JOURNAL_CHECKPOINT_MAGIC: u32 = 0x5254_4350;

/// Size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 32;

const COMMIT_PAYLOAD_SIZE: usize = 12;
const JOURNAL_FILE: &str = "journal.log";
const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Role of a journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Part of a transaction's encoded batch.
    Data,
    /// Terminates a transaction.
    Commit,
}

impl BlockKind {
    fn to_u8(self) -> u8 {
        match self {
            BlockKind::Data => 0,
            BlockKind::Commit => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BlockKind::Data),
            1 => Some(BlockKind::Commit),
            _ => None,
        }
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block role.
    pub kind: BlockKind,
    /// Owning transaction.
    pub txn_id: u64,
    /// Position within the transaction.
    pub index: u32,
    /// Bytes of payload following the header.
    pub payload_len: u32,
}

/// Encodes one block of exactly `block_size` bytes.
pub fn encode_block(header: &BlockHeader, payload: &[u8], block_size: usize) -> Vec<u8> {
    let mut block = vec![0u8; block_size];
    block[0..4].copy_from_slice(&JOURNAL_BLOCK_MAGIC.to_le_bytes());
    block[4] = header.kind.to_u8();
    block[8..16].copy_from_slice(&header.txn_id.to_le_bytes());
    block[16..20].copy_from_slice(&header.index.to_le_bytes());
    block[20..24].copy_from_slice(&header.payload_len.to_le_bytes());
    block[28..32].copy_from_slice(&(block_size as u32).to_le_bytes());
    block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(payload);

    let crc = block_crc(&block, payload);
    block[24..28].copy_from_slice(&crc.to_le_bytes());
    block
}

fn block_crc(block: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block[0..24]);
    hasher.update(&block[28..32]);
    hasher.update(payload);
    hasher.finalize()
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Size recorded in the header at the start of `bytes`, if it looks like a
/// block header.
pub fn stored_block_size(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < BLOCK_HEADER_SIZE || u32_at(bytes, 0) != JOURNAL_BLOCK_MAGIC {
        return None;
    }
    let size = u32_at(bytes, 28) as usize;
    (size >= MIN_BLOCK_SIZE).then_some(size)
}

/// Validates one block; `None` if it is torn or corrupt, or if its recorded
/// size is not `block.len()`.
pub fn decode_block(block: &[u8]) -> Option<(BlockHeader, &[u8])> {
    if stored_block_size(block)? != block.len() {
        return None;
    }
    let kind = BlockKind::from_u8(block[4])?;
    let mut txn = [0u8; 8];
    txn.copy_from_slice(&block[8..16]);
    let header = BlockHeader {
        kind,
        txn_id: u64::from_le_bytes(txn),
        index: u32_at(block, 16),
        payload_len: u32_at(block, 20),
    };
    let payload = block.get(BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + header.payload_len as usize)?;
    if block_crc(block, payload) != u32_at(block, 24) {
        return None;
    }
    Some((header, payload))
}

/// Splits an encoded batch into data blocks plus a commit block.
pub fn encode_transaction(txn_id: u64, record: &[u8], block_size: usize) -> Vec<u8> {
    let capacity = block_size - BLOCK_HEADER_SIZE;
    let mut out = Vec::with_capacity((record.len() / capacity + 2) * block_size);
    let mut data_blocks = 0u32;
    for (index, chunk) in record.chunks(capacity).enumerate() {
        let header = BlockHeader {
            kind: BlockKind::Data,
            txn_id,
            index: index as u32,
            payload_len: chunk.len() as u32,
        };
        out.extend(encode_block(&header, chunk, block_size));
        data_blocks += 1;
    }

    let mut commit = [0u8; COMMIT_PAYLOAD_SIZE];
    commit[0..4].copy_from_slice(&data_blocks.to_le_bytes());
    commit[4..12].copy_from_slice(&(record.len() as u64).to_le_bytes());
    let header = BlockHeader {
        kind: BlockKind::Commit,
        txn_id,
        index: data_blocks,
        payload_len: COMMIT_PAYLOAD_SIZE as u32,
    };
    out.extend(encode_block(&header, &commit, block_size));
    out
}

/// Complete transaction found while scanning a journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedTransaction {
    /// Transaction id.
    pub txn_id: u64,
    /// Encoded mutation batch.
    pub record: Vec<u8>,
}

/// Result of scanning journal bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalScan {
    /// Complete transactions in order.
    pub transactions: Vec<ScannedTransaction>,
    /// Byte offset just past the last commit block.
    pub valid_len: u64,
    /// Blocks examined.
    pub blocks_scanned: u64,
}

/// Scans journal bytes and stops at the first block that does not extend a
/// well-formed transaction. Each block is read at the size its header
/// records.
pub fn scan_journal(bytes: &[u8]) -> JournalScan {
    let mut scan = JournalScan::default();
    let mut open: Option<(u64, Vec<u8>, u32)> = None;
    let mut last_txn: Option<u64> = None;
    let mut offset = 0usize;

    while let Some(block_size) = stored_block_size(&bytes[offset..]) {
        let Some(block) = bytes.get(offset..offset + block_size) else {
            debug!(offset, block_size, "journal scan stopped at short block");
            break;
        };
        let Some((header, payload)) = decode_block(block) else {
            debug!(offset, "journal scan stopped at invalid block");
            break;
        };
        scan.blocks_scanned += 1;

        if last_txn.is_some_and(|last| header.txn_id <= last) {
            debug!(offset, txn_id = header.txn_id, "journal scan stopped at stale transaction id");
            break;
        }

        match header.kind {
            BlockKind::Data => {
                let (txn_id, mut record, next) = open.take().unwrap_or((header.txn_id, Vec::new(), 0));
                if txn_id != header.txn_id || header.index != next {
                    debug!(offset, txn_id = header.txn_id, "journal scan stopped at out-of-order block");
                    break;
                }
                record.extend_from_slice(payload);
                open = Some((txn_id, record, next + 1));
            }
            BlockKind::Commit => {
                let (txn_id, record, blocks) = open.take().unwrap_or((header.txn_id, Vec::new(), 0));
                if txn_id != header.txn_id || payload.len() != COMMIT_PAYLOAD_SIZE {
                    break;
                }
                let expected_blocks = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let mut len = [0u8; 8];
                len.copy_from_slice(&payload[4..12]);
                if expected_blocks != blocks || u64::from_le_bytes(len) != record.len() as u64 {
                    debug!(offset, txn_id, "journal scan stopped at mismatched commit");
                    break;
                }
                scan.transactions.push(ScannedTransaction { txn_id, record });
                scan.valid_len = (offset + block_size) as u64;
                last_txn = Some(txn_id);
            }
        }
        offset += block_size;
    }
    scan
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointState {
    last_txn: u64,
    catalog: Catalog,
    contents: Vec<(ResourceId, Vec<u8>)>,
}

/// Summary of opening a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Last transaction folded into the checkpoint.
    pub checkpoint_txn: u64,
    /// Transactions replayed from the journal.
    pub transactions_replayed: usize,
    /// Blocks examined.
    pub blocks_scanned: u64,
    /// Bytes discarded from the journal tail.
    pub truncated_bytes: u64,
}

/// Journal-file persistence driver.
pub struct JournalDriver {
    root: PathBuf,
    file: File,
    len: u64,
    block_size: usize,
    sync_mode: SyncMode,
    compact_threshold: u64,
    next_txn: u64,
    catalog: Catalog,
    contents: HashMap<ResourceId, Vec<u8>>,
    report: RecoveryReport,
}

impl JournalDriver {
    /// Opens or creates the journal under `config.root`, recovering any
    /// committed state.
    pub fn open(config: &JournalConfig, block_size: usize) -> PersistResult<Self> {
        std::fs::create_dir_all(&config.root)?;
        let state = load_checkpoint(&config.root.join(CHECKPOINT_FILE))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(config.root.join(JOURNAL_FILE))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let scan = scan_journal(&bytes);
        let mut catalog = state.catalog;
        let mut contents: HashMap<ResourceId, Vec<u8>> = state.contents.into_iter().collect();
        let mut last_txn = state.last_txn;
        let mut replayed = 0;

        for txn in &scan.transactions {
            if txn.txn_id <= state.last_txn {
                continue;
            }
            let batch: Vec<Mutation> = bincode::deserialize(&txn.record)?;
            apply_to_image(&mut catalog, &mut contents, &batch);
            last_txn = txn.txn_id;
            replayed += 1;
        }

        let truncated_bytes = bytes.len() as u64 - scan.valid_len;
        if truncated_bytes > 0 {
            warn!(
                root = %config.root.display(),
                truncated_bytes,
                "discarding incomplete journal tail"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(scan.valid_len))?;

        let report = RecoveryReport {
            checkpoint_txn: state.last_txn,
            transactions_replayed: replayed,
            blocks_scanned: scan.blocks_scanned,
            truncated_bytes,
        };
        info!(
            root = %config.root.display(),
            checkpoint_txn = report.checkpoint_txn,
            replayed = report.transactions_replayed,
            blocks = report.blocks_scanned,
            "journal recovered"
        );

        Ok(Self {
            root: config.root.clone(),
            file,
            len: scan.valid_len,
            block_size,
            sync_mode: config.sync_mode,
            compact_threshold: config.compact_threshold_bytes,
            next_txn: last_txn + 1,
            catalog,
            contents,
            report,
        })
    }

    /// What recovery found when this driver was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Current journal length in bytes.
    pub fn journal_len(&self) -> u64 {
        self.len
    }

    /// Path of the journal file.
    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    fn append(&mut self, txn_id: u64, record: &[u8]) -> std::io::Result<()> {
        let encoded = encode_transaction(txn_id, record, self.block_size);
        let commit_at = encoded.len() - self.block_size;

        self.file.seek(SeekFrom::Start(self.len))?;
        match self.sync_mode {
            SyncMode::Sync => {
                self.file.write_all(&encoded[..commit_at])?;
                self.file.sync_data()?;
                self.file.write_all(&encoded[commit_at..])?;
                self.file.sync_data()?;
            }
            SyncMode::BatchSync | SyncMode::AsyncSync => {
                self.file.write_all(&encoded)?;
                sync_file(&self.file, self.sync_mode)?;
            }
        }
        self.len += encoded.len() as u64;
        Ok(())
    }
}

fn load_checkpoint(path: &Path) -> PersistResult<CheckpointState> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CheckpointState::default()),
        Err(e) => return Err(e.into()),
    };
    let body = decode_snapshot(JOURNAL_CHECKPOINT_MAGIC, &bytes)
        .map_err(|reason| PersistError::Corrupted { reason })?;
    Ok(bincode::deserialize(body)?)
}

fn apply_to_image(catalog: &mut Catalog, contents: &mut HashMap<ResourceId, Vec<u8>>, batch: &[Mutation]) {
    for mutation in batch {
        match mutation {
            Mutation::PutContents { id, contents: bytes } => {
                contents.insert(*id, bytes.clone());
            }
            Mutation::DeleteResource { id } => {
                contents.remove(id);
            }
            _ => {}
        }
        catalog.apply(mutation);
    }
}

impl PersistenceDriver for JournalDriver {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn load_catalog(&self) -> PersistResult<Catalog> {
        Ok(self.catalog.clone())
    }

    fn load_contents(&self, id: ResourceId) -> PersistResult<Option<Vec<u8>>> {
        Ok(self.contents.get(&id).cloned())
    }

    fn apply(&mut self, batch: &[Mutation]) -> PersistResult<()> {
        let record = bincode::serialize(batch)?;
        let txn_id = self.next_txn;

        if let Err(e) = self.append(txn_id, &record) {
            // Drop whatever part of the transaction reached the file.
            if let Err(trim) = self.file.set_len(self.len) {
                warn!(error = %trim, "could not trim failed journal append");
            }
            return Err(e.into());
        }

        self.next_txn += 1;
        apply_to_image(&mut self.catalog, &mut self.contents, batch);
        debug!(txn_id, mutations = batch.len(), bytes = record.len(), "journal commit");

        if self.len >= self.compact_threshold {
            if let Err(e) = self.compact() {
                warn!(error = %e, "journal compaction failed");
            }
        }
        Ok(())
    }

    fn compact(&mut self) -> PersistResult<()> {
        let state = CheckpointState {
            last_txn: self.next_txn - 1,
            catalog: self.catalog.clone(),
            contents: self
                .contents
                .iter()
                .map(|(id, bytes)| (*id, bytes.clone()))
                .collect(),
        };
        let body = bincode::serialize(&state)?;
        write_atomically(
            &self.root.join(CHECKPOINT_FILE),
            &encode_snapshot(JOURNAL_CHECKPOINT_MAGIC, &body),
        )?;

        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::Start(0))?;
        info!(
            root = %self.root.display(),
            last_txn = state.last_txn,
            journal_bytes = self.len,
            "journal compacted"
        );
        self.len = 0;
        Ok(())
    }
}
