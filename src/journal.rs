//! The journal (§4.2): a circular, checksummed, replay-on-mount
//! write-ahead log of metadata operations.
//!
//! Layout within the journal region: two anchor blocks (primary, backup),
//! then an entry ring. Each entry is a payload (the serialized metadata
//! writes) followed by a header block that doubles as the commit marker —
//! writing the header last, after the payload is durable, is the atomic
//! commit point a replay scan looks for.
//!
//! Simplification versus §4.2's literal background-flusher design: this
//! implementation applies an entry's metadata writes synchronously right
//! after its commit marker is durable, instead of deferring writeback to a
//! background task and reclaiming ring space only once that completes.
//! Because metadata writes are idempotent, replay-on-mount is still
//! implemented and still covers the crash-consistency testable property
//! (§8) — the simplification drops a performance optimization, not a
//! correctness guarantee.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::block_io::BlockIo;
use crate::error::{Result, StoreError};
use crate::format::FS_BLOCK;
use crate::metrics::Metrics;

const ANCHOR_MAGIC: u32 = 0x4a4e_4c41; // "JNLA"
const ENTRY_MAGIC: u32 = 0x4a4e_4c45; // "JNLE"

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawAnchor {
    magic: u32,
    anchor_crc: u32,
    sequence: u64,
    cursor: u64,
}

impl RawAnchor {
    fn computed_crc(&self) -> u32 {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf[12..20].copy_from_slice(&self.cursor.to_le_bytes());
        crc32c::crc32c(&buf)
    }

    fn is_valid(&self) -> bool {
        self.magic == ANCHOR_MAGIC && self.anchor_crc == self.computed_crc()
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawEntryHeader {
    magic: u32,
    header_crc: u32,
    sequence: u64,
    payload_block_count: u32,
    payload_byte_len: u32,
    payload_crc: u32,
    _pad: u32,
}

impl RawEntryHeader {
    fn computed_crc(&self) -> u32 {
        let mut buf = [0u8; 24];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_block_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_byte_len.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_crc.to_le_bytes());
        crc32c::crc32c(&buf)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Ordered (target_fs_block, FS_BLOCK-sized contents) metadata writes.
    pub writes: Vec<(u64, Vec<u8>)>,
    /// Ranges to trim once the transaction's metadata has been applied.
    pub trims: Vec<(u64, u64)>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    pub fn write_block(&mut self, target_fs_block: u64, data: Vec<u8>) {
        debug_assert_eq!(data.len(), FS_BLOCK as usize);
        self.writes.push((target_fs_block, data));
    }

    pub fn trim(&mut self, start_fs_block: u64, len_fs_blocks: u64) {
        self.trims.push((start_fs_block, len_fs_blocks));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

pub struct Journal {
    block_io: Arc<BlockIo>,
    metrics: Arc<Metrics>,
    journal_start: u64,
    entry_region_start: u64,
    entry_region_len: u64,
    sequence: u64,
    cursor: u64,
}

impl Journal {
    /// Writes fresh, empty anchors at format time.
    pub fn format(block_io: &BlockIo, journal_start: u64, journal_block_count: u64) -> Result<()> {
        let anchor = RawAnchor { magic: ANCHOR_MAGIC, anchor_crc: 0, sequence: 0, cursor: 0 };
        let mut anchor = anchor;
        anchor.anchor_crc = anchor.computed_crc();
        let block = pad_to_block(anchor.as_bytes());
        block_io.write_block(journal_start, &block)?;
        block_io.write_block(journal_start + 1, &block)?;
        block_io.zero_blocks(journal_start + 2, journal_block_count - 2)?;
        Ok(())
    }

    pub fn open(block_io: Arc<BlockIo>, metrics: Arc<Metrics>, journal_start: u64, journal_block_count: u64) -> Result<Journal> {
        let mut buf = vec![0u8; FS_BLOCK as usize];
        block_io.read_block(journal_start, &mut buf)?;
        let primary = RawAnchor::read_from_prefix(&buf).map(|(a, _)| a).ok();
        block_io.read_block(journal_start + 1, &mut buf)?;
        let backup = RawAnchor::read_from_prefix(&buf).map(|(a, _)| a).ok();

        let anchor = match (primary.filter(RawAnchor::is_valid), backup.filter(RawAnchor::is_valid)) {
            (Some(a), _) => a,
            (None, Some(b)) => b,
            (None, None) => return Err(StoreError::IoError("both journal anchors invalid")),
        };

        Ok(Journal {
            block_io,
            metrics,
            journal_start,
            entry_region_start: journal_start + 2,
            entry_region_len: journal_block_count - 2,
            sequence: anchor.sequence,
            cursor: anchor.cursor,
        })
    }

    fn write_anchors(&self) -> Result<()> {
        let mut anchor = RawAnchor {
            magic: ANCHOR_MAGIC,
            anchor_crc: 0,
            sequence: self.sequence,
            cursor: self.cursor,
        };
        anchor.anchor_crc = anchor.computed_crc();
        let block = pad_to_block(anchor.as_bytes());
        self.block_io.write_block(self.journal_start, &block)?;
        self.block_io.write_block(self.journal_start + 1, &block)?;
        self.block_io.flush()
    }

    /// Replays entries from the current cursor forward, applying each
    /// valid, in-sequence entry's metadata writes. Stops at the first
    /// invalid or out-of-sequence entry, per §4.2.
    pub fn replay(&mut self) -> Result<u64> {
        let mut applied = 0u64;
        loop {
            let header_block_no = self.entry_region_start + self.cursor;
            let mut header_bytes = vec![0u8; FS_BLOCK as usize];
            self.block_io.read_block(header_block_no, &mut header_bytes)?;
            let Ok((header, _)) = RawEntryHeader::read_from_prefix(&header_bytes) else { break };
            if header.magic != ENTRY_MAGIC || header.header_crc != header.computed_crc() {
                break;
            }
            if header.sequence != self.sequence {
                break;
            }
            let payload_start = header_block_no + 1;
            if self.cursor + 1 + header.payload_block_count as u64 > self.entry_region_len {
                break; // malformed: would run past the ring, can't trust it
            }
            let mut payload = vec![0u8; header.payload_block_count as usize * FS_BLOCK as usize];
            self.block_io.read_blocks(payload_start, &mut payload)?;
            let body = &payload[..header.payload_byte_len as usize];
            if crc32c::crc32c(body) != header.payload_crc {
                break;
            }
            let Ok(tx) = postcard::from_bytes::<Transaction>(body) else { break };
            for (target, data) in &tx.writes {
                self.block_io.write_block(*target, data)?;
            }
            self.block_io.flush()?;
            self.cursor = (self.cursor + 1 + header.payload_block_count as u64) % self.entry_region_len;
            self.sequence += 1;
            applied += 1;
        }
        self.write_anchors()?;
        Ok(applied)
    }

    /// Commits a transaction: writes the payload, flushes, writes the
    /// commit-marker header, flushes, then (see module docs) synchronously
    /// applies the metadata writes and advances the reclaim cursor.
    pub fn commit(&mut self, tx: &Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let body = postcard::to_allocvec(tx)?;
        let payload_block_count = (body.len() as u64).div_ceil(FS_BLOCK as u64);
        if payload_block_count + 1 > self.entry_region_len {
            return Err(StoreError::Unsupported("transaction too large for journal capacity"));
        }
        if self.cursor + payload_block_count + 1 > self.entry_region_len {
            self.cursor = 0;
        }

        let payload_crc = crc32c::crc32c(&body);
        let payload = pad_to_blocks(&body, payload_block_count);
        let payload_start = self.entry_region_start + self.cursor + 1;
        self.block_io.write_blocks(&[(payload_start, &payload)])?;
        self.block_io.flush()?;

        let mut header = RawEntryHeader {
            magic: ENTRY_MAGIC,
            header_crc: 0,
            sequence: self.sequence,
            payload_block_count: payload_block_count as u32,
            payload_byte_len: body.len() as u32,
            payload_crc,
            _pad: 0,
        };
        header.header_crc = header.computed_crc();
        let header_block = pad_to_block(header.as_bytes());
        let header_block_no = self.entry_region_start + self.cursor;
        self.block_io.write_block(header_block_no, &header_block)?;
        self.block_io.flush()?;
        self.metrics.inc_journal_commits();

        for (target, data) in &tx.writes {
            self.block_io.write_block(*target, data)?;
        }
        self.block_io.flush()?;

        self.cursor = (self.cursor + 1 + payload_block_count) % self.entry_region_len;
        self.sequence += 1;
        self.write_anchors()?;

        for (start, len) in &tx.trims {
            let _ = self.block_io.trim(*start, *len);
        }
        Ok(())
    }
}

fn pad_to_block(bytes: &[u8]) -> Vec<u8> {
    pad_to_blocks(bytes, 1)
}

fn pad_to_blocks(bytes: &[u8], block_count: u64) -> Vec<u8> {
    let mut buf = vec![0u8; block_count as usize * FS_BLOCK as usize];
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;

    fn setup() -> (Arc<BlockIo>, Arc<Metrics>, u64, u64) {
        let device = Arc::new(InMemoryDevice::new(512, 1024 * (FS_BLOCK as u64 / 512)));
        let block_io = Arc::new(BlockIo::new(device).unwrap());
        let journal_start = 10u64;
        let journal_block_count = 16u64;
        Journal::format(&block_io, journal_start, journal_block_count).unwrap();
        (block_io, Arc::new(Metrics::new()), journal_start, journal_block_count)
    }

    #[test]
    fn commit_then_reopen_sees_no_replay_needed() {
        let (block_io, metrics, start, count) = setup();
        let mut journal = Journal::open(Arc::clone(&block_io), Arc::clone(&metrics), start, count).unwrap();
        let mut tx = Transaction::new();
        tx.write_block(500, vec![0xAB; FS_BLOCK as usize]);
        journal.commit(&tx).unwrap();

        let mut reopened = Journal::open(Arc::clone(&block_io), metrics, start, count).unwrap();
        let applied = reopened.replay().unwrap();
        assert_eq!(applied, 0, "already-applied entry should not replay again");

        let mut check = vec![0u8; FS_BLOCK as usize];
        block_io.read_block(500, &mut check).unwrap();
        assert!(check.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn uncommitted_entry_is_not_replayed() {
        let (block_io, metrics, start, count) = setup();
        // Simulate a crash: write only the payload block, never the header.
        let mut tx = Transaction::new();
        tx.write_block(600, vec![0xCD; FS_BLOCK as usize]);
        let body = postcard::to_allocvec(&tx).unwrap();
        let payload = pad_to_blocks(&body, 1);
        block_io.write_block(start + 3, &payload).unwrap();

        let mut journal = Journal::open(block_io.clone(), metrics, start, count).unwrap();
        let applied = journal.replay().unwrap();
        assert_eq!(applied, 0);

        let mut check = vec![0u8; FS_BLOCK as usize];
        block_io.read_block(600, &mut check).unwrap();
        assert!(check.iter().all(|&b| b == 0), "target block must be untouched");
    }
}
