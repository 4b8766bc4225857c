//! A content-addressed, write-once blob storage engine.
//!
//! `no_std` plus `alloc`: the core never assumes an OS is present beneath
//! it. A host provides a `BlockDevice`, a `Metrics` collector, and a
//! `CorruptionNotifier`, then calls `Store::format` once and `Store::mount`
//! on every boot. Everything downstream — the journal, the allocator, the
//! node table, the blob cache, the pager, and the directory — is wired
//! together behind `Store`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod alloc_space;
pub mod blob;
pub mod block_io;
pub mod cache;
pub mod checker;
pub mod compress;
pub mod config;
pub mod device;
pub mod directory;
pub mod error;
pub mod executor;
pub mod extents;
pub mod format;
pub mod journal;
pub mod merkle;
pub mod metrics;
pub mod mkfs;
pub mod notifier;
pub mod pager;
pub mod region;
pub mod task;
pub mod writer;

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::alloc_space::Allocator;
use crate::blob::{Blob, CompressionKind};
use crate::block_io::BlockIo;
use crate::cache::BlobCache;
use crate::checker::{CheckMode, CheckReport};
use crate::config::{BlobLayout, FormatOptions, MountOptions};
use crate::device::BlockDevice;
use crate::directory::Directory;
use crate::error::{Result, StoreError};
use crate::format::bitmap::Bitmap;
use crate::format::node::{Node, NodeIndex, SENTINEL_NODE};
use crate::format::superblock::Superblock;
use crate::format::{DIGEST_LEN, FS_BLOCK, NODE_SIZE};
use crate::journal::{Journal, Transaction};
use crate::metrics::Metrics;
use crate::notifier::CorruptionNotifier;
use crate::writer::BlobWriter;

/// Everything a mounted store needs, shared behind one `Arc` so the writer,
/// pager, directory and checker can each hold a cheap handle to it without
/// `Store` itself needing `Clone` semantics beyond that one pointer.
pub(crate) struct StoreInner {
    pub block_io: Arc<BlockIo>,
    pub allocator: Arc<Allocator>,
    pub journal: spin::Mutex<Journal>,
    pub metrics: Arc<Metrics>,
    pub notifier: Arc<dyn CorruptionNotifier>,
    pub cache: BlobCache,
    pub directory: Directory,
    pub writing: spin::Mutex<BTreeSet<[u8; DIGEST_LEN]>>,
    pub data_start: u64,
    pub bitmap_start: u64,
    pub node_table_start: u64,
    pub layout: BlobLayout,
    pub mount_options: MountOptions,
    pub superblock: spin::Mutex<Superblock>,
}

/// A mounted instance. Construct one with `format` then `mount`, or `mount`
/// directly against an already-formatted device.
pub struct Store(Arc<StoreInner>);

impl Store {
    /// Lays out a fresh, empty instance on `device` (§4.12).
    pub fn format(device: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
        mkfs::format(device, options)
    }

    /// Reads the superblock, replays the journal, loads the bitmap and node
    /// table into memory, and rebuilds the digest index.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        mount_options: MountOptions,
        metrics: Arc<Metrics>,
        notifier: Arc<dyn CorruptionNotifier>,
    ) -> Result<Store> {
        let block_io = Arc::new(BlockIo::new(device)?);

        let mut sb_bytes = vec![0u8; FS_BLOCK as usize];
        block_io.read_block(0, &mut sb_bytes)?;
        let mut superblock = Superblock::from_block_bytes(&sb_bytes)?;

        let journal_block_count = superblock.journal_block_count as u64;
        let mut journal = Journal::open(Arc::clone(&block_io), Arc::clone(&metrics), superblock.journal_start, journal_block_count)?;

        if !superblock.is_clean() {
            log::warn!("mounting an unclean volume; replaying journal before use");
        }
        if mount_options.is_writable() {
            let applied = journal.replay()?;
            if applied > 0 {
                log::info!("replayed {applied} journal entries at mount");
            }
        }

        let bitmap_block_count = superblock.node_table_start - superblock.bitmap_start;
        let mut bitmap_bytes = vec![0u8; (bitmap_block_count * FS_BLOCK as u64) as usize];
        block_io.read_blocks(superblock.bitmap_start, &mut bitmap_bytes)?;
        let bitmap = Bitmap::from_bytes(bitmap_bytes, superblock.data_block_count);

        let node_table_block_count = superblock.journal_start - superblock.node_table_start;
        let mut node_bytes = vec![0u8; (node_table_block_count * FS_BLOCK as u64) as usize];
        block_io.read_blocks(superblock.node_table_start, &mut node_bytes)?;
        let mut nodes = Vec::with_capacity(superblock.inode_count as usize);
        for i in 0..superblock.inode_count as usize {
            let start = i * NODE_SIZE;
            nodes.push(Node::decode(&node_bytes[start..start + NODE_SIZE])?);
        }

        let allocator = Arc::new(Allocator::new(bitmap, nodes, Arc::clone(&metrics)));
        let directory = Directory::rebuild(&allocator);

        if mount_options.is_writable() {
            superblock.set_clean(false);
            block_io.write_block(0, &superblock.to_block_bytes())?;
            block_io.flush()?;
        }

        let layout = superblock.blob_layout();
        let inner = Arc::new(StoreInner {
            block_io,
            allocator,
            journal: spin::Mutex::new(journal),
            metrics,
            notifier,
            cache: BlobCache::new(mount_options.cache_policy),
            directory,
            writing: spin::Mutex::new(BTreeSet::new()),
            data_start: superblock.data_start,
            bitmap_start: superblock.bitmap_start,
            node_table_start: superblock.node_table_start,
            layout,
            mount_options,
            superblock: spin::Mutex::new(superblock),
        });

        Ok(Store(inner))
    }

    pub fn create_blob(&self, digest: [u8; DIGEST_LEN], declared_size: u64) -> Result<BlobWriter> {
        if !self.0.mount_options.is_writable() {
            return Err(StoreError::AccessDenied);
        }
        writer::create(&self.0, digest, declared_size)
    }

    /// Opens a readable blob by digest, serving a live cache entry if one
    /// exists and otherwise rebuilding a `Blob` handle from the node table.
    pub fn open_blob(&self, digest: &[u8; DIGEST_LEN]) -> Result<Arc<Blob>> {
        if let Some(blob) = self.0.cache.lookup(digest) {
            return Ok(blob);
        }
        let head = self.0.directory.lookup(digest).ok_or(StoreError::NotFound)?;
        let inode = match self.0.allocator.node(head)? {
            Node::Inode(inode) => inode,
            _ => return Err(StoreError::CorruptNode(head)),
        };
        let extents_list = extents::collect_extents(&self.0.allocator, &inode)?;
        let tree_len = merkle::tree_byte_size(inode.blob_size);
        let content_offset = match self.0.layout {
            BlobLayout::CompactAtEnd => 0,
            BlobLayout::PaddedAtStart => tree_len,
        };
        let tag = extents::read_region_range(&self.0.block_io, self.0.data_start, &extents_list, content_offset + 8, 1)?;
        let compression_kind = match tag[0] {
            0 => CompressionKind::Uncompressed,
            1 => CompressionKind::Chunked,
            _ => return Err(StoreError::CorruptNode(head)),
        };
        let stored_len = inode.block_count as u64 * FS_BLOCK as u64;
        let blob = Arc::new(Blob::new_readable(*digest, head, inode.blob_size, stored_len, self.0.layout, compression_kind));
        match self.0.cache.insert(*digest, Arc::clone(&blob)) {
            Ok(()) => Ok(blob),
            Err(StoreError::AlreadyExists) => self.0.cache.lookup(digest).ok_or(StoreError::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn read(&self, blob: &Arc<Blob>, offset: u64, len: u64) -> Result<Vec<u8>> {
        pager::read_range(&self.0, blob, offset, len)
    }

    /// Frees a readable blob's nodes and data blocks in one journal
    /// transaction (§4.10).
    ///
    /// Simplification versus the on-disk footprint being removed only once
    /// the last strong reference to its cached `Blob` drops: `Blob` has no
    /// back-pointer into the store to run that teardown from a `Drop` impl,
    /// so this reclaims the extents and nodes immediately and only marks
    /// any live cache entry `MarkedForDeletion` for readers already holding
    /// it. A reader with an open `Arc<Blob>` across an `unlink` can still
    /// finish reads already in flight against data already fetched, but a
    /// fresh `read` after unlink is not guaranteed to see the old bytes.
    pub fn unlink(&self, digest: &[u8; DIGEST_LEN]) -> Result<()> {
        if !self.0.mount_options.is_writable() {
            return Err(StoreError::AccessDenied);
        }
        let head = self.0.directory.remove(digest)?;
        let inode = match self.0.allocator.node(head)? {
            Node::Inode(inode) => inode,
            _ => return Err(StoreError::CorruptNode(head)),
        };
        let extents_list = extents::collect_extents(&self.0.allocator, &inode)?;
        // Reserve each freed range before clearing its committed bits, and
        // hold the reservations until the transaction below commits, so a
        // concurrent create_blob()'s reserve_blocks() cannot claim them
        // while the on-disk bitmap and journal still disagree (§4.3, §8.2).
        let mut freed_reservations = Vec::with_capacity(extents_list.len());
        for extent in &extents_list {
            let reserved = self.0.allocator.reserve_for_free(*extent)?;
            self.0.allocator.free_blocks(&reserved)?;
            freed_reservations.push(reserved);
        }

        let mut touched_node_blocks = BTreeSet::new();
        let mut next = inode.next_node;
        while next != SENTINEL_NODE {
            let idx = NodeIndex(next);
            let container = match self.0.allocator.node(idx)? {
                Node::Container(container) => container,
                _ => return Err(StoreError::CorruptNode(idx)),
            };
            next = container.next_node;
            self.0.allocator.free_node(idx)?;
            touched_node_blocks.insert(Allocator::node_table_block_of(idx));
        }
        self.0.allocator.free_node(head)?;
        touched_node_blocks.insert(Allocator::node_table_block_of(head));

        if let Some(blob) = self.0.cache.lookup(digest) {
            let _ = blob.mark_for_deletion();
        }

        let mut bitmap_blocks = BTreeSet::new();
        for extent in &extents_list {
            for b in Allocator::bitmap_blocks_for_extent(*extent) {
                bitmap_blocks.insert(b);
            }
        }
        let mut tx = Transaction::new();
        for b in bitmap_blocks {
            tx.write_block(self.0.bitmap_start + b, self.0.allocator.bitmap_block_bytes(b));
        }
        for b in touched_node_blocks {
            tx.write_block(self.0.node_table_start + b, self.0.allocator.node_table_block_bytes(b));
        }
        {
            let mut sb = self.0.superblock.lock();
            sb.allocated_block_count -= extents_list.iter().map(|e| e.length as u64).sum::<u64>();
            sb.allocated_inode_count -= 1;
            tx.write_block(0, sb.to_block_bytes());
        }
        self.0.journal.lock().commit(&tx)?;
        checker::debug_check_after_commit(&self.0);
        // Only now is it safe to let the freed ranges go back to the free
        // pool — the journal has the clear committed on durable storage.
        drop(freed_reservations);

        for extent in &extents_list {
            let _ = self.0.block_io.trim(self.0.data_start + extent.start_block, extent.length as u64);
        }
        Ok(())
    }

    pub fn list_blobs(&self) -> Vec<[u8; DIGEST_LEN]> {
        self.0.directory.iter_digests()
    }

    pub fn blob_count(&self) -> usize {
        self.0.directory.len()
    }

    /// Histogram of free-fragment lengths (§4.3), keyed by fragment length
    /// in blocks. Inspection surface for fragmentation-aware placement
    /// tooling and tests; not used by any read/write path.
    pub fn free_fragment_histogram(&self) -> alloc::collections::BTreeMap<u64, u32> {
        self.0.allocator.free_fragment_histogram()
    }

    /// Number of extents a blob's data is split across on disk. Inspection
    /// surface mirroring the allocated-regions query a real blobfs exposes
    /// to callers that care about fragmentation.
    pub fn extent_count(&self, digest: &[u8; DIGEST_LEN]) -> Result<u16> {
        let head = self.0.directory.lookup(digest).ok_or(StoreError::NotFound)?;
        match self.0.allocator.node(head)? {
            Node::Inode(inode) => Ok(inode.extent_count),
            _ => Err(StoreError::CorruptNode(head)),
        }
    }

    pub fn check(&self, mode: CheckMode) -> CheckReport {
        checker::check(&self.0, mode)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.0.metrics
    }

    /// Flushes, marks the volume clean, and writes the final superblock.
    /// Consumes `self`: there is no valid operation on a `Store` after
    /// shutdown.
    pub fn shutdown(self) -> Result<()> {
        self.0.block_io.flush()?;
        if self.0.mount_options.is_writable() {
            let mut sb = self.0.superblock.lock();
            sb.set_clean(true);
            self.0.block_io.write_block(0, &sb.to_block_bytes())?;
            self.0.block_io.flush()?;
        }
        Ok(())
    }
}
