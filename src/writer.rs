//! The blob writer (§4.9): create/write/close.
//!
//! The whole payload is buffered in memory across `write()` calls (the
//! store has no paged-write path) and finalized at `close()`: build the
//! Merkle tree, check it against the digest the caller declared at
//! `create()`, optionally compress, reserve space and a node chain, and
//! land the node table / bitmap / superblock updates in one journal
//! transaction. Data blocks are written directly, outside the journal, the
//! same way the reference design keeps payload I/O off the metadata log.
//!
//! No reader can observe a blob mid-write: a `Blob` value is only
//! constructed, already `Readable`, once `close()` succeeds. Concurrent
//! `create()` calls for the same digest are rejected via an in-flight
//! digest set rather than by publishing a `Writing`-state `Blob`.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::alloc_space::Allocator;
use crate::blob::{Blob, CompressionKind};
use crate::compress::{self, CompressedHeader};
use crate::config::CompressionAlgorithm;
use crate::error::{Result, StoreError};
use crate::extents;
use crate::format::node::{Container, Extent, Inode, NodeIndex, INLINE_EXTENTS_CONTAINER, SENTINEL_NODE};
use crate::format::DIGEST_LEN;
use crate::journal::Transaction;
use crate::merkle::MerkleTree;
use crate::region::{self, ContentTag};
use crate::StoreInner;

pub struct BlobWriter {
    store: Arc<StoreInner>,
    digest: [u8; DIGEST_LEN],
    declared_size: u64,
    buffer: Vec<u8>,
    closed: bool,
}

pub(crate) fn create(store: &Arc<StoreInner>, digest: [u8; DIGEST_LEN], declared_size: u64) -> Result<BlobWriter> {
    if store.directory.lookup(&digest).is_some() {
        return Err(StoreError::AlreadyExists);
    }
    let mut writing = store.writing.lock();
    if !writing.insert(digest) {
        return Err(StoreError::AlreadyExists);
    }
    drop(writing);
    Ok(BlobWriter {
        store: Arc::clone(store),
        digest,
        declared_size,
        buffer: Vec::with_capacity(declared_size.min(1 << 20) as usize),
        closed: false,
    })
}

impl BlobWriter {
    pub fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StoreError::BadState("write after close"));
        }
        if self.buffer.len() as u64 + bytes.len() as u64 > self.declared_size {
            self.abort();
            return Err(StoreError::InvalidArgument("write exceeds declared blob size"));
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn abort(&mut self) {
        if !self.closed {
            self.store.writing.lock().remove(&self.digest);
            self.closed = true;
        }
    }

    pub fn close(mut self) -> Result<Arc<Blob>> {
        if self.closed {
            return Err(StoreError::BadState("already closed"));
        }
        if self.buffer.len() as u64 != self.declared_size {
            self.abort();
            return Err(StoreError::InvalidArgument("declared size not fully written at close"));
        }

        let tree = MerkleTree::build(&self.buffer);
        if tree.root() != self.digest {
            self.abort();
            return Err(StoreError::IntegrityError { chunk: u32::MAX });
        }

        let mount = self.store.mount_options;
        let (tag, body, compression_kind) = match mount.compression_algorithm {
            CompressionAlgorithm::Chunked => match compress::compress(&self.buffer, mount.compression_level) {
                Some(compressed) => {
                    let header = CompressedHeader { index: compressed.index, uncompressed_len: compressed.uncompressed_len };
                    let header_bytes = postcard::to_allocvec(&header)?;
                    let mut body = Vec::with_capacity(4 + header_bytes.len() + compressed.data.len());
                    body.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
                    body.extend_from_slice(&header_bytes);
                    body.extend_from_slice(&compressed.data);
                    self.store.metrics.add_bytes_compressed_written(compressed.data.len() as u64);
                    (ContentTag::Chunked, body, CompressionKind::Chunked)
                }
                None => (ContentTag::Uncompressed, self.buffer.clone(), CompressionKind::Uncompressed),
            },
            CompressionAlgorithm::Uncompressed => (ContentTag::Uncompressed, self.buffer.clone(), CompressionKind::Uncompressed),
        };

        // The content region is self-describing: an 8-byte total length
        // (inclusive of itself) followed by a tag byte and the body. This
        // lets a reader find where the Merkle tree starts in the
        // `CompactAtEnd` layout without first having to parse a
        // compression header.
        let mut content = vec![0u8; 8];
        content.push(tag as u8);
        content.extend_from_slice(&body);
        let content_len = content.len() as u64;
        content[0..8].copy_from_slice(&content_len.to_le_bytes());

        let layout = region::compute(self.store.layout, self.declared_size, content.len() as u64);
        let tree_bytes = tree.to_bytes();

        let mut region_buf = vec![0u8; layout.total_len as usize];
        region_buf[layout.content_offset as usize..layout.content_offset as usize + content.len()].copy_from_slice(&content);
        if !tree_bytes.is_empty() {
            region_buf[layout.tree_offset as usize..layout.tree_offset as usize + tree_bytes.len()].copy_from_slice(&tree_bytes);
        }

        let result = self.finish_allocation(&region_buf, layout.block_count, compression_kind, layout.total_len);
        match result {
            Ok(blob) => {
                self.store.writing.lock().remove(&self.digest);
                self.closed = true;
                Ok(blob)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn finish_allocation(
        &self,
        region_buf: &[u8],
        block_count: u32,
        compression_kind: CompressionKind,
        stored_len: u64,
    ) -> Result<Arc<Blob>> {
        let allocator = &self.store.allocator;
        let reservations = allocator.reserve_blocks(block_count)?;
        let extents_list: Vec<Extent> = reservations.iter().map(|r| r.extent()).collect();

        extents::write_region(&self.store.block_io, self.store.data_start, &extents_list, region_buf)?;
        self.store.block_io.flush()?;

        let committed_extents: Vec<Extent> = reservations.into_iter().map(|r| allocator.mark_allocated(r)).collect();

        let head_reserved = allocator.reserve_node()?;
        let head_index = head_reserved.index();

        let overflow = &committed_extents[1..];
        let group_count = overflow.len().div_ceil(INLINE_EXTENTS_CONTAINER);
        let mut container_reserved = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            container_reserved.push(allocator.reserve_node()?);
        }
        let container_indices: Vec<NodeIndex> = container_reserved.iter().map(|r| r.index()).collect();

        let mut touched_node_blocks = BTreeSet::new();
        for (i, (reserved, group)) in container_reserved.into_iter().zip(overflow.chunks(INLINE_EXTENTS_CONTAINER)).enumerate() {
            let mut extents_arr = [Extent::default(); INLINE_EXTENTS_CONTAINER];
            for (j, e) in group.iter().enumerate() {
                extents_arr[j] = *e;
            }
            let container = Container {
                version: 1,
                next_node: container_indices.get(i + 1).map(|n| n.0).unwrap_or(SENTINEL_NODE),
                previous_node: if i == 0 { head_index.0 } else { container_indices[i - 1].0 },
                extent_count: group.len() as u16,
                extents: extents_arr,
            };
            let idx = reserved.index();
            allocator.mark_container(reserved, container);
            touched_node_blocks.insert(Allocator::node_table_block_of(idx));
        }

        let inode = Inode {
            version: 1,
            next_node: container_indices.first().map(|n| n.0).unwrap_or(SENTINEL_NODE),
            digest: self.digest,
            blob_size: self.declared_size,
            block_count,
            extent_count: committed_extents.len() as u16,
            inline_extent: committed_extents[0],
        };
        touched_node_blocks.insert(Allocator::node_table_block_of(head_index));
        allocator.mark_inode(head_reserved, inode);

        let mut bitmap_blocks = BTreeSet::new();
        for e in &committed_extents {
            for b in Allocator::bitmap_blocks_for_extent(*e) {
                bitmap_blocks.insert(b);
            }
        }

        let mut tx = Transaction::new();
        for b in bitmap_blocks {
            tx.write_block(self.store.bitmap_start + b, allocator.bitmap_block_bytes(b));
        }
        for b in touched_node_blocks {
            tx.write_block(self.store.node_table_start + b, allocator.node_table_block_bytes(b));
        }
        {
            let mut sb = self.store.superblock.lock();
            sb.allocated_block_count += block_count as u64;
            sb.allocated_inode_count += 1;
            tx.write_block(0, sb.to_block_bytes());
        }

        self.store.journal.lock().commit(&tx)?;
        crate::checker::debug_check_after_commit(&self.store);

        let blob = Arc::new(Blob::new_readable(
            self.digest,
            head_index,
            self.declared_size,
            stored_len,
            self.store.layout,
            compression_kind,
        ));
        self.store.cache.insert(self.digest, Arc::clone(&blob))?;
        self.store.directory.insert(self.digest, head_index)?;
        self.store.metrics.inc_blobs_readable();
        Ok(blob)
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.store.writing.lock().remove(&self.digest);
        }
    }
}
