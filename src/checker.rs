//! The consistency checker (§4.11): validates the superblock, the node
//! table's linkage, and the block bitmap against each other, either
//! structurally (`Lenient`) or by also recomputing and comparing every
//! blob's Merkle root (`Strict`).

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::extents;
use crate::format::bitmap::Bitmap;
use crate::format::node::{Node, NodeIndex};
use crate::merkle::MerkleTree;
use crate::StoreInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Lenient,
    Strict,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub blob_count: u64,
    pub container_count: u64,
    pub allocated_blocks_bitmap: u64,
    pub allocated_blocks_reachable: u64,
    pub errors: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn check(store: &Arc<StoreInner>, mode: CheckMode) -> CheckReport {
    let mut report = CheckReport::default();

    if let Err(e) = store.superblock.lock().validate() {
        report.errors.push(format!("superblock: {e}"));
    }

    let allocator = &store.allocator;
    report.allocated_blocks_bitmap = allocator.allocated_block_count();

    let mut reachable = Bitmap::new_cleared(data_block_count(store));
    for i in 0..allocator.node_count() as u32 {
        let node = match allocator.node(NodeIndex(i)) {
            Ok(n) => n,
            Err(e) => {
                report.errors.push(format!("node {i}: {e}"));
                continue;
            }
        };
        match node {
            Node::Free => {}
            Node::Container(container) => {
                report.container_count += 1;
                check_linkage(store, &mut report, NodeIndex(i), container.previous_node, container.next_node);
            }
            Node::Inode(inode) => {
                report.blob_count += 1;
                let extents_list = match extents::collect_extents(allocator, &inode) {
                    Ok(e) => e,
                    Err(e) => {
                        report.errors.push(format!("inode {i}: broken extent chain: {e}"));
                        continue;
                    }
                };

                let mut blob_blocks = 0u64;
                for extent in &extents_list {
                    blob_blocks += extent.length as u64;
                    if extent.end_block() > reachable.len_bits() {
                        report.errors.push(format!("inode {i}: extent runs past data region"));
                        continue;
                    }
                    for b in extent.start_block..extent.end_block() {
                        if reachable.get(b) {
                            report.errors.push(format!("inode {i}: block {b} referenced by more than one node"));
                        }
                        reachable.set(b, true);
                        if !allocator.is_block_allocated(b) {
                            report.errors.push(format!("inode {i}: block {b} used but not marked allocated in bitmap"));
                        }
                    }
                }

                if blob_blocks != inode.block_count as u64 {
                    report.errors.push(format!(
                        "inode {i}: extent chain totals {blob_blocks} blocks but inode claims {}",
                        inode.block_count
                    ));
                }

                if mode == CheckMode::Strict {
                    verify_digest(store, &mut report, i, &inode, &extents_list);
                }
            }
        }
    }

    report.allocated_blocks_reachable = reachable.popcount();
    if report.allocated_blocks_reachable != report.allocated_blocks_bitmap {
        report.errors.push(format!(
            "bitmap claims {} allocated blocks but only {} are reachable from nodes",
            report.allocated_blocks_bitmap, report.allocated_blocks_reachable
        ));
    }

    let sb = store.superblock.lock();
    if report.allocated_blocks_bitmap != sb.allocated_block_count {
        report.errors.push(format!(
            "superblock claims {} allocated blocks but the bitmap has {}",
            sb.allocated_block_count, report.allocated_blocks_bitmap
        ));
    }
    if report.blob_count != sb.allocated_inode_count as u64 {
        report.errors.push(format!(
            "superblock claims {} allocated inodes but {} blob inodes are reachable",
            sb.allocated_inode_count, report.blob_count
        ));
    }
    drop(sb);

    report
}

fn check_linkage(store: &Arc<StoreInner>, report: &mut CheckReport, index: NodeIndex, previous: u32, next: u32) {
    use crate::format::node::SENTINEL_NODE;
    if previous != SENTINEL_NODE && store.allocator.node(NodeIndex(previous)).is_err() {
        report.errors.push(format!("container {}: previous_node {previous} out of range", index.0));
    }
    if next != SENTINEL_NODE && store.allocator.node(NodeIndex(next)).is_err() {
        report.errors.push(format!("container {}: next_node {next} out of range", index.0));
    }
}

fn verify_digest(
    store: &Arc<StoreInner>,
    report: &mut CheckReport,
    index: u32,
    inode: &crate::format::node::Inode,
    extents_list: &[crate::format::node::Extent],
) {
    let region_total_len: u64 = extents_list.iter().map(|e| e.length as u64 * crate::format::FS_BLOCK as u64).sum();
    let raw = match extents::read_region(&store.block_io, store.data_start, extents_list, region_total_len) {
        Ok(bytes) => bytes,
        Err(e) => {
            report.errors.push(format!("inode {index}: failed to read region: {e}"));
            return;
        }
    };

    let tree_len = crate::merkle::tree_byte_size(inode.blob_size);
    let content_offset = match store.layout {
        crate::config::BlobLayout::CompactAtEnd => 0usize,
        crate::config::BlobLayout::PaddedAtStart => tree_len as usize,
    };
    if raw.len() < content_offset + 9 {
        report.errors.push(format!("inode {index}: region too short for content header"));
        return;
    }
    let content_len = u64::from_le_bytes(raw[content_offset..content_offset + 8].try_into().unwrap()) as usize;
    let tag = raw[content_offset + 8];
    let body = &raw[content_offset + 9..content_offset + content_len];

    let payload = match tag {
        0 => body.to_vec(),
        1 => match decode_chunked(body) {
            Ok(p) => p,
            Err(e) => {
                report.errors.push(format!("inode {index}: {e}"));
                return;
            }
        },
        other => {
            report.errors.push(format!("inode {index}: unknown content tag {other}"));
            return;
        }
    };

    if payload.len() as u64 != inode.blob_size {
        report.errors.push(format!("inode {index}: decoded payload length {} != declared blob_size {}", payload.len(), inode.blob_size));
        return;
    }

    let root = if crate::merkle::leaf_count(inode.blob_size) <= 1 {
        MerkleTree::build(&payload).root()
    } else {
        let tree_offset = match store.layout {
            crate::config::BlobLayout::PaddedAtStart => 0,
            crate::config::BlobLayout::CompactAtEnd => content_offset as u64 + content_len as u64,
        };
        if raw.len() < (tree_offset + tree_len) as usize {
            report.errors.push(format!("inode {index}: region too short for Merkle tree"));
            return;
        }
        let tree_bytes = &raw[tree_offset as usize..(tree_offset + tree_len) as usize];
        match MerkleTree::from_bytes(tree_bytes, inode.blob_size, inode.digest) {
            Ok(tree) => tree.root(),
            Err(e) => {
                report.errors.push(format!("inode {index}: stored Merkle tree invalid: {e}"));
                return;
            }
        }
    };

    if root != inode.digest {
        report.errors.push(format!("inode {index}: recomputed digest does not match stored digest"));
    }
}

fn decode_chunked(body: &[u8]) -> Result<alloc::vec::Vec<u8>, alloc::string::String> {
    if body.len() < 4 {
        return Err(String::from("chunked content too short for header length"));
    }
    let header_len = u32::from_le_bytes(body[0..4].try_into().unwrap()) as usize;
    if body.len() < 4 + header_len {
        return Err(String::from("chunked content too short for header"));
    }
    let header: crate::compress::CompressedHeader =
        postcard::from_bytes(&body[4..4 + header_len]).map_err(|_| String::from("chunked header decode failed"))?;
    let data = &body[4 + header_len..];
    let mut payload = alloc::vec::Vec::with_capacity(header.uncompressed_len as usize);
    for entry in &header.index {
        let expected_len = (header.uncompressed_len - entry.uncompressed_offset).min(crate::compress::COMPRESSION_CHUNK) as usize;
        let start = entry.compressed_offset as usize;
        let end = start + entry.compressed_length as usize;
        if end > data.len() {
            return Err(String::from("chunk compressed range out of bounds"));
        }
        let chunk = crate::compress::decompress_chunk(entry, &data[start..end], expected_len).map_err(|_| String::from("chunk decompression failed"))?;
        payload.extend_from_slice(&chunk);
    }
    Ok(payload)
}

fn data_block_count(store: &Arc<StoreInner>) -> u64 {
    store.superblock.lock().data_block_count
}

/// Runs the checker against in-memory state right after a transaction
/// commits, when `MountOptions::debug_fsck_after_commit` is set, and
/// panics on the first mismatch (§9). `Lenient` mode, not `Strict`: this
/// runs on every commit and re-hashing every blob's Merkle tree on every
/// write would defeat the point of a fast debug tripwire.
pub(crate) fn debug_check_after_commit(store: &Arc<StoreInner>) {
    if !store.mount_options.debug_fsck_after_commit {
        return;
    }
    let report = check(store, CheckMode::Lenient);
    if !report.is_clean() {
        panic!("debug_fsck_after_commit: inconsistency after commit: {:?}", report.errors);
    }
}

#[cfg(test)]
mod tests {
    // Exercised by the end-to-end integration scenarios, which format,
    // write, corrupt, and check a store in one pass.
}
