//! The space allocator (§4.3): block bitmap + node pool with
//! transaction-scoped reservations.
//!
//! `ReservedExtent`/`ReservedNode` are RAII handles, grounded on the
//! reference implementation's `NodeReserver`/`ReservedNode` pattern
//! (move-only, release-on-drop) — here expressed with ownership instead of
//! a manual `Release()` call, since Rust's `Drop` gives us the same
//! guarantee without a dangling-pointer risk.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Result, StoreError};
use crate::format::bitmap::Bitmap;
use crate::format::node::{Container, Extent, Inode, Node, NodeIndex};
use crate::format::{FS_BLOCK, NODES_PER_BLOCK, NODE_SIZE};
use crate::metrics::Metrics;

pub fn node_block_and_offset(index: NodeIndex, node_table_start: u64) -> (u64, usize) {
    let block = node_table_start + (index.0 / NODES_PER_BLOCK) as u64;
    let offset = (index.0 % NODES_PER_BLOCK) as usize * NODE_SIZE;
    (block, offset)
}

struct Inner {
    committed_blocks: Bitmap,
    reserved_blocks: Bitmap,
    nodes: Vec<Node>,
    reserved_nodes: BTreeSet<u32>,
    data_block_count: u64,
}

pub struct Allocator {
    inner: Arc<spin::Mutex<Inner>>,
    metrics: Arc<Metrics>,
}

impl Allocator {
    pub fn new(committed_blocks: Bitmap, nodes: Vec<Node>, metrics: Arc<Metrics>) -> Allocator {
        let data_block_count = committed_blocks.len_bits();
        Allocator {
            inner: Arc::new(spin::Mutex::new(Inner {
                reserved_blocks: Bitmap::new_cleared(data_block_count),
                committed_blocks,
                nodes,
                reserved_nodes: BTreeSet::new(),
                data_block_count,
            })),
            metrics,
        }
    }

    pub fn is_block_allocated(&self, block_no: u64) -> bool {
        self.inner.lock().committed_blocks.get(block_no)
    }

    pub fn allocated_block_count(&self) -> u64 {
        self.inner.lock().committed_blocks.popcount()
    }

    pub fn allocated_inode_count(&self) -> u32 {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| matches!(n, Node::Inode(_)))
            .count() as u32
    }

    pub fn node(&self, index: NodeIndex) -> Result<Node> {
        let inner = self.inner.lock();
        inner.nodes.get(index.0 as usize).copied().ok_or(StoreError::InvalidArgument("node index out of range"))
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// First-fit reservation, possibly split across multiple extents when a
    /// single contiguous run large enough is not available.
    pub fn reserve_blocks(&self, mut remaining: u32) -> Result<Vec<ReservedExtent>> {
        let mut result: Vec<ReservedExtent> = Vec::new();
        let mut inner = self.inner.lock();
        let mut search_from = 0u64;
        while remaining > 0 {
            let Some((start, len)) = find_next_free_run(&inner.committed_blocks, &inner.reserved_blocks, search_from, remaining as u64)
            else {
                drop(inner);
                // Roll back anything we speculatively marked reserved.
                for extent in result {
                    extent.release_without_commit();
                }
                return Err(StoreError::NoSpace { requested_blocks: remaining });
            };
            let len = len.min(u16::MAX as u64) as u16;
            inner.reserved_blocks.set_range(start, len as u64, true);
            result.push(ReservedExtent {
                extent: Extent { start_block: start, length: len },
                allocator: Arc::clone(&self.inner),
                committed: false,
            });
            remaining -= len as u32;
            search_from = start + len as u64;
        }
        Ok(result)
    }

    pub fn reserve_node(&self) -> Result<ReservedNode> {
        let mut inner = self.inner.lock();
        let idx = (0..inner.nodes.len() as u32)
            .find(|i| !inner.nodes[*i as usize].is_allocated() && !inner.reserved_nodes.contains(i));
        let Some(idx) = idx else {
            return Err(StoreError::NoSpace { requested_blocks: 0 });
        };
        inner.reserved_nodes.insert(idx);
        Ok(ReservedNode { index: NodeIndex(idx), allocator: Arc::clone(&self.inner), committed: false })
    }

    pub fn mark_allocated(&self, mut reserved: ReservedExtent) -> Extent {
        let extent = reserved.extent;
        let mut inner = self.inner.lock();
        inner.committed_blocks.set_range(extent.start_block, extent.length as u64, true);
        inner.reserved_blocks.set_range(extent.start_block, extent.length as u64, false);
        drop(inner);
        self.metrics.inc_blocks_allocated(extent.length as u64);
        reserved.committed = true;
        extent
    }

    pub fn mark_inode(&self, mut reserved: ReservedNode, inode: Inode) -> NodeIndex {
        let idx = reserved.index;
        let mut inner = self.inner.lock();
        inner.nodes[idx.0 as usize] = Node::Inode(inode);
        inner.reserved_nodes.remove(&idx.0);
        reserved.committed = true;
        idx
    }

    pub fn mark_container(&self, mut reserved: ReservedNode, container: Container) -> NodeIndex {
        let idx = reserved.index;
        let mut inner = self.inner.lock();
        inner.nodes[idx.0 as usize] = Node::Container(container);
        inner.reserved_nodes.remove(&idx.0);
        reserved.committed = true;
        idx
    }

    /// Reserves `extent` for freeing (§4.3): marks it in `reserved_blocks`
    /// while its `committed_blocks` bits are still set, so the range is
    /// excluded from `find_next_free_run` on both sides of the clear below.
    /// The caller holds the returned `ReservedExtent` until the transaction
    /// that clears the committed bits on disk has committed; dropping it
    /// then releases the range back to the free pool.
    pub fn reserve_for_free(&self, extent: Extent) -> Result<ReservedExtent> {
        let mut inner = self.inner.lock();
        if extent.start_block + extent.length as u64 > inner.data_block_count {
            return Err(StoreError::InvalidArgument("extent out of range"));
        }
        for b in extent.start_block..extent.end_block() {
            if !inner.committed_blocks.get(b) {
                return Err(StoreError::BadState("freeing an unallocated block"));
            }
            if inner.reserved_blocks.get(b) {
                return Err(StoreError::BadState("freeing a block with an in-flight reservation"));
            }
        }
        inner.reserved_blocks.set_range(extent.start_block, extent.length as u64, true);
        Ok(ReservedExtent { extent, allocator: Arc::clone(&self.inner), committed: false })
    }

    /// Clears `reserved.extent()`'s committed bits in memory. The caller
    /// must already hold the matching `ReservedExtent` (from
    /// `reserve_for_free`) and must not drop it until the transaction
    /// persisting this change has committed — otherwise a concurrent
    /// `reserve_blocks` could claim the same range before the on-disk
    /// bitmap and journal agree on it (§8.2).
    pub fn free_blocks(&self, reserved: &ReservedExtent) -> Result<()> {
        let extent = reserved.extent;
        let mut inner = self.inner.lock();
        inner.committed_blocks.set_range(extent.start_block, extent.length as u64, false);
        drop(inner);
        self.metrics.inc_blocks_freed(extent.length as u64);
        Ok(())
    }

    pub fn free_node(&self, index: NodeIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let node = inner.nodes.get(index.0 as usize).ok_or(StoreError::InvalidArgument("node index out of range"))?;
        if !node.is_allocated() {
            return Err(StoreError::BadState("double-free of node"));
        }
        inner.nodes[index.0 as usize] = Node::Free;
        Ok(())
    }

    pub fn raw_node_bytes(&self, index: NodeIndex) -> [u8; NODE_SIZE] {
        self.inner.lock().nodes[index.0 as usize].encode()
    }

    /// Histogram of free-fragment lengths in the committed-or-reserved
    /// view, sampled on demand (§4.3).
    pub fn free_fragment_histogram(&self) -> BTreeMap<u64, u32> {
        let inner = self.inner.lock();
        let mut histogram = BTreeMap::new();
        let mut bit = 0u64;
        let len = inner.committed_blocks.len_bits();
        while bit < len {
            if !inner.committed_blocks.get(bit) && !inner.reserved_blocks.get(bit) {
                let start = bit;
                while bit < len && !inner.committed_blocks.get(bit) && !inner.reserved_blocks.get(bit) {
                    bit += 1;
                }
                *histogram.entry(bit - start).or_insert(0) += 1;
            } else {
                bit += 1;
            }
        }
        histogram
    }

    /// Packs the `NODES_PER_BLOCK` nodes covering node-table block
    /// `block_index` (relative to the start of the node table) into one
    /// `FS_BLOCK`-sized buffer, ready to hand to the journal.
    pub fn node_table_block_bytes(&self, block_index: u64) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut buf = vec![0u8; FS_BLOCK as usize];
        let start_node = block_index * NODES_PER_BLOCK as u64;
        for i in 0..NODES_PER_BLOCK as u64 {
            let idx = (start_node + i) as usize;
            if idx < inner.nodes.len() {
                let bytes = inner.nodes[idx].encode();
                let at = i as usize * NODE_SIZE;
                buf[at..at + NODE_SIZE].copy_from_slice(&bytes);
            }
        }
        buf
    }

    /// Packs bitmap block `block_index` (relative to the start of the
    /// bitmap region) into one `FS_BLOCK`-sized buffer.
    pub fn bitmap_block_bytes(&self, block_index: u64) -> Vec<u8> {
        let inner = self.inner.lock();
        let bytes_per_block = FS_BLOCK as usize;
        let start = block_index as usize * bytes_per_block;
        let raw = inner.committed_blocks.as_bytes();
        let mut buf = vec![0u8; bytes_per_block];
        if start < raw.len() {
            let end = (start + bytes_per_block).min(raw.len());
            buf[..end - start].copy_from_slice(&raw[start..end]);
        }
        buf
    }

    pub fn node_table_block_of(index: NodeIndex) -> u64 {
        index.0 as u64 / NODES_PER_BLOCK as u64
    }

    /// Bitmap blocks (relative indices) touched by `extent`.
    pub fn bitmap_blocks_for_extent(extent: Extent) -> impl Iterator<Item = u64> {
        let bits_per_block = FS_BLOCK as u64 * 8;
        let first = extent.start_block / bits_per_block;
        let last = extent.end_block().saturating_sub(1) / bits_per_block;
        first..=last
    }

    pub fn replace_committed_bitmap(&self, bitmap: Bitmap) {
        self.inner.lock().committed_blocks = bitmap;
    }

    pub fn replace_nodes(&self, nodes: Vec<Node>) {
        self.inner.lock().nodes = nodes;
    }
}

/// First-fit run search across two bitmaps at once: delegates the scan
/// itself to `Bitmap::find_clear_run_up_to` on `committed`, then trims
/// the candidate run down to the prefix that is also clear in
/// `reserved`, retrying past the first conflict when the whole candidate
/// is unusable.
fn find_next_free_run(committed: &Bitmap, reserved: &Bitmap, from: u64, max_len: u64) -> Option<(u64, u64)> {
    let mut search_from = from;
    loop {
        let (start, len) = committed.find_clear_run_up_to(search_from, max_len)?;
        let mut usable = 0u64;
        let mut conflict_at = None;
        for b in start..start + len {
            if reserved.get(b) {
                conflict_at = Some(b);
                break;
            }
            usable += 1;
        }
        if usable > 0 {
            return Some((start, usable));
        }
        search_from = conflict_at.expect("usable == 0 implies a conflict bit was found") + 1;
    }
}

pub struct ReservedExtent {
    extent: Extent,
    allocator: Arc<spin::Mutex<Inner>>,
    committed: bool,
}

impl ReservedExtent {
    pub fn extent(&self) -> Extent {
        self.extent
    }

    fn release_without_commit(self) {
        drop(self);
    }
}

impl Drop for ReservedExtent {
    fn drop(&mut self) {
        if !self.committed {
            let mut inner = self.allocator.lock();
            inner.reserved_blocks.set_range(self.extent.start_block, self.extent.length as u64, false);
        }
    }
}

pub struct ReservedNode {
    index: NodeIndex,
    allocator: Arc<spin::Mutex<Inner>>,
    committed: bool,
}

impl ReservedNode {
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl Drop for ReservedNode {
    fn drop(&mut self) {
        if !self.committed {
            self.allocator.lock().reserved_nodes.remove(&self.index.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn test_allocator(block_count: u64, node_count: usize) -> Allocator {
        Allocator::new(
            Bitmap::new_cleared(block_count),
            vec![Node::Free; node_count],
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn reserve_then_drop_releases() {
        let allocator = test_allocator(16, 4);
        {
            let _reservation = allocator.reserve_blocks(4).unwrap();
            assert!(allocator.reserve_blocks(16).is_err());
        }
        let second = allocator.reserve_blocks(16).unwrap();
        assert_eq!(second.iter().map(|e| e.extent().length as u64).sum::<u64>(), 16);
    }

    #[test]
    fn mark_allocated_persists_past_reservation_drop() {
        let allocator = test_allocator(16, 4);
        let mut reservations = allocator.reserve_blocks(4).unwrap();
        let extent = allocator.mark_allocated(reservations.remove(0));
        assert!(allocator.is_block_allocated(extent.start_block));
        assert_eq!(allocator.allocated_block_count(), 4);
    }

    #[test]
    fn reservation_prevents_concurrent_double_allocation() {
        let allocator = test_allocator(8, 2);
        let _r1 = allocator.reserve_blocks(8).unwrap();
        assert!(allocator.reserve_blocks(1).is_err());
    }

    #[test]
    fn free_fragment_histogram_counts_runs() {
        let allocator = test_allocator(16, 1);
        let mut reservations = allocator.reserve_blocks(1).unwrap();
        allocator.mark_allocated(reservations.remove(0));
        let histogram = allocator.free_fragment_histogram();
        assert_eq!(histogram.get(&15), Some(&1));
    }

    #[test]
    fn double_free_is_bad_state() {
        let allocator = test_allocator(8, 1);
        let mut reservations = allocator.reserve_blocks(2).unwrap();
        let extent = allocator.mark_allocated(reservations.remove(0));
        let reserved = allocator.reserve_for_free(extent).unwrap();
        allocator.free_blocks(&reserved).unwrap();
        drop(reserved);
        assert!(allocator.reserve_for_free(extent).is_err());
    }

    #[test]
    fn reserve_for_free_blocks_concurrent_reallocation_until_released() {
        let allocator = test_allocator(8, 1);
        let mut reservations = allocator.reserve_blocks(8).unwrap();
        let extent = allocator.mark_allocated(reservations.remove(0));
        let reserved = allocator.reserve_for_free(extent).unwrap();
        allocator.free_blocks(&reserved).unwrap();

        // Committed bits are clear but the reservation still holds the
        // range: a concurrent allocation must not be able to claim it.
        assert!(allocator.reserve_blocks(1).is_err());

        drop(reserved);
        assert!(allocator.reserve_blocks(1).is_ok());
    }
}
