//! Extent-list walking: an inode's data lives in its one inline extent plus,
//! when fragmented across more than one run, a chain of `Container` nodes
//! reached through `next_node`.

use alloc::vec::Vec;

use crate::alloc_space::Allocator;
use crate::block_io::BlockIo;
use crate::error::{Result, StoreError};
use crate::format::node::{Extent, Inode, Node, NodeIndex, SENTINEL_NODE};
use crate::format::FS_BLOCK;

pub fn collect_extents(allocator: &Allocator, inode: &Inode) -> Result<Vec<Extent>> {
    let mut extents = Vec::with_capacity(inode.extent_count as usize);
    if !inode.inline_extent.is_empty() {
        extents.push(inode.inline_extent);
    }
    let mut next = inode.next_node;
    while next != SENTINEL_NODE {
        match allocator.node(NodeIndex(next))? {
            Node::Container(container) => {
                for e in container.extents.iter().take(container.extent_count as usize) {
                    extents.push(*e);
                }
                next = container.next_node;
            }
            _ => return Err(StoreError::CorruptNode(NodeIndex(next))),
        }
    }
    Ok(extents)
}

pub fn read_region(block_io: &BlockIo, data_start: u64, extents: &[Extent], total_len: u64) -> Result<alloc::vec::Vec<u8>> {
    let mut out = alloc::vec::Vec::with_capacity(total_len as usize);
    for extent in extents {
        let mut buf = alloc::vec![0u8; extent.length as usize * FS_BLOCK as usize];
        block_io.read_blocks(data_start + extent.start_block, &mut buf)?;
        out.extend_from_slice(&buf);
    }
    out.truncate(total_len as usize);
    Ok(out)
}

/// Reads only the bytes in `[region_offset, region_offset+len)` of the
/// region addressed by `extents`, without materializing the whole region.
pub fn read_region_range(
    block_io: &BlockIo,
    data_start: u64,
    extents: &[Extent],
    region_offset: u64,
    len: u64,
) -> Result<alloc::vec::Vec<u8>> {
    let mut out = alloc::vec::Vec::with_capacity(len as usize);
    let mut region_pos = 0u64;
    let want_end = region_offset + len;
    for extent in extents {
        let extent_bytes = extent.length as u64 * FS_BLOCK as u64;
        let extent_start = region_pos;
        let extent_end = region_pos + extent_bytes;
        if extent_end > region_offset && extent_start < want_end {
            let mut buf = alloc::vec![0u8; extent_bytes as usize];
            block_io.read_blocks(data_start + extent.start_block, &mut buf)?;
            let lo = region_offset.max(extent_start) - extent_start;
            let hi = want_end.min(extent_end) - extent_start;
            out.extend_from_slice(&buf[lo as usize..hi as usize]);
        }
        region_pos = extent_end;
        if region_pos >= want_end {
            break;
        }
    }
    Ok(out)
}

pub fn write_region(block_io: &BlockIo, data_start: u64, extents: &[Extent], bytes: &[u8]) -> Result<()> {
    let mut pos = 0usize;
    for extent in extents {
        let extent_bytes = extent.length as usize * FS_BLOCK as usize;
        let mut buf = alloc::vec![0u8; extent_bytes];
        let available = bytes.len().saturating_sub(pos).min(extent_bytes);
        buf[..available].copy_from_slice(&bytes[pos..pos + available]);
        block_io.write_blocks(&[(data_start + extent.start_block, &buf)])?;
        pos += extent_bytes;
    }
    Ok(())
}
