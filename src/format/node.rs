//! Fixed-size nodes packed into the node table (§3, §4.4).
//!
//! An `Inode` is a blob head; an `ExtentContainer` carries overflow extents.
//! Both are exactly `NODE_SIZE` bytes on disk and are read/written through
//! `zerocopy`, replacing the raw-pointer memcpy pattern this crate's
//! ancestor used for its own on-disk structs.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, StoreError};
use crate::format::{DIGEST_LEN, NODE_SIZE};

pub const SENTINEL_NODE: u32 = u32::MAX;

pub const FLAG_ALLOCATED: u16 = 1 << 0;
pub const FLAG_CONTAINER: u16 = 1 << 1;
pub const FLAG_COMPRESSED: u16 = 1 << 2;

pub const INLINE_EXTENTS_INODE: usize = 1;
pub const INLINE_EXTENTS_CONTAINER: usize = 6;

const EXTENT_OFFSET_MASK: u64 = (1u64 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub start_block: u64,
    pub length: u16,
}

impl Extent {
    pub fn pack(self) -> u64 {
        debug_assert!(self.start_block <= EXTENT_OFFSET_MASK);
        (self.start_block & EXTENT_OFFSET_MASK) | ((self.length as u64) << 48)
    }

    pub fn unpack(raw: u64) -> Extent {
        Extent {
            start_block: raw & EXTENT_OFFSET_MASK,
            length: (raw >> 48) as u16,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn end_block(&self) -> u64 {
        self.start_block + self.length as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub u32);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawNode {
    flags: u16,
    version: u16,
    next_node: u32,
    body: [u8; NODE_SIZE - 8],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawInodeBody {
    digest: [u8; DIGEST_LEN],
    blob_size: u64,
    block_count: u32,
    extent_count: u16,
    reserved: u16,
    inline_extent: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawContainerBody {
    previous_node: u32,
    extent_count: u16,
    reserved: u16,
    extents: [u64; INLINE_EXTENTS_CONTAINER],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Free,
    Inode(Inode),
    Container(Container),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub version: u16,
    pub next_node: u32,
    pub digest: [u8; DIGEST_LEN],
    pub blob_size: u64,
    pub block_count: u32,
    pub extent_count: u16,
    pub inline_extent: Extent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Container {
    pub version: u16,
    pub next_node: u32,
    pub previous_node: u32,
    pub extent_count: u16,
    pub extents: [Extent; INLINE_EXTENTS_CONTAINER],
}

impl Node {
    pub fn decode(bytes: &[u8]) -> Result<Node> {
        let raw = RawNode::read_from_bytes(bytes)
            .map_err(|_| StoreError::IoError("node block too short"))?;
        if raw.flags & FLAG_ALLOCATED == 0 {
            if raw.flags != 0 {
                return Err(StoreError::IoError("unallocated node has nonzero flags"));
            }
            return Ok(Node::Free);
        }
        if raw.flags & FLAG_CONTAINER != 0 {
            let body = RawContainerBody::read_from_bytes(&raw.body)
                .map_err(|_| StoreError::IoError("container body decode failed"))?;
            let mut extents = [Extent::default(); INLINE_EXTENTS_CONTAINER];
            for (i, e) in extents.iter_mut().enumerate() {
                *e = Extent::unpack(body.extents[i]);
            }
            Ok(Node::Container(Container {
                version: raw.version,
                next_node: raw.next_node,
                previous_node: body.previous_node,
                extent_count: body.extent_count,
                extents,
            }))
        } else {
            let body = RawInodeBody::read_from_bytes(&raw.body)
                .map_err(|_| StoreError::IoError("inode body decode failed"))?;
            Ok(Node::Inode(Inode {
                version: raw.version,
                next_node: raw.next_node,
                digest: body.digest,
                blob_size: body.blob_size,
                block_count: body.block_count,
                extent_count: body.extent_count,
                inline_extent: Extent::unpack(body.inline_extent),
            }))
        }
    }

    pub fn encode(&self) -> [u8; NODE_SIZE] {
        let mut buf = [0u8; NODE_SIZE];
        match self {
            Node::Free => {}
            Node::Inode(inode) => {
                let body = RawInodeBody {
                    digest: inode.digest,
                    blob_size: inode.blob_size,
                    block_count: inode.block_count,
                    extent_count: inode.extent_count,
                    reserved: 0,
                    inline_extent: inode.inline_extent.pack(),
                };
                let raw = RawNode {
                    flags: FLAG_ALLOCATED,
                    version: inode.version,
                    next_node: inode.next_node,
                    body: body_to_array(&body),
                };
                buf.copy_from_slice(raw.as_bytes());
            }
            Node::Container(container) => {
                let mut extents = [0u64; INLINE_EXTENTS_CONTAINER];
                for (i, e) in container.extents.iter().enumerate() {
                    extents[i] = e.pack();
                }
                let body = RawContainerBody {
                    previous_node: container.previous_node,
                    extent_count: container.extent_count,
                    reserved: 0,
                    extents,
                };
                let raw = RawNode {
                    flags: FLAG_ALLOCATED | FLAG_CONTAINER,
                    version: container.version,
                    next_node: container.next_node,
                    body: body_to_array(&body),
                };
                buf.copy_from_slice(raw.as_bytes());
            }
        }
        buf
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self, Node::Free)
    }
}

fn body_to_array<T: IntoBytes + Immutable>(body: &T) -> [u8; NODE_SIZE - 8] {
    let mut arr = [0u8; NODE_SIZE - 8];
    let bytes = body.as_bytes();
    arr[..bytes.len()].copy_from_slice(bytes);
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_round_trips() {
        let inode = Inode {
            version: 1,
            next_node: SENTINEL_NODE,
            digest: [7u8; DIGEST_LEN],
            blob_size: 1024,
            block_count: 1,
            extent_count: 1,
            inline_extent: Extent { start_block: 5, length: 1 },
        };
        let encoded = Node::Inode(inode).encode();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded, Node::Inode(inode));
    }

    #[test]
    fn free_node_is_all_zero() {
        let encoded = Node::Free.encode();
        assert!(encoded.iter().all(|&b| b == 0));
        assert_eq!(Node::decode(&encoded).unwrap(), Node::Free);
    }

    #[test]
    fn extent_packing_round_trips() {
        let e = Extent { start_block: (1u64 << 40) + 3, length: 0xFEED };
        assert_eq!(Extent::unpack(e.pack()), e);
    }
}
