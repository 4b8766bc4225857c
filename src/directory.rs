//! The root directory (§4.10): a flat, digest-keyed namespace mapping every
//! readable blob's digest to its head node. Blobfs has no path hierarchy —
//! a blob's name *is* its Merkle root — so this is just an index, rebuilt
//! at mount time by scanning the node table for `Inode` entries.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::alloc_space::Allocator;
use crate::error::{Result, StoreError};
use crate::format::node::{Node, NodeIndex};
use crate::format::DIGEST_LEN;

pub struct Directory {
    index: spin::Mutex<BTreeMap<[u8; DIGEST_LEN], NodeIndex>>,
}

impl Directory {
    pub fn rebuild(allocator: &Allocator) -> Directory {
        let mut index = BTreeMap::new();
        for i in 0..allocator.node_count() as u32 {
            if let Ok(Node::Inode(inode)) = allocator.node(NodeIndex(i)) {
                index.insert(inode.digest, NodeIndex(i));
            }
        }
        Directory { index: spin::Mutex::new(index) }
    }

    pub fn lookup(&self, digest: &[u8; DIGEST_LEN]) -> Option<NodeIndex> {
        self.index.lock().get(digest).copied()
    }

    pub fn insert(&self, digest: [u8; DIGEST_LEN], node: NodeIndex) -> Result<()> {
        let mut index = self.index.lock();
        if index.contains_key(&digest) {
            return Err(StoreError::AlreadyExists);
        }
        index.insert(digest, node);
        Ok(())
    }

    pub fn remove(&self, digest: &[u8; DIGEST_LEN]) -> Result<NodeIndex> {
        self.index.lock().remove(digest).ok_or(StoreError::NotFound)
    }

    pub fn iter_digests(&self) -> Vec<[u8; DIGEST_LEN]> {
        self.index.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
