//! Merkle tree construction and verification (§4.6).
//!
//! Hash primitive: BLAKE2b-256, pinned here per the §9 open-question
//! resolution — a pure-Rust, `no_std`-compatible construction. Chunk size
//! equals `FS_BLOCK`; each leaf mixes in `level ^ chunk_offset` and the
//! chunk's effective length before hashing the (zero-padded) chunk. Internal
//! levels hash concatenated, block-padded child digests the same way.

use alloc::vec;
use alloc::vec::Vec;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest as _};

use crate::error::{Result, StoreError};
use crate::format::{DIGEST_LEN, FS_BLOCK};

pub type Digest = [u8; DIGEST_LEN];

type Blake2b256 = Blake2b<U32>;

const DIGESTS_PER_BLOCK: usize = FS_BLOCK as usize / DIGEST_LEN;

fn hash_node(level: u32, offset: u64, data: &[u8], effective_len: u32) -> Digest {
    let mut hasher = Blake2b256::new();
    let salt = (level as u64) ^ offset;
    hasher.update(salt.to_le_bytes());
    hasher.update(effective_len.to_le_bytes());
    hasher.update(data);
    let out = hasher.finalize();
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&out);
    digest
}

fn hash_leaf(chunk_offset: u64, chunk: &[u8]) -> Digest {
    let mut padded = [0u8; FS_BLOCK as usize];
    padded[..chunk.len()].copy_from_slice(chunk);
    hash_node(0, chunk_offset, &padded, chunk.len() as u32)
}

fn hash_internal(level: u32, node_index: u64, children: &[Digest]) -> Digest {
    let mut padded = vec![0u8; FS_BLOCK as usize];
    let mut written = 0;
    for child in children {
        padded[written..written + DIGEST_LEN].copy_from_slice(child);
        written += DIGEST_LEN;
    }
    hash_node(level, node_index, &padded, written as u32)
}

/// Number of leaf chunks for a payload of `payload_len` bytes.
pub fn leaf_count(payload_len: u64) -> u64 {
    if payload_len == 0 {
        1
    } else {
        payload_len.div_ceil(FS_BLOCK as u64)
    }
}

/// Total size in bytes of every non-root level's digests, used to size the
/// on-disk tree region. Payloads of one chunk or less need no tree.
pub fn tree_byte_size(payload_len: u64) -> u64 {
    if leaf_count(payload_len) <= 1 {
        return 0;
    }
    let mut size = 0u64;
    let mut level_len = leaf_count(payload_len);
    while level_len > 1 {
        size += level_len * DIGEST_LEN as u64;
        level_len = level_len.div_ceil(DIGESTS_PER_BLOCK as u64);
    }
    size
}

/// Block count needed to store the tree, rounding each level up to whole
/// filesystem blocks (used by the `PaddedAtStart` layout).
pub fn tree_block_count(payload_len: u64) -> u64 {
    if leaf_count(payload_len) <= 1 {
        return 0;
    }
    let mut blocks = 0u64;
    let mut level_len = leaf_count(payload_len);
    while level_len > 1 {
        blocks += level_len.div_ceil(DIGESTS_PER_BLOCK as u64);
        level_len = level_len.div_ceil(DIGESTS_PER_BLOCK as u64);
    }
    blocks
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] is the leaf level; the last level has exactly one entry,
    /// the root. Payloads of a single chunk or less produce a single-level
    /// tree (the leaf digest is the root, and no bytes are persisted).
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    pub fn build(payload: &[u8]) -> MerkleTree {
        let n_leaves = leaf_count(payload.len() as u64) as usize;
        let mut leaves = Vec::with_capacity(n_leaves);
        for i in 0..n_leaves {
            let start = i * FS_BLOCK as usize;
            let end = (start + FS_BLOCK as usize).min(payload.len());
            let chunk = if start < payload.len() { &payload[start..end] } else { &[][..] };
            leaves.push(hash_leaf(start as u64, chunk));
        }

        let mut levels = vec![leaves];
        let mut level_idx = 1u32;
        while levels.last().unwrap().len() > 1 {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(DIGESTS_PER_BLOCK));
            for (group_idx, group) in prev.chunks(DIGESTS_PER_BLOCK).enumerate() {
                next.push(hash_internal(level_idx, group_idx as u64, group));
            }
            levels.push(next);
            level_idx += 1;
        }
        MerkleTree { levels }
    }

    /// Reconstructs the single-leaf tree for a payload of one chunk or
    /// less, where the leaf digest and the root are the same value and
    /// nothing is ever persisted to disk.
    pub fn trivial(root: Digest) -> MerkleTree {
        MerkleTree { levels: vec![vec![root]] }
    }

    pub fn root(&self) -> Digest {
        self.levels.last().unwrap()[0]
    }

    pub fn is_trivial(&self) -> bool {
        self.levels.len() == 1
    }

    /// Serializes every level except the root (the root is carried in the
    /// inode, not the tree bytes) as flat, concatenated digests, leaf level
    /// first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for level in self.levels.iter().take(self.levels.len().saturating_sub(1)) {
            for digest in level {
                out.extend_from_slice(digest);
            }
        }
        out
    }

    /// Reconstructs a tree's shape from its serialized bytes and the
    /// payload length the tree was built over, then verifies internal
    /// consistency by recomputing every internal node from its children.
    pub fn from_bytes(bytes: &[u8], payload_len: u64, expected_root: Digest) -> Result<MerkleTree> {
        let n_leaves = leaf_count(payload_len) as usize;
        if n_leaves <= 1 {
            return Err(StoreError::InvalidArgument(
                "payload of one chunk or less has no stored tree",
            ));
        }
        let mut levels: Vec<Vec<Digest>> = Vec::new();
        let mut offset = 0usize;
        let mut level_len = n_leaves;
        loop {
            let byte_len = level_len * DIGEST_LEN;
            if offset + byte_len > bytes.len() {
                return Err(StoreError::IoError("merkle tree bytes truncated"));
            }
            let mut level = Vec::with_capacity(level_len);
            for i in 0..level_len {
                let start = offset + i * DIGEST_LEN;
                let mut d = [0u8; DIGEST_LEN];
                d.copy_from_slice(&bytes[start..start + DIGEST_LEN]);
                level.push(d);
            }
            offset += byte_len;
            levels.push(level);
            if level_len == 1 {
                break;
            }
            level_len = level_len.div_ceil(DIGESTS_PER_BLOCK);
        }

        // Recompute the root from the stored levels to confirm internal
        // consistency before trusting any of it.
        let mut level_idx = 1u32;
        for i in 1..levels.len() {
            let prev = levels[i - 1].clone();
            for (group_idx, group) in prev.chunks(DIGESTS_PER_BLOCK).enumerate() {
                let recomputed = hash_internal(level_idx, group_idx as u64, group);
                if recomputed != levels[i][group_idx] {
                    return Err(StoreError::IntegrityError { chunk: group_idx as u32 });
                }
            }
            level_idx += 1;
        }
        let root = *levels.last().unwrap().first().ok_or(StoreError::IoError("empty tree"))?;
        if root != expected_root {
            return Err(StoreError::IntegrityError { chunk: u32::MAX });
        }
        Ok(MerkleTree { levels })
    }

    /// Verifies one leaf chunk against the tree, walking only the path from
    /// leaf to root (O(log64 size) work), per §4.6.
    pub fn verify_chunk(&self, chunk_no: u64, chunk_bytes: &[u8]) -> Result<()> {
        let leaf_len = self.levels[0].len() as u64;
        if chunk_no >= leaf_len {
            return Err(StoreError::InvalidArgument("chunk index out of range"));
        }
        let expected_leaf = self.levels[0][chunk_no as usize];
        let computed = hash_leaf(chunk_no * FS_BLOCK as u64, chunk_bytes);
        if computed != expected_leaf {
            return Err(StoreError::IntegrityError { chunk: chunk_no as u32 });
        }
        Ok(())
    }
}

/// Computes the root digest of a payload without retaining the full tree;
/// used by the writer's streaming path is layered on top of `MerkleTree`
/// directly today (no incremental variant yet — see checker/writer).
pub fn digest_of(payload: &[u8]) -> Digest {
    MerkleTree::build(payload).root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_single_leaf() {
        let tree = MerkleTree::build(&[]);
        assert!(tree.is_trivial());
        assert_eq!(tree_byte_size(0), 0);
    }

    #[test]
    fn one_chunk_payload_has_no_stored_tree() {
        let payload = vec![0x61u8; FS_BLOCK as usize];
        let tree = MerkleTree::build(&payload);
        assert!(tree.is_trivial());
        assert_eq!(tree_byte_size(payload.len() as u64), 0);
    }

    #[test]
    fn multi_chunk_round_trip_and_verify() {
        let payload: Vec<u8> = (0..(FS_BLOCK as usize * 3 + 100)).map(|i| (i % 251) as u8).collect();
        let tree = MerkleTree::build(&payload);
        assert!(!tree.is_trivial());
        let root = tree.root();
        let bytes = tree.to_bytes();
        let reconstructed = MerkleTree::from_bytes(&bytes, payload.len() as u64, root).unwrap();
        for (i, chunk) in payload.chunks(FS_BLOCK as usize).enumerate() {
            reconstructed.verify_chunk(i as u64, chunk).unwrap();
        }
    }

    #[test]
    fn corrupt_chunk_fails_verification() {
        let payload: Vec<u8> = (0..(FS_BLOCK as usize * 3)).map(|i| (i % 251) as u8).collect();
        let tree = MerkleTree::build(&payload);
        let mut corrupt_chunk = payload[0..FS_BLOCK as usize].to_vec();
        corrupt_chunk[0] ^= 0xFF;
        assert!(tree.verify_chunk(0, &corrupt_chunk).is_err());
    }
}
