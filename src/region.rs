//! The byte layout of a blob's stored region within its extents.
//!
//! A stored region is a flat byte buffer written across one or more data
//! extents: a one-byte content tag, then either the raw payload
//! (`ContentTag::Uncompressed`) or a `CompressedHeader` followed by the
//! compressed chunk bytes (`ContentTag::Chunked`), plus the serialized
//! Merkle tree (empty for single-chunk blobs). `BlobLayout` controls
//! whether the tree precedes or follows the content.

use crate::config::BlobLayout;
use crate::format::round_up_blocks;
use crate::merkle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTag {
    Uncompressed = 0,
    Chunked = 1,
}

impl ContentTag {
    pub fn from_byte(b: u8) -> Option<ContentTag> {
        match b {
            0 => Some(ContentTag::Uncompressed),
            1 => Some(ContentTag::Chunked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    pub tree_offset: u64,
    pub tree_len: u64,
    pub content_offset: u64,
    pub content_len: u64,
    pub total_len: u64,
    pub block_count: u32,
}

/// `blob_size` is the logical (uncompressed) size, which determines the
/// Merkle tree's shape; `content_len` is the number of bytes the tagged
/// content region actually occupies on disk (raw payload length, or
/// 1 + header + compressed bytes for the chunked case).
pub fn compute(layout: BlobLayout, blob_size: u64, content_len: u64) -> RegionLayout {
    let tree_len = merkle::tree_byte_size(blob_size);
    let (tree_offset, content_offset) = match layout {
        BlobLayout::CompactAtEnd => (content_len, 0),
        BlobLayout::PaddedAtStart => (0, tree_len),
    };
    let total_len = tree_len + content_len;
    RegionLayout {
        tree_offset,
        tree_len,
        content_offset,
        content_len,
        total_len,
        block_count: round_up_blocks(total_len) as u32,
    }
}
