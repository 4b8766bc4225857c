//! Format-time and mount-time configuration surfaces.
//!
//! Kept as plain `serde` structs, per §10.3: a host loads these from
//! whatever configuration format it likes and hands the core a value, rather
//! than the core reaching for a global config singleton.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobLayout {
    /// Merkle tree precedes the payload. Read-only legacy layout.
    PaddedAtStart,
    /// Payload first, Merkle tree packed at the end of the storage region.
    CompactAtEnd,
}

impl Default for BlobLayout {
    fn default() -> Self {
        BlobLayout::CompactAtEnd
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FormatOptions {
    pub blob_layout: BlobLayout,
    /// Initial inode count; rounded up to a whole node-table block on use.
    pub num_inodes: u32,
    /// Stamp written into the superblock's oldest_minor_version; `None`
    /// means "use this build's minor version".
    pub oldest_minor_version: Option<u16>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            blob_layout: BlobLayout::CompactAtEnd,
            num_inodes: 1024,
            oldest_minor_version: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Writability {
    ReadOnlyDisk,
    ReadOnlyFilesystem,
    Writable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Uncompressed,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    EvictImmediately,
    NeverEvict,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MountOptions {
    pub writability: Writability,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: i32,
    pub cache_policy: CachePolicy,
    pub pager_backed_cache_policy: Option<CachePolicy>,
    pub sandbox_decompression: bool,
    pub offline_compression: bool,
    pub paging_threads: u32,
    pub verbose: bool,
    pub metrics: bool,
    pub metrics_flush_period_ms: u32,
    /// Runs the consistency checker after every committed transaction and
    /// panics on mismatch. A policy choice per §9, not a debug_assertions
    /// switch, so it stays selectable in release builds under test.
    pub debug_fsck_after_commit: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            writability: Writability::Writable,
            compression_algorithm: CompressionAlgorithm::Chunked,
            compression_level: 6,
            cache_policy: CachePolicy::EvictImmediately,
            pager_backed_cache_policy: None,
            sandbox_decompression: false,
            offline_compression: false,
            paging_threads: 1,
            verbose: false,
            metrics: false,
            metrics_flush_period_ms: 0,
            debug_fsck_after_commit: false,
        }
    }
}

impl MountOptions {
    pub fn effective_pager_cache_policy(&self) -> CachePolicy {
        self.pager_backed_cache_policy.unwrap_or(self.cache_policy)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.writability, Writability::Writable)
    }
}
