//! The primary (and optional backup) superblock: the first filesystem
//! block, carrying region sizes, version info, flags, and counts.
//!
//! Encoded with `zerocopy` rather than an unsafe raw-pointer cast, per §9's
//! memory-safety re-architecture note.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BlobLayout, FormatOptions};
use crate::error::{Result, StoreError};
use crate::format::{Layout, FS_BLOCK};

pub const MAGIC0: u64 = 0x424c_4f42_4653_3031; // "BLOBFS01"-ish, arbitrary but stable
pub const MAGIC1: u64 = 0x5f73_746f_7265_0001;

pub const FORMAT_VERSION: u32 = 1;
pub const CURRENT_MINOR_VERSION: u16 = 1;

pub const FLAG_CLEAN: u32 = 1 << 0;
pub const FLAG_LAYOUT_COMPACT_AT_END: u32 = 1 << 1;
pub const FLAG_WITHIN_VOLUME_MANAGER: u32 = 1 << 2;
pub const FLAG_TRIM_SUPPORTED: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Superblock {
    pub magic0: u64,
    pub magic1: u64,
    pub format_version: u32,
    pub minor_version: u16,
    pub oldest_minor_version: u16,
    pub flags: u32,
    pub fs_block_size: u32,
    pub block_count: u64,
    pub inode_count: u32,
    pub journal_block_count: u32,
    pub allocated_block_count: u64,
    pub allocated_inode_count: u32,
    _pad0: u32,
    pub bitmap_start: u64,
    pub node_table_start: u64,
    pub journal_start: u64,
    pub data_start: u64,
    pub data_block_count: u64,
    _reserved: [u8; 32],
}

impl Superblock {
    pub fn new(layout: &Layout, options: &FormatOptions) -> Superblock {
        let mut flags = FLAG_CLEAN | FLAG_TRIM_SUPPORTED;
        if options.blob_layout == BlobLayout::CompactAtEnd {
            flags |= FLAG_LAYOUT_COMPACT_AT_END;
        }
        Superblock {
            magic0: MAGIC0,
            magic1: MAGIC1,
            format_version: FORMAT_VERSION,
            minor_version: CURRENT_MINOR_VERSION,
            oldest_minor_version: options.oldest_minor_version.unwrap_or(CURRENT_MINOR_VERSION),
            flags,
            fs_block_size: FS_BLOCK,
            block_count: layout.block_count,
            inode_count: layout.inode_count,
            journal_block_count: layout.journal_block_count as u32,
            allocated_block_count: 0,
            allocated_inode_count: 0,
            _pad0: 0,
            bitmap_start: layout.bitmap_start,
            node_table_start: layout.node_table_start,
            journal_start: layout.journal_start,
            data_start: layout.data_start,
            data_block_count: layout.data_block_count,
            _reserved: [0; 32],
        }
    }

    pub fn to_block_bytes(&self) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; FS_BLOCK as usize];
        let bytes = self.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    pub fn from_block_bytes(block: &[u8]) -> Result<Superblock> {
        let sb = Superblock::read_from_prefix(block)
            .map_err(|_| StoreError::IoError("superblock block too short"))?
            .0;
        sb.validate()?;
        Ok(sb)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic0 != MAGIC0 || self.magic1 != MAGIC1 {
            return Err(StoreError::IoError("superblock magic mismatch"));
        }
        if self.fs_block_size != FS_BLOCK {
            return Err(StoreError::Unsupported("unexpected fs_block_size"));
        }
        if self.allocated_block_count > self.data_block_count {
            return Err(StoreError::IoError("allocated_block_count exceeds data_block_count"));
        }
        if self.allocated_inode_count > self.inode_count {
            return Err(StoreError::IoError("allocated_inode_count exceeds inode_count"));
        }
        if self.oldest_minor_version > self.minor_version {
            return Err(StoreError::Unsupported("oldest_minor_version newer than minor_version"));
        }
        Some(())
            .filter(|_| {
                self.block_count
                    .checked_mul(self.fs_block_size as u64)
                    .is_some()
            })
            .ok_or(StoreError::IoError("block_count overflows when scaled by fs_block_size"))?;
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.flags & FLAG_CLEAN != 0
    }

    pub fn set_clean(&mut self, clean: bool) {
        if clean {
            self.flags |= FLAG_CLEAN;
        } else {
            self.flags &= !FLAG_CLEAN;
        }
    }

    pub fn blob_layout(&self) -> BlobLayout {
        if self.flags & FLAG_LAYOUT_COMPACT_AT_END != 0 {
            BlobLayout::CompactAtEnd
        } else {
            BlobLayout::PaddedAtStart
        }
    }

    pub fn within_volume_manager(&self) -> bool {
        self.flags & FLAG_WITHIN_VOLUME_MANAGER != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let layout = Layout::compute(1024, 128).unwrap();
        let sb = Superblock::new(&layout, &FormatOptions::default());
        let bytes = sb.to_block_bytes();
        let parsed = Superblock::from_block_bytes(&bytes).unwrap();
        assert_eq!(parsed.block_count, sb.block_count);
        assert_eq!(parsed.bitmap_start, sb.bitmap_start);
        assert!(parsed.is_clean());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = alloc::vec![0u8; FS_BLOCK as usize];
        bytes[0] = 0xff;
        assert!(Superblock::from_block_bytes(&bytes).is_err());
    }
}
