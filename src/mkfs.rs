//! The formatter (§4.12): lays out a fresh instance on an empty device.

use alloc::sync::Arc;

use crate::block_io::BlockIo;
use crate::config::FormatOptions;
use crate::device::BlockDevice;
use crate::error::{Result, StoreError};
use crate::format::superblock::Superblock;
use crate::format::Layout;
use crate::journal::Journal;

pub fn format(device: Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
    let block_io = BlockIo::new(device)?;
    let block_count = block_io.fs_block_count();
    let layout = Layout::compute(block_count, options.num_inodes)
        .ok_or(StoreError::InvalidArgument("device too small for a viable layout"))?;

    block_io.zero_blocks(layout.bitmap_start, layout.bitmap_block_count)?;
    block_io.zero_blocks(layout.node_table_start, layout.node_table_block_count)?;
    Journal::format(&block_io, layout.journal_start, layout.journal_block_count)?;

    let superblock = Superblock::new(&layout, options);
    block_io.write_block(0, &superblock.to_block_bytes())?;

    if block_io.within_volume_manager() {
        let backup_offset = layout.data_start + layout.data_block_count - 1;
        block_io.write_block(backup_offset, &superblock.to_block_bytes())?;
    }

    block_io.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::format::FS_BLOCK;

    #[test]
    fn formats_a_small_device() {
        let device = Arc::new(InMemoryDevice::new(512, 1024 * (FS_BLOCK as u64 / 512)));
        format(device.clone(), &FormatOptions::default()).unwrap();

        let block_io = BlockIo::new(device).unwrap();
        let mut sb_bytes = alloc::vec![0u8; FS_BLOCK as usize];
        block_io.read_block(0, &mut sb_bytes).unwrap();
        let sb = Superblock::from_block_bytes(&sb_bytes).unwrap();
        assert!(sb.is_clean());
        assert_eq!(sb.allocated_block_count, 0);
        assert_eq!(sb.allocated_inode_count, 0);
    }

    #[test]
    fn refuses_too_small_device() {
        let device = Arc::new(InMemoryDevice::new(512, 4));
        assert!(format(device, &FormatOptions::default()).is_err());
    }

    #[test]
    fn writes_backup_superblock_within_a_volume_manager() {
        let device = Arc::new(InMemoryDevice::new(512, 1024 * (FS_BLOCK as u64 / 512)).within_volume_manager());
        format(device.clone(), &FormatOptions::default()).unwrap();

        let block_io = BlockIo::new(device).unwrap();
        let layout = Layout::compute(block_io.fs_block_count(), FormatOptions::default().num_inodes).unwrap();
        let mut backup_bytes = alloc::vec![0u8; FS_BLOCK as usize];
        block_io.read_block(layout.data_start + layout.data_block_count - 1, &mut backup_bytes).unwrap();
        let backup = Superblock::from_block_bytes(&backup_bytes).unwrap();
        assert_eq!(backup.block_count, layout.block_count);
    }
}
