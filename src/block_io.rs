//! Buffered I/O layer (§4.1): translates whole-`FS_BLOCK` reads/writes into
//! batched device operations. Sub-block I/O is not supported; the device's
//! native block size must divide `FS_BLOCK`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::error::{Result, StoreError};
use crate::format::FS_BLOCK;

pub struct BlockIo {
    device: Arc<dyn BlockDevice>,
    device_block_size: u32,
    blocks_per_fs_block: u32,
}

impl BlockIo {
    pub fn new(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let info = device.info();
        if info.device_block_size == 0 || FS_BLOCK % info.device_block_size != 0 {
            return Err(StoreError::InvalidArgument(
                "device block size must divide FS_BLOCK",
            ));
        }
        Ok(BlockIo {
            device,
            device_block_size: info.device_block_size,
            blocks_per_fs_block: FS_BLOCK / info.device_block_size,
        })
    }

    pub fn device_block_count(&self) -> u64 {
        self.device.info().block_count
    }

    pub fn fs_block_count(&self) -> u64 {
        self.device_block_count() / self.blocks_per_fs_block as u64
    }

    pub fn within_volume_manager(&self) -> bool {
        self.device.info().flags.within_volume_manager
    }

    fn device_offset(&self, fs_block_no: u64) -> u64 {
        fs_block_no * self.blocks_per_fs_block as u64
    }

    pub fn read_block(&self, fs_block_no: u64, out_buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out_buf.len(), FS_BLOCK as usize);
        self.device.read_blocks(self.device_offset(fs_block_no), out_buf)
    }

    pub fn read_blocks(&self, first_fs_block: u64, out_buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out_buf.len() % FS_BLOCK as usize, 0);
        self.device.read_blocks(self.device_offset(first_fs_block), out_buf)
    }

    pub fn write_blocks(&self, writes: &[(u64, &[u8])]) -> Result<()> {
        for (fs_block_no, buf) in writes {
            debug_assert_eq!(buf.len() % FS_BLOCK as usize, 0);
            self.device.write_blocks(self.device_offset(*fs_block_no), buf)?;
        }
        Ok(())
    }

    pub fn write_block(&self, fs_block_no: u64, buf: &[u8]) -> Result<()> {
        self.write_blocks(&[(fs_block_no, buf)])
    }

    pub fn trim(&self, first_fs_block: u64, fs_block_count: u64) -> Result<()> {
        if !self.device.info().flags.trim_support {
            return Err(StoreError::Unsupported("device does not support trim"));
        }
        self.device.trim(
            self.device_offset(first_fs_block),
            fs_block_count * self.blocks_per_fs_block as u64,
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }

    pub fn zero_blocks(&self, first_fs_block: u64, fs_block_count: u64) -> Result<()> {
        let buf: Vec<u8> = alloc::vec![0u8; FS_BLOCK as usize];
        for i in 0..fs_block_count {
            self.write_block(first_fs_block + i, &buf)?;
        }
        Ok(())
    }
}
