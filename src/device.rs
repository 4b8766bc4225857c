//! The block-device boundary (§6). The core only consumes this trait; a
//! real disk driver, a VMO-backed slab, or (in tests) an in-memory buffer
//! can all implement it.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFlags {
    pub readonly: bool,
    pub trim_support: bool,
    pub within_volume_manager: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub device_block_size: u32,
    pub block_count: u64,
    pub flags: DeviceFlags,
    pub max_transfer_size: u32,
}

/// A contiguous array of fixed-size device blocks.
///
/// All offsets and lengths below are in units of `device_block_size`, not
/// `FS_BLOCK`; the buffered I/O layer (`block_io`) is the adapter between
/// the two.
pub trait BlockDevice: Send + Sync {
    fn info(&self) -> DeviceInfo;

    fn read_blocks(&self, device_block_offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_blocks(&self, device_block_offset: u64, buf: &[u8]) -> Result<()>;

    fn trim(&self, device_block_offset: u64, block_count: u64) -> Result<()>;

    fn flush(&self) -> Result<()>;
}

/// An in-memory block device, grounded on the fake block device used by the
/// reference implementation's own test harness. Not gated on `cfg(test)` so
/// that the `tests/` integration crate (which links as a separate, always
/// `std`, binary) can use it too.
pub struct InMemoryDevice {
    block_size: u32,
    data: spin::Mutex<Vec<u8>>,
    readonly: bool,
    within_volume_manager: bool,
    flush_count: core::sync::atomic::AtomicU64,
}

impl InMemoryDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        InMemoryDevice {
            block_size,
            data: spin::Mutex::new(vec![0u8; (block_size as u64 * block_count) as usize]),
            readonly: false,
            within_volume_manager: false,
            flush_count: core::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn within_volume_manager(mut self) -> Self {
        self.within_volume_manager = true;
        self
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(core::sync::atomic::Ordering::Relaxed)
    }

    /// Test-only helper to flip a single byte on the backing store, used to
    /// simulate on-disk corruption (scenario S3).
    pub fn corrupt_byte(&self, byte_offset: usize, new_value: u8) {
        let mut data = self.data.lock();
        data[byte_offset] ^= new_value | 0x01;
    }
}

impl BlockDevice for InMemoryDevice {
    fn info(&self) -> DeviceInfo {
        let block_count = self.data.lock().len() as u64 / self.block_size as u64;
        DeviceInfo {
            device_block_size: self.block_size,
            block_count,
            flags: DeviceFlags {
                readonly: self.readonly,
                trim_support: true,
                within_volume_manager: self.within_volume_manager,
            },
            max_transfer_size: u32::MAX,
        }
    }

    fn read_blocks(&self, device_block_offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = device_block_offset as usize * self.block_size as usize;
        let data = self.data.lock();
        let end = start + buf.len();
        if end > data.len() {
            return Err(StoreError::IoError("read past end of device"));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_blocks(&self, device_block_offset: u64, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(StoreError::AccessDenied);
        }
        let start = device_block_offset as usize * self.block_size as usize;
        let mut data = self.data.lock();
        let end = start + buf.len();
        if end > data.len() {
            return Err(StoreError::IoError("write past end of device"));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn trim(&self, _device_block_offset: u64, _block_count: u64) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flush_count.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}
