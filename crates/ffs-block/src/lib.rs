#![forbid(unsafe_code)]
//! Block I/O layer and buffer cache.
//!
//! Provides the `BlockDevice` trait, an in-memory device, and the
//! buffer-head cache whose per-buffer state flags carry the journal's cached
//! revoke status.

pub mod buffer;
pub mod cache;

pub use buffer::{
    BH_DIRTY, BH_HASHED, BH_JWRITE, BH_REVOKE_VALID, BH_REVOKED, BH_UPTODATE, BufferFlags,
    BufferHead, BufferRef, RevokeState,
};
pub use cache::{BufferCache, BufferLookup};

use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Memory-backed block device.
///
/// Used by tests and benchmarks; can be told to fail writes to exercise
/// error paths.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    bytes: Mutex<Vec<u8>>,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FfsError::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = u64::from(block_size)
            .checked_mul(block_count)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| FfsError::InvalidGeometry("device size overflows usize".to_owned()))?;
        Ok(Self {
            block_size,
            block_count,
            bytes: Mutex::new(vec![0_u8; len]),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Make every subsequent write fail with an I/O error (or stop doing so).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Number of successful block writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    fn byte_range(&self, block: BlockNumber) -> Result<std::ops::Range<usize>> {
        if block.0 >= self.block_count {
            return Err(FfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let start = block
            .0
            .checked_mul(u64::from(self.block_size))
            .and_then(|off| usize::try_from(off).ok())
            .ok_or_else(|| FfsError::Format("block offset overflow".to_owned()))?;
        Ok(start..start + self.block_size as usize)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let range = self.byte_range(block)?;
        let bytes = self.bytes.lock();
        let buf = bytes[range].to_vec();
        drop(bytes);
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(FfsError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let range = self.byte_range(block)?;
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(FfsError::Io(std::io::Error::other(format!(
                "injected write failure at block {}",
                block.0
            ))));
        }
        let mut bytes = self.bytes.lock();
        bytes[range].copy_from_slice(data);
        drop(bytes);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
