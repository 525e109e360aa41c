//! Hash-indexed cache of [`BufferHead`]s.
//!
//! The cache hands out reference-counted handles. Evicting a block removes
//! it from the lookup map but leaves outstanding handles valid: they become
//! unhashed aliases, and a later lookup of the same block creates a fresh
//! buffer with no cached revoke status.

use crate::BlockDevice;
use crate::buffer::{BH_HASHED, BH_UPTODATE, BufferHead, BufferRef};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only view of a buffer cache, as needed by the journal.
pub trait BufferLookup: Send + Sync {
    /// Find the cached buffer for `block`, taking a reference on hit.
    ///
    /// A buffer cached with a different size is not a hit.
    fn lookup(&self, block: BlockNumber, block_size: u32) -> Option<BufferRef>;
}

/// Buffer cache for a single device and block size.
#[derive(Debug)]
pub struct BufferCache {
    block_size: BlockSize,
    buffers: Mutex<HashMap<BlockNumber, BufferRef>>,
}

impl BufferCache {
    pub fn new(block_size: u32) -> Result<Self> {
        let block_size = BlockSize::new(block_size)
            .map_err(|err| FfsError::InvalidGeometry(format!("buffer cache: {err}")))?;
        Ok(Self {
            block_size,
            buffers: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    /// Return the cached buffer for `block`, creating a zeroed one on miss.
    pub fn get_or_create(&self, block: BlockNumber) -> BufferRef {
        let mut buffers = self.buffers.lock();
        let bh = buffers.entry(block).or_insert_with(|| {
            tracing::trace!(target: "ffs::block::cache", block = block.0, "buffer_create");
            Arc::new(BufferHead::with_flags(
                block,
                self.block_size.get(),
                vec![0_u8; self.block_size.bytes()],
                BH_UPTODATE | BH_HASHED,
            ))
        });
        Arc::clone(bh)
    }

    /// Return the cached buffer for `block`, reading it from `dev` on miss.
    pub fn read(&self, dev: &dyn BlockDevice, block: BlockNumber) -> Result<BufferRef> {
        if let Some(bh) = self.lookup(block, self.block_size.get()) {
            return Ok(bh);
        }
        if dev.block_size() != self.block_size.get() {
            return Err(FfsError::InvalidGeometry(format!(
                "device block size {} does not match cache block size {}",
                dev.block_size(),
                self.block_size
            )));
        }
        let buf = dev.read_block(block)?;

        let mut buffers = self.buffers.lock();
        // Another reader may have raced us in; keep the first buffer.
        let bh = buffers.entry(block).or_insert_with(|| {
            Arc::new(BufferHead::with_flags(
                block,
                self.block_size.get(),
                buf.into_inner(),
                BH_UPTODATE | BH_HASHED,
            ))
        });
        Ok(Arc::clone(bh))
    }

    /// Drop `block` from the lookup map.
    ///
    /// Outstanding handles stay usable but are no longer hashed.
    pub fn evict(&self, block: BlockNumber) -> Option<BufferRef> {
        let evicted = self.buffers.lock().remove(&block);
        if let Some(bh) = &evicted {
            bh.set_hashed(false);
            tracing::trace!(target: "ffs::block::cache", block = block.0, "buffer_evict");
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl BufferLookup for BufferCache {
    fn lookup(&self, block: BlockNumber, block_size: u32) -> Option<BufferRef> {
        if block_size != self.block_size.get() {
            return None;
        }
        self.buffers.lock().get(&block).map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBlockDevice;
    use crate::buffer::RevokeState;

    #[test]
    fn rejects_invalid_block_size() {
        assert!(matches!(
            BufferCache::new(1000),
            Err(FfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn get_or_create_returns_same_buffer() {
        let cache = BufferCache::new(1024).expect("cache");
        let a = cache.get_or_create(BlockNumber(5));
        let b = cache.get_or_create(BlockNumber(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_hashed());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lookup_misses_on_size_mismatch() {
        let cache = BufferCache::new(1024).expect("cache");
        let _bh = cache.get_or_create(BlockNumber(5));
        assert!(cache.lookup(BlockNumber(5), 1024).is_some());
        assert!(cache.lookup(BlockNumber(5), 4096).is_none());
        assert!(cache.lookup(BlockNumber(6), 1024).is_none());
    }

    #[test]
    fn evicted_buffer_becomes_alias() {
        let cache = BufferCache::new(1024).expect("cache");
        let old = cache.get_or_create(BlockNumber(3));
        old.mark_revoked();

        let evicted = cache.evict(BlockNumber(3)).expect("evicted");
        assert!(Arc::ptr_eq(&old, &evicted));
        assert!(!old.is_hashed());

        let fresh = cache.get_or_create(BlockNumber(3));
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.revoke_state(), RevokeState::Unknown);
        assert_eq!(old.revoke_state(), RevokeState::Revoked);
    }

    #[test]
    fn read_loads_from_device_once() {
        let dev = MemBlockDevice::new(1024, 8).expect("device");
        dev.write_block(BlockNumber(2), &[0x5A; 1024]).expect("write");
        let cache = BufferCache::new(1024).expect("cache");

        let bh = cache.read(&dev, BlockNumber(2)).expect("read");
        assert_eq!(bh.data()[0], 0x5A);

        dev.write_block(BlockNumber(2), &[0x11; 1024]).expect("write");
        let again = cache.read(&dev, BlockNumber(2)).expect("read");
        assert!(Arc::ptr_eq(&bh, &again));
        assert_eq!(again.data()[0], 0x5A);
    }
}
