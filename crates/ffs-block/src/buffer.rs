//! Cached block buffers and their state flags.
//!
//! A [`BufferHead`] is the in-memory representation of one disk block. Its
//! state lives in a single atomic word so that concurrent journal operations
//! on the same buffer update it with read-modify-write operations, never a
//! load followed by a store.

use ffs_types::BlockNumber;
use parking_lot::{Mutex, MutexGuard};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Buffer contents match the disk (or were freshly zeroed for a new block).
pub const BH_UPTODATE: u32 = 1 << 0;
/// Buffer contents differ from the disk.
pub const BH_DIRTY: u32 = 1 << 1;
/// Buffer is registered in its cache's lookup map.
///
/// A buffer without this bit is an alias: either detached on creation or
/// evicted while still referenced.
pub const BH_HASHED: u32 = 1 << 2;
/// Buffer is being written to the journal log.
pub const BH_JWRITE: u32 = 1 << 3;
/// Block has been revoked in the running transaction.
///
/// Only meaningful while [`BH_REVOKE_VALID`] is set.
pub const BH_REVOKED: u32 = 1 << 4;
/// [`BH_REVOKED`] reflects the revoke table and may be trusted.
pub const BH_REVOKE_VALID: u32 = 1 << 5;

const REVOKE_BITS: u32 = BH_REVOKED | BH_REVOKE_VALID;

/// Cached revoke status of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeState {
    /// No cached status; the revoke table must be consulted.
    Unknown,
    /// Known not revoked; cancelling is a no-op.
    Clean,
    /// Known revoked.
    Revoked,
}

impl RevokeState {
    #[must_use]
    fn from_bits(bits: u32) -> Self {
        if bits & BH_REVOKE_VALID == 0 {
            Self::Unknown
        } else if bits & BH_REVOKED != 0 {
            Self::Revoked
        } else {
            Self::Clean
        }
    }
}

/// A snapshot of a buffer's state word.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u32);

impl Debug for BufferFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BufferFlags(uptodate={}, dirty={}, hashed={}, jwrite={}, revoke={:?})",
            self.is_uptodate(),
            self.is_dirty(),
            self.is_hashed(),
            self.is_jwrite(),
            self.revoke_state(),
        )
    }
}

impl BufferFlags {
    #[must_use]
    pub fn is_uptodate(self) -> bool {
        self.0 & BH_UPTODATE != 0
    }

    #[must_use]
    pub fn is_dirty(self) -> bool {
        self.0 & BH_DIRTY != 0
    }

    #[must_use]
    pub fn is_hashed(self) -> bool {
        self.0 & BH_HASHED != 0
    }

    #[must_use]
    pub fn is_jwrite(self) -> bool {
        self.0 & BH_JWRITE != 0
    }

    #[must_use]
    pub fn revoke_state(self) -> RevokeState {
        RevokeState::from_bits(self.0)
    }
}

#[derive(Default)]
struct AtomicBufferFlags(AtomicU32);

impl AtomicBufferFlags {
    fn load(&self) -> BufferFlags {
        BufferFlags(self.0.load(Ordering::Acquire))
    }

    fn set(&self, bits: u32) -> BufferFlags {
        BufferFlags(self.0.fetch_or(bits, Ordering::AcqRel))
    }

    fn clear(&self, bits: u32) -> BufferFlags {
        BufferFlags(self.0.fetch_and(!bits, Ordering::AcqRel))
    }

    /// Apply `f` atomically, returning the previous flags.
    fn update(&self, f: impl Fn(u32) -> u32) -> BufferFlags {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| Some(f(bits)));
        match previous {
            Ok(bits) | Err(bits) => BufferFlags(bits),
        }
    }
}

/// In-memory image of one disk block.
///
/// Handles are `Arc<BufferHead>`: cloning a handle takes a reference, dropping
/// it releases one.
pub struct BufferHead {
    block: BlockNumber,
    size: u32,
    flags: AtomicBufferFlags,
    data: Mutex<Vec<u8>>,
}

/// Shared handle to a cached buffer.
pub type BufferRef = Arc<BufferHead>;

impl Debug for BufferHead {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHead")
            .field("block", &self.block)
            .field("size", &self.size)
            .field("flags", &self.flags.load())
            .finish_non_exhaustive()
    }
}

impl BufferHead {
    pub(crate) fn with_flags(block: BlockNumber, size: u32, data: Vec<u8>, flags: u32) -> Self {
        Self {
            block,
            size,
            flags: AtomicBufferFlags(AtomicU32::new(flags)),
            data: Mutex::new(data),
        }
    }

    /// Create a zeroed buffer that is not registered in any cache.
    #[must_use]
    pub fn detached(block: BlockNumber, size: u32) -> BufferRef {
        Arc::new(Self::with_flags(
            block,
            size,
            vec![0_u8; size as usize],
            BH_UPTODATE,
        ))
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.flags.load()
    }

    /// Lock the buffer contents for reading or writing.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.flags.load().is_hashed()
    }

    pub(crate) fn set_hashed(&self, hashed: bool) {
        if hashed {
            self.flags.set(BH_HASHED);
        } else {
            self.flags.clear(BH_HASHED);
        }
    }

    pub fn mark_dirty(&self) {
        self.flags.set(BH_DIRTY);
    }

    /// Clear the dirty bit, returning whether it was set.
    pub fn clear_dirty(&self) -> bool {
        self.flags.clear(BH_DIRTY).is_dirty()
    }

    pub fn set_jwrite(&self) {
        self.flags.set(BH_JWRITE);
    }

    pub fn clear_jwrite(&self) {
        self.flags.clear(BH_JWRITE);
    }

    #[must_use]
    pub fn revoke_state(&self) -> RevokeState {
        self.flags.load().revoke_state()
    }

    /// Mark the buffer as revoked (and the mark as valid), returning the
    /// previous state.
    pub fn mark_revoked(&self) -> RevokeState {
        self.flags.set(REVOKE_BITS).revoke_state()
    }

    /// Move the buffer to the known-clean state and report whether a revoke
    /// record may exist for it.
    ///
    /// With a valid cached state the answer is the cached revoked bit. Without
    /// one, the caller must assume a record may exist.
    pub fn begin_revoke_cancel(&self) -> bool {
        let previous = self
            .flags
            .update(|old| (old | BH_REVOKE_VALID) & !BH_REVOKED);
        match previous.revoke_state() {
            RevokeState::Unknown | RevokeState::Revoked => true,
            RevokeState::Clean => false,
        }
    }

    /// Clear the revoked bit without touching validity.
    pub fn clear_revoked(&self) {
        self.flags.clear(BH_REVOKED);
    }

    /// Forget any cached revoke status, forcing the next check to consult
    /// the revoke table.
    pub fn invalidate_revoke_state(&self) {
        self.flags.clear(REVOKE_BITS);
    }
}
