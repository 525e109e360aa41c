//! Hashed set of revoke records.
//!
//! A [`RevokeTable`] maps block numbers to the transaction that revoked them.
//! The running transaction owns one (records added by `revoke`, drained at
//! commit); recovery builds another from the revoke blocks found in the log.
//!
//! The table does no locking of its own. The journal wraps the running table
//! in a mutex; a recovery table is owned by the single recovery thread.

use crate::pool::RecordPool;
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, Tid};
use std::sync::Arc;

/// One revoked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokeRecord {
    pub block: BlockNumber,
    /// Transaction that revoked the block. During recovery this is the
    /// latest such transaction seen in the log.
    pub sequence: Tid,
}

/// Position of a record inside a table, valid until the next mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHandle {
    bucket: usize,
    slot: usize,
}

/// Bucket index for `block` in a table of `1 << shift` buckets.
///
/// Folds the high bits down before a multiplicative (Fibonacci) hash so that
/// blocks differing only above bit 32, or only in multiples of the table
/// size, still spread across buckets.
#[must_use]
pub fn revoke_hash(block: BlockNumber, shift: u32) -> usize {
    if shift == 0 {
        return 0;
    }
    let b = block.0;
    let folded = b ^ (b >> 13) ^ (b >> 29);
    let hashed = folded.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - shift);
    // shift <= usize::BITS, so the value fits.
    usize::try_from(hashed).unwrap_or(0)
}

/// Fixed-size chained hash table of revoke records.
#[derive(Debug)]
pub struct RevokeTable {
    hash_shift: u32,
    buckets: Vec<Vec<RevokeRecord>>,
    len: usize,
    pool: Arc<RecordPool>,
}

impl RevokeTable {
    /// Create an empty table with `hash_size` buckets.
    ///
    /// `hash_size` must be a non-zero power of two. Failure to allocate the
    /// bucket array is reported as `OutOfMemory`.
    pub fn new(hash_size: usize, pool: Arc<RecordPool>) -> Result<Self> {
        crate::config::validate_hash_size("hash_size", hash_size)?;
        let mut buckets = Vec::new();
        buckets.try_reserve_exact(hash_size).map_err(|err| {
            FfsError::OutOfMemory(format!("revoke table with {hash_size} buckets: {err}"))
        })?;
        buckets.resize_with(hash_size, Vec::new);
        Ok(Self {
            hash_shift: hash_size.trailing_zeros(),
            buckets,
            len: 0,
            pool,
        })
    }

    /// Number of buckets.
    #[must_use]
    pub fn hash_size(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_of(&self, block: BlockNumber) -> usize {
        revoke_hash(block, self.hash_shift)
    }

    /// Insert a new record for `block`.
    ///
    /// Does not check for an existing record; callers look up first.
    pub fn insert(&mut self, block: BlockNumber, sequence: Tid) -> Result<RecordHandle> {
        self.pool.charge()?;
        let bucket = self.bucket_of(block);
        let chain = &mut self.buckets[bucket];
        if let Err(err) = chain.try_reserve(1) {
            self.pool.release(1);
            return Err(FfsError::OutOfMemory(format!(
                "revoke record for block {block}: {err}"
            )));
        }
        chain.push(RevokeRecord { block, sequence });
        self.len += 1;
        Ok(RecordHandle {
            bucket,
            slot: chain.len() - 1,
        })
    }

    /// Locate the record for `block`.
    #[must_use]
    pub fn find(&self, block: BlockNumber) -> Option<RecordHandle> {
        let bucket = self.bucket_of(block);
        self.buckets[bucket]
            .iter()
            .position(|record| record.block == block)
            .map(|slot| RecordHandle { bucket, slot })
    }

    #[must_use]
    pub fn get(&self, handle: RecordHandle) -> Option<&RevokeRecord> {
        self.buckets.get(handle.bucket)?.get(handle.slot)
    }

    pub fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut RevokeRecord> {
        self.buckets.get_mut(handle.bucket)?.get_mut(handle.slot)
    }

    /// Look up `block` and return a copy of its record.
    #[must_use]
    pub fn lookup(&self, block: BlockNumber) -> Option<RevokeRecord> {
        self.find(block).and_then(|handle| self.get(handle).copied())
    }

    /// Remove the record at `handle`, returning it.
    ///
    /// Other handles into the same bucket are invalidated.
    pub fn remove(&mut self, handle: RecordHandle) -> Option<RevokeRecord> {
        let chain = self.buckets.get_mut(handle.bucket)?;
        if handle.slot >= chain.len() {
            return None;
        }
        let record = chain.swap_remove(handle.slot);
        self.len -= 1;
        self.pool.release(1);
        Some(record)
    }

    /// Remove and return every record, releasing each as it is yielded.
    ///
    /// Records not consumed by the caller are freed when the iterator drops.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain {
            table: self,
            bucket: 0,
        }
    }

    /// Free every record.
    pub fn clear(&mut self) {
        let freed = self.len;
        for chain in &mut self.buckets {
            chain.clear();
        }
        self.len = 0;
        self.pool.release(freed);
    }

    /// Tear the table down. It must already be empty.
    ///
    /// Remaining records indicate a lost revoke; they are freed anyway so the
    /// pool accounting stays balanced.
    pub fn destroy(mut self) {
        crate::check(self.is_empty(), "destroying a non-empty revoke table");
        self.clear();
    }

    /// Chain length of every bucket, for distribution diagnostics.
    #[must_use]
    pub fn bucket_lengths(&self) -> Vec<usize> {
        self.buckets.iter().map(Vec::len).collect()
    }
}

impl Drop for RevokeTable {
    fn drop(&mut self) {
        self.pool.release(self.len);
    }
}

/// Draining iterator returned by [`RevokeTable::drain`].
#[derive(Debug)]
pub struct Drain<'a> {
    table: &'a mut RevokeTable,
    bucket: usize,
}

impl Iterator for Drain<'_> {
    type Item = RevokeRecord;

    fn next(&mut self) -> Option<RevokeRecord> {
        while self.bucket < self.table.buckets.len() {
            if let Some(record) = self.table.buckets[self.bucket].pop() {
                self.table.len -= 1;
                self.table.pool.release(1);
                return Some(record);
            }
            self.bucket += 1;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.table.len, Some(self.table.len))
    }
}

impl ExactSizeIterator for Drain<'_> {}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.for_each(drop);
    }
}
