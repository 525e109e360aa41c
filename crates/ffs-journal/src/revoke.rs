//! Revoking freed metadata blocks and cancelling revokes on reuse.
//!
//! # Protocol
//!
//! When the filesystem frees a metadata block it calls [`Journal::revoke`].
//! That inserts a record into the running transaction's revoke table and marks
//! any cached buffer for the block as revoked. If the block is later journaled
//! again before commit, the write-access path calls
//! [`Journal::cancel_revoke`], which removes the record so the revoke never
//! reaches the log.
//!
//! Each buffer caches its revoke status in two flag bits:
//!
//! | `REVOKE_VALID` | `REVOKED` | meaning |
//! |----------------|-----------|---------|
//! | clear | (any) | unknown; consult the table |
//! | set | clear | known clean; cancel skips the table |
//! | set | set | known revoked |
//!
//! The bits are updated with single-word atomic operations, so concurrent
//! cancels of one buffer agree on which of them searches the table.

use crate::journal::{Journal, RevokeStats, TransactionHandle};
use crate::pool::with_oom_retry;
use ffs_block::{BufferRef, RevokeState};
use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use std::sync::Arc;

/// Where the buffer handed to `revoke` came from; decides how it is released.
enum Held {
    /// Passed in by the caller: detached from journaling via `forget_buffer`.
    Explicit(BufferRef),
    /// Found in the buffer cache: the lookup reference is dropped.
    Lookup(BufferRef),
    None,
}

impl Held {
    fn buffer(&self) -> Option<&BufferRef> {
        match self {
            Self::Explicit(bh) | Self::Lookup(bh) => Some(bh),
            Self::None => None,
        }
    }
}

impl Journal {
    /// Revoke `block` in transaction `txn`.
    ///
    /// An explicitly passed buffer is always consumed: unless an error is
    /// returned it is handed to the log layer's `forget_buffer`, otherwise it
    /// is dropped.
    /// Without one, the cached buffer for `block` (if any) is flagged.
    ///
    /// # Errors
    ///
    /// - `UnsupportedFeature` if the journal superblock cannot carry revoke
    ///   records.
    /// - `Format` if `block` does not fit the configured record width.
    /// - `OutOfMemory` if no record could be allocated within the retry
    ///   policy. Nothing is changed in that case.
    pub fn revoke(
        &self,
        txn: &TransactionHandle,
        block: BlockNumber,
        bh_in: Option<BufferRef>,
    ) -> Result<()> {
        self.ensure_revoke_features()?;
        if !self.config.record_width.fits(block) {
            return Err(FfsError::Format(format!(
                "block {block} does not fit a {:?} revoke record",
                self.config.record_width
            )));
        }

        let held = match bh_in {
            Some(bh) => {
                if self.config.expensive_checks {
                    self.check_alias_is_revoked(block, &bh);
                }
                Held::Explicit(bh)
            }
            None => self
                .cache
                .lookup(block, self.block_size.get())
                .map_or(Held::None, Held::Lookup),
        };

        if let Some(bh) = held.buffer() {
            let revoked = bh.revoke_state() == RevokeState::Revoked;
            if !crate::check(!revoked, "block revoked twice without a cancel") {
                if let Held::Explicit(bh) = held {
                    self.io.forget_buffer(txn.tid(), bh);
                }
                return Ok(());
            }
        }

        let tid = txn.tid();
        let refreshed = with_oom_retry(self.config.oom_retry, || {
            let mut table = self.lock_table();
            if let Some(handle) = table.find(block) {
                // Already revoked with no buffer to catch it: keep one record.
                if let Some(record) = table.get_mut(handle) {
                    record.sequence = record.sequence.latest(tid);
                }
                return Ok(true);
            }
            table.insert(block, tid).map(|_| false)
        });
        let refreshed = match refreshed {
            Ok(refreshed) => refreshed,
            Err(err) => {
                tracing::debug!(
                    target: "ffs::journal::revoke",
                    block = block.0,
                    tid = tid.0,
                    error = %err,
                    "revoke_insert_failed"
                );
                return Err(err);
            }
        };

        match held {
            Held::Explicit(bh) => {
                bh.mark_revoked();
                self.io.forget_buffer(tid, bh);
            }
            Held::Lookup(bh) => {
                bh.mark_revoked();
            }
            Held::None => {}
        }

        if refreshed {
            RevokeStats::bump(&self.stats.refreshed, 1);
        } else {
            RevokeStats::bump(&self.stats.revokes, 1);
        }
        tracing::trace!(
            target: "ffs::journal::revoke",
            block = block.0,
            tid = tid.0,
            refreshed,
            "revoke_insert"
        );
        Ok(())
    }

    /// Cancel any outstanding revoke of `bh`'s block before it is journaled
    /// again in `txn`.
    ///
    /// Returns whether a revoke record was removed. The buffer is left in the
    /// known-clean state either way.
    pub fn cancel_revoke(&self, txn: &TransactionHandle, bh: &BufferRef) -> bool {
        let block = bh.block();
        let need_cancel = bh.begin_revoke_cancel();

        let mut did_cancel = false;
        if need_cancel {
            let removed = {
                let mut table = self.lock_table();
                table.find(block).and_then(|handle| table.remove(handle))
            };
            if let Some(record) = removed {
                did_cancel = true;
                RevokeStats::bump(&self.stats.cancels, 1);
                tracing::trace!(
                    target: "ffs::journal::revoke",
                    block = block.0,
                    tid = txn.tid().0,
                    revoked_in = record.sequence.0,
                    "revoke_cancel"
                );
            }
        } else {
            RevokeStats::bump(&self.stats.cancel_fast_path, 1);
        }

        if self.config.expensive_checks {
            let left = self.lock_table().find(block).is_some();
            crate::check(!left, "revoke record survived cancel");
        }

        // An unhashed buffer may have a hashed alias for the same block that
        // still carries the revoked bit.
        if need_cancel && !bh.is_hashed() {
            if let Some(alias) = self.cache.lookup(block, bh.size()) {
                if !Arc::ptr_eq(&alias, bh) {
                    alias.clear_revoked();
                    tracing::trace!(
                        target: "ffs::journal::revoke",
                        block = block.0,
                        "revoke_cancel_alias"
                    );
                }
            }
        }

        did_cancel
    }

    fn check_alias_is_revoked(&self, block: BlockNumber, bh: &BufferRef) {
        let Some(alias) = self.cache.lookup(block, self.block_size.get()) else {
            return;
        };
        if Arc::ptr_eq(&alias, bh) {
            return;
        }
        crate::check(
            alias.revoke_state() != RevokeState::Clean,
            "revoking a block whose cached alias is known clean",
        );
    }
}
