//! Recovery-time revoke tracking.
//!
//! During mount after a crash the log is scanned forward once. Every revoke
//! block found is folded into a [`RecoveryRevoke`] table, which keeps, per
//! block, the latest transaction that revoked it. The replay pass then asks
//! the table whether each logged block image is stale.
//!
//! A block logged in transaction `T` is skipped if it was revoked in `T` or
//! any later transaction. A revoke in `T` never suppresses an image logged
//! after `T`: journaling the block again cancelled the revoke.

use crate::config::OomRetryPolicy;
use crate::format::{RecordWidth, is_revoke_block, parse_revoke_block, parse_to_ffs_error};
use crate::pool::{RecordPool, with_oom_retry};
use crate::table::RevokeTable;
use ffs_error::Result;
use ffs_types::{BlockNumber, Tid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counters gathered over one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    /// Revoke blocks scanned.
    pub revoke_blocks: u64,
    /// Revoke entries read from those blocks.
    pub revoke_records: u64,
    /// Log blocks passed to the scanner that were not revoke blocks.
    pub non_revoke_blocks: u64,
    /// Logged images the replay pass was told to write.
    pub replayed_blocks: u64,
    /// Logged images suppressed by a revoke.
    pub skipped_revoked_blocks: u64,
}

/// What to do with one logged block image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDecision {
    Replay,
    /// A revoke in the same or a later transaction makes the image stale.
    SkipRevoked,
}

/// Revoke table built during log recovery.
#[derive(Debug)]
pub struct RecoveryRevoke {
    table: RevokeTable,
    width: RecordWidth,
    retry: OomRetryPolicy,
    stats: ReplayStats,
}

impl RecoveryRevoke {
    pub fn new(
        hash_size: usize,
        width: RecordWidth,
        retry: OomRetryPolicy,
        pool: Arc<RecordPool>,
    ) -> Result<Self> {
        let table = RevokeTable::new(hash_size, pool)?;
        tracing::debug!(
            target: "ffs::journal::recovery",
            hash_size,
            record_width = ?width,
            "recovery_revoke_init"
        );
        Ok(Self {
            table,
            width,
            retry,
            stats: ReplayStats::default(),
        })
    }

    /// Note that `block` was revoked in transaction `sequence`.
    ///
    /// An existing record keeps the later of the two sequences.
    pub fn set_revoke(&mut self, block: BlockNumber, sequence: Tid) -> Result<()> {
        if let Some(handle) = self.table.find(block) {
            if let Some(record) = self.table.get_mut(handle) {
                if sequence.is_after(record.sequence) {
                    record.sequence = sequence;
                }
            }
            return Ok(());
        }
        let table = &mut self.table;
        with_oom_retry(self.retry, || table.insert(block, sequence)).map(|_| ())
    }

    /// Whether the image of `block` logged in transaction `sequence` must not
    /// be replayed.
    #[must_use]
    pub fn test_revoke(&self, block: BlockNumber, sequence: Tid) -> bool {
        self.table
            .lookup(block)
            .is_some_and(|record| record.sequence.is_at_or_after(sequence))
    }

    /// Free every record.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Fold one raw revoke block found at `log_block` into the table.
    ///
    /// Returns the number of entries read.
    pub fn scan_revoke_block(&mut self, log_block: BlockNumber, raw: &[u8]) -> Result<usize> {
        let parsed = parse_revoke_block(raw, self.width).map_err(|err| {
            tracing::error!(
                target: "ffs::journal::recovery",
                log_block = log_block.0,
                error = %err,
                "revoke_block_corrupt"
            );
            parse_to_ffs_error(&err, Some(log_block))
        })?;

        for block in &parsed.blocks {
            self.set_revoke(*block, parsed.sequence)?;
        }

        let entries = parsed.blocks.len();
        self.stats.revoke_blocks += 1;
        self.stats.revoke_records += entries as u64;
        tracing::debug!(
            target: "ffs::journal::recovery",
            log_block = log_block.0,
            tid = parsed.sequence.0,
            entries,
            "revoke_block_scanned"
        );
        Ok(entries)
    }

    /// Scan a sequence of `(log block, contents)` pairs, folding in every
    /// revoke block and skipping everything else.
    pub fn scan_log<'a, I>(&mut self, blocks: I) -> Result<()>
    where
        I: IntoIterator<Item = (BlockNumber, &'a [u8])>,
    {
        for (log_block, raw) in blocks {
            if is_revoke_block(raw) {
                self.scan_revoke_block(log_block, raw)?;
            } else {
                self.stats.non_revoke_blocks += 1;
            }
        }
        Ok(())
    }

    /// Decide whether to replay the image of `block` logged in `sequence`,
    /// counting the outcome.
    pub fn replay_decision(&mut self, block: BlockNumber, sequence: Tid) -> ReplayDecision {
        if self.test_revoke(block, sequence) {
            self.stats.skipped_revoked_blocks += 1;
            tracing::trace!(
                target: "ffs::journal::recovery",
                block = block.0,
                tid = sequence.0,
                "replay_skip_revoked"
            );
            ReplayDecision::SkipRevoked
        } else {
            self.stats.replayed_blocks += 1;
            ReplayDecision::Replay
        }
    }

    /// Latest revoking transaction recorded for `block`.
    #[must_use]
    pub fn revoked_in(&self, block: BlockNumber) -> Option<Tid> {
        self.table.lookup(block).map(|record| record.sequence)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// End recovery: free every record and return the pass's counters.
    pub fn finish(mut self) -> ReplayStats {
        self.clear();
        let Self { table, stats, .. } = self;
        table.destroy();
        tracing::info!(
            target: "ffs::journal::recovery",
            revoke_blocks = stats.revoke_blocks,
            revoke_records = stats.revoke_records,
            replayed = stats.replayed_blocks,
            skipped = stats.skipped_revoked_blocks,
            "recovery_revoke_done"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        REVOKE_HEADER_SIZE, encode_revoke_entry, encode_revoke_header, set_revoke_count,
    };
    use ffs_error::FfsError;

    fn tracker() -> RecoveryRevoke {
        RecoveryRevoke::new(
            64,
            RecordWidth::Narrow,
            OomRetryPolicy::Fail,
            Arc::new(RecordPool::new(None)),
        )
        .expect("tracker")
    }

    fn revoke_block(sequence: u32, blocks: &[u64]) -> Vec<u8> {
        let mut buf = vec![0_u8; 1024];
        encode_revoke_header(&mut buf, Tid(sequence)).expect("header");
        let mut offset = REVOKE_HEADER_SIZE;
        for block in blocks {
            encode_revoke_entry(&mut buf, offset, BlockNumber(*block), RecordWidth::Narrow)
                .expect("entry");
            offset += 4;
        }
        set_revoke_count(&mut buf, offset).expect("count");
        buf
    }

    #[test]
    fn keeps_latest_sequence() {
        let mut t = tracker();
        for seq in [3, 7, 5] {
            t.set_revoke(BlockNumber(10), Tid(seq)).expect("set");
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.revoked_in(BlockNumber(10)), Some(Tid(7)));
        for seq in 1..=7 {
            assert!(t.test_revoke(BlockNumber(10), Tid(seq)), "seq {seq}");
        }
        for seq in 8..12 {
            assert!(!t.test_revoke(BlockNumber(10), Tid(seq)), "seq {seq}");
        }
    }

    #[test]
    fn boundary_is_inclusive() {
        let mut t = tracker();
        t.set_revoke(BlockNumber(1), Tid(100)).expect("set");
        assert!(t.test_revoke(BlockNumber(1), Tid(100)));
        assert!(!t.test_revoke(BlockNumber(1), Tid(101)));
        assert!(!t.test_revoke(BlockNumber(2), Tid(1)));
    }

    #[test]
    fn merge_is_wraparound_aware() {
        let mut t = tracker();
        t.set_revoke(BlockNumber(5), Tid(u32::MAX - 1)).expect("set");
        t.set_revoke(BlockNumber(5), Tid(2)).expect("set");
        assert_eq!(t.revoked_in(BlockNumber(5)), Some(Tid(2)));
        assert!(t.test_revoke(BlockNumber(5), Tid(u32::MAX)));
        assert!(!t.test_revoke(BlockNumber(5), Tid(3)));
    }

    #[test]
    fn scan_log_skips_non_revoke_blocks() {
        let mut t = tracker();
        let revoke = revoke_block(4, &[200, 201]);
        let data = vec![0xEE_u8; 1024];
        t.scan_log([
            (BlockNumber(1), data.as_slice()),
            (BlockNumber(2), revoke.as_slice()),
        ])
        .expect("scan");
        let stats = t.stats();
        assert_eq!(stats.revoke_blocks, 1);
        assert_eq!(stats.revoke_records, 2);
        assert_eq!(stats.non_revoke_blocks, 1);
        assert!(t.test_revoke(BlockNumber(200), Tid(4)));
        assert!(!t.test_revoke(BlockNumber(200), Tid(5)));
    }

    #[test]
    fn corrupt_revoke_block_reports_log_position() {
        let mut t = tracker();
        let mut raw = revoke_block(4, &[1]);
        set_revoke_count(&mut raw, 4096).expect("count");
        let err = t
            .scan_revoke_block(BlockNumber(33), &raw)
            .expect_err("corrupt");
        assert!(matches!(err, FfsError::Corruption { block: 33, .. }));
    }

    #[test]
    fn replay_decisions_are_counted() {
        let mut t = tracker();
        t.set_revoke(BlockNumber(9), Tid(5)).expect("set");
        assert_eq!(
            t.replay_decision(BlockNumber(9), Tid(4)),
            ReplayDecision::SkipRevoked
        );
        assert_eq!(
            t.replay_decision(BlockNumber(9), Tid(6)),
            ReplayDecision::Replay
        );
        assert_eq!(
            t.replay_decision(BlockNumber(10), Tid(1)),
            ReplayDecision::Replay
        );
        let stats = t.finish();
        assert_eq!(stats.skipped_revoked_blocks, 1);
        assert_eq!(stats.replayed_blocks, 2);
    }

    #[test]
    fn clear_and_finish_release_pool() {
        let pool = Arc::new(RecordPool::new(None));
        let mut t = RecoveryRevoke::new(
            8,
            RecordWidth::Narrow,
            OomRetryPolicy::Fail,
            Arc::clone(&pool),
        )
        .expect("tracker");
        for block in 0..20 {
            t.set_revoke(BlockNumber(block), Tid(1)).expect("set");
        }
        assert_eq!(pool.in_use(), 20);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(pool.in_use(), 0);
        t.set_revoke(BlockNumber(1), Tid(1)).expect("set");
        t.finish();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn pool_exhaustion_is_out_of_memory() {
        let mut t = RecoveryRevoke::new(
            8,
            RecordWidth::Narrow,
            OomRetryPolicy::Fail,
            Arc::new(RecordPool::new(Some(1))),
        )
        .expect("tracker");
        t.set_revoke(BlockNumber(1), Tid(1)).expect("set");
        // Merging into an existing record needs no allocation.
        t.set_revoke(BlockNumber(1), Tid(2)).expect("merge");
        assert!(matches!(
            t.set_revoke(BlockNumber(2), Tid(1)),
            Err(FfsError::OutOfMemory(_))
        ));
    }
}
