//! Commit-time serialization of the revoke table into log descriptors.

use crate::format::{
    REVOKE_HEADER_SIZE, encode_revoke_entry, encode_revoke_header, set_revoke_count,
};
use crate::journal::{Journal, RevokeStats, TransactionHandle};
use crate::table::RevokeRecord;
use ffs_block::BufferRef;
use serde::{Deserialize, Serialize};

/// Outcome of one [`Journal::write_revoke_records`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeWriteStats {
    /// Records drained from the table.
    pub records: usize,
    /// Records placed in descriptors that were submitted for I/O.
    pub written: usize,
    /// Records freed without reaching the log (aborted journal, or no
    /// descriptor buffer available).
    pub dropped: usize,
    /// Descriptors submitted for I/O.
    pub descriptors: usize,
}

/// Descriptor currently being filled.
struct OpenDescriptor {
    bh: BufferRef,
    capacity: usize,
    offset: usize,
    entries: usize,
}

impl Journal {
    /// Write every record of the running table into revoke descriptors for
    /// `txn`, leaving the table empty.
    ///
    /// Holds the revoke lock for the whole drain. When the journal is
    /// aborted no descriptor is submitted, but the records are still freed.
    pub fn write_revoke_records(&self, txn: &TransactionHandle) -> RevokeWriteStats {
        let tid = txn.tid();
        let width = self.config.record_width;
        let mut stats = RevokeWriteStats::default();
        let mut open: Option<OpenDescriptor> = None;

        let mut table = self.lock_table();
        for record in table.drain() {
            stats.records += 1;
            if self.is_aborted() {
                stats.dropped += 1;
                continue;
            }

            if let Some(full) = open.take_if(|desc| desc.offset + width.bytes() > desc.capacity) {
                self.flush_descriptor(full, &mut stats);
            }
            if open.is_none() {
                open = self.open_descriptor(txn);
            }
            let Some(desc) = open.as_mut() else {
                stats.dropped += 1;
                continue;
            };
            self.append_record(desc, record, &mut stats);
        }
        if let Some(last) = open.take() {
            self.flush_descriptor(last, &mut stats);
        }
        drop(table);

        RevokeStats::bump(&self.stats.records_written, stats.written as u64);
        RevokeStats::bump(&self.stats.records_dropped, stats.dropped as u64);
        RevokeStats::bump(&self.stats.descriptors_written, stats.descriptors as u64);

        tracing::info!(
            target: "ffs::journal::commit",
            tid = tid.0,
            records = stats.records,
            written = stats.written,
            dropped = stats.dropped,
            descriptors = stats.descriptors,
            aborted = self.is_aborted(),
            "revoke_records_written"
        );
        stats
    }

    fn open_descriptor(&self, txn: &TransactionHandle) -> Option<OpenDescriptor> {
        let Some(bh) = self.io.get_descriptor_buffer() else {
            tracing::warn!(
                target: "ffs::journal::commit",
                tid = txn.tid().0,
                "revoke_descriptor_unavailable"
            );
            return None;
        };
        let header = encode_revoke_header(&mut bh.data(), txn.tid());
        if let Err(err) = header {
            tracing::warn!(
                target: "ffs::journal::commit",
                tid = txn.tid().0,
                block = bh.block().0,
                error = %err,
                "revoke_descriptor_too_small"
            );
            return None;
        }
        self.io.file_log_ctl(txn.tid(), &bh);
        let capacity = bh.size() as usize;
        Some(OpenDescriptor {
            bh,
            capacity,
            offset: REVOKE_HEADER_SIZE,
            entries: 0,
        })
    }

    fn append_record(
        &self,
        desc: &mut OpenDescriptor,
        record: RevokeRecord,
        stats: &mut RevokeWriteStats,
    ) {
        let width = self.config.record_width;
        match encode_revoke_entry(&mut desc.bh.data(), desc.offset, record.block, width) {
            Ok(()) => {
                desc.offset += width.bytes();
                desc.entries += 1;
            }
            Err(err) => {
                // revoke() only admits blocks that fit the width.
                tracing::error!(
                    target: "ffs::journal::commit",
                    block = record.block.0,
                    error = %err,
                    "revoke_record_encode_failed"
                );
                stats.dropped += 1;
            }
        }
    }

    fn flush_descriptor(&self, desc: OpenDescriptor, stats: &mut RevokeWriteStats) {
        let OpenDescriptor {
            bh,
            offset,
            entries,
            ..
        } = desc;
        if self.is_aborted() {
            tracing::warn!(
                target: "ffs::journal::commit",
                block = bh.block().0,
                entries,
                "revoke_descriptor_dropped_on_abort"
            );
            stats.dropped += entries;
            return;
        }
        if let Err(err) = set_revoke_count(&mut bh.data(), offset) {
            tracing::error!(
                target: "ffs::journal::commit",
                block = bh.block().0,
                error = %err,
                "revoke_descriptor_count_failed"
            );
            stats.dropped += entries;
            return;
        }
        bh.set_jwrite();
        bh.clear_dirty();
        tracing::debug!(
            target: "ffs::journal::commit",
            block = bh.block().0,
            entries,
            bytes = offset,
            "revoke_descriptor_submit"
        );
        self.io.submit_write(bh);
        stats.written += entries;
        stats.descriptors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::format::{RecordWidth, parse_revoke_block};
    use crate::journal::JournalIo;
    use crate::test_support::RecordingIo;
    use ffs_block::BufferCache;
    use ffs_types::{BlockNumber, Tid};
    use std::collections::BTreeSet;
    use std::sync::{Arc, OnceLock, Weak};

    fn journal(config: JournalConfig, io: &Arc<RecordingIo>) -> Journal {
        let cache = Arc::new(BufferCache::new(config.block_size).expect("cache"));
        Journal::new(config, cache, io.clone()).expect("journal")
    }

    /// Aborts its journal when the first descriptor is requested.
    #[derive(Debug, Default)]
    struct AbortOnDescriptor {
        inner: RecordingIo,
        journal: OnceLock<Weak<Journal>>,
    }

    impl JournalIo for AbortOnDescriptor {
        fn forget_buffer(&self, tid: Tid, bh: BufferRef) {
            self.inner.forget_buffer(tid, bh);
        }

        fn get_descriptor_buffer(&self) -> Option<BufferRef> {
            if let Some(journal) = self.journal.get().and_then(Weak::upgrade) {
                journal.abort();
            }
            self.inner.get_descriptor_buffer()
        }

        fn file_log_ctl(&self, tid: Tid, bh: &BufferRef) {
            self.inner.file_log_ctl(tid, bh);
        }

        fn submit_write(&self, bh: BufferRef) {
            self.inner.submit_write(bh);
        }
    }

    fn small_config() -> JournalConfig {
        JournalConfig {
            block_size: 1024,
            ..JournalConfig::default()
        }
    }

    fn parsed_blocks(io: &RecordingIo, width: RecordWidth) -> BTreeSet<u64> {
        io.submitted()
            .iter()
            .flat_map(|raw| {
                parse_revoke_block(raw, width)
                    .expect("parse")
                    .blocks
                    .into_iter()
                    .map(|b| b.0)
            })
            .collect()
    }

    #[test]
    fn empty_table_writes_nothing() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(small_config(), &io);
        let stats = j.write_revoke_records(&TransactionHandle::new(Tid(1)));
        assert_eq!(stats, RevokeWriteStats::default());
        assert!(io.submitted().is_empty());
        assert_eq!(io.descriptors_handed_out(), 0);
    }

    #[test]
    fn single_descriptor_carries_all_records() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(small_config(), &io);
        let txn = TransactionHandle::new(Tid(200));
        for block in [200_u64, 201, 202] {
            j.revoke(&txn, BlockNumber(block), None).expect("revoke");
        }

        let stats = j.write_revoke_records(&txn);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.written, 3);
        assert_eq!(stats.descriptors, 1);
        assert_eq!(j.revoke_record_count(), 0);

        let submitted = io.submitted();
        assert_eq!(submitted.len(), 1);
        let parsed = parse_revoke_block(&submitted[0], RecordWidth::Narrow).expect("parse");
        assert_eq!(parsed.sequence, Tid(200));
        let blocks: BTreeSet<u64> = parsed.blocks.iter().map(|b| b.0).collect();
        assert_eq!(blocks, BTreeSet::from([200, 201, 202]));
        // r_count is the byte count including the header.
        assert_eq!(&submitted[0][12..16], &28_u32.to_be_bytes());
        assert_eq!(io.log_ctl_tids(), vec![Tid(200)]);
    }

    #[test]
    fn full_descriptor_spills_into_a_new_one() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(small_config(), &io);
        let txn = TransactionHandle::new(Tid(9));
        // 252 narrow entries fit a 1 KiB descriptor.
        for block in 0..300_u64 {
            j.revoke(&txn, BlockNumber(block), None).expect("revoke");
        }
        let stats = j.write_revoke_records(&txn);
        assert_eq!(stats.descriptors, 2);
        assert_eq!(stats.written, 300);

        let submitted = io.submitted();
        let first = parse_revoke_block(&submitted[0], RecordWidth::Narrow).expect("parse");
        assert_eq!(first.blocks.len(), 252);
        assert_eq!(&submitted[0][12..16], &1024_u32.to_be_bytes());
        assert_eq!(
            parsed_blocks(&io, RecordWidth::Narrow),
            (0..300).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn wide_records_round_trip() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(
            JournalConfig {
                record_width: RecordWidth::Wide,
                ..small_config()
            },
            &io,
        );
        let txn = TransactionHandle::new(Tid(2));
        let blocks = [1_u64 << 40, 5, (1 << 33) + 7];
        for block in blocks {
            j.revoke(&txn, BlockNumber(block), None).expect("revoke");
        }
        j.write_revoke_records(&txn);
        assert_eq!(
            parsed_blocks(&io, RecordWidth::Wide),
            blocks.into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn aborted_journal_frees_records_without_io() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(small_config(), &io);
        let txn = TransactionHandle::new(Tid(3));
        for block in 0..10_u64 {
            j.revoke(&txn, BlockNumber(block), None).expect("revoke");
        }
        j.abort();
        let stats = j.write_revoke_records(&txn);
        assert_eq!(stats.records, 10);
        assert_eq!(stats.dropped, 10);
        assert_eq!(stats.written, 0);
        assert_eq!(j.revoke_record_count(), 0);
        assert_eq!(j.pool().in_use(), 0);
        assert!(io.submitted().is_empty());
        assert_eq!(io.descriptors_handed_out(), 0);
    }

    #[test]
    fn abort_with_open_descriptor_drops_it_unsubmitted() {
        let io = Arc::new(AbortOnDescriptor::default());
        let config = small_config();
        let cache = Arc::new(BufferCache::new(config.block_size).expect("cache"));
        let j = Arc::new(Journal::new(config, cache, io.clone()).expect("journal"));
        io.journal.set(Arc::downgrade(&j)).expect("set once");

        let txn = TransactionHandle::new(Tid(8));
        for block in 0..20_u64 {
            j.revoke(&txn, BlockNumber(block), None).expect("revoke");
        }
        let stats = j.write_revoke_records(&txn);
        assert!(j.is_aborted());
        assert_eq!(stats.records, 20);
        assert_eq!(stats.dropped, 20);
        assert_eq!(stats.written, 0);
        assert_eq!(stats.descriptors, 0);
        assert_eq!(io.inner.descriptors_handed_out(), 1);
        assert!(io.inner.submitted().is_empty());
        assert_eq!(j.revoke_record_count(), 0);
        assert_eq!(j.pool().in_use(), 0);
    }

    #[test]
    fn missing_descriptor_buffer_drops_records() {
        let io = Arc::new(RecordingIo::default());
        io.set_log_full(true);
        let j = journal(small_config(), &io);
        let txn = TransactionHandle::new(Tid(4));
        j.revoke(&txn, BlockNumber(1), None).expect("revoke");
        j.revoke(&txn, BlockNumber(2), None).expect("revoke");
        let stats = j.write_revoke_records(&txn);
        assert_eq!(stats.dropped, 2);
        assert_eq!(j.revoke_record_count(), 0);
        assert_eq!(j.stats().records_dropped, 2);
    }

    #[test]
    fn submitted_descriptor_is_flagged_for_log_write() {
        let io = Arc::new(RecordingIo::default());
        let j = journal(small_config(), &io);
        let txn = TransactionHandle::new(Tid(6));
        j.revoke(&txn, BlockNumber(77), None).expect("revoke");
        j.write_revoke_records(&txn);
        let bufs = io.submitted_buffers();
        assert_eq!(bufs.len(), 1);
        assert!(bufs[0].flags().is_jwrite());
        assert!(!bufs[0].flags().is_dirty());
    }
}
