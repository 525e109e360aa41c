#![forbid(unsafe_code)]
//! JBD-compatible journal revoke handling.
//!
//! A revoke record tells recovery not to replay older logged images of a
//! block that was freed (and possibly reused for something else) after it
//! was journaled. This crate covers the whole life of those records:
//!
//! - [`Journal::revoke`] / [`Journal::cancel_revoke`] maintain the running
//!   transaction's [`RevokeTable`] together with the revoke state cached on
//!   each buffer.
//! - [`Journal::write_revoke_records`] drains the table into on-disk revoke
//!   descriptors at commit.
//! - [`RecoveryRevoke`] rebuilds revoke state from the log after a crash and
//!   gates replay of every other logged block.
//!
//! Log I/O goes through the [`JournalIo`] trait; [`LogWriter`] implements it
//! over any [`ffs_block::BlockDevice`].

pub mod commit;
pub mod config;
pub mod format;
pub mod journal;
pub mod log;
pub mod pool;
pub mod recovery;
pub mod revoke;
pub mod table;

pub use commit::RevokeWriteStats;
pub use config::{JOURNAL_REVOKE_DEFAULT_HASH, JournalConfig, JournalFormat, OomRetryPolicy};
pub use format::{RecordWidth, RevokeBlock, parse_revoke_block};
pub use journal::{Journal, JournalIo, RevokeStatsSnapshot, TransactionHandle};
pub use log::LogWriter;
pub use pool::RecordPool;
pub use recovery::{RecoveryRevoke, ReplayDecision, ReplayStats};
pub use table::{RevokeRecord, RevokeTable, revoke_hash};

/// Check a journal invariant.
///
/// A violation is a bug in the caller. Debug builds panic; release builds log
/// it and return `false` so the caller can skip the offending mutation.
#[track_caller]
pub(crate) fn check(holds: bool, what: &str) -> bool {
    if holds {
        return true;
    }
    if cfg!(debug_assertions) {
        panic!("journal invariant violated: {what}");
    }
    let location = std::panic::Location::caller();
    tracing::error!(
        target: "ffs::journal::revoke",
        invariant = what,
        location = %location,
        "journal_invariant_violated"
    );
    false
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::journal::JournalIo;
    use ffs_block::{BufferHead, BufferRef};
    use ffs_types::{BlockNumber, Tid};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// `JournalIo` that records every call and keeps submitted buffers in
    /// memory.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingIo {
        next_block: AtomicU64,
        log_full: AtomicBool,
        forgotten: Mutex<Vec<(Tid, BlockNumber)>>,
        log_ctl: Mutex<Vec<Tid>>,
        submitted: Mutex<Vec<BufferRef>>,
    }

    impl RecordingIo {
        pub(crate) fn set_log_full(&self, full: bool) {
            self.log_full.store(full, Ordering::Release);
        }

        pub(crate) fn forgotten(&self) -> Vec<(Tid, BlockNumber)> {
            self.forgotten.lock().clone()
        }

        pub(crate) fn log_ctl_tids(&self) -> Vec<Tid> {
            self.log_ctl.lock().clone()
        }

        pub(crate) fn descriptors_handed_out(&self) -> u64 {
            self.next_block.load(Ordering::Acquire)
        }

        pub(crate) fn submitted_buffers(&self) -> Vec<BufferRef> {
            self.submitted.lock().clone()
        }

        /// Contents of every submitted buffer, in submission order.
        pub(crate) fn submitted(&self) -> Vec<Vec<u8>> {
            self.submitted
                .lock()
                .iter()
                .map(|bh| bh.data().clone())
                .collect()
        }
    }

    impl JournalIo for RecordingIo {
        fn forget_buffer(&self, tid: Tid, bh: BufferRef) {
            self.forgotten.lock().push((tid, bh.block()));
        }

        fn get_descriptor_buffer(&self) -> Option<BufferRef> {
            if self.log_full.load(Ordering::Acquire) {
                return None;
            }
            let block = self.next_block.fetch_add(1, Ordering::AcqRel);
            Some(BufferHead::detached(BlockNumber(block), 1024))
        }

        fn file_log_ctl(&self, tid: Tid, _bh: &BufferRef) {
            self.log_ctl.lock().push(tid);
        }

        fn submit_write(&self, bh: BufferRef) {
            self.submitted.lock().push(bh);
        }
    }
}
