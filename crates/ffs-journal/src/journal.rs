//! Per-journal revoke state and the I/O seam to the log layer.

use crate::config::{JournalConfig, JournalFormat};
use crate::format::{
    JBD_FEATURE_INCOMPAT_64BIT, JBD_FEATURE_INCOMPAT_REVOKE, RecordWidth, parse_to_ffs_error,
};
use crate::pool::RecordPool;
use crate::recovery::RecoveryRevoke;
use crate::table::RevokeTable;
use ffs_block::{BufferLookup, BufferRef};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, BlockSize, Tid};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Journal log services the revoke code calls into.
///
/// Implemented by [`LogWriter`](crate::LogWriter); tests may substitute
/// their own.
pub trait JournalIo: Send + Sync {
    /// Detach a buffer from the journaling lists of transaction `tid`.
    ///
    /// Takes over the caller's reference.
    fn forget_buffer(&self, tid: Tid, bh: BufferRef);

    /// Allocate a zeroed, block-sized buffer at the next free log position,
    /// or `None` if the log has no room.
    fn get_descriptor_buffer(&self) -> Option<BufferRef>;

    /// File a descriptor on transaction `tid`'s log-control list so the
    /// commit path can wait for its I/O.
    fn file_log_ctl(&self, tid: Tid, bh: &BufferRef);

    /// Start writing a buffer to its log block.
    ///
    /// Completion and errors are reported through the commit path, not here.
    fn submit_write(&self, bh: BufferRef);
}

/// The part of a running transaction the revoke code needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    tid: Tid,
}

impl TransactionHandle {
    #[must_use]
    pub fn new(tid: Tid) -> Self {
        Self { tid }
    }

    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }
}

/// Journal-wide revoke counters.
#[derive(Debug, Default)]
pub(crate) struct RevokeStats {
    pub(crate) revokes: AtomicU64,
    pub(crate) refreshed: AtomicU64,
    pub(crate) cancel_fast_path: AtomicU64,
    pub(crate) cancels: AtomicU64,
    pub(crate) records_written: AtomicU64,
    pub(crate) records_dropped: AtomicU64,
    pub(crate) descriptors_written: AtomicU64,
}

impl RevokeStats {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RevokeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RevokeStatsSnapshot {
            revokes: load(&self.revokes),
            refreshed: load(&self.refreshed),
            cancel_fast_path: load(&self.cancel_fast_path),
            cancels: load(&self.cancels),
            records_written: load(&self.records_written),
            records_dropped: load(&self.records_dropped),
            descriptors_written: load(&self.descriptors_written),
        }
    }
}

/// Point-in-time copy of the journal's revoke counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeStatsSnapshot {
    /// Records inserted by `revoke`.
    pub revokes: u64,
    /// Revokes of a block that already had a record in the running table.
    pub refreshed: u64,
    /// Cancels answered from the buffer's cached state alone.
    pub cancel_fast_path: u64,
    /// Cancels that removed a record.
    pub cancels: u64,
    /// Records serialized into submitted descriptors.
    pub records_written: u64,
    /// Records freed at commit without reaching the log.
    pub records_dropped: u64,
    /// Revoke descriptors submitted.
    pub descriptors_written: u64,
}

/// Revoke bookkeeping for one journal.
///
/// Owns the live revoke table of the running transaction. The table mutex is
/// the journal-wide revoke lock: insert, search-and-remove and commit drain
/// all run under it.
pub struct Journal {
    pub(crate) config: JournalConfig,
    pub(crate) block_size: BlockSize,
    incompat: AtomicU32,
    aborted: AtomicBool,
    pub(crate) revoke: Mutex<RevokeTable>,
    pub(crate) pool: Arc<RecordPool>,
    pub(crate) cache: Arc<dyn BufferLookup>,
    pub(crate) io: Arc<dyn JournalIo>,
    pub(crate) stats: RevokeStats,
}

impl Debug for Journal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.config)
            .field("incompat", &self.incompat_features())
            .field("aborted", &self.is_aborted())
            .field("revoke_records", &self.revoke_record_count())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Set up revoke state for a journal being mounted.
    ///
    /// Failure to allocate the live table is fatal to the mount.
    pub fn new(
        config: JournalConfig,
        cache: Arc<dyn BufferLookup>,
        io: Arc<dyn JournalIo>,
    ) -> Result<Self> {
        config.validate()?;
        let block_size =
            BlockSize::new(config.block_size).map_err(|err| parse_to_ffs_error(&err, None))?;
        let pool = Arc::new(RecordPool::new(config.record_limit));
        let table = RevokeTable::new(config.revoke_hash_size, Arc::clone(&pool))?;

        tracing::debug!(
            target: "ffs::journal::revoke",
            hash_size = config.revoke_hash_size,
            block_size = config.block_size,
            record_width = ?config.record_width,
            "revoke_table_init"
        );

        Ok(Self {
            config,
            block_size,
            incompat: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            revoke: Mutex::new(table),
            pool,
            cache,
            io,
            stats: RevokeStats::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    /// Put the journal into the aborted state. Log I/O stops; in-memory
    /// bookkeeping continues.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: "ffs::journal::revoke", "journal_abort");
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Incompat feature bits currently set on the journal superblock.
    #[must_use]
    pub fn incompat_features(&self) -> u32 {
        self.incompat.load(Ordering::Acquire)
    }

    /// Add incompat feature bits. A V1 superblock has no feature fields.
    pub fn set_incompat_features(&self, bits: u32) -> Result<()> {
        if self.incompat_features() & bits == bits {
            return Ok(());
        }
        if self.config.format == JournalFormat::V1 {
            return Err(FfsError::UnsupportedFeature(format!(
                "incompat features {bits:#x} on a V1 journal superblock"
            )));
        }
        let previous = self.incompat.fetch_or(bits, Ordering::AcqRel);
        if previous & bits != bits {
            tracing::info!(
                target: "ffs::journal::revoke",
                previous = previous,
                incompat = previous | bits,
                "journal_set_features"
            );
        }
        Ok(())
    }

    /// Make sure the superblock advertises what revoke blocks need.
    pub(crate) fn ensure_revoke_features(&self) -> Result<()> {
        let mut needed = JBD_FEATURE_INCOMPAT_REVOKE;
        if self.config.record_width == RecordWidth::Wide {
            needed |= JBD_FEATURE_INCOMPAT_64BIT;
        }
        self.set_incompat_features(needed)
    }

    /// Number of records in the running transaction's revoke table.
    #[must_use]
    pub fn revoke_record_count(&self) -> usize {
        self.revoke.lock().len()
    }

    /// Transaction that revoked `block` in the running table, if any.
    #[must_use]
    pub fn revoked_in(&self, block: BlockNumber) -> Option<Tid> {
        self.revoke.lock().lookup(block).map(|record| record.sequence)
    }

    #[must_use]
    pub fn stats(&self) -> RevokeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Record accounting shared by this journal's tables.
    #[must_use]
    pub fn pool(&self) -> &Arc<RecordPool> {
        &self.pool
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, RevokeTable> {
        self.revoke.lock()
    }

    /// Create a recovery tracker sharing this journal's record pool.
    pub fn begin_recovery(&self) -> Result<RecoveryRevoke> {
        RecoveryRevoke::new(
            self.config.recovery_hash_size,
            self.config.record_width,
            self.config.oom_retry,
            Arc::clone(&self.pool),
        )
    }

    /// Tear down revoke state at unmount. The running table must be empty.
    pub fn destroy(self) {
        let Self { revoke, .. } = self;
        revoke.into_inner().destroy();
        tracing::debug!(target: "ffs::journal::revoke", "revoke_table_destroy");
    }
}
