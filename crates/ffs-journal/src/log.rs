//! Minimal circular journal log area.
//!
//! [`LogWriter`] hands out descriptor buffers from a contiguous range of
//! device blocks, writes them when submitted, and tracks each transaction's
//! log-control buffers so the commit path can wait for them. It is the
//! default [`JournalIo`] implementation.

use crate::journal::JournalIo;
use ffs_block::{BlockDevice, BufferHead, BufferRef};
use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, Tid};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug)]
struct LogState {
    /// Next log block to hand out.
    head: u64,
    /// Blocks not yet handed out.
    free: u64,
    log_ctl: Vec<(Tid, BufferRef)>,
    forgotten: Vec<(Tid, BlockNumber)>,
    failed: BTreeSet<BlockNumber>,
}

/// Log writer over blocks `[first, last)` of a device.
#[derive(Debug)]
pub struct LogWriter<D: BlockDevice> {
    dev: Arc<D>,
    first: u64,
    last: u64,
    state: Mutex<LogState>,
}

impl<D: BlockDevice> LogWriter<D> {
    pub fn new(dev: Arc<D>, first: BlockNumber, last: BlockNumber) -> Result<Self> {
        if first.0 >= last.0 || last.0 > dev.block_count() {
            return Err(FfsError::InvalidGeometry(format!(
                "log area [{first}, {last}) outside device of {} blocks",
                dev.block_count()
            )));
        }
        Ok(Self {
            dev,
            first: first.0,
            last: last.0,
            state: Mutex::new(LogState {
                head: first.0,
                free: last.0 - first.0,
                log_ctl: Vec::new(),
                forgotten: Vec::new(),
                failed: BTreeSet::new(),
            }),
        })
    }

    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.dev
    }

    /// Next log block that will be handed out.
    #[must_use]
    pub fn head(&self) -> BlockNumber {
        BlockNumber(self.state.lock().head)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.state.lock().free
    }

    /// Return `count` blocks to the log once a checkpoint has retired them.
    pub fn release_log_space(&self, count: u64) {
        let mut state = self.state.lock();
        let capacity = self.last - self.first;
        state.free = state.free.saturating_add(count).min(capacity);
    }

    /// Wait for transaction `tid`'s log-control buffers, taking them off the
    /// list.
    ///
    /// Returns the log blocks written. Buffers that were never submitted (an
    /// aborted commit) are released without being counted. If any write
    /// failed the whole batch is reported as an I/O error.
    pub fn wait_log_ctl(&self, tid: Tid) -> Result<Vec<BlockNumber>> {
        let mut state = self.state.lock();
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.log_ctl)
            .into_iter()
            .partition(|(owner, _)| *owner == tid);
        state.log_ctl = rest;

        let mut written = Vec::with_capacity(mine.len());
        let mut failed = Vec::new();
        for (_, bh) in mine {
            if !bh.flags().is_jwrite() {
                continue;
            }
            bh.clear_jwrite();
            if state.failed.remove(&bh.block()) {
                failed.push(bh.block());
            } else {
                written.push(bh.block());
            }
        }
        drop(state);

        if !failed.is_empty() {
            tracing::error!(
                target: "ffs::journal::log",
                tid = tid.0,
                failed = failed.len(),
                "log_ctl_write_failed"
            );
            return Err(FfsError::Io(std::io::Error::other(format!(
                "journal log write failed for blocks {failed:?}"
            ))));
        }
        tracing::debug!(
            target: "ffs::journal::log",
            tid = tid.0,
            written = written.len(),
            "log_ctl_complete"
        );
        Ok(written)
    }

    /// Buffers detached from journaling by `forget_buffer`, oldest first.
    #[must_use]
    pub fn forgotten(&self) -> Vec<(Tid, BlockNumber)> {
        self.state.lock().forgotten.clone()
    }
}

impl<D: BlockDevice> JournalIo for LogWriter<D> {
    fn forget_buffer(&self, tid: Tid, bh: BufferRef) {
        bh.clear_dirty();
        tracing::trace!(
            target: "ffs::journal::log",
            tid = tid.0,
            block = bh.block().0,
            "buffer_forget"
        );
        self.state.lock().forgotten.push((tid, bh.block()));
    }

    fn get_descriptor_buffer(&self) -> Option<BufferRef> {
        let mut state = self.state.lock();
        if state.free == 0 {
            tracing::warn!(target: "ffs::journal::log", "log_full");
            return None;
        }
        let block = state.head;
        state.head = if block + 1 == self.last {
            self.first
        } else {
            block + 1
        };
        state.free -= 1;
        drop(state);
        Some(BufferHead::detached(
            BlockNumber(block),
            self.dev.block_size(),
        ))
    }

    fn file_log_ctl(&self, tid: Tid, bh: &BufferRef) {
        self.state.lock().log_ctl.push((tid, Arc::clone(bh)));
    }

    fn submit_write(&self, bh: BufferRef) {
        let block = bh.block();
        let result = {
            let data = bh.data();
            self.dev.write_block(block, &data)
        };
        if let Err(err) = result {
            tracing::error!(
                target: "ffs::journal::log",
                block = block.0,
                error = %err,
                "log_write_failed"
            );
            self.state.lock().failed.insert(block);
        }
    }
}
