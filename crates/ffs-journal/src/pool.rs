//! Accounting for revoke record allocations.
//!
//! Every live revoke record, in the running table or a recovery table, is
//! charged against a [`RecordPool`] shared by one journal. The pool models
//! the record allocator: when it is exhausted, inserting a record fails with
//! `OutOfMemory` exactly as a failed allocation would.

use crate::config::OomRetryPolicy;
use ffs_error::{FfsError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Shared accounting for revoke records.
#[derive(Debug)]
pub struct RecordPool {
    limit: Option<usize>,
    in_use: AtomicUsize,
    high_water: AtomicUsize,
    failures: AtomicU64,
}

impl RecordPool {
    /// Create a pool admitting at most `limit` live records (`None` = unbounded).
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            in_use: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Charge one record against the pool.
    pub(crate) fn charge(&self) -> Result<()> {
        let limit = self.limit.unwrap_or(usize::MAX);
        let charged = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < limit).then_some(used + 1)
            });
        match charged {
            Ok(previous) => {
                self.high_water.fetch_max(previous + 1, Ordering::AcqRel);
                Ok(())
            }
            Err(used) => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                Err(FfsError::OutOfMemory(format!(
                    "revoke record pool exhausted ({used} records in use)"
                )))
            }
        }
    }

    /// Return `count` records to the pool.
    pub(crate) fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_sub(count)
            });
        crate::check(released.is_ok(), "revoke record pool released below zero");
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Records currently charged.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Largest number of records ever charged at once.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }

    /// Number of charges refused because the pool was full.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }
}

/// Run `op`, retrying allocation failures according to `policy`.
///
/// Only `OutOfMemory` is retried; any other error is returned immediately.
/// `op` must not hold locks across calls: the retry sleeps between attempts.
pub(crate) fn with_oom_retry<T>(
    policy: OomRetryPolicy,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0_u32;
    loop {
        match op() {
            Err(FfsError::OutOfMemory(detail)) => {
                let Some(delay) = policy.backoff(attempt) else {
                    return Err(FfsError::OutOfMemory(detail));
                };
                tracing::debug!(
                    target: "ffs::journal::revoke",
                    attempt,
                    delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX),
                    detail = %detail,
                    "revoke_record_alloc_retry"
                );
                std::thread::yield_now();
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt = attempt.saturating_add(1);
            }
            other => return other,
        }
    }
}
