//! Journal revoke configuration.

use crate::format::{RecordWidth, parse_to_ffs_error};
use ffs_error::{FfsError, Result};
use ffs_types::BlockSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bucket count for revoke tables.
pub const JOURNAL_REVOKE_DEFAULT_HASH: usize = 256;

/// Journal superblock format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalFormat {
    /// Version 1 superblock: no feature fields, so no revoke support.
    V1,
    /// Version 2 superblock with compat/incompat feature sets.
    #[default]
    V2,
}

/// What to do when a revoke record cannot be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OomRetryPolicy {
    /// Surface `OutOfMemory` on the first failure.
    Fail,
    /// Retry up to `max_attempts` more times, yielding and backing off
    /// exponentially from `initial_backoff_us` up to `max_backoff_us`.
    Bounded {
        max_attempts: u32,
        initial_backoff_us: u64,
        max_backoff_us: u64,
    },
    /// Retry until the allocation succeeds.
    ///
    /// Never returns `OutOfMemory`; a journal under sustained memory pressure
    /// stalls the calling thread instead.
    Indefinite { backoff_us: u64 },
}

impl Default for OomRetryPolicy {
    fn default() -> Self {
        Self::Bounded {
            max_attempts: 8,
            initial_backoff_us: 50,
            max_backoff_us: 5_000,
        }
    }
}

impl OomRetryPolicy {
    /// Delay before retry number `attempt` (zero-based), or `None` to give up.
    #[must_use]
    pub fn backoff(self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Fail => None,
            Self::Bounded {
                max_attempts,
                initial_backoff_us,
                max_backoff_us,
            } => {
                if attempt >= max_attempts {
                    return None;
                }
                let delay = initial_backoff_us
                    .checked_shl(attempt)
                    .unwrap_or(u64::MAX)
                    .min(max_backoff_us);
                Some(Duration::from_micros(delay))
            }
            Self::Indefinite { backoff_us } => Some(Duration::from_micros(backoff_us)),
        }
    }
}

/// Configuration for a journal's revoke machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Journal block size in bytes.
    /// Default: 4096.
    pub block_size: u32,
    /// Bucket count of the live revoke table. Must be a power of two.
    /// Default: 256.
    pub revoke_hash_size: usize,
    /// Bucket count of the recovery revoke table. Must be a power of two.
    /// Default: 256.
    pub recovery_hash_size: usize,
    /// Superblock format. Default: V2.
    pub format: JournalFormat,
    /// On-disk revoke entry width. Default: narrow (32-bit).
    pub record_width: RecordWidth,
    /// Allocation retry policy for revoke records.
    pub oom_retry: OomRetryPolicy,
    /// Maximum number of live revoke records across the journal's tables.
    /// Default: unlimited.
    pub record_limit: Option<usize>,
    /// Enable extra consistency assertions on the revoke paths.
    /// Default: false.
    pub expensive_checks: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            revoke_hash_size: JOURNAL_REVOKE_DEFAULT_HASH,
            recovery_hash_size: JOURNAL_REVOKE_DEFAULT_HASH,
            format: JournalFormat::V2,
            record_width: RecordWidth::Narrow,
            oom_retry: OomRetryPolicy::default(),
            record_limit: None,
            expensive_checks: false,
        }
    }
}

impl JournalConfig {
    /// Check structural parameters.
    pub fn validate(&self) -> Result<()> {
        BlockSize::new(self.block_size).map_err(|err| parse_to_ffs_error(&err, None))?;
        validate_hash_size("revoke_hash_size", self.revoke_hash_size)?;
        validate_hash_size("recovery_hash_size", self.recovery_hash_size)?;
        if self.record_width == RecordWidth::Wide && self.format == JournalFormat::V1 {
            return Err(FfsError::UnsupportedFeature(
                "64-bit revoke records need a V2 journal superblock".to_owned(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_hash_size(field: &str, hash_size: usize) -> Result<()> {
    if hash_size == 0 || !hash_size.is_power_of_two() {
        return Err(FfsError::InvalidGeometry(format!(
            "{field}={hash_size} (must be a non-zero power of two)"
        )));
    }
    Ok(())
}
