#![forbid(unsafe_code)]
//! Error types for the FrankenFS journal.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ffs-types` | Byte-level format violations in journal blocks |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors returned by block, cache, and journal APIs |
//!
//! `ffs-error` does not depend on `ffs-types`. `ffs-journal` converts a
//! `ParseError` into `FfsError::Parse`, or into `FfsError::Corruption` when
//! the offending log block is known.
//!
//! ## Allocation failure
//!
//! `OutOfMemory` is the only error the revoke hot path produces. Callers may
//! retry; the journal itself already retries according to its configured
//! policy before surfacing it. At journal initialisation it is fatal to the
//! mount.
//!
//! ## Invariant violations
//!
//! Programmer errors (revoking a buffer twice without a cancel, destroying a
//! non-empty revoke table) are *not* represented here. They panic in debug
//! builds and are logged and skipped in release builds.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `OutOfMemory` | `ENOMEM` |

use thiserror::Error;

/// Unified error type for journal and block-layer operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed journal metadata found at a known log block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Misuse of an on-disk format (wrong buffer size, value out of range).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without a block number.
    #[error("parse error: {0}")]
    Parse(String),

    /// The journal format cannot carry a feature this operation needs.
    ///
    /// Raised when a revoke is attempted on a version-1 journal superblock,
    /// which has no feature fields.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A structural parameter is invalid (hash size not a power of two,
    /// unsupported block size, empty log area).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Revoke record or table allocation failed after all permitted retries.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive: adding a variant without an arm here is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::OutOfMemory(_) => libc::ENOMEM,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (FfsError::Format("test".into()), libc::EINVAL),
            (FfsError::Parse("test".into()), libc::EINVAL),
            (
                FfsError::UnsupportedFeature("revoke".into()),
                libc::EOPNOTSUPP,
            ),
            (
                FfsError::InvalidGeometry("hash_size=3".into()),
                libc::EINVAL,
            ),
            (FfsError::OutOfMemory("record".into()), libc::ENOMEM),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::Corruption {
            block: 42,
            detail: "revoke r_count past end of block".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: revoke r_count past end of block"
        );

        let oom = FfsError::OutOfMemory("revoke record for block 7".into());
        assert_eq!(oom.to_string(), "out of memory: revoke record for block 7");
    }

    #[test]
    fn only_out_of_memory_is_transient() {
        assert!(FfsError::OutOfMemory("x".into()).is_transient());
        assert!(!FfsError::Corruption {
            block: 1,
            detail: "x".into(),
        }
        .is_transient());
        assert!(!FfsError::Format("x".into()).is_transient());
    }
}
