//! On-disk layout of JBD journal block headers and revoke descriptors.
//!
//! # Revoke descriptor
//!
//! ```text
//! +--------+-------------+------------------------------------------+
//! | offset | field       |                                          |
//! +--------+-------------+------------------------------------------+
//! | 0      | h_magic     | u32 BE = 0xC03B3998                      |
//! | 4      | h_blocktype | u32 BE = 5 (revoke)                      |
//! | 8      | h_sequence  | u32 BE, committing transaction id        |
//! | 12     | r_count     | u32 BE, bytes used in the block,         |
//! |        |             | header included                          |
//! | 16..   | entries     | u32 BE block numbers (u64 BE with the    |
//! |        |             | 64-bit feature) up to r_count            |
//! +--------+-------------+------------------------------------------+
//! ```
//!
//! All fields are big-endian regardless of host byte order and are encoded
//! field by field; nothing relies on in-memory struct layout.

use ffs_error::FfsError;
use ffs_types::{
    BlockNumber, ParseError, Tid, read_be_u32, read_be_u64, write_be_u32, write_be_u64,
};
use serde::{Deserialize, Serialize};

/// Magic number at the start of every journal metadata block.
pub const JBD_MAGIC_NUMBER: u32 = 0xC03B_3998;

pub const JBD_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD_COMMIT_BLOCK: u32 = 2;
pub const JBD_SUPERBLOCK_V1: u32 = 3;
pub const JBD_SUPERBLOCK_V2: u32 = 4;
pub const JBD_REVOKE_BLOCK: u32 = 5;

/// Incompat feature: the journal may contain revoke blocks.
pub const JBD_FEATURE_INCOMPAT_REVOKE: u32 = 0x0000_0001;
/// Incompat feature: block numbers in the journal are 64 bits wide.
pub const JBD_FEATURE_INCOMPAT_64BIT: u32 = 0x0000_0002;

/// Size of the common block header (magic, type, sequence).
pub const JOURNAL_HEADER_SIZE: usize = 12;
/// Size of the revoke block header (common header plus `r_count`).
pub const REVOKE_HEADER_SIZE: usize = 16;

const R_COUNT_OFFSET: usize = JOURNAL_HEADER_SIZE;

/// Width of one revoke entry on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordWidth {
    /// 32-bit block numbers (classic JBD).
    #[default]
    Narrow,
    /// 64-bit block numbers (`JBD_FEATURE_INCOMPAT_64BIT`).
    Wide,
}

impl RecordWidth {
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Narrow => 4,
            Self::Wide => 8,
        }
    }

    /// Whether `block` can be stored in an entry of this width.
    #[must_use]
    pub fn fits(self, block: BlockNumber) -> bool {
        match self {
            Self::Narrow => block.to_u32().is_ok(),
            Self::Wide => true,
        }
    }

    /// Number of entries a single descriptor of `block_size` bytes holds.
    #[must_use]
    pub fn entries_per_block(self, block_size: usize) -> usize {
        block_size.saturating_sub(REVOKE_HEADER_SIZE) / self.bytes()
    }
}

/// Common header of journal metadata blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub block_type: u32,
    pub sequence: Tid,
}

impl JournalHeader {
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_be_u32(buf, 0, JBD_MAGIC_NUMBER)?;
        write_be_u32(buf, 4, self.block_type)?;
        write_be_u32(buf, 8, self.sequence.0)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(buf, 0)?;
        if magic != JBD_MAGIC_NUMBER {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(JBD_MAGIC_NUMBER),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            block_type: read_be_u32(buf, 4)?,
            sequence: Tid(read_be_u32(buf, 8)?),
        })
    }
}

/// Whether `buf` starts with a revoke block header.
#[must_use]
pub fn is_revoke_block(buf: &[u8]) -> bool {
    matches!(
        JournalHeader::decode(buf),
        Ok(JournalHeader {
            block_type: JBD_REVOKE_BLOCK,
            ..
        })
    )
}

/// Start a revoke descriptor for transaction `sequence` in `buf`.
///
/// `r_count` is left zero until [`set_revoke_count`] runs at flush time.
pub fn encode_revoke_header(buf: &mut [u8], sequence: Tid) -> Result<(), ParseError> {
    JournalHeader {
        block_type: JBD_REVOKE_BLOCK,
        sequence,
    }
    .encode_into(buf)?;
    write_be_u32(buf, R_COUNT_OFFSET, 0)
}

/// Record the number of bytes used by a revoke descriptor, header included.
pub fn set_revoke_count(buf: &mut [u8], used_bytes: usize) -> Result<(), ParseError> {
    let count = u32::try_from(used_bytes).map_err(|_| ParseError::IntegerConversion {
        field: "r_count",
    })?;
    write_be_u32(buf, R_COUNT_OFFSET, count)
}

/// Store one revoked block number at `offset`.
pub fn encode_revoke_entry(
    buf: &mut [u8],
    offset: usize,
    block: BlockNumber,
    width: RecordWidth,
) -> Result<(), ParseError> {
    match width {
        RecordWidth::Narrow => write_be_u32(buf, offset, block.to_u32()?),
        RecordWidth::Wide => write_be_u64(buf, offset, block.0),
    }
}

/// Convert a codec error into the crate error type.
///
/// With the log block known the error is reported as corruption at that
/// block; otherwise it is a format error (or invalid geometry for a bad
/// block size).
pub(crate) fn parse_to_ffs_error(err: &ParseError, log_block: Option<BlockNumber>) -> FfsError {
    match (err, log_block) {
        (ParseError::InvalidField { field: "block_size", .. }, _) => {
            FfsError::InvalidGeometry(err.to_string())
        }
        (_, Some(block)) => FfsError::Corruption {
            block: block.0,
            detail: format!("revoke block: {err}"),
        },
        (ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. }, None) => {
            FfsError::Format(err.to_string())
        }
        (ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. }, None) => {
            FfsError::Parse(err.to_string())
        }
    }
}

/// A decoded revoke descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeBlock {
    pub sequence: Tid,
    pub blocks: Vec<BlockNumber>,
}

/// Decode a revoke descriptor.
pub fn parse_revoke_block(buf: &[u8], width: RecordWidth) -> Result<RevokeBlock, ParseError> {
    let header = JournalHeader::decode(buf)?;
    if header.block_type != JBD_REVOKE_BLOCK {
        return Err(ParseError::InvalidField {
            field: "h_blocktype",
            reason: "not a revoke block",
        });
    }

    let r_count = read_be_u32(buf, R_COUNT_OFFSET)?;
    let used = usize::try_from(r_count)
        .map_err(|_| ParseError::IntegerConversion { field: "r_count" })?;
    if used < REVOKE_HEADER_SIZE {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "smaller than revoke header",
        });
    }
    if used > buf.len() {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "exceeds block size",
        });
    }
    let entry_bytes = used - REVOKE_HEADER_SIZE;
    if entry_bytes % width.bytes() != 0 {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "not a whole number of entries",
        });
    }

    let mut blocks = Vec::with_capacity(entry_bytes / width.bytes());
    let mut offset = REVOKE_HEADER_SIZE;
    while offset < used {
        let block = match width {
            RecordWidth::Narrow => u64::from(read_be_u32(buf, offset)?),
            RecordWidth::Wide => read_be_u64(buf, offset)?,
        };
        blocks.push(BlockNumber(block));
        offset += width.bytes();
    }

    Ok(RevokeBlock {
        sequence: header.sequence,
        blocks,
    })
}
