//! Shared ids, schema types and flag sets
//!
//! Foundational types used across the storage, btree, transaction and
//! journal layers.

use bitflags::bitflags;

use crate::error::{Error, ErrorKind, Result};

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page id: the page's index within the backing store (64-bit self-id).
pub type PageId = u64;

/// Transaction id, monotonically increasing per Environment.
pub type TxnId = u64;

/// Log sequence number used to order journal records across both files.
pub type Lsn = u64;

/// Blob id: encodes the byte address of the blob header in the backing store.
pub type BlobId = u64;

/// Database name. Numeric, 16-bit; the range `0xf000..` is reserved.
pub type DbName = u16;

/// Cursor handle id, process-local.
pub type CursorId = u64;

// ============================================================================
// Limits and Defaults
// ============================================================================

/// First reserved database name; user databases must be below this.
pub const DB_NAME_RESERVED: DbName = 0xf000;

/// Sentinel for "variable-length keys".
pub const KEY_SIZE_UNLIMITED: u16 = u16::MAX;

/// Sentinel for "variable-length records".
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 16 * 1024;

/// Smallest allowed page size.
pub const MIN_PAGE_SIZE: u32 = 1024;

/// Default page cache capacity in bytes.
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024;

/// Default journal switch threshold in bytes.
pub const DEFAULT_JOURNAL_SWITCH_THRESHOLD: u64 = 2 * 1024 * 1024;

/// Default maximum number of databases per environment.
pub const DEFAULT_MAX_DATABASES: u16 = 64;

// ============================================================================
// Key and Record Schema
// ============================================================================

/// Key schema of a database, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// Variable-length byte strings, memcmp order.
    Binary = 0,
    /// Byte strings compared by a user-registered comparator.
    Custom = 1,
    UInt8 = 3,
    UInt16 = 5,
    UInt32 = 7,
    UInt64 = 9,
    Real32 = 11,
    Real64 = 12,
}

impl KeyType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => KeyType::Binary,
            1 => KeyType::Custom,
            3 => KeyType::UInt8,
            5 => KeyType::UInt16,
            7 => KeyType::UInt32,
            9 => KeyType::UInt64,
            11 => KeyType::Real32,
            12 => KeyType::Real64,
            _ => return Err(Error::with_detail(ErrorKind::InvalidParameter, "unknown key type")),
        })
    }

    /// Width implied by the type itself, for the numeric types.
    pub fn implied_width(&self) -> Option<u16> {
        match self {
            KeyType::UInt8 => Some(1),
            KeyType::UInt16 => Some(2),
            KeyType::UInt32 | KeyType::Real32 => Some(4),
            KeyType::UInt64 | KeyType::Real64 => Some(8),
            KeyType::Binary | KeyType::Custom => None,
        }
    }
}

/// Record schema of a database, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Binary = 0,
    UInt8 = 3,
    UInt16 = 5,
    UInt32 = 7,
    UInt64 = 9,
    Real32 = 11,
    Real64 = 12,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => RecordType::Binary,
            3 => RecordType::UInt8,
            5 => RecordType::UInt16,
            7 => RecordType::UInt32,
            9 => RecordType::UInt64,
            11 => RecordType::Real32,
            12 => RecordType::Real64,
            _ => return Err(Error::with_detail(ErrorKind::InvalidParameter, "unknown record type")),
        })
    }

    pub fn implied_width(&self) -> Option<u32> {
        match self {
            RecordType::UInt8 => Some(1),
            RecordType::UInt16 => Some(2),
            RecordType::UInt32 | RecordType::Real32 => Some(4),
            RecordType::UInt64 | RecordType::Real64 => Some(8),
            RecordType::Binary => None,
        }
    }
}

// ============================================================================
// Flag Sets
// ============================================================================

bitflags! {
    /// Environment open/create flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// `fsync` after every commit record.
        const ENABLE_FSYNC                   = 0x0000_0001;
        /// Reject mutating calls.
        const READ_ONLY                      = 0x0000_0004;
        /// No backing file; all state is lost at close.
        const IN_MEMORY                      = 0x0000_0080;
        /// Force the `read`/`write` path even if mapping is available.
        const DISABLE_MMAP                   = 0x0000_0200;
        /// Replay the journal at open.
        const AUTO_RECOVERY                  = 0x0001_0000;
        /// Enable the transaction layer and the journal.
        const ENABLE_TRANSACTIONS            = 0x0002_0000;
        /// Disable cache eviction entirely.
        const CACHE_UNLIMITED                = 0x0004_0000;
        /// Do not write or replay the journal.
        const DISABLE_RECOVERY               = 0x0008_0000;
        /// Compute and verify a CRC32 per page.
        const ENABLE_CRC32                   = 0x0200_0000;
        /// Apply the btree and write back dirty pages at commit.
        const FLUSH_TRANSACTIONS_IMMEDIATELY = 0x0800_0000;
        /// Treat the cache capacity as a hard cap and evict aggressively.
        const CACHE_STRICT                   = 0x1000_0000;
    }
}

bitflags! {
    /// Per-database flags, persisted in the database directory slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Allow more than one record per key.
        const ENABLE_DUPLICATE_KEYS = 0x0000_4000;
        /// Auto-incrementing 32-bit keys.
        const RECORD_NUMBER32       = 0x0000_1000;
        /// Auto-incrementing 64-bit keys.
        const RECORD_NUMBER64       = 0x0000_2000;
        /// Store record bytes in the leaf instead of as a blob.
        const FORCE_RECORDS_INLINE  = 0x0080_0000;
        /// Open a custom-compare database without its comparator registered.
        const IGNORE_MISSING_CALLBACK = 0x0000_0002;
    }
}

bitflags! {
    /// Flags for insert operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InsertFlags: u32 {
        /// Overwrite the record if the key exists.
        const OVERWRITE               = 0x0001;
        /// Add a duplicate if the key exists (duplicate databases only).
        const DUPLICATE               = 0x0002;
        /// Insert the duplicate before the cursor position.
        const DUPLICATE_INSERT_BEFORE = 0x0004;
        /// Insert the duplicate after the cursor position.
        const DUPLICATE_INSERT_AFTER  = 0x0008;
        /// Insert as the first duplicate of the key.
        const DUPLICATE_INSERT_FIRST  = 0x0010;
        /// Insert as the last duplicate of the key (default).
        const DUPLICATE_INSERT_LAST   = 0x0020;
    }
}

bitflags! {
    /// Approximate-match flags for lookups.
    ///
    /// `NEAR` accepts either neighbor; when both exist and neither matches
    /// exactly, the lower neighbor wins. Callers that need a specific side
    /// use the directional flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FindFlags: u32 {
        /// Strictly less than the given key.
        const LT   = 0x0001;
        /// Strictly greater than the given key.
        const GT   = 0x0002;
        /// Less than or equal.
        const LEQ  = 0x0004;
        /// Greater than or equal.
        const GEQ  = 0x0008;
        /// Either neighbor; exact match preferred.
        const NEAR = 0x0004 | 0x0008;
    }
}

bitflags! {
    /// Flags for erase operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EraseFlags: u32 {
        /// Erase every duplicate of the key, not just the positioned one.
        const ALL_DUPLICATES = 0x0001;
    }
}

bitflags! {
    /// Transaction begin flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        /// The transaction will not perform mutations.
        const READ_ONLY = 0x0001;
        /// Implicit transaction wrapping a single operation.
        const TEMPORARY = 0x0002;
    }
}

bitflags! {
    /// Modifier flags for cursor movement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveFlags: u32 {
        /// Step over remaining duplicates of the current key.
        const SKIP_DUPLICATES = 0x0001;
        /// Stay within the duplicates of the current key.
        const ONLY_DUPLICATES = 0x0002;
    }
}

/// Cursor movement directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
}

/// `posix_fadvise` hint passed to the OS for the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fadvise {
    #[default]
    Normal,
    Random,
}

/// Validate a user-supplied database name.
pub fn check_db_name(name: DbName) -> Result<()> {
    if name == 0 || name >= DB_NAME_RESERVED {
        return Err(Error::with_detail(
            ErrorKind::InvalidParameter,
            format!("database name {name} is reserved"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_type_roundtrip() {
        for kt in [
            KeyType::Binary,
            KeyType::Custom,
            KeyType::UInt8,
            KeyType::UInt16,
            KeyType::UInt32,
            KeyType::UInt64,
            KeyType::Real32,
            KeyType::Real64,
        ] {
            assert_eq!(KeyType::from_u8(kt as u8).unwrap(), kt);
        }
        assert!(KeyType::from_u8(2).is_err());
    }

    #[test]
    fn test_db_name_range() {
        assert!(check_db_name(0).is_err());
        assert!(check_db_name(1).is_ok());
        assert!(check_db_name(0xefff).is_ok());
        assert!(check_db_name(0xf000).is_err());
    }

    #[test]
    fn test_near_is_both_sides() {
        assert!(FindFlags::NEAR.contains(FindFlags::LEQ));
        assert!(FindFlags::NEAR.contains(FindFlags::GEQ));
    }
}
