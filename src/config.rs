//! Environment and database configuration
//!
//! Options are plain values with effects; anything left at its default is
//! filled in at open/create time. Validation happens once, up front, so the
//! rest of the engine can trust the configuration.

use std::path::PathBuf;

use crate::compress::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{
    DbFlags, EnvFlags, Fadvise, KeyType, RecordType, DEFAULT_CACHE_SIZE,
    DEFAULT_JOURNAL_SWITCH_THRESHOLD, DEFAULT_MAX_DATABASES, DEFAULT_PAGE_SIZE,
    KEY_SIZE_UNLIMITED, MIN_PAGE_SIZE, RECORD_SIZE_UNLIMITED,
};

/// Environment-wide configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub flags: EnvFlags,
    /// File page size at creation; 0 selects the default.
    pub page_size: u32,
    /// Upper bound of the page cache in bytes; 0 selects the default.
    pub cache_size: u64,
    /// Maximum number of databases; 0 selects the default.
    pub max_databases: u16,
    /// Return `LimitsReached` when the file would grow past this; 0 = none.
    pub file_size_limit: u64,
    /// Directory for the journal files; default is next to the backing file.
    pub log_directory: Option<PathBuf>,
    /// Hint passed to the OS for the backing file.
    pub posix_fadvise: Fadvise,
    /// AES-128-CBC key for persisted pages.
    pub encryption_key: Option<[u8; 16]>,
    /// Codec applied to journal record payloads.
    pub journal_compression: Codec,
    /// Codec applied to blob payloads.
    pub record_compression: Codec,
    /// Codec applied to key pages (fixed-width key types only).
    pub key_compression: Codec,
    /// Switch the active journal file past this size; 0 selects the default.
    pub journal_switch_threshold: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            flags: EnvFlags::empty(),
            page_size: 0,
            cache_size: 0,
            max_databases: 0,
            file_size_limit: 0,
            log_directory: None,
            posix_fadvise: Fadvise::Normal,
            encryption_key: None,
            journal_compression: Codec::None,
            record_compression: Codec::None,
            key_compression: Codec::None,
            journal_switch_threshold: 0,
        }
    }
}

impl EnvConfig {
    /// Fill defaults and reject inconsistent option combinations.
    pub fn validated(mut self) -> Result<Self> {
        if self.page_size == 0 {
            self.page_size = DEFAULT_PAGE_SIZE;
        }
        check_page_size(self.page_size)?;
        if self.cache_size == 0 {
            self.cache_size = DEFAULT_CACHE_SIZE;
        }
        if self.max_databases == 0 {
            self.max_databases = DEFAULT_MAX_DATABASES;
        }
        if self.journal_switch_threshold == 0 {
            self.journal_switch_threshold = DEFAULT_JOURNAL_SWITCH_THRESHOLD;
        }
        if self.flags.contains(EnvFlags::IN_MEMORY) {
            if self.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
                && !self.flags.contains(EnvFlags::DISABLE_RECOVERY)
            {
                // An in-memory environment has nowhere to put a journal.
                self.flags |= EnvFlags::DISABLE_RECOVERY;
            }
            if self.flags.contains(EnvFlags::READ_ONLY) {
                return Err(Error::with_detail(
                    ErrorKind::InvalidParameter,
                    "in-memory environments cannot be read-only",
                ));
            }
        }
        if self.flags.contains(EnvFlags::AUTO_RECOVERY)
            && self.flags.contains(EnvFlags::DISABLE_RECOVERY)
        {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "auto-recovery conflicts with disable-recovery",
            ));
        }
        let slots = directory_capacity(self.page_size);
        if self.max_databases as usize > slots {
            return Err(Error::with_detail(
                ErrorKind::LimitsReached,
                format!("at most {slots} databases fit a {}-byte page", self.page_size),
            ));
        }
        Ok(self)
    }
}

/// Page size rule: 1024, or a power-of-two multiple of 2048.
pub fn check_page_size(page_size: u32) -> Result<()> {
    let ok = page_size == MIN_PAGE_SIZE
        || (page_size > MIN_PAGE_SIZE && page_size % 2048 == 0 && page_size.is_power_of_two());
    if !ok {
        return Err(Error::with_detail(
            ErrorKind::InvalidPageSize,
            format!("{page_size} is not 1024 or a power-of-two multiple of 2048"),
        ));
    }
    Ok(())
}

/// Number of database directory slots that fit the header page.
pub fn directory_capacity(page_size: u32) -> usize {
    (page_size as usize - crate::env::DIRECTORY_OFF) / crate::env::DB_SLOT_SIZE
}

/// Per-database configuration, fixed at database creation.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub flags: DbFlags,
    pub key_type: KeyType,
    /// Key width in bytes; `KEY_SIZE_UNLIMITED` for variable keys.
    pub key_size: u16,
    pub record_type: RecordType,
    /// Record width in bytes; `RECORD_SIZE_UNLIMITED` for variable records.
    pub record_size: u32,
    /// Registry name of the comparator for `KeyType::Custom`.
    pub compare_name: Option<String>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            flags: DbFlags::empty(),
            key_type: KeyType::Binary,
            key_size: KEY_SIZE_UNLIMITED,
            record_type: RecordType::Binary,
            record_size: RECORD_SIZE_UNLIMITED,
            compare_name: None,
        }
    }
}

impl DbConfig {
    /// Fill implied widths and reject inconsistent schemas.
    pub fn validated(mut self) -> Result<Self> {
        if self.flags.contains(DbFlags::RECORD_NUMBER32) {
            self.key_type = KeyType::UInt32;
        } else if self.flags.contains(DbFlags::RECORD_NUMBER64) {
            self.key_type = KeyType::UInt64;
        }
        if let Some(width) = self.key_type.implied_width() {
            if self.key_size != KEY_SIZE_UNLIMITED && self.key_size != width {
                return Err(Error::with_detail(
                    ErrorKind::InvalidKeySize,
                    format!("key type implies width {width}"),
                ));
            }
            self.key_size = width;
        }
        if self.key_size == 0 {
            return Err(Error::new(ErrorKind::InvalidKeySize));
        }
        if let Some(width) = self.record_type.implied_width() {
            if self.record_size != RECORD_SIZE_UNLIMITED && self.record_size != width {
                return Err(Error::with_detail(
                    ErrorKind::InvalidRecordSize,
                    format!("record type implies width {width}"),
                ));
            }
            self.record_size = width;
        }
        if self.flags.contains(DbFlags::RECORD_NUMBER32)
            && self.flags.contains(DbFlags::RECORD_NUMBER64)
        {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "record-number32 conflicts with record-number64",
            ));
        }
        if self.key_type == KeyType::Custom && self.compare_name.is_none() {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "custom key type requires a comparator name",
            ));
        }
        if self.key_type != KeyType::Custom && self.compare_name.is_some() {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "comparator name requires the custom key type",
            ));
        }
        if self.flags.contains(DbFlags::FORCE_RECORDS_INLINE)
            && self.record_size == RECORD_SIZE_UNLIMITED
        {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "force-records-inline requires a fixed record size",
            ));
        }
        Ok(self)
    }
}
