//! Environment: the arena owning every subsystem
//!
//! One Environment binds one backing store (file or in-memory arena) and
//! owns the pager, blob manager, transaction manager, journal and the
//! database directory. Subsystems never point back at each other; everything
//! reaches its peers through the [`EnvCore`] it lives in, under one lock.
//!
//! Header page (page 0), after the common page header:
//!
//! ```text
//! 32..36  magic
//! 36..38  format version
//! 38      endianness marker (1 = little endian)
//! 39      flags: encrypted, crc, clean shutdown
//! 40..44  page size
//! 44..46  max databases
//! 48..64  encryption salt
//! 64..80  key-check token
//! 80..88  freelist root page
//! 96..    database directory slots
//! ```
//!
//! Everything from the directory on is encrypted when a key is configured;
//! the identification fields stay plaintext so a wrong key is detected by
//! the key-check token, not by garbage parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::BlobManager;
use crate::btree::{Btree, TreeSpec};
use crate::compare::KeyCompare;
use crate::config::{DbConfig, EnvConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::journal::{self, Journal};
use crate::os::{Device, FileDevice, MemDevice};
use crate::storage::cache::CacheMode;
use crate::storage::codec::PageTransform;
use crate::storage::encoding::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::storage::freelist::Freelist;
use crate::storage::page::{PageKind, PAGE_HEADER_SIZE};
use crate::storage::Pager;
use crate::txn::{TxnManager, TxnOp, TxnOpKind};
use crate::types::{
    check_db_name, DbFlags, DbName, EnvFlags, KeyType, PageId, RecordType, TxnId, MIN_PAGE_SIZE,
};

const ENV_MAGIC: [u8; 4] = *b"brw1";
const ENV_FORMAT_VERSION: u16 = 1;
const ENDIAN_LITTLE: u8 = 1;

const HDR_MAGIC: usize = PAGE_HEADER_SIZE;
const HDR_VERSION: usize = 36;
const HDR_ENDIAN: usize = 38;
const HDR_FLAGS: usize = 39;
const HDR_PAGE_SIZE: usize = 40;
const HDR_MAX_DBS: usize = 44;
const HDR_SALT: usize = 48;
const HDR_KEY_CHECK: usize = 64;
const HDR_FREELIST_ROOT: usize = 80;

const HFLAG_ENCRYPTED: u8 = 0x01;
const HFLAG_CRC: u8 = 0x02;
const HFLAG_CLEAN: u8 = 0x04;

/// Plaintext block encrypted into the key-check token.
const KEY_CHECK_PLAIN: [u8; 16] = *b"burrowdbkeycheck";

/// Offset of the first database directory slot on the header page.
pub const DIRECTORY_OFF: usize = 96;

/// Serialized size of one directory slot.
pub const DB_SLOT_SIZE: usize = 64;

const SLOT_COMPARE_NAME_LEN: usize = 32;

// ============================================================================
// Directory slots
// ============================================================================

/// One database directory entry, as persisted on the header page.
#[derive(Debug, Clone)]
pub struct DbSlot {
    pub name: DbName,
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_type: RecordType,
    pub record_size: u32,
    pub flags: DbFlags,
    pub root: PageId,
    pub recno: u64,
    pub compare_name: Option<String>,
}

impl DbSlot {
    fn decode(data: &[u8], off: usize) -> Result<Option<DbSlot>> {
        let name = read_u16(data, off);
        if name == 0 {
            return Ok(None);
        }
        let raw_name = &data[off + 32..off + 32 + SLOT_COMPARE_NAME_LEN];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(SLOT_COMPARE_NAME_LEN);
        let compare_name = if end == 0 {
            None
        } else {
            Some(String::from_utf8_lossy(&raw_name[..end]).into_owned())
        };
        Ok(Some(DbSlot {
            name,
            key_type: KeyType::from_u8(data[off + 2])?,
            record_type: RecordType::from_u8(data[off + 3])?,
            key_size: read_u16(data, off + 4),
            record_size: read_u32(data, off + 8),
            flags: DbFlags::from_bits_retain(read_u32(data, off + 12)),
            root: read_u64(data, off + 16),
            recno: read_u64(data, off + 24),
            compare_name,
        }))
    }

    fn encode(&self, data: &mut [u8], off: usize) {
        data[off..off + DB_SLOT_SIZE].fill(0);
        write_u16(data, off, self.name);
        data[off + 2] = self.key_type as u8;
        data[off + 3] = self.record_type as u8;
        write_u16(data, off + 4, self.key_size);
        write_u32(data, off + 8, self.record_size);
        write_u32(data, off + 12, self.flags.bits());
        write_u64(data, off + 16, self.root);
        write_u64(data, off + 24, self.recno);
        if let Some(name) = &self.compare_name {
            let bytes = name.as_bytes();
            let len = bytes.len().min(SLOT_COMPARE_NAME_LEN);
            data[off + 32..off + 32 + len].copy_from_slice(&bytes[..len]);
        }
    }

    fn to_db_config(&self) -> DbConfig {
        DbConfig {
            flags: self.flags,
            key_type: self.key_type,
            key_size: self.key_size,
            record_type: self.record_type,
            record_size: self.record_size,
            compare_name: self.compare_name.clone(),
        }
    }
}

/// An open database: its tree plus handle bookkeeping.
pub struct OpenDb {
    pub tree: Btree,
}

/// Parameter query results for an environment.
#[derive(Debug, Clone)]
pub struct EnvParameters {
    pub page_size: u32,
    pub cache_size: u64,
    pub max_databases: u16,
    pub journal_switch_threshold: u64,
    pub file_size_limit: u64,
    pub flags: EnvFlags,
}

/// Parameter query results for a database.
#[derive(Debug, Clone)]
pub struct DbParameters {
    pub name: DbName,
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_type: RecordType,
    pub record_size: u32,
    pub flags: DbFlags,
    pub max_keys_per_page: usize,
}

// ============================================================================
// Core
// ============================================================================

pub struct EnvCore {
    pub cfg: EnvConfig,
    pub pager: Pager,
    pub blobs: BlobManager,
    pub txns: TxnManager,
    pub journal: Option<Journal>,
    pub open_dbs: HashMap<DbName, OpenDb>,
    pub cursors: HashMap<crate::types::CursorId, crate::db::CursorState>,
    pub next_cursor: crate::types::CursorId,
    slots: Vec<DbSlot>,
    freelist_chain: Vec<PageId>,
    journal_paths: Option<[PathBuf; 2]>,
    closed: bool,
}

/// The public environment handle. All state lives behind one lock; handles
/// reach it through the shared core.
pub struct Environment {
    core: Arc<Mutex<EnvCore>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Create a new environment, truncating anything at `path`.
    pub fn create(path: &Path, cfg: EnvConfig) -> Result<Environment> {
        let cfg = cfg.validated()?;
        if cfg.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "cannot create a read-only environment",
            ));
        }
        let in_memory = cfg.flags.contains(EnvFlags::IN_MEMORY);
        let device: Box<dyn Device> = if in_memory {
            Box::new(MemDevice::new())
        } else {
            Box::new(FileDevice::create(
                path,
                !cfg.flags.contains(EnvFlags::DISABLE_MMAP),
                cfg.posix_fadvise,
            )?)
        };

        let salt = generate_salt();
        let transform = PageTransform::new(
            cfg.flags.contains(EnvFlags::ENABLE_CRC32),
            cfg.encryption_key.as_ref(),
            salt,
        );
        let key_check = transform.key_check_token(&KEY_CHECK_PLAIN).unwrap_or([0u8; 16]);
        let mut pager = Pager::new(
            device,
            transform,
            cfg.page_size,
            cfg.cache_size,
            cache_mode(&cfg),
            cfg.file_size_limit,
            false,
        )?;

        // Page 0 is the header page.
        let header = pager.alloc(PageKind::Header, 0)?;
        debug_assert_eq!(header.read().id(), 0);
        {
            let mut page = header.write();
            page.data[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(&ENV_MAGIC);
            write_u16(&mut page.data, HDR_VERSION, ENV_FORMAT_VERSION);
            page.data[HDR_ENDIAN] = ENDIAN_LITTLE;
            let mut flags = 0u8;
            if cfg.encryption_key.is_some() {
                flags |= HFLAG_ENCRYPTED;
            }
            if cfg.flags.contains(EnvFlags::ENABLE_CRC32) {
                flags |= HFLAG_CRC;
            }
            page.data[HDR_FLAGS] = flags;
            write_u32(&mut page.data, HDR_PAGE_SIZE, cfg.page_size);
            write_u16(&mut page.data, HDR_MAX_DBS, cfg.max_databases);
            page.data[HDR_SALT..HDR_SALT + 16].copy_from_slice(&salt);
            page.data[HDR_KEY_CHECK..HDR_KEY_CHECK + 16].copy_from_slice(&key_check);
            write_u64(&mut page.data, HDR_FREELIST_ROOT, 0);
            page.mark_dirty();
        }
        drop(header);

        let journal_paths = if wants_journal(&cfg) && !in_memory {
            Some(journal::journal_paths(path, cfg.log_directory.as_deref()))
        } else {
            None
        };
        let journal = match &journal_paths {
            Some(paths) => Some(Journal::open(
                paths,
                cfg.journal_switch_threshold,
                cfg.flags.contains(EnvFlags::ENABLE_FSYNC),
                cfg.journal_compression,
            )?),
            None => None,
        };

        let mut core = EnvCore {
            cfg,
            pager,
            blobs: BlobManager::new(),
            txns: TxnManager::new(),
            journal,
            open_dbs: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor: 1,
            slots: Vec::new(),
            freelist_chain: Vec::new(),
            journal_paths,
            closed: false,
        };
        if !in_memory {
            // Persist the header right away so a crash before the first
            // flush still finds a parseable file, marked not-clean.
            core.persist_metadata(false)?;
            core.pager.flush_all(core.cfg.flags.contains(EnvFlags::ENABLE_FSYNC))?;
        }
        log::info!("environment created (page size {})", core.cfg.page_size);
        Ok(Environment { core: Arc::new(Mutex::new(core)) })
    }

    /// Open an existing environment.
    pub fn open(path: &Path, cfg: EnvConfig) -> Result<Environment> {
        let cfg = cfg.validated()?;
        if cfg.flags.contains(EnvFlags::IN_MEMORY) {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "in-memory environments cannot be reopened",
            ));
        }
        let read_only = cfg.flags.contains(EnvFlags::READ_ONLY);
        let mut device: Box<dyn Device> = Box::new(FileDevice::open(
            path,
            !cfg.flags.contains(EnvFlags::DISABLE_MMAP),
            read_only,
            cfg.posix_fadvise,
        )?);

        // The identification fields live in the first kilobyte, readable
        // before the page size is known.
        let mut head = vec![0u8; MIN_PAGE_SIZE as usize];
        if device.len()? < MIN_PAGE_SIZE as u64 {
            return Err(Error::new(ErrorKind::InvalidFileHeader));
        }
        device.read(0, &mut head)?;
        if head[HDR_MAGIC..HDR_MAGIC + 4] != ENV_MAGIC {
            return Err(Error::new(ErrorKind::InvalidFileHeader));
        }
        if read_u16(&head, HDR_VERSION) != ENV_FORMAT_VERSION {
            return Err(Error::new(ErrorKind::InvalidFileVersion));
        }
        if head[HDR_ENDIAN] != ENDIAN_LITTLE {
            return Err(Error::new(ErrorKind::InvalidFileHeader));
        }
        let header_flags = head[HDR_FLAGS];
        let page_size = read_u32(&head, HDR_PAGE_SIZE);
        crate::config::check_page_size(page_size)?;

        let encrypted = header_flags & HFLAG_ENCRYPTED != 0;
        if encrypted != cfg.encryption_key.is_some() {
            return Err(Error::new(ErrorKind::InvalidFileHeader));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&head[HDR_SALT..HDR_SALT + 16]);
        let transform =
            PageTransform::new(header_flags & HFLAG_CRC != 0, cfg.encryption_key.as_ref(), salt);
        if let Some(token) = transform.key_check_token(&KEY_CHECK_PLAIN) {
            if head[HDR_KEY_CHECK..HDR_KEY_CHECK + 16] != token {
                return Err(Error::new(ErrorKind::InvalidFileHeader));
            }
        }

        let mut pager = Pager::new(
            device,
            transform,
            page_size,
            cfg.cache_size,
            cache_mode(&cfg),
            cfg.file_size_limit,
            read_only,
        )?;

        // Full header page: CRC-checked, decrypted directory.
        let header = pager.fetch(0)?;
        let (max_databases, freelist_root, clean, slots) = {
            let page = header.read();
            let max_databases = read_u16(&page.data, HDR_MAX_DBS);
            let freelist_root = read_u64(&page.data, HDR_FREELIST_ROOT);
            let clean = page.data[HDR_FLAGS] & HFLAG_CLEAN != 0;
            let mut slots = Vec::new();
            let capacity = (page_size as usize - DIRECTORY_OFF) / DB_SLOT_SIZE;
            for i in 0..capacity.min(max_databases as usize) {
                if let Some(slot) = DbSlot::decode(&page.data, DIRECTORY_OFF + i * DB_SLOT_SIZE)? {
                    slots.push(slot);
                }
            }
            (max_databases, freelist_root, clean, slots)
        };
        drop(header);

        // Rebuild the freelist from its chain, then reclaim the chain pages
        // themselves; the list lives in memory until the next checkpoint.
        let mut chunks = Vec::new();
        let mut chain_pages = Vec::new();
        let mut chain = freelist_root;
        while chain != 0 {
            let page = pager.fetch(chain)?;
            let guard = page.read();
            chunks.push(Freelist::decode_chunk(&guard.data));
            chain_pages.push(chain);
            chain = guard.kind_word();
        }
        *pager.freelist_mut() = Freelist::load(chunks);
        for id in chain_pages {
            pager.free_page(id);
        }

        let mut cfg = cfg;
        cfg.page_size = page_size;
        cfg.max_databases = max_databases;

        let journal_paths = if wants_journal(&cfg) {
            Some(journal::journal_paths(path, cfg.log_directory.as_deref()))
        } else {
            None
        };

        let mut core = EnvCore {
            cfg,
            pager,
            blobs: BlobManager::new(),
            txns: TxnManager::new(),
            journal: None,
            open_dbs: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor: 1,
            slots,
            freelist_chain: Vec::new(),
            journal_paths: journal_paths.clone(),
            closed: false,
        };

        // Crash recovery decision.
        if let Some(paths) = &journal_paths {
            let pending = journal::needs_recovery(paths, core.cfg.journal_compression)?;
            if pending && !clean {
                if core.cfg.flags.contains(EnvFlags::AUTO_RECOVERY) {
                    core.run_recovery(paths.clone())?;
                } else {
                    return Err(Error::new(ErrorKind::NeedRecovery));
                }
            }
            if !read_only {
                core.journal = Some(Journal::open(
                    paths,
                    core.cfg.journal_switch_threshold,
                    core.cfg.flags.contains(EnvFlags::ENABLE_FSYNC),
                    core.cfg.journal_compression,
                )?);
            }
        }

        if !read_only {
            core.persist_metadata(false)?;
            core.pager.flush_all(core.cfg.flags.contains(EnvFlags::ENABLE_FSYNC))?;
        }
        log::info!("environment opened ({} databases)", core.core_database_count());
        Ok(Environment { core: Arc::new(Mutex::new(core)) })
    }

    /// Create a database inside the environment.
    pub fn create_db(&self, name: DbName, cfg: DbConfig) -> Result<crate::db::Database> {
        let mut core = self.core.lock();
        core.create_db(name, cfg)?;
        Ok(crate::db::Database::new(self.core.clone(), name))
    }

    /// Open an existing database.
    pub fn open_db(&self, name: DbName, flags: DbFlags) -> Result<crate::db::Database> {
        let mut core = self.core.lock();
        core.open_db(name, flags)?;
        Ok(crate::db::Database::new(self.core.clone(), name))
    }

    /// Names of all databases in the directory.
    pub fn database_names(&self) -> Result<Vec<DbName>> {
        let core = self.core.lock();
        Ok(core.slots.iter().map(|s| s.name).collect())
    }

    /// Rename a closed database.
    pub fn rename_db(&self, old: DbName, new: DbName) -> Result<()> {
        self.core.lock().rename_db(old, new)
    }

    /// Delete a closed database and release its pages.
    pub fn erase_db(&self, name: DbName) -> Result<()> {
        self.core.lock().erase_db(name)
    }

    /// Begin a transaction.
    pub fn begin_txn(&self, flags: crate::types::TxnFlags) -> Result<crate::db::Transaction> {
        let mut core = self.core.lock();
        if !core.cfg.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "transactions are not enabled",
            ));
        }
        let id = core.txns.begin(flags);
        Ok(crate::db::Transaction::new(self.core.clone(), id))
    }

    /// Flush dirty pages and write a checkpoint.
    pub fn flush(&self) -> Result<()> {
        self.core.lock().checkpoint()
    }

    /// Environment parameter query.
    pub fn parameters(&self) -> Result<EnvParameters> {
        let core = self.core.lock();
        Ok(EnvParameters {
            page_size: core.cfg.page_size,
            cache_size: core.cfg.cache_size,
            max_databases: core.cfg.max_databases,
            journal_switch_threshold: core.cfg.journal_switch_threshold,
            file_size_limit: core.cfg.file_size_limit,
            flags: core.cfg.flags,
        })
    }

    /// Close the environment: abort leftover transactions, flush, mark the
    /// file clean and truncate the journal.
    pub fn close(self) -> Result<()> {
        self.core.lock().close()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        if !core.closed {
            if let Err(err) = core.close() {
                log::error!("environment close failed: {err}");
            }
        }
    }
}

// ============================================================================
// Core implementation
// ============================================================================

impl EnvCore {
    fn core_database_count(&self) -> usize {
        self.slots.len()
    }

    pub fn writable(&self) -> Result<()> {
        if self.cfg.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        Ok(())
    }

    pub fn transactions_enabled(&self) -> bool {
        self.cfg.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
    }

    fn slot_index(&self, name: DbName) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    pub fn slot(&self, name: DbName) -> Result<&DbSlot> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))
    }

    fn slot_mut(&mut self, name: DbName) -> Result<&mut DbSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))
    }

    fn build_spec(&self, slot: &DbSlot, ignore_missing: bool) -> Result<TreeSpec> {
        let cmp = KeyCompare::resolve(slot.key_type, slot.compare_name.as_deref(), ignore_missing)?;
        TreeSpec::new(
            slot.name,
            &slot.to_db_config(),
            cmp,
            self.cfg.record_compression,
            self.cfg.key_compression,
            self.cfg.page_size,
        )
    }

    pub fn create_db(&mut self, name: DbName, cfg: DbConfig) -> Result<()> {
        self.writable()?;
        check_db_name(name)?;
        if self.slot_index(name).is_some() {
            return Err(Error::new(ErrorKind::DatabaseAlreadyExists));
        }
        if self.slots.len() >= self.cfg.max_databases as usize {
            return Err(Error::new(ErrorKind::LimitsReached));
        }
        let cfg = cfg.validated()?;
        let slot = DbSlot {
            name,
            key_type: cfg.key_type,
            key_size: cfg.key_size,
            record_type: cfg.record_type,
            record_size: cfg.record_size,
            flags: cfg.flags,
            root: 0,
            recno: 0,
            compare_name: cfg.compare_name.clone(),
        };
        let spec = self.build_spec(&slot, false)?;
        let tree = Btree::create(&mut self.pager, spec)?;
        let mut slot = slot;
        slot.root = tree.root;
        self.slots.push(slot);
        self.open_dbs.insert(name, OpenDb { tree });
        self.write_header()?;
        // Directory changes are durable immediately; journal replay assumes
        // the database exists.
        self.flush_directory()?;
        log::debug!("created database {name}");
        Ok(())
    }

    fn flush_directory(&mut self) -> Result<()> {
        if self.cfg.flags.contains(EnvFlags::IN_MEMORY) {
            return Ok(());
        }
        // The freelist must land together with the directory: a replayed
        // journal allocates against the persisted freelist, which therefore
        // must not list pages the directory change just consumed.
        self.persist_metadata(false)?;
        self.pager.flush_all(self.cfg.flags.contains(EnvFlags::ENABLE_FSYNC))
    }

    pub fn open_db(&mut self, name: DbName, flags: DbFlags) -> Result<()> {
        check_db_name(name)?;
        if self.open_dbs.contains_key(&name) {
            return Err(Error::new(ErrorKind::DatabaseAlreadyOpen));
        }
        let slot = self.slot(name)?.clone();
        let spec =
            self.build_spec(&slot, flags.contains(DbFlags::IGNORE_MISSING_CALLBACK))?;
        let tree = Btree::open(slot.root, spec);
        self.open_dbs.insert(name, OpenDb { tree });
        Ok(())
    }

    /// Called when the last handle for a database drops.
    pub fn close_db(&mut self, name: DbName) -> Result<()> {
        if let Some(open) = self.open_dbs.remove(&name) {
            let root = open.tree.root;
            if let Ok(slot) = self.slot_mut(name) {
                if slot.root != root {
                    slot.root = root;
                    self.write_header()?;
                }
            }
        }
        Ok(())
    }

    pub fn rename_db(&mut self, old: DbName, new: DbName) -> Result<()> {
        self.writable()?;
        check_db_name(old)?;
        check_db_name(new)?;
        if self.open_dbs.contains_key(&old) {
            return Err(Error::new(ErrorKind::DatabaseAlreadyOpen));
        }
        if self.slot_index(new).is_some() {
            return Err(Error::new(ErrorKind::DatabaseAlreadyExists));
        }
        self.slot_mut(old)?.name = new;
        self.write_header()?;
        self.flush_directory()
    }

    pub fn erase_db(&mut self, name: DbName) -> Result<()> {
        self.writable()?;
        check_db_name(name)?;
        if self.open_dbs.contains_key(&name) {
            return Err(Error::new(ErrorKind::DatabaseAlreadyOpen));
        }
        let slot = self.slot(name)?.clone();
        let spec = self.build_spec(&slot, true)?;
        let mut tree = Btree::open(slot.root, spec);
        tree.free_all(&mut self.pager, &mut self.blobs)?;
        let idx = self.slot_index(name).expect("slot existed above");
        self.slots.remove(idx);
        self.write_header()?;
        self.flush_directory()?;
        log::debug!("erased database {name}");
        Ok(())
    }

    pub fn db_parameters(&self, name: DbName) -> Result<DbParameters> {
        let slot = self.slot(name)?;
        let spec = self.build_spec(slot, true)?;
        Ok(DbParameters {
            name,
            key_type: slot.key_type,
            key_size: slot.key_size,
            record_type: slot.record_type,
            record_size: slot.record_size,
            flags: slot.flags,
            max_keys_per_page: spec.max_keys_per_page(),
        })
    }

    /// Record a moved btree root in the directory.
    pub fn note_root(&mut self, name: DbName, root: PageId) -> Result<()> {
        let mut changed = false;
        if let Ok(slot) = self.slot_mut(name) {
            if slot.root != root {
                slot.root = root;
                changed = true;
            }
        }
        if changed {
            self.write_header()?;
        }
        Ok(())
    }

    /// Assign the next record-number key for a database.
    pub fn next_recno(&mut self, name: DbName) -> Result<u64> {
        let slot = self.slot_mut(name)?;
        slot.recno += 1;
        Ok(slot.recno)
    }

    /// Raise the record-number counter to at least `value`.
    pub fn bump_recno(&mut self, name: DbName, value: u64) -> Result<()> {
        let slot = self.slot_mut(name)?;
        if value > slot.recno {
            slot.recno = value;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit path
    // ------------------------------------------------------------------

    /// Apply one logged operation to its btree.
    pub fn apply_op(&mut self, op: &TxnOp) -> Result<()> {
        let was_open = self.open_dbs.contains_key(&op.db);
        if !was_open {
            self.open_db(op.db, DbFlags::IGNORE_MISSING_CALLBACK)?;
        }
        // Replayed inserts must also restore the record-number counter.
        if let TxnOpKind::Insert(_) = op.kind {
            let recno = {
                let slot = self.slot(op.db)?;
                if slot.flags.contains(DbFlags::RECORD_NUMBER32) && op.key.len() == 4 {
                    Some(u32::from_le_bytes([op.key[0], op.key[1], op.key[2], op.key[3]]) as u64)
                } else if slot.flags.contains(DbFlags::RECORD_NUMBER64) && op.key.len() == 8 {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&op.key);
                    Some(u64::from_le_bytes(buf))
                } else {
                    None
                }
            };
            if let Some(value) = recno {
                self.bump_recno(op.db, value)?;
            }
        }
        let open = self.open_dbs.get_mut(&op.db).expect("opened above");
        let result = match op.kind {
            TxnOpKind::Insert(flags) => open.tree.insert(
                &mut self.pager,
                &mut self.blobs,
                &op.key,
                &op.record,
                flags,
                None,
            ),
            TxnOpKind::Erase(flags) => {
                open.tree.erase(&mut self.pager, &mut self.blobs, &op.key, None, flags)
            }
        };
        let root = open.tree.root;
        if let Ok(slot) = self.slot_mut(op.db) {
            slot.root = root;
        }
        if !was_open {
            self.close_db(op.db)?;
        }
        result
    }

    /// Commit a transaction: journal the batch, apply it to the btree, then
    /// flush if so configured.
    pub fn commit_txn(&mut self, id: TxnId) -> Result<()> {
        let txn = self.txns.take_for_commit(id)?;
        if let Some(journal) = &mut self.journal {
            journal.append_commit_batch(txn.id, &txn.ops)?;
        }
        for op in &txn.ops {
            self.apply_op(op)?;
        }
        self.write_header()?;
        if self.cfg.flags.contains(EnvFlags::FLUSH_TRANSACTIONS_IMMEDIATELY) {
            self.checkpoint()?;
        }
        log::trace!("committed transaction {id} ({} ops)", txn.ops.len());
        Ok(())
    }

    pub fn abort_txn(&mut self, id: TxnId) -> Result<()> {
        let txn = self.txns.take_for_abort(id)?;
        log::trace!("aborted transaction {id} ({} ops discarded)", txn.ops.len());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata persistence
    // ------------------------------------------------------------------

    /// Serialize the freelist into its page chain and rewrite the header
    /// page (directory, freelist root, clean flag).
    fn persist_metadata(&mut self, clean: bool) -> Result<()> {
        // Old chain pages go back to the free set before it is serialized.
        for id in std::mem::take(&mut self.freelist_chain) {
            self.pager.free_page(id);
        }

        let page_size = self.cfg.page_size;
        let mut chain: Vec<PageId> = Vec::new();
        // Growing the chain may shrink the free set (chain pages come from
        // it), so iterate until the chain is large enough.
        loop {
            let needed = Freelist::pages_needed(self.pager.freelist().len(), page_size);
            if chain.len() >= needed {
                break;
            }
            let page = self.pager.alloc(PageKind::Freelist, 0)?;
            chain.push(page.read().id());
        }

        let ids: Vec<PageId> = self.pager.freelist().iter().collect();
        let per_page = Freelist::ids_per_page(page_size);
        for (i, &chain_id) in chain.iter().enumerate() {
            let start = i * per_page;
            let end = ((i + 1) * per_page).min(ids.len());
            let chunk = if start < ids.len() { &ids[start..end] } else { &[] };
            let page = self.pager.fetch(chain_id)?;
            let mut guard = page.write();
            guard.data[PAGE_HEADER_SIZE..].fill(0);
            Freelist::encode_chunk(&mut guard.data, chunk);
            guard.set_kind_word(chain.get(i + 1).copied().unwrap_or(0));
            guard.mark_dirty();
        }
        self.freelist_chain = chain;
        self.write_header_with(clean)
    }

    fn write_header(&mut self) -> Result<()> {
        self.write_header_with(false)
    }

    fn write_header_with(&mut self, clean: bool) -> Result<()> {
        let root = self.freelist_chain.first().copied().unwrap_or(0);
        let header = self.pager.fetch(0)?;
        let mut page = header.write();
        let mut flags = page.data[HDR_FLAGS] & !HFLAG_CLEAN;
        if clean {
            flags |= HFLAG_CLEAN;
        }
        page.data[HDR_FLAGS] = flags;
        write_u64(&mut page.data, HDR_FREELIST_ROOT, root);
        page.data[DIRECTORY_OFF..].fill(0);
        for (i, slot) in self.slots.iter().enumerate() {
            slot.encode(&mut page.data, DIRECTORY_OFF + i * DB_SLOT_SIZE);
        }
        page.mark_dirty();
        Ok(())
    }

    /// Flush everything durable and mark the journal reclaimable.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.writable()?;
        // Roots of open trees may have moved since their last update.
        let roots: Vec<(DbName, PageId)> =
            self.open_dbs.iter().map(|(&name, open)| (name, open.tree.root)).collect();
        for (name, root) in roots {
            if let Ok(slot) = self.slot_mut(name) {
                slot.root = root;
            }
        }
        self.persist_metadata(false)?;
        let fsync = self.cfg.flags.contains(EnvFlags::ENABLE_FSYNC);
        if let Some(journal) = &mut self.journal {
            // Before-images of the metadata pages travel with the
            // checkpoint so recovery can fall back to a consistent header.
            let header = self.pager.fetch(0)?;
            let image = header.read().data.clone();
            journal.append_page_image(0, &image)?;
        }
        self.pager.flush_all(fsync)?;
        if let Some(journal) = &mut self.journal {
            journal.append_checkpoint()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn run_recovery(&mut self, paths: [PathBuf; 2]) -> Result<()> {
        log::info!("running journal recovery");
        let codec = self.cfg.journal_compression;
        let mut ops: Vec<TxnOp> = Vec::new();
        journal::recover(&paths, codec, |op| {
            ops.push(op.clone());
            Ok(())
        })?;
        let mut replayed = 0usize;
        for op in &ops {
            match self.apply_op(op) {
                Ok(()) => replayed += 1,
                // The effect may already be durable when the crash landed
                // between the page flush and the checkpoint record.
                Err(err)
                    if matches!(err.kind(), ErrorKind::DuplicateKey | ErrorKind::KeyNotFound) =>
                {
                    log::warn!("recovery: skipping already-applied op: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        self.persist_metadata(false)?;
        self.pager.flush_all(true)?;
        log::info!("recovery replayed {replayed} operations");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let leftover = self.txns.active_count();
        if leftover > 0 {
            // The file stays marked not-clean; the next open recovers.
            return Err(Error::with_detail(
                ErrorKind::TxnStillOpen,
                format!("{leftover} transactions still active"),
            ));
        }
        self.closed = true;

        // Sync open tree roots into their slots.
        let roots: Vec<(DbName, PageId)> =
            self.open_dbs.iter().map(|(&name, open)| (name, open.tree.root)).collect();
        for (name, root) in roots {
            if let Ok(slot) = self.slot_mut(name) {
                slot.root = root;
            }
        }
        self.open_dbs.clear();

        if self.cfg.flags.contains(EnvFlags::IN_MEMORY)
            || self.cfg.flags.contains(EnvFlags::READ_ONLY)
        {
            self.pager.clear_cache();
            return Ok(());
        }

        self.persist_metadata(true)?;
        self.pager.flush_all(true)?;
        if let Some(journal) = &mut self.journal {
            journal.truncate_all()?;
        }
        self.pager.clear_cache();
        self.blobs.reset();
        log::info!("environment closed cleanly");
        Ok(())
    }
}

fn cache_mode(cfg: &EnvConfig) -> CacheMode {
    if cfg.flags.contains(EnvFlags::CACHE_UNLIMITED) || cfg.flags.contains(EnvFlags::IN_MEMORY) {
        CacheMode::Unlimited
    } else if cfg.flags.contains(EnvFlags::CACHE_STRICT) {
        CacheMode::Strict
    } else {
        CacheMode::Normal
    }
}

fn wants_journal(cfg: &EnvConfig) -> bool {
    cfg.flags.contains(EnvFlags::ENABLE_TRANSACTIONS)
        && !cfg.flags.contains(EnvFlags::DISABLE_RECOVERY)
}

/// Seed the per-environment salt. Not cryptographic randomness; the salt
/// only diversifies per-page IVs and is stored in the clear.
fn generate_salt() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos =
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0) as u64;
    let mut state = nanos ^ 0x9e37_79b9_7f4a_7c15;
    let mut salt = [0u8; 16];
    for chunk in salt.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    salt
}
