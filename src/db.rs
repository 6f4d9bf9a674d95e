//! Database handles, transactions and cursors
//!
//! The public operation surface. Reads and writes go through the
//! transaction layer when it is enabled: a transaction sees its own op-log
//! first (latest wins), cursor scans merge the committed tree ordering with
//! the op-log, and keys pending under another active transaction are skipped
//! in scans but surface as `TxnConflict` on positional operations.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::cursor::TreeCursor;
use crate::btree::node::LeafPayload;
use crate::env::{DbParameters, EnvCore};
use crate::error::{Error, ErrorKind, Result};
use crate::txn::{KeyState, TxnOp, TxnOpKind};
use crate::types::{
    CursorId, CursorMove, DbFlags, DbName, EraseFlags, FindFlags, InsertFlags, MoveFlags, TxnId,
    TxnFlags,
};

// ============================================================================
// Handles
// ============================================================================

/// A named ordered key/value map inside an environment.
pub struct Database {
    core: Arc<Mutex<EnvCore>>,
    name: DbName,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish_non_exhaustive()
    }
}

/// An atomic, isolated batch of operations.
pub struct Transaction {
    core: Arc<Mutex<EnvCore>>,
    id: TxnId,
    done: bool,
}

/// A positioned iterator over a database, optionally bound to a transaction.
pub struct Cursor {
    core: Arc<Mutex<EnvCore>>,
    id: CursorId,
    db: DbName,
    txn: Option<TxnId>,
}

/// Cursor position kept inside the environment core. The position is the
/// owned key plus a duplicate index, so structural btree changes never
/// invalidate it.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub db: DbName,
    pub txn: Option<TxnId>,
    pub key: Option<Vec<u8>>,
    pub dup: u32,
}

impl Transaction {
    pub(crate) fn new(core: Arc<Mutex<EnvCore>>, id: TxnId) -> Self {
        Transaction { core, id, done: false }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Make the transaction's effects durable and visible.
    pub fn commit(&mut self) -> Result<()> {
        let mut core = self.core.lock();
        core.commit_txn(self.id)?;
        self.done = true;
        Ok(())
    }

    /// Discard the transaction's effects.
    pub fn abort(&mut self) -> Result<()> {
        let mut core = self.core.lock();
        core.abort_txn(self.id)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            let mut core = self.core.lock();
            if let Err(err) = core.abort_txn(self.id) {
                log::warn!("dropping transaction {}: {err}", self.id);
            }
        }
    }
}

// ============================================================================
// Merged views over tree + op-log
// ============================================================================

/// Where a merged cursor entry's records come from.
enum EntryRecords {
    Tree(LeafPayload),
    View(Vec<Vec<u8>>),
}

impl EntryRecords {
    fn count(&self) -> u64 {
        match self {
            EntryRecords::Tree(payload) => payload.record_count(),
            EntryRecords::View(records) => records.len() as u64,
        }
    }
}

struct MergedEntry {
    key: Vec<u8>,
    records: EntryRecords,
}

fn db_tree<'a>(core: &'a EnvCore, db: DbName) -> Result<&'a crate::btree::Btree> {
    core.open_dbs
        .get(&db)
        .map(|open| &open.tree)
        .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))
}

fn tree_lookup(core: &mut EnvCore, db: DbName, key: &[u8]) -> Result<Option<LeafPayload>> {
    let open = core
        .open_dbs
        .get(&db)
        .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
    open.tree.lookup(&mut core.pager, &mut core.blobs, key)
}

/// The transaction's private state for a key, if any.
fn view_state<'a>(core: &'a EnvCore, db: DbName, txn: Option<TxnId>, key: &[u8]) -> Option<&'a KeyState> {
    let txn = txn?;
    core.txns.get(txn).ok()?.view(db)?.state_of(key)
}

/// Visible records for `key` right now, or `None` when the key does not
/// exist for this transaction (including foreign-pending keys, which scans
/// treat as invisible).
fn current_entry(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    key: &[u8],
) -> Result<Option<EntryRecords>> {
    match view_state(core, db, txn, key) {
        Some(KeyState::Erased) => return Ok(None),
        Some(KeyState::Put(records)) => return Ok(Some(EntryRecords::View(records.clone()))),
        None => {}
    }
    if core.txns.is_foreign_pending(db, key, txn) {
        return Ok(None);
    }
    Ok(tree_lookup(core, db, key)?.map(EntryRecords::Tree))
}

/// Next visible entry after `after` (or the first one), merging the
/// committed tree with the transaction's op-log. With `skip_conflicts`
/// false, a foreign-pending candidate raises `TxnConflict` instead of being
/// stepped over.
fn merged_next(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    after: Option<&[u8]>,
    skip_conflicts: bool,
) -> Result<Option<MergedEntry>> {
    let cmp = db_tree(core, db)?.spec.cmp;

    // Tree side: skip keys the op-log already decides, and (in scan mode)
    // keys pending under another transaction.
    let mut probe = after.map(<[u8]>::to_vec);
    let tree_candidate = loop {
        let hit = {
            let open = core
                .open_dbs
                .get(&db)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            match &probe {
                None => open.tree.first(&mut core.pager, &mut core.blobs)?,
                Some(key) => open.tree.successor(&mut core.pager, &mut core.blobs, key)?,
            }
        };
        match hit {
            None => break None,
            Some((key, payload)) => {
                if view_state(core, db, txn, &key).is_some() {
                    probe = Some(key);
                    continue;
                }
                if core.txns.is_foreign_pending(db, &key, txn) {
                    if !skip_conflicts {
                        return Err(Error::new(ErrorKind::TxnConflict));
                    }
                    probe = Some(key);
                    continue;
                }
                break Some((key, payload));
            }
        }
    };

    // Op-log side: the transaction's own writes, erased keys excluded.
    let view_candidate: Option<(Vec<u8>, Vec<Vec<u8>>)> = if let Some(txn_id) = txn {
        let mut probe = after.map(<[u8]>::to_vec);
        loop {
            let next = match core.txns.get(txn_id)?.view(db) {
                None => break None,
                Some(view) => view.next_after(probe.as_deref(), &cmp)?.cloned(),
            };
            match next {
                None => break None,
                Some(key) => match view_state(core, db, txn, &key) {
                    Some(KeyState::Put(records)) => break Some((key, records.clone())),
                    _ => {
                        probe = Some(key);
                        continue;
                    }
                },
            }
        }
    } else {
        None
    };

    Ok(match (tree_candidate, view_candidate) {
        (None, None) => None,
        (Some((key, payload)), None) => {
            Some(MergedEntry { key, records: EntryRecords::Tree(payload) })
        }
        (None, Some((key, records))) => {
            Some(MergedEntry { key, records: EntryRecords::View(records) })
        }
        (Some((tree_key, payload)), Some((view_key, records))) => {
            // The tree side skipped op-log keys, so the two never tie.
            if cmp.compare(&tree_key, &view_key)? == std::cmp::Ordering::Less {
                Some(MergedEntry { key: tree_key, records: EntryRecords::Tree(payload) })
            } else {
                Some(MergedEntry { key: view_key, records: EntryRecords::View(records) })
            }
        }
    })
}

/// Mirror image of [`merged_next`].
fn merged_prev(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    before: Option<&[u8]>,
    skip_conflicts: bool,
) -> Result<Option<MergedEntry>> {
    let cmp = db_tree(core, db)?.spec.cmp;

    let mut probe = before.map(<[u8]>::to_vec);
    let tree_candidate = loop {
        let hit = {
            let open = core
                .open_dbs
                .get(&db)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            match &probe {
                None => open.tree.last(&mut core.pager, &mut core.blobs)?,
                Some(key) => open.tree.predecessor(&mut core.pager, &mut core.blobs, key)?,
            }
        };
        match hit {
            None => break None,
            Some((key, payload)) => {
                if view_state(core, db, txn, &key).is_some() {
                    probe = Some(key);
                    continue;
                }
                if core.txns.is_foreign_pending(db, &key, txn) {
                    if !skip_conflicts {
                        return Err(Error::new(ErrorKind::TxnConflict));
                    }
                    probe = Some(key);
                    continue;
                }
                break Some((key, payload));
            }
        }
    };

    let view_candidate: Option<(Vec<u8>, Vec<Vec<u8>>)> = if let Some(txn_id) = txn {
        let mut probe = before.map(<[u8]>::to_vec);
        loop {
            let prev = match core.txns.get(txn_id)?.view(db) {
                None => break None,
                Some(view) => view.prev_before(probe.as_deref(), &cmp)?.cloned(),
            };
            match prev {
                None => break None,
                Some(key) => match view_state(core, db, txn, &key) {
                    Some(KeyState::Put(records)) => break Some((key, records.clone())),
                    _ => {
                        probe = Some(key);
                        continue;
                    }
                },
            }
        }
    } else {
        None
    };

    Ok(match (tree_candidate, view_candidate) {
        (None, None) => None,
        (Some((key, payload)), None) => {
            Some(MergedEntry { key, records: EntryRecords::Tree(payload) })
        }
        (None, Some((key, records))) => {
            Some(MergedEntry { key, records: EntryRecords::View(records) })
        }
        (Some((tree_key, payload)), Some((view_key, records))) => {
            if cmp.compare(&tree_key, &view_key)? == std::cmp::Ordering::Greater {
                Some(MergedEntry { key: tree_key, records: EntryRecords::Tree(payload) })
            } else {
                Some(MergedEntry { key: view_key, records: EntryRecords::View(records) })
            }
        }
    })
}

fn record_at(core: &mut EnvCore, db: DbName, records: &EntryRecords, idx: u32) -> Result<Vec<u8>> {
    match records {
        EntryRecords::View(list) => list
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound)),
        EntryRecords::Tree(payload) => {
            let refs = {
                let open = core
                    .open_dbs
                    .get(&db)
                    .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
                open.tree.payload_records(&mut core.pager, payload)?
            };
            let rec = refs.get(idx as usize).ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
            let open = core
                .open_dbs
                .get(&db)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            open.tree.read_record(&mut core.pager, &mut core.blobs, rec)
        }
    }
}

fn record_size_at(core: &mut EnvCore, db: DbName, records: &EntryRecords, idx: u32) -> Result<u32> {
    match records {
        EntryRecords::View(list) => list
            .get(idx as usize)
            .map(|r| r.len() as u32)
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound)),
        EntryRecords::Tree(payload) => {
            let open = core
                .open_dbs
                .get(&db)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            let refs = open.tree.payload_records(&mut core.pager, payload)?;
            refs.get(idx as usize)
                .map(|r| r.size())
                .ok_or_else(|| Error::new(ErrorKind::KeyNotFound))
        }
    }
}

// ============================================================================
// Write path shared by Database and Cursor
// ============================================================================

fn insert_inner(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
    dup_at: Option<u32>,
) -> Result<()> {
    core.writable()?;
    {
        let spec = &db_tree(core, db)?.spec;
        spec.check_key(key)?;
        spec.check_record(record)?;
    }

    if !core.transactions_enabled() {
        let open = core
            .open_dbs
            .get_mut(&db)
            .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
        open.tree.insert(&mut core.pager, &mut core.blobs, key, record, flags, dup_at)?;
        let root = open.tree.root;
        return core.note_root(db, root);
    }

    let (txn_id, temporary) = match txn {
        Some(id) => (id, false),
        None => (core.txns.begin(TxnFlags::TEMPORARY), true),
    };
    let result = buffer_insert(core, db, txn_id, key, record, flags);
    match (result, temporary) {
        (Ok(()), true) => core.commit_txn(txn_id),
        (Ok(()), false) => Ok(()),
        (Err(err), true) => {
            let _ = core.abort_txn(txn_id);
            Err(err)
        }
        (Err(err), false) => Err(err),
    }
}

fn buffer_insert(
    core: &mut EnvCore,
    db: DbName,
    txn_id: TxnId,
    key: &[u8],
    record: &[u8],
    flags: InsertFlags,
) -> Result<()> {
    let dup_flags = InsertFlags::DUPLICATE
        | InsertFlags::DUPLICATE_INSERT_FIRST
        | InsertFlags::DUPLICATE_INSERT_LAST
        | InsertFlags::DUPLICATE_INSERT_BEFORE
        | InsertFlags::DUPLICATE_INSERT_AFTER;
    let exists = match view_state(core, db, Some(txn_id), key) {
        Some(KeyState::Put(_)) => true,
        Some(KeyState::Erased) => false,
        None => {
            core.txns.check_access(db, key, Some(txn_id))?;
            tree_lookup(core, db, key)?.is_some()
        }
    };
    if exists && !flags.intersects(InsertFlags::OVERWRITE | dup_flags) {
        return Err(Error::new(ErrorKind::DuplicateKey));
    }
    if flags.intersects(dup_flags)
        && !db_tree(core, db)?.spec.flags.contains(DbFlags::ENABLE_DUPLICATE_KEYS)
    {
        return Err(Error::with_detail(
            ErrorKind::InvalidParameter,
            "duplicate flags on a database without duplicates",
        ));
    }
    let cmp = db_tree(core, db)?.spec.cmp;
    core.txns.record(
        txn_id,
        TxnOp {
            db,
            kind: TxnOpKind::Insert(flags),
            key: key.to_vec(),
            record: record.to_vec(),
        },
        &cmp,
    )
}

fn erase_inner(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    key: &[u8],
    dup_at: Option<u32>,
    flags: EraseFlags,
) -> Result<()> {
    core.writable()?;
    db_tree(core, db)?.spec.check_key(key)?;

    if !core.transactions_enabled() {
        let open = core
            .open_dbs
            .get_mut(&db)
            .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
        open.tree.erase(&mut core.pager, &mut core.blobs, key, dup_at, flags)?;
        let root = open.tree.root;
        return core.note_root(db, root);
    }

    let (txn_id, temporary) = match txn {
        Some(id) => (id, false),
        None => (core.txns.begin(TxnFlags::TEMPORARY), true),
    };
    let result = (|| {
        let exists = match view_state(core, db, Some(txn_id), key) {
            Some(KeyState::Put(_)) => true,
            Some(KeyState::Erased) => false,
            None => {
                core.txns.check_access(db, key, Some(txn_id))?;
                tree_lookup(core, db, key)?.is_some()
            }
        };
        if !exists {
            return Err(Error::new(ErrorKind::KeyNotFound));
        }
        let cmp = db_tree(core, db)?.spec.cmp;
        core.txns.record(
            txn_id,
            TxnOp { db, kind: TxnOpKind::Erase(flags), key: key.to_vec(), record: Vec::new() },
            &cmp,
        )
    })();
    match (result, temporary) {
        (Ok(()), true) => core.commit_txn(txn_id),
        (Ok(()), false) => Ok(()),
        (Err(err), true) => {
            let _ = core.abort_txn(txn_id);
            Err(err)
        }
        (Err(err), false) => Err(err),
    }
}

fn find_first_record(
    core: &mut EnvCore,
    db: DbName,
    txn: Option<TxnId>,
    key: &[u8],
) -> Result<Vec<u8>> {
    db_tree(core, db)?.spec.check_key(key)?;
    match view_state(core, db, txn, key) {
        Some(KeyState::Put(records)) => return Ok(records[0].clone()),
        Some(KeyState::Erased) => return Err(Error::new(ErrorKind::KeyNotFound)),
        None => {}
    }
    if core.transactions_enabled() {
        core.txns.check_access(db, key, txn)?;
    }
    let payload =
        tree_lookup(core, db, key)?.ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
    record_at(core, db, &EntryRecords::Tree(payload), 0)
}

// ============================================================================
// Database
// ============================================================================

impl Database {
    pub(crate) fn new(core: Arc<Mutex<EnvCore>>, name: DbName) -> Self {
        Database { core, name }
    }

    pub fn name(&self) -> DbName {
        self.name
    }

    fn recno_key(&self, core: &mut EnvCore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = core.slot(self.name)?;
        let width = if slot.flags.contains(DbFlags::RECORD_NUMBER32) {
            4
        } else if slot.flags.contains(DbFlags::RECORD_NUMBER64) {
            8
        } else {
            return Ok(None);
        };
        if key.is_empty() {
            let assigned = core.next_recno(self.name)?;
            if width == 4 {
                if assigned > u32::MAX as u64 {
                    return Err(Error::new(ErrorKind::LimitsReached));
                }
                return Ok(Some((assigned as u32).to_le_bytes().to_vec()));
            }
            return Ok(Some(assigned.to_le_bytes().to_vec()));
        }
        if key.len() != width {
            return Err(Error::new(ErrorKind::InvalidKeySize));
        }
        let value = if width == 4 {
            u32::from_le_bytes([key[0], key[1], key[2], key[3]]) as u64
        } else {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(key);
            u64::from_le_bytes(buf)
        };
        core.bump_recno(self.name, value)?;
        Ok(Some(key.to_vec()))
    }

    /// Insert a key/record pair.
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let mut core = self.core.lock();
        let key = match self.recno_key(&mut core, key)? {
            Some(assigned) => assigned,
            None => key.to_vec(),
        };
        insert_inner(&mut core, self.name, txn.map(|t| t.id), &key, record, flags, None)
    }

    /// Insert into a record-number database, returning the assigned key.
    pub fn insert_recno(&self, txn: Option<&Transaction>, record: &[u8]) -> Result<u64> {
        let mut core = self.core.lock();
        let slot = core.slot(self.name)?;
        if !slot
            .flags
            .intersects(DbFlags::RECORD_NUMBER32 | DbFlags::RECORD_NUMBER64)
        {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "not a record-number database",
            ));
        }
        let key = self.recno_key(&mut core, &[])?.expect("record-number database");
        insert_inner(&mut core, self.name, txn.map(|t| t.id), &key, record, InsertFlags::empty(), None)?;
        let mut buf = [0u8; 8];
        buf[..key.len()].copy_from_slice(&key);
        Ok(u64::from_le_bytes(buf))
    }

    /// Exact lookup; returns the record (the first duplicate for duplicate
    /// keys).
    pub fn find(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Vec<u8>> {
        let mut core = self.core.lock();
        find_first_record(&mut core, self.name, txn.map(|t| t.id), key)
    }

    /// Lookup with approximate matching; returns the matched key and record.
    pub fn find_approx(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut core = self.core.lock();
        let txn = txn.map(|t| t.id);
        if flags.is_empty() {
            let record = find_first_record(&mut core, self.name, txn, key)?;
            return Ok((key.to_vec(), record));
        }
        if flags.intersects(FindFlags::LEQ | FindFlags::GEQ) {
            match find_first_record(&mut core, self.name, txn, key) {
                Ok(record) => return Ok((key.to_vec(), record)),
                Err(err) if err.kind() == ErrorKind::KeyNotFound => {}
                Err(err) => return Err(err),
            }
        }
        // The lower neighbor wins the `near` tie-break.
        if flags.intersects(FindFlags::LT | FindFlags::LEQ) {
            if let Some(entry) = merged_prev(&mut core, self.name, txn, Some(key), false)? {
                let record = record_at(&mut core, self.name, &entry.records, 0)?;
                return Ok((entry.key, record));
            }
        }
        if flags.intersects(FindFlags::GT | FindFlags::GEQ) {
            if let Some(entry) = merged_next(&mut core, self.name, txn, Some(key), false)? {
                let record = record_at(&mut core, self.name, &entry.records, 0)?;
                return Ok((entry.key, record));
            }
        }
        Err(Error::new(ErrorKind::KeyNotFound))
    }

    /// Copy the record into a caller-provided buffer, returning its length.
    /// Fails with `LimitsReached` when the buffer is too small.
    pub fn find_into(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        buf: &mut [u8],
    ) -> Result<usize> {
        let record = self.find(txn, key)?;
        if record.len() > buf.len() {
            return Err(Error::with_detail(
                ErrorKind::LimitsReached,
                format!("record of {} bytes exceeds the buffer", record.len()),
            ));
        }
        buf[..record.len()].copy_from_slice(&record);
        Ok(record.len())
    }

    /// Erase a key (and all its duplicates).
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<()> {
        let mut core = self.core.lock();
        erase_inner(&mut core, self.name, txn.map(|t| t.id), key, None, EraseFlags::empty())
    }

    /// Number of records, or distinct keys when `distinct` is set.
    pub fn count(&self, txn: Option<&Transaction>, distinct: bool) -> Result<u64> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let txn = txn.map(|t| t.id);
        let mut total = {
            let open = core
                .open_dbs
                .get(&self.name)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            open.tree.count(&mut core.pager, distinct)?
        };
        // Adjust for this transaction's own uncommitted writes.
        if let Some(txn_id) = txn {
            let keys: Vec<Vec<u8>> = match core.txns.get(txn_id)?.view(self.name) {
                None => Vec::new(),
                Some(view) => {
                    let cmp = db_tree(core, self.name)?.spec.cmp;
                    let mut keys = Vec::new();
                    let mut probe: Option<Vec<u8>> = None;
                    while let Some(key) = view.next_after(probe.as_deref(), &cmp)?.cloned() {
                        keys.push(key.clone());
                        probe = Some(key);
                    }
                    keys
                }
            };
            for key in keys {
                let committed = tree_lookup(core, self.name, &key)?;
                let state = view_state(core, self.name, txn, &key).cloned();
                match state {
                    Some(KeyState::Erased) => {
                        if let Some(payload) = committed {
                            total -= if distinct { 1 } else { payload.record_count() };
                        }
                    }
                    Some(KeyState::Put(records)) => match committed {
                        Some(payload) => {
                            if !distinct {
                                total = total - payload.record_count() + records.len() as u64;
                            }
                        }
                        None => {
                            total += if distinct { 1 } else { records.len() as u64 };
                        }
                    },
                    None => {}
                }
            }
        }
        Ok(total)
    }

    /// Structural verification of the database's tree.
    pub fn check_integrity(&self) -> Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let open = core
            .open_dbs
            .get(&self.name)
            .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
        open.tree.check_integrity(&mut core.pager, &mut core.blobs)
    }

    /// Database parameter query.
    pub fn parameters(&self) -> Result<DbParameters> {
        let core = self.core.lock();
        core.db_parameters(self.name)
    }

    /// Open a cursor, optionally bound to a transaction.
    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        let mut core = self.core.lock();
        if !core.open_dbs.contains_key(&self.name) {
            return Err(Error::new(ErrorKind::DatabaseNotFound));
        }
        let txn_id = txn.map(|t| t.id);
        let id = core.next_cursor;
        core.next_cursor += 1;
        if let Some(txn_id) = txn_id {
            core.txns.attach_cursor(txn_id, id)?;
        }
        core.cursors.insert(
            id,
            CursorState { db: self.name, txn: txn_id, key: None, dup: 0 },
        );
        Ok(Cursor { core: self.core.clone(), id, db: self.name, txn: txn_id })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        if let Err(err) = core.close_db(self.name) {
            log::warn!("closing database {}: {err}", self.name);
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

impl Cursor {
    fn state(&self, core: &EnvCore) -> Result<CursorState> {
        core.cursors
            .get(&self.id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter))
    }

    fn set_state(&self, core: &mut EnvCore, key: Option<Vec<u8>>, dup: u32) {
        if let Some(state) = core.cursors.get_mut(&self.id) {
            state.key = key;
            state.dup = dup;
        }
    }

    /// Move the cursor and return the key/record it lands on, or `None`
    /// when the run is exhausted.
    pub fn move_to(
        &self,
        direction: CursorMove,
        flags: MoveFlags,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let skip_dups = flags.contains(MoveFlags::SKIP_DUPLICATES);
        let only_dups = flags.contains(MoveFlags::ONLY_DUPLICATES);

        // Without a transaction layer there is nothing to merge; the tree
        // cursor steps the committed view directly.
        if !core.transactions_enabled() {
            return self.move_committed(core, state, direction, skip_dups, only_dups);
        }

        let landed: Option<(Vec<u8>, EntryRecords, u32)> = match direction {
            CursorMove::First => merged_next(core, self.db, self.txn, None, false)?
                .map(|e| (e.key, e.records, 0)),
            CursorMove::Last => merged_prev(core, self.db, self.txn, None, false)?
                .map(|e| {
                    let dup = e.records.count().saturating_sub(1) as u32;
                    (e.key, e.records, dup)
                }),
            CursorMove::Next => match &state.key {
                None => merged_next(core, self.db, self.txn, None, true)?
                    .map(|e| (e.key, e.records, 0)),
                Some(current) => {
                    let mut landed = None;
                    if !skip_dups {
                        if let Some(records) = current_entry(core, self.db, self.txn, current)? {
                            if (state.dup as u64) + 1 < records.count() {
                                landed = Some((current.clone(), records, state.dup + 1));
                            }
                        }
                    }
                    if landed.is_none() && only_dups {
                        return Ok(None);
                    }
                    match landed {
                        Some(l) => Some(l),
                        None => merged_next(core, self.db, self.txn, Some(current.as_slice()), true)?
                            .map(|e| (e.key, e.records, 0)),
                    }
                }
            },
            CursorMove::Previous => match &state.key {
                None => merged_prev(core, self.db, self.txn, None, true)?.map(|e| {
                    let dup = e.records.count().saturating_sub(1) as u32;
                    (e.key, e.records, dup)
                }),
                Some(current) => {
                    let mut landed = None;
                    if !skip_dups && state.dup > 0 {
                        if let Some(records) = current_entry(core, self.db, self.txn, current)? {
                            landed = Some((current.clone(), records, state.dup - 1));
                        }
                    }
                    if landed.is_none() && only_dups {
                        return Ok(None);
                    }
                    match landed {
                        Some(l) => Some(l),
                        None => merged_prev(core, self.db, self.txn, Some(current.as_slice()), true)?
                            .map(|e| {
                                let dup =
                                    if skip_dups { 0 } else { e.records.count().saturating_sub(1) as u32 };
                                (e.key, e.records, dup)
                            }),
                    }
                }
            },
        };

        match landed {
            None => {
                self.set_state(core, None, 0);
                Ok(None)
            }
            Some((key, records, dup)) => {
                let record = record_at(core, self.db, &records, dup)?;
                self.set_state(core, Some(key.clone()), dup);
                Ok(Some((key, record)))
            }
        }
    }

    /// Committed-only movement through the tree-side cursor.
    fn move_committed(
        &self,
        core: &mut EnvCore,
        state: CursorState,
        direction: CursorMove,
        skip_dups: bool,
        only_dups: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut tree_cursor = TreeCursor { key: state.key, dup: state.dup };
        let hit = {
            let open = core
                .open_dbs
                .get(&self.db)
                .ok_or_else(|| Error::new(ErrorKind::DatabaseNotFound))?;
            let tree = &open.tree;
            match direction {
                CursorMove::First => {
                    tree_cursor.seek_first(tree, &mut core.pager, &mut core.blobs)?
                }
                CursorMove::Last => tree_cursor.seek_last(tree, &mut core.pager, &mut core.blobs)?,
                CursorMove::Next => tree_cursor.next(
                    tree,
                    &mut core.pager,
                    &mut core.blobs,
                    skip_dups,
                    only_dups,
                )?,
                CursorMove::Previous => tree_cursor.prev(
                    tree,
                    &mut core.pager,
                    &mut core.blobs,
                    skip_dups,
                    only_dups,
                )?,
            }
        };
        match hit {
            None => {
                if !only_dups {
                    self.set_state(core, None, 0);
                }
                Ok(None)
            }
            Some(hit) => {
                let record = record_at(core, self.db, &EntryRecords::Tree(hit.payload), hit.dup)?;
                self.set_state(core, Some(hit.key.clone()), hit.dup);
                Ok(Some((hit.key, record)))
            }
        }
    }

    /// Position the cursor on a key. Approximate flags position on the
    /// neighbor per the `find` contract.
    pub fn find(&self, key: &[u8], flags: FindFlags) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut core = self.core.lock();
        let core = &mut *core;
        db_tree(core, self.db)?.spec.check_key(key)?;

        if flags.is_empty() || flags.intersects(FindFlags::LEQ | FindFlags::GEQ) {
            match view_state(core, self.db, self.txn, key) {
                Some(KeyState::Put(records)) => {
                    let record = records[0].clone();
                    self.set_state(core, Some(key.to_vec()), 0);
                    return Ok((key.to_vec(), record));
                }
                Some(KeyState::Erased) if flags.is_empty() => {
                    return Err(Error::new(ErrorKind::KeyNotFound))
                }
                _ => {}
            }
            if core.transactions_enabled() {
                core.txns.check_access(self.db, key, self.txn)?;
            }
            if let Some(payload) = tree_lookup(core, self.db, key)? {
                if view_state(core, self.db, self.txn, key).is_none() {
                    let record = record_at(core, self.db, &EntryRecords::Tree(payload), 0)?;
                    self.set_state(core, Some(key.to_vec()), 0);
                    return Ok((key.to_vec(), record));
                }
            }
            if flags.is_empty() {
                return Err(Error::new(ErrorKind::KeyNotFound));
            }
        }
        if flags.intersects(FindFlags::LT | FindFlags::LEQ) {
            if let Some(entry) = merged_prev(core, self.db, self.txn, Some(key), false)? {
                let record = record_at(core, self.db, &entry.records, 0)?;
                self.set_state(core, Some(entry.key.clone()), 0);
                return Ok((entry.key, record));
            }
        }
        if flags.intersects(FindFlags::GT | FindFlags::GEQ) {
            if let Some(entry) = merged_next(core, self.db, self.txn, Some(key), false)? {
                let record = record_at(core, self.db, &entry.records, 0)?;
                self.set_state(core, Some(entry.key.clone()), 0);
                return Ok((entry.key, record));
            }
        }
        Err(Error::new(ErrorKind::KeyNotFound))
    }

    /// Insert through the cursor; duplicate-position flags are relative to
    /// the cursor's current duplicate.
    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let dup_at = state.key.as_deref().and_then(|current| {
            if current == key {
                Some(state.dup)
            } else {
                None
            }
        });
        insert_inner(core, self.db, self.txn, key, record, flags, dup_at)?;

        // Re-position on the inserted record.
        let dup = if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            0
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
            dup_at.unwrap_or(0)
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
            dup_at.map(|d| d + 1).unwrap_or(0)
        } else if flags.intersects(InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_LAST) {
            match current_entry(core, self.db, self.txn, key)? {
                Some(records) => records.count().saturating_sub(1) as u32,
                None => 0,
            }
        } else {
            0
        };
        self.set_state(core, Some(key.to_vec()), dup);
        Ok(())
    }

    /// Replace the record under the cursor.
    pub fn overwrite(&self, record: &[u8]) -> Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let key = state.key.clone().ok_or_else(|| Error::new(ErrorKind::CursorIsNil))?;
        insert_inner(
            core,
            self.db,
            self.txn,
            &key,
            record,
            InsertFlags::OVERWRITE,
            Some(state.dup),
        )
    }

    /// Erase the positioned record (or the whole key with
    /// `EraseFlags::ALL_DUPLICATES`). The cursor goes nil.
    pub fn erase(&self, flags: EraseFlags) -> Result<()> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let key = state.key.clone().ok_or_else(|| Error::new(ErrorKind::CursorIsNil))?;
        erase_inner(core, self.db, self.txn, &key, Some(state.dup), flags)?;
        self.set_state(core, None, 0);
        Ok(())
    }

    /// Current key bytes.
    pub fn key(&self) -> Result<Vec<u8>> {
        let core = self.core.lock();
        let state = self.state(&core)?;
        state.key.ok_or_else(|| Error::new(ErrorKind::CursorIsNil))
    }

    /// Current record bytes.
    pub fn record(&self) -> Result<Vec<u8>> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let key = state.key.ok_or_else(|| Error::new(ErrorKind::CursorIsNil))?;
        let records = current_entry(core, self.db, self.txn, &key)?
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
        record_at(core, self.db, &records, state.dup)
    }

    /// Number of duplicates of the current key.
    pub fn duplicate_count(&self) -> Result<u64> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let key = state.key.ok_or_else(|| Error::new(ErrorKind::CursorIsNil))?;
        let records = current_entry(core, self.db, self.txn, &key)?
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
        Ok(records.count())
    }

    /// Index of the positioned duplicate within its group.
    pub fn duplicate_position(&self) -> Result<u32> {
        let core = self.core.lock();
        let state = self.state(&core)?;
        if state.key.is_none() {
            return Err(Error::new(ErrorKind::CursorIsNil));
        }
        Ok(state.dup)
    }

    /// Length of the positioned record without copying it out.
    pub fn record_size(&self) -> Result<u32> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let state = self.state(core)?;
        let key = state.key.ok_or_else(|| Error::new(ErrorKind::CursorIsNil))?;
        let records = current_entry(core, self.db, self.txn, &key)?
            .ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
        record_size_at(core, self.db, &records, state.dup)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        core.cursors.remove(&self.id);
        if let Some(txn_id) = self.txn {
            core.txns.detach_cursor(txn_id, self.id);
        }
    }
}
