//! Transaction manager
//!
//! Transactions are an in-process construct: each carries an ordered op-log
//! that stays private until commit, plus a per-database view of its own
//! writes so reads observe program order. Key-level conflict detection goes
//! through a pending-write map: the first active transaction to touch a key
//! owns it until it resolves.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::compare::KeyCompare;
use crate::error::{Error, ErrorKind, Result};
use crate::types::{CursorId, DbName, EraseFlags, InsertFlags, TxnFlags, TxnId};

/// One logged operation, kept in program order for the journal and the
/// commit-time btree application.
#[derive(Debug, Clone)]
pub struct TxnOp {
    pub db: DbName,
    pub kind: TxnOpKind,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOpKind {
    Insert(InsertFlags),
    Erase(EraseFlags),
}

/// Latest state of a key inside one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyState {
    /// Records this transaction wrote, in duplicate order.
    Put(Vec<Vec<u8>>),
    Erased,
}

/// Per-database view of a transaction's own writes.
#[derive(Debug, Default)]
pub struct TxnDbView {
    states: HashMap<Vec<u8>, KeyState>,
    /// Keys in comparator order, for merging with committed cursor scans.
    ordered: Vec<Vec<u8>>,
}

impl TxnDbView {
    pub fn state_of(&self, key: &[u8]) -> Option<&KeyState> {
        self.states.get(key)
    }

    fn position(&self, key: &[u8], cmp: &KeyCompare) -> Result<(usize, bool)> {
        let mut lo = 0usize;
        let mut hi = self.ordered.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(&self.ordered[mid], key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, true)),
            }
        }
        Ok((lo, false))
    }

    fn record(&mut self, key: &[u8], state: KeyState, cmp: &KeyCompare) -> Result<()> {
        if !self.states.contains_key(key) {
            let (pos, exact) = self.position(key, cmp)?;
            debug_assert!(!exact);
            self.ordered.insert(pos, key.to_vec());
        }
        self.states.insert(key.to_vec(), state);
        Ok(())
    }

    /// Smallest logged key strictly greater than `after` (or the smallest
    /// overall when `after` is `None`).
    pub fn next_after(&self, after: Option<&[u8]>, cmp: &KeyCompare) -> Result<Option<&Vec<u8>>> {
        let idx = match after {
            None => 0,
            Some(key) => {
                let (pos, exact) = self.position(key, cmp)?;
                if exact {
                    pos + 1
                } else {
                    pos
                }
            }
        };
        Ok(self.ordered.get(idx))
    }

    /// Largest logged key strictly less than `before` (or the largest
    /// overall when `before` is `None`).
    pub fn prev_before(&self, before: Option<&[u8]>, cmp: &KeyCompare) -> Result<Option<&Vec<u8>>> {
        let idx = match before {
            None => self.ordered.len(),
            Some(key) => self.position(key, cmp)?.0,
        };
        if idx == 0 {
            return Ok(None);
        }
        Ok(self.ordered.get(idx - 1))
    }
}

/// An active transaction.
#[derive(Debug)]
pub struct Txn {
    pub id: TxnId,
    pub flags: TxnFlags,
    pub ops: Vec<TxnOp>,
    views: HashMap<DbName, TxnDbView>,
    pub cursors: HashSet<CursorId>,
}

impl Txn {
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(TxnFlags::READ_ONLY)
    }

    pub fn view(&self, db: DbName) -> Option<&TxnDbView> {
        self.views.get(&db)
    }

    /// Apply one operation to the transaction's private view.
    fn fold_into_view(&mut self, op: &TxnOp, cmp: &KeyCompare) -> Result<()> {
        let view = self.views.entry(op.db).or_default();
        match op.kind {
            TxnOpKind::Erase(_) => view.record(&op.key, KeyState::Erased, cmp)?,
            TxnOpKind::Insert(flags) => {
                let dup = flags.intersects(
                    InsertFlags::DUPLICATE
                        | InsertFlags::DUPLICATE_INSERT_FIRST
                        | InsertFlags::DUPLICATE_INSERT_LAST
                        | InsertFlags::DUPLICATE_INSERT_BEFORE
                        | InsertFlags::DUPLICATE_INSERT_AFTER,
                );
                let state = match (view.states.get(&op.key), dup) {
                    (Some(KeyState::Put(records)), true) => {
                        let mut records = records.clone();
                        if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
                            records.insert(0, op.record.clone());
                        } else {
                            records.push(op.record.clone());
                        }
                        KeyState::Put(records)
                    }
                    _ => KeyState::Put(vec![op.record.clone()]),
                };
                view.record(&op.key, state, cmp)?;
            }
        }
        Ok(())
    }
}

/// All active transactions plus the pending-write conflict map.
#[derive(Debug, Default)]
pub struct TxnManager {
    next_id: TxnId,
    active: HashMap<TxnId, Txn>,
    pending: HashMap<(DbName, Vec<u8>), TxnId>,
}

impl TxnManager {
    pub fn new() -> Self {
        TxnManager { next_id: 1, active: HashMap::new(), pending: HashMap::new() }
    }

    pub fn begin(&mut self, flags: TxnFlags) -> TxnId {
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            id,
            Txn { id, flags, ops: Vec::new(), views: HashMap::new(), cursors: HashSet::new() },
        );
        id
    }

    pub fn get(&self, id: TxnId) -> Result<&Txn> {
        self.active.get(&id).ok_or_else(|| Error::new(ErrorKind::InvalidParameter))
    }

    pub fn get_mut(&mut self, id: TxnId) -> Result<&mut Txn> {
        self.active.get_mut(&id).ok_or_else(|| Error::new(ErrorKind::InvalidParameter))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Fail with `TxnConflict` when another active transaction has a pending
    /// write on the key.
    pub fn check_access(&self, db: DbName, key: &[u8], reader: Option<TxnId>) -> Result<()> {
        match self.pending.get(&(db, key.to_vec())) {
            Some(&owner) if Some(owner) != reader => Err(Error::new(ErrorKind::TxnConflict)),
            _ => Ok(()),
        }
    }

    /// True when the key has a pending write by some other transaction;
    /// cursor scans use this to skip rather than fail.
    pub fn is_foreign_pending(&self, db: DbName, key: &[u8], reader: Option<TxnId>) -> bool {
        matches!(self.pending.get(&(db, key.to_vec())), Some(&owner) if Some(owner) != reader)
    }

    /// Log an operation: conflict-check the key, claim it, append to the
    /// op-log and fold it into the transaction's view.
    pub fn record(&mut self, txn_id: TxnId, op: TxnOp, cmp: &KeyCompare) -> Result<()> {
        self.check_access(op.db, &op.key, Some(txn_id))?;
        let txn = self.get_mut(txn_id)?;
        if txn.is_read_only() {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        txn.fold_into_view(&op, cmp)?;
        let claim = (op.db, op.key.clone());
        txn.ops.push(op);
        self.pending.insert(claim, txn_id);
        Ok(())
    }

    fn release_claims(&mut self, txn: &Txn) {
        for op in &txn.ops {
            if self.pending.get(&(op.db, op.key.clone())) == Some(&txn.id) {
                self.pending.remove(&(op.db, op.key.clone()));
            }
        }
    }

    /// Remove the transaction for commit; the caller applies the op-log.
    /// Open cursors must be closed first.
    pub fn take_for_commit(&mut self, id: TxnId) -> Result<Txn> {
        let txn = self.get(id)?;
        if !txn.cursors.is_empty() {
            return Err(Error::new(ErrorKind::CursorStillOpen));
        }
        let txn = self.active.remove(&id).expect("checked above");
        self.release_claims(&txn);
        Ok(txn)
    }

    /// Remove the transaction for abort; its effects are discarded.
    pub fn take_for_abort(&mut self, id: TxnId) -> Result<Txn> {
        self.take_for_commit(id)
    }

    /// Register a cursor with its owning transaction.
    pub fn attach_cursor(&mut self, id: TxnId, cursor: CursorId) -> Result<()> {
        self.get_mut(id)?.cursors.insert(cursor);
        Ok(())
    }

    pub fn detach_cursor(&mut self, id: TxnId, cursor: CursorId) {
        if let Some(txn) = self.active.get_mut(&id) {
            txn.cursors.remove(&cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_op(db: DbName, key: &[u8], record: &[u8]) -> TxnOp {
        TxnOp {
            db,
            kind: TxnOpKind::Insert(InsertFlags::empty()),
            key: key.to_vec(),
            record: record.to_vec(),
        }
    }

    fn erase_op(db: DbName, key: &[u8]) -> TxnOp {
        TxnOp { db, kind: TxnOpKind::Erase(EraseFlags::empty()), key: key.to_vec(), record: Vec::new() }
    }

    #[test]
    fn test_own_writes_visible_in_order() {
        let mut mgr = TxnManager::new();
        let cmp = KeyCompare::Memcmp;
        let txn = mgr.begin(TxnFlags::empty());

        mgr.record(txn, insert_op(1, b"k", b"v1"), &cmp).unwrap();
        mgr.record(txn, insert_op(1, b"k", b"v2"), &cmp).unwrap();
        let view = mgr.get(txn).unwrap().view(1).unwrap();
        assert_eq!(view.state_of(b"k"), Some(&KeyState::Put(vec![b"v2".to_vec()])));

        mgr.record(txn, erase_op(1, b"k"), &cmp).unwrap();
        let view = mgr.get(txn).unwrap().view(1).unwrap();
        assert_eq!(view.state_of(b"k"), Some(&KeyState::Erased));
        assert_eq!(mgr.get(txn).unwrap().ops.len(), 3);
    }

    #[test]
    fn test_conflict_between_transactions() {
        let mut mgr = TxnManager::new();
        let cmp = KeyCompare::Memcmp;
        let t1 = mgr.begin(TxnFlags::empty());
        let t2 = mgr.begin(TxnFlags::empty());

        mgr.record(t1, insert_op(1, b"k", b"v"), &cmp).unwrap();
        let err = mgr.record(t2, insert_op(1, b"k", b"other"), &cmp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TxnConflict);

        // Reads of the pending key conflict too, but not for the owner.
        assert_eq!(mgr.check_access(1, b"k", Some(t2)).unwrap_err().kind(), ErrorKind::TxnConflict);
        assert_eq!(mgr.check_access(1, b"k", None).unwrap_err().kind(), ErrorKind::TxnConflict);
        assert!(mgr.check_access(1, b"k", Some(t1)).is_ok());

        // A different key does not conflict.
        mgr.record(t2, insert_op(1, b"other", b"v"), &cmp).unwrap();

        // Resolution releases the claim.
        let committed = mgr.take_for_commit(t1).unwrap();
        assert_eq!(committed.ops.len(), 1);
        assert!(mgr.check_access(1, b"k", Some(t2)).is_ok());
        mgr.record(t2, insert_op(1, b"k", b"now fine"), &cmp).unwrap();
    }

    #[test]
    fn test_ordered_view_merging() {
        let mut mgr = TxnManager::new();
        let cmp = KeyCompare::Memcmp;
        let txn = mgr.begin(TxnFlags::empty());
        for key in [b"d", b"a", b"c"] {
            mgr.record(txn, insert_op(1, key, b"v"), &cmp).unwrap();
        }
        let view = mgr.get(txn).unwrap().view(1).unwrap();
        assert_eq!(view.next_after(None, &cmp).unwrap().unwrap(), &b"a".to_vec());
        assert_eq!(view.next_after(Some(b"a".as_slice()), &cmp).unwrap().unwrap(), &b"c".to_vec());
        assert_eq!(view.next_after(Some(b"b".as_slice()), &cmp).unwrap().unwrap(), &b"c".to_vec());
        assert!(view.next_after(Some(b"d".as_slice()), &cmp).unwrap().is_none());
        assert_eq!(view.prev_before(None, &cmp).unwrap().unwrap(), &b"d".to_vec());
        assert_eq!(view.prev_before(Some(b"c".as_slice()), &cmp).unwrap().unwrap(), &b"a".to_vec());
        assert!(view.prev_before(Some(b"a".as_slice()), &cmp).unwrap().is_none());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut mgr = TxnManager::new();
        let cmp = KeyCompare::Memcmp;
        let txn = mgr.begin(TxnFlags::READ_ONLY);
        let err = mgr.record(txn, insert_op(1, b"k", b"v"), &cmp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteProtected);
    }

    #[test]
    fn test_open_cursor_blocks_commit() {
        let mut mgr = TxnManager::new();
        let txn = mgr.begin(TxnFlags::empty());
        mgr.attach_cursor(txn, 9).unwrap();
        assert_eq!(mgr.take_for_commit(txn).unwrap_err().kind(), ErrorKind::CursorStillOpen);
        mgr.detach_cursor(txn, 9);
        assert!(mgr.take_for_commit(txn).is_ok());
    }

    #[test]
    fn test_duplicate_accumulation_in_view() {
        let mut mgr = TxnManager::new();
        let cmp = KeyCompare::Memcmp;
        let txn = mgr.begin(TxnFlags::empty());
        let mut op = insert_op(1, b"k", b"A");
        op.kind = TxnOpKind::Insert(InsertFlags::DUPLICATE);
        mgr.record(txn, op.clone(), &cmp).unwrap();
        op.record = b"B".to_vec();
        mgr.record(txn, op.clone(), &cmp).unwrap();
        op.record = b"X".to_vec();
        op.kind = TxnOpKind::Insert(InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST);
        mgr.record(txn, op, &cmp).unwrap();

        let view = mgr.get(txn).unwrap().view(1).unwrap();
        assert_eq!(
            view.state_of(b"k"),
            Some(&KeyState::Put(vec![b"X".to_vec(), b"A".to_vec(), b"B".to_vec()]))
        );
    }
}
