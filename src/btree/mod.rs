//! B+tree index
//!
//! Ordered mapping from keys to record references. One tree per database;
//! the layout family is fixed at creation from the key/record schema. All
//! traversal is iterative with an explicit path or work stack.

pub mod cursor;
pub mod dupes;
pub mod node;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::blob::BlobManager;
use crate::compare::KeyCompare;
use crate::compress::Codec;
use crate::config::DbConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::page::PageKind;
use crate::storage::Pager;
use crate::types::{
    DbFlags, DbName, EraseFlags, FindFlags, InsertFlags, KeyType, PageId, RecordType,
    KEY_SIZE_UNLIMITED,
};

use node::{
    compact_capacity, InnerEntry, KeyRepr, Layout, LeafEntry, LeafPayload, Node, NodeBody,
    NodeSchema, RecordRef, DUP_TABLE_THRESHOLD, EXT_KEY_PREFIX, INLINE_RECORD_MAX, NODE_BODY_OFF,
};

// Process-wide tunable, deliberately not persisted.
static EXT_KEY_THRESHOLD: AtomicUsize = AtomicUsize::new(256);

/// Set the key length past which keys spill to an overflow blob.
pub fn set_extended_key_threshold(bytes: usize) {
    EXT_KEY_THRESHOLD.store(bytes.max(EXT_KEY_PREFIX + 1), AtomicOrdering::Relaxed);
}

pub fn extended_key_threshold() -> usize {
    EXT_KEY_THRESHOLD.load(AtomicOrdering::Relaxed)
}

// ============================================================================
// Tree specification
// ============================================================================

/// Everything the tree needs to know about its database's schema.
#[derive(Debug, Clone)]
pub struct TreeSpec {
    pub db: DbName,
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_type: RecordType,
    pub record_size: u32,
    pub flags: DbFlags,
    pub cmp: KeyCompare,
    pub record_codec: Codec,
    pub schema: NodeSchema,
}

impl TreeSpec {
    /// Choose the layout for a validated database configuration.
    pub fn new(
        db: DbName,
        cfg: &DbConfig,
        cmp: KeyCompare,
        record_codec: Codec,
        key_codec: Codec,
        page_size: u32,
    ) -> Result<TreeSpec> {
        let fixed_key = cfg.key_size != KEY_SIZE_UNLIMITED;
        let fixed_record = cfg.record_size != crate::types::RECORD_SIZE_UNLIMITED;
        let dupes = cfg.flags.contains(DbFlags::ENABLE_DUPLICATE_KEYS);

        let compact = fixed_key
            && fixed_record
            && !dupes
            && compact_capacity(page_size, cfg.key_size, cfg.record_size) >= 4;
        let layout = if compact { Layout::Compact } else { Layout::General };

        if !key_codec.is_none() && layout != Layout::Compact {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "key compression requires fixed-width keys without duplicates",
            ));
        }
        if fixed_key && !compact {
            // A fixed key must still leave a usable fanout in the general
            // layout; oversized keys spill, so only absurd widths fail.
            let per_entry = 2 + 1 + 2 + cfg.key_size as usize + 16;
            if (page_size as usize - NODE_BODY_OFF) / per_entry < 4
                && (cfg.key_size as usize) < extended_key_threshold()
            {
                return Err(Error::with_detail(
                    ErrorKind::InvalidKeySize,
                    "key size leaves a fanout below 4",
                ));
            }
        }

        Ok(TreeSpec {
            db,
            key_type: cfg.key_type,
            key_size: cfg.key_size,
            record_type: cfg.record_type,
            record_size: cfg.record_size,
            flags: cfg.flags,
            cmp,
            record_codec,
            schema: NodeSchema {
                layout,
                key_width: if compact { cfg.key_size } else { 0 },
                record_width: if compact { cfg.record_size } else { 0 },
                key_codec,
                page_size,
            },
        })
    }

    pub fn layout(&self) -> Layout {
        self.schema.layout
    }

    /// Fanout reported by the parameter query.
    pub fn max_keys_per_page(&self) -> usize {
        self.schema.max_keys_per_page()
    }

    fn owner(&self) -> u64 {
        self.db as u64
    }

    /// Keys longer than this spill to an overflow blob. The process-wide
    /// threshold is clamped so four entries always fit a page.
    fn key_spill_limit(&self) -> usize {
        let page_cap = (self.schema.page_size as usize - NODE_BODY_OFF) / 4;
        let page_cap = page_cap.saturating_sub(2 + 1 + 2 + 1 + 4 + INLINE_RECORD_MAX);
        extended_key_threshold().min(page_cap.max(EXT_KEY_PREFIX + 1))
    }

    /// Records up to this long stay in the leaf.
    fn record_inline_limit(&self) -> usize {
        if self.flags.contains(DbFlags::FORCE_RECORDS_INLINE) {
            // The fixed record size was validated at creation; give it the
            // same quarter-page bound the key side gets.
            let page_cap = (self.schema.page_size as usize - NODE_BODY_OFF) / 4;
            page_cap.saturating_sub(2 + 1 + 2 + self.key_size as usize + 8)
        } else {
            INLINE_RECORD_MAX
        }
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if self.key_size != KEY_SIZE_UNLIMITED && key.len() != self.key_size as usize {
            return Err(Error::with_detail(
                ErrorKind::InvalidKeySize,
                format!("expected {} bytes, got {}", self.key_size, key.len()),
            ));
        }
        if key.is_empty() {
            return Err(Error::new(ErrorKind::InvalidKeySize));
        }
        Ok(())
    }

    pub(crate) fn check_record(&self, record: &[u8]) -> Result<()> {
        if self.record_size != crate::types::RECORD_SIZE_UNLIMITED
            && record.len() != self.record_size as usize
        {
            return Err(Error::with_detail(
                ErrorKind::InvalidRecordSize,
                format!("expected {} bytes, got {}", self.record_size, record.len()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Btree
// ============================================================================

pub struct Btree {
    pub root: PageId,
    pub spec: TreeSpec,
}

impl Btree {
    /// Create an empty tree: a single leaf acting as root.
    pub fn create(pager: &mut Pager, spec: TreeSpec) -> Result<Btree> {
        let page = pager.alloc(PageKind::BtreeLeaf, spec.owner())?;
        let root = page.read().id();
        let empty = Node::new_leaf(spec.layout());
        {
            let mut guard = page.write();
            node::write(&empty, &mut guard.data, &spec.schema)?;
            guard.mark_dirty();
        }
        Ok(Btree { root, spec })
    }

    pub fn open(root: PageId, spec: TreeSpec) -> Btree {
        Btree { root, spec }
    }

    fn parse_page(&self, pager: &mut Pager, id: PageId) -> Result<Node> {
        let page = pager.fetch(id)?;
        let guard = page.read();
        node::parse(&guard.data, &self.spec.schema)
    }

    fn write_page(&self, pager: &mut Pager, id: PageId, n: &Node) -> Result<()> {
        let page = pager.fetch(id)?;
        let mut guard = page.write();
        node::write(n, &mut guard.data, &self.spec.schema)?;
        guard.mark_dirty();
        Ok(())
    }

    /// Walk from the root to the leaf responsible for `key`. Returns the
    /// internal pages on the path, root first, and the leaf id.
    fn descend(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<(Vec<PageId>, PageId)> {
        let mut path = Vec::new();
        let mut page_id = self.root;
        loop {
            let n = self.parse_page(pager, page_id)?;
            if n.is_leaf() {
                return Ok((path, page_id));
            }
            path.push(page_id);
            let entries = n.inner_entries();
            let (slot, exact) =
                node::search(entries, key, &self.spec.cmp, &mut |id| blobs.read(pager, id))?;
            page_id = if exact {
                entries[slot].child
            } else if slot == 0 {
                n.leftmost
            } else {
                entries[slot - 1].child
            };
        }
    }

    // ------------------------------------------------------------------
    // Key and record materialization
    // ------------------------------------------------------------------

    fn make_key(&self, pager: &mut Pager, blobs: &mut BlobManager, key: &[u8]) -> Result<KeyRepr> {
        if self.spec.layout() == Layout::General && key.len() > self.spec.key_spill_limit() {
            let blob = blobs.alloc(pager, key, Codec::None)?;
            Ok(KeyRepr::Extended {
                prefix: key[..EXT_KEY_PREFIX].to_vec(),
                blob,
                full_len: key.len() as u32,
            })
        } else {
            Ok(KeyRepr::Inline(key.to_vec()))
        }
    }

    fn free_key(&self, pager: &mut Pager, blobs: &mut BlobManager, key: &KeyRepr) -> Result<()> {
        if let KeyRepr::Extended { blob, .. } = key {
            blobs.free(pager, *blob)?;
        }
        Ok(())
    }

    /// Copy a key for use as a parent separator. Extended keys get their own
    /// overflow blob so every blob keeps exactly one owner.
    fn copy_key(&self, pager: &mut Pager, blobs: &mut BlobManager, key: &KeyRepr) -> Result<KeyRepr> {
        match key {
            KeyRepr::Inline(k) => Ok(KeyRepr::Inline(k.clone())),
            KeyRepr::Extended { prefix, blob, full_len } => {
                let full = blobs.read(pager, *blob)?;
                let copy = blobs.alloc(pager, &full, Codec::None)?;
                Ok(KeyRepr::Extended { prefix: prefix.clone(), blob: copy, full_len: *full_len })
            }
        }
    }

    fn make_record(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        record: &[u8],
    ) -> Result<RecordRef> {
        if self.spec.layout() == Layout::Compact || record.len() <= self.spec.record_inline_limit()
        {
            Ok(RecordRef::Inline(record.to_vec()))
        } else {
            let id = blobs.alloc(pager, record, self.spec.record_codec)?;
            Ok(RecordRef::Blob { id, size: record.len() as u32 })
        }
    }

    fn free_record(&self, pager: &mut Pager, blobs: &mut BlobManager, rec: &RecordRef) -> Result<()> {
        if let RecordRef::Blob { id, .. } = rec {
            blobs.free(pager, *id)?;
        }
        Ok(())
    }

    pub fn read_record(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        rec: &RecordRef,
    ) -> Result<Vec<u8>> {
        match rec {
            RecordRef::Inline(data) => Ok(data.clone()),
            RecordRef::Blob { id, .. } => blobs.read(pager, *id),
        }
    }

    fn free_payload(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        payload: &LeafPayload,
    ) -> Result<()> {
        match payload {
            LeafPayload::Single(rec) => self.free_record(pager, blobs, rec),
            LeafPayload::DupInline(refs) => {
                for rec in refs {
                    self.free_record(pager, blobs, rec)?;
                }
                Ok(())
            }
            LeafPayload::DupTable { page, .. } => {
                for rec in dupes::read_all(pager, *page)? {
                    self.free_record(pager, blobs, &rec)?;
                }
                dupes::free_chain(pager, *page)
            }
        }
    }

    /// All record references behind a payload, in duplicate order.
    pub fn payload_records(
        &self,
        pager: &mut Pager,
        payload: &LeafPayload,
    ) -> Result<Vec<RecordRef>> {
        match payload {
            LeafPayload::Single(rec) => Ok(vec![rec.clone()]),
            LeafPayload::DupInline(refs) => Ok(refs.clone()),
            LeafPayload::DupTable { page, .. } => dupes::read_all(pager, *page),
        }
    }

    pub fn full_key(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &KeyRepr,
    ) -> Result<Vec<u8>> {
        node::key_bytes(key, &mut |id| blobs.read(pager, id))
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    /// Insert or overwrite. `dup_at` carries the cursor's duplicate position
    /// for the positional duplicate flags.
    pub fn insert(
        &mut self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        dup_at: Option<u32>,
    ) -> Result<()> {
        self.spec.check_key(key)?;
        self.spec.check_record(record)?;
        let dup_flags = InsertFlags::DUPLICATE
            | InsertFlags::DUPLICATE_INSERT_FIRST
            | InsertFlags::DUPLICATE_INSERT_LAST
            | InsertFlags::DUPLICATE_INSERT_BEFORE
            | InsertFlags::DUPLICATE_INSERT_AFTER;
        let wants_dup = flags.intersects(dup_flags);
        if wants_dup && !self.spec.flags.contains(DbFlags::ENABLE_DUPLICATE_KEYS) {
            return Err(Error::with_detail(
                ErrorKind::InvalidParameter,
                "duplicate flags on a database without duplicates",
            ));
        }

        let (path, leaf_id) = self.descend(pager, blobs, key)?;
        let mut n = self.parse_page(pager, leaf_id)?;
        let (slot, exact) = node::search(n.leaf_entries(), key, &self.spec.cmp, &mut |id| {
            blobs.read(pager, id)
        })?;

        if exact {
            if wants_dup {
                self.insert_duplicate(pager, blobs, &mut n, slot, record, flags, dup_at)?;
            } else if flags.contains(InsertFlags::OVERWRITE) {
                self.overwrite_at(pager, blobs, &mut n, slot, record, dup_at)?;
            } else {
                return Err(Error::new(ErrorKind::DuplicateKey));
            }
        } else {
            let key_repr = self.make_key(pager, blobs, key)?;
            let rec = self.make_record(pager, blobs, record)?;
            n.leaf_entries_mut()
                .insert(slot, LeafEntry { key: key_repr, payload: LeafPayload::Single(rec) });
        }

        if self.spec.schema.fits(&n) {
            self.write_page(pager, leaf_id, &n)
        } else {
            self.split(pager, blobs, path, leaf_id, n)
        }
    }

    /// Replace the record of an existing entry; `dup_at` selects the
    /// duplicate, defaulting to the first.
    fn overwrite_at(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        n: &mut Node,
        slot: usize,
        record: &[u8],
        dup_at: Option<u32>,
    ) -> Result<()> {
        let new_rec = self.make_record(pager, blobs, record)?;
        let idx = dup_at.unwrap_or(0) as usize;
        let entry = &mut n.leaf_entries_mut()[slot];
        match &mut entry.payload {
            LeafPayload::Single(old) => {
                if idx != 0 {
                    return Err(Error::new(ErrorKind::KeyNotFound));
                }
                let old = std::mem::replace(old, new_rec);
                self.free_record(pager, blobs, &old)?;
            }
            LeafPayload::DupInline(refs) => {
                if idx >= refs.len() {
                    return Err(Error::new(ErrorKind::KeyNotFound));
                }
                let old = std::mem::replace(&mut refs[idx], new_rec);
                self.free_record(pager, blobs, &old)?;
            }
            LeafPayload::DupTable { page, .. } => {
                let table_page = *page;
                let mut refs = dupes::read_all(pager, table_page)?;
                if idx >= refs.len() {
                    return Err(Error::new(ErrorKind::KeyNotFound));
                }
                let old = std::mem::replace(&mut refs[idx], new_rec);
                self.free_record(pager, blobs, &old)?;
                dupes::rewrite(pager, self.spec.owner(), table_page, &refs)?;
            }
        }
        Ok(())
    }

    fn insert_duplicate(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        n: &mut Node,
        slot: usize,
        record: &[u8],
        flags: InsertFlags,
        dup_at: Option<u32>,
    ) -> Result<()> {
        let new_rec = self.make_record(pager, blobs, record)?;
        let position = |len: usize| -> Result<usize> {
            if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
                Ok(0)
            } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
                let at = dup_at.ok_or_else(|| {
                    Error::with_detail(ErrorKind::InvalidParameter, "insert-before needs a cursor")
                })?;
                Ok((at as usize).min(len))
            } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
                let at = dup_at.ok_or_else(|| {
                    Error::with_detail(ErrorKind::InvalidParameter, "insert-after needs a cursor")
                })?;
                Ok((at as usize + 1).min(len))
            } else {
                // DUPLICATE and DUPLICATE_INSERT_LAST both append.
                Ok(len)
            }
        };

        let entry = &mut n.leaf_entries_mut()[slot];
        let taken = std::mem::replace(&mut entry.payload, LeafPayload::DupInline(Vec::new()));
        entry.payload = match taken {
            LeafPayload::Single(old) => {
                let mut refs = vec![old];
                let pos = position(refs.len())?;
                refs.insert(pos, new_rec);
                LeafPayload::DupInline(refs)
            }
            LeafPayload::DupInline(mut refs) => {
                let pos = position(refs.len())?;
                refs.insert(pos, new_rec);
                if refs.len() > DUP_TABLE_THRESHOLD {
                    let page = dupes::create(pager, self.spec.owner(), &refs)?;
                    LeafPayload::DupTable { page, count: refs.len() as u64 }
                } else {
                    LeafPayload::DupInline(refs)
                }
            }
            LeafPayload::DupTable { page, .. } => {
                let mut refs = dupes::read_all(pager, page)?;
                let pos = position(refs.len())?;
                refs.insert(pos, new_rec);
                dupes::rewrite(pager, self.spec.owner(), page, &refs)?;
                LeafPayload::DupTable { page, count: refs.len() as u64 }
            }
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Split
    // ------------------------------------------------------------------

    fn split(
        &mut self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        mut path: Vec<PageId>,
        mut page_id: PageId,
        mut n: Node,
    ) -> Result<()> {
        loop {
            let mid = n.count() / 2;
            debug_assert!(mid >= 1, "splitting a node with fewer than two entries");

            let (mut right, separator) = match &mut n.body {
                NodeBody::Leaf(entries) => {
                    let right_entries = entries.split_off(mid);
                    let separator = self.copy_key(pager, blobs, &right_entries[0].key)?;
                    let mut right = Node::new_leaf(self.spec.layout());
                    right.body = NodeBody::Leaf(right_entries);
                    (right, separator)
                }
                NodeBody::Inner(entries) => {
                    let mut right_entries = entries.split_off(mid);
                    // The middle separator moves up rather than being kept.
                    let promoted = right_entries.remove(0);
                    let mut right =
                        Node::new_inner(self.spec.layout(), n.level, promoted.child);
                    right.body = NodeBody::Inner(right_entries);
                    (right, promoted.key)
                }
            };
            right.level = n.level;

            let right_page = pager.alloc(
                if n.is_leaf() { PageKind::BtreeLeaf } else { PageKind::BtreeInternal },
                self.spec.owner(),
            )?;
            let right_id = right_page.read().id();
            drop(right_page);

            right.left = page_id;
            right.right = n.right;
            if n.right != 0 {
                let old_right = pager.fetch(n.right)?;
                let mut guard = old_right.write();
                node::set_left_sibling(&mut guard.data, right_id);
                guard.mark_dirty();
            }
            n.right = right_id;

            self.write_page(pager, page_id, &n)?;
            self.write_page(pager, right_id, &right)?;
            log::trace!("split page {page_id} -> {right_id} (level {})", n.level);

            let sep_bytes = self.full_key(pager, blobs, &separator)?;
            match path.pop() {
                None => {
                    // The root split: the tree grows one level.
                    let new_root_page = pager.alloc(PageKind::BtreeInternal, self.spec.owner())?;
                    let new_root_id = new_root_page.read().id();
                    drop(new_root_page);
                    let mut root = Node::new_inner(self.spec.layout(), n.level + 1, page_id);
                    root.inner_entries_mut().push(InnerEntry { key: separator, child: right_id });
                    self.write_page(pager, new_root_id, &root)?;
                    self.root = new_root_id;
                    return Ok(());
                }
                Some(parent_id) => {
                    let mut parent = self.parse_page(pager, parent_id)?;
                    let (slot, _) = node::search(
                        parent.inner_entries(),
                        &sep_bytes,
                        &self.spec.cmp,
                        &mut |id| blobs.read(pager, id),
                    )?;
                    parent
                        .inner_entries_mut()
                        .insert(slot, InnerEntry { key: separator, child: right_id });
                    if self.spec.schema.fits(&parent) {
                        return self.write_page(pager, parent_id, &parent);
                    }
                    page_id = parent_id;
                    n = parent;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Erase
    // ------------------------------------------------------------------

    /// Erase a key, one duplicate of it, or the whole duplicate group.
    /// Without a cursor position the whole key is erased.
    pub fn erase(
        &mut self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
        dup_at: Option<u32>,
        flags: EraseFlags,
    ) -> Result<()> {
        self.spec.check_key(key)?;
        let (path, leaf_id) = self.descend(pager, blobs, key)?;
        let mut n = self.parse_page(pager, leaf_id)?;
        let (slot, exact) = node::search(n.leaf_entries(), key, &self.spec.cmp, &mut |id| {
            blobs.read(pager, id)
        })?;
        if !exact {
            return Err(Error::new(ErrorKind::KeyNotFound));
        }

        let erase_all = dup_at.is_none() || flags.contains(EraseFlags::ALL_DUPLICATES);
        let mut remove_entry = erase_all;
        if erase_all {
            let payload = n.leaf_entries()[slot].payload.clone();
            self.free_payload(pager, blobs, &payload)?;
        } else {
            let idx = dup_at.unwrap_or(0) as usize;
            let entry = &mut n.leaf_entries_mut()[slot];
            let taken = std::mem::replace(&mut entry.payload, LeafPayload::DupInline(Vec::new()));
            entry.payload = match taken {
                LeafPayload::Single(rec) => {
                    if idx != 0 {
                        return Err(Error::new(ErrorKind::KeyNotFound));
                    }
                    self.free_record(pager, blobs, &rec)?;
                    remove_entry = true;
                    LeafPayload::Single(rec)
                }
                LeafPayload::DupInline(mut refs) => {
                    if idx >= refs.len() {
                        return Err(Error::new(ErrorKind::KeyNotFound));
                    }
                    let old = refs.remove(idx);
                    self.free_record(pager, blobs, &old)?;
                    match refs.len() {
                        0 => {
                            remove_entry = true;
                            LeafPayload::DupInline(refs)
                        }
                        1 => LeafPayload::Single(refs.remove(0)),
                        _ => LeafPayload::DupInline(refs),
                    }
                }
                LeafPayload::DupTable { page, .. } => {
                    let mut refs = dupes::read_all(pager, page)?;
                    if idx >= refs.len() {
                        return Err(Error::new(ErrorKind::KeyNotFound));
                    }
                    let old = refs.remove(idx);
                    self.free_record(pager, blobs, &old)?;
                    if refs.is_empty() {
                        dupes::free_chain(pager, page)?;
                        remove_entry = true;
                        LeafPayload::DupTable { page: 0, count: 0 }
                    } else {
                        // Once promoted, the group stays an external table.
                        dupes::rewrite(pager, self.spec.owner(), page, &refs)?;
                        LeafPayload::DupTable { page, count: refs.len() as u64 }
                    }
                }
            };
        }

        if remove_entry {
            let removed = n.leaf_entries_mut().remove(slot);
            self.free_key(pager, blobs, &removed.key)?;
        }

        if !path.is_empty() && self.spec.schema.underfull(&n) {
            self.rebalance(pager, blobs, path, leaf_id, n)
        } else {
            self.write_page(pager, leaf_id, &n)
        }
    }

    // ------------------------------------------------------------------
    // Merge / redistribute
    // ------------------------------------------------------------------

    fn rebalance(
        &mut self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        mut path: Vec<PageId>,
        mut page_id: PageId,
        mut n: Node,
    ) -> Result<()> {
        loop {
            let parent_id = match path.pop() {
                Some(id) => id,
                None => {
                    // The node is the root. An internal root with no keys
                    // collapses into its single child; the tree shrinks.
                    if !n.is_leaf() && n.count() == 0 {
                        self.root = n.leftmost;
                        pager.free_page(page_id);
                        log::trace!("root collapsed to page {}", self.root);
                    } else {
                        self.write_page(pager, page_id, &n)?;
                    }
                    return Ok(());
                }
            };

            let mut parent = self.parse_page(pager, parent_id)?;
            let pos = child_position(&parent, page_id)?;

            // Pair with the right sibling when one exists, else the left one.
            // A child at position p has entries[p + 1].key as the separator
            // between it and the child at p + 1.
            let (left_id, left, right_id, right, sep_idx) = {
                let right_idx = (pos + 1) as usize;
                if right_idx < parent.inner_entries().len() {
                    let right_id = parent.inner_entries()[right_idx].child;
                    let right = self.parse_page(pager, right_id)?;
                    (page_id, n, right_id, right, right_idx)
                } else {
                    let sep_idx = pos as usize;
                    let left_id = if pos == 0 {
                        parent.leftmost
                    } else {
                        parent.inner_entries()[sep_idx - 1].child
                    };
                    let left = self.parse_page(pager, left_id)?;
                    (left_id, left, page_id, n, sep_idx)
                }
            };

            // Combine both nodes (plus the bridging separator for internal
            // nodes, which moves down).
            let separator_entry = parent.inner_entries_mut().remove(sep_idx);
            let (layout, level, outer_left, outer_right, leftmost) =
                (left.layout, left.level, left.left, right.right, left.leftmost);
            let right_leftmost = right.leftmost;
            let combined_body = match (left.body, right.body) {
                (NodeBody::Leaf(mut left_entries), NodeBody::Leaf(right_entries)) => {
                    self.free_key(pager, blobs, &separator_entry.key)?;
                    left_entries.extend(right_entries);
                    NodeBody::Leaf(left_entries)
                }
                (NodeBody::Inner(mut left_entries), NodeBody::Inner(right_entries)) => {
                    left_entries
                        .push(InnerEntry { key: separator_entry.key, child: right_leftmost });
                    left_entries.extend(right_entries);
                    NodeBody::Inner(left_entries)
                }
                _ => {
                    return Err(Error::with_detail(
                        ErrorKind::IntegrityViolated,
                        "sibling level mismatch",
                    ))
                }
            };
            let combined = Node {
                layout,
                level,
                left: outer_left,
                right: outer_right,
                leftmost,
                body: combined_body,
            };

            if self.spec.schema.fits(&combined) {
                // Merge: everything lives in the left page now.
                if combined.right != 0 {
                    let after = pager.fetch(combined.right)?;
                    let mut guard = after.write();
                    node::set_left_sibling(&mut guard.data, left_id);
                    guard.mark_dirty();
                }
                self.write_page(pager, left_id, &combined)?;
                pager.free_page(right_id);
                log::trace!("merged page {right_id} into {left_id}");

                if path.is_empty() {
                    // Parent is the root.
                    if parent.inner_entries().is_empty() {
                        self.root = parent.leftmost;
                        pager.free_page(parent_id);
                        log::trace!("root collapsed to page {}", self.root);
                    } else {
                        self.write_page(pager, parent_id, &parent)?;
                    }
                    return Ok(());
                }
                if self.spec.schema.underfull(&parent) {
                    page_id = parent_id;
                    n = parent;
                    continue;
                }
                return self.write_page(pager, parent_id, &parent);
            }

            // Redistribute: split the combined entries evenly and reinstall
            // a fresh separator.
            let mid = combined.count() / 2;
            let (new_left, new_right, new_sep) = match combined.body {
                NodeBody::Leaf(mut entries) => {
                    let right_entries = entries.split_off(mid);
                    let sep = self.copy_key(pager, blobs, &right_entries[0].key)?;
                    let mut new_left = Node::new_leaf(self.spec.layout());
                    new_left.left = combined.left;
                    new_left.right = right_id;
                    new_left.body = NodeBody::Leaf(entries);
                    let mut new_right = Node::new_leaf(self.spec.layout());
                    new_right.left = left_id;
                    new_right.right = combined.right;
                    new_right.body = NodeBody::Leaf(right_entries);
                    (new_left, new_right, sep)
                }
                NodeBody::Inner(mut entries) => {
                    let mut right_entries = entries.split_off(mid);
                    let promoted = right_entries.remove(0);
                    let mut new_left =
                        Node::new_inner(self.spec.layout(), combined.level, combined.leftmost);
                    new_left.left = combined.left;
                    new_left.right = right_id;
                    new_left.body = NodeBody::Inner(entries);
                    let mut new_right =
                        Node::new_inner(self.spec.layout(), combined.level, promoted.child);
                    new_right.left = left_id;
                    new_right.right = combined.right;
                    new_right.body = NodeBody::Inner(right_entries);
                    (new_left, new_right, promoted.key)
                }
            };

            parent
                .inner_entries_mut()
                .insert(sep_idx, InnerEntry { key: new_sep, child: right_id });
            self.write_page(pager, left_id, &new_left)?;
            self.write_page(pager, right_id, &new_right)?;
            return self.write_page(pager, parent_id, &parent);
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Exact lookup returning the payload.
    pub fn lookup(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Option<LeafPayload>> {
        self.spec.check_key(key)?;
        let (_, leaf_id) = self.descend(pager, blobs, key)?;

        // Fast path: stride binary search straight on the page bytes.
        if self.spec.layout() == Layout::Compact && self.spec.schema.key_codec.is_none() {
            let page = pager.fetch(leaf_id)?;
            let guard = page.read();
            let (slot, exact) =
                node::search_compact_raw(&guard.data, &self.spec.schema, key, &self.spec.cmp)?;
            if !exact {
                return Ok(None);
            }
            let rec = node::compact_record_at(&guard.data, &self.spec.schema, slot);
            return Ok(Some(LeafPayload::Single(RecordRef::Inline(rec))));
        }

        let n = self.parse_page(pager, leaf_id)?;
        let (slot, exact) = node::search(n.leaf_entries(), key, &self.spec.cmp, &mut |id| {
            blobs.read(pager, id)
        })?;
        if !exact {
            return Ok(None);
        }
        Ok(Some(n.leaf_entries()[slot].payload.clone()))
    }

    /// Approximate lookup per the find flags. Returns the matched key and
    /// its payload.
    pub fn find(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<(Vec<u8>, LeafPayload)> {
        if flags.is_empty() {
            let payload = self
                .lookup(pager, blobs, key)?
                .ok_or_else(|| Error::new(ErrorKind::KeyNotFound))?;
            return Ok((key.to_vec(), payload));
        }

        let want_exact = flags.intersects(FindFlags::LEQ | FindFlags::GEQ);
        if want_exact {
            if let Some(payload) = self.lookup(pager, blobs, key)? {
                return Ok((key.to_vec(), payload));
            }
        }

        let lower_ok = flags.intersects(FindFlags::LT | FindFlags::LEQ);
        let upper_ok = flags.intersects(FindFlags::GT | FindFlags::GEQ);
        // Tie-break for `near`: the lower neighbor wins.
        if lower_ok {
            if let Some(found) = self.predecessor(pager, blobs, key)? {
                return Ok(found);
            }
        }
        if upper_ok {
            if let Some(found) = self.successor(pager, blobs, key)? {
                return Ok(found);
            }
        }
        Err(Error::new(ErrorKind::KeyNotFound))
    }

    /// First entry with a key strictly greater than `key`.
    pub fn successor(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, LeafPayload)>> {
        let (_, leaf_id) = self.descend(pager, blobs, key)?;
        let n = self.parse_page(pager, leaf_id)?;
        let (slot, exact) = node::search(n.leaf_entries(), key, &self.spec.cmp, &mut |id| {
            blobs.read(pager, id)
        })?;
        let idx = if exact { slot + 1 } else { slot };
        self.entry_at_or_right(pager, blobs, n, idx)
    }

    /// Last entry with a key strictly less than `key`.
    pub fn predecessor(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, LeafPayload)>> {
        let (_, leaf_id) = self.descend(pager, blobs, key)?;
        let mut n = self.parse_page(pager, leaf_id)?;
        let (slot, _) = node::search(n.leaf_entries(), key, &self.spec.cmp, &mut |id| {
            blobs.read(pager, id)
        })?;
        // `slot` is the first entry >= key, so the predecessor sits before it.
        if slot > 0 {
            let entry = &n.leaf_entries()[slot - 1];
            let key = self.full_key(pager, blobs, &entry.key)?;
            return Ok(Some((key, entry.payload.clone())));
        }
        loop {
            if n.left == 0 {
                return Ok(None);
            }
            n = self.parse_page(pager, n.left)?;
            if let Some(entry) = n.leaf_entries().last() {
                let key = self.full_key(pager, blobs, &entry.key)?;
                return Ok(Some((key, entry.payload.clone())));
            }
        }
    }

    fn entry_at_or_right(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        mut n: Node,
        mut idx: usize,
    ) -> Result<Option<(Vec<u8>, LeafPayload)>> {
        loop {
            if idx < n.leaf_entries().len() {
                let entry = &n.leaf_entries()[idx];
                let key = self.full_key(pager, blobs, &entry.key)?;
                return Ok(Some((key, entry.payload.clone())));
            }
            if n.right == 0 {
                return Ok(None);
            }
            n = self.parse_page(pager, n.right)?;
            idx = 0;
        }
    }

    /// First entry of the tree.
    pub fn first(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
    ) -> Result<Option<(Vec<u8>, LeafPayload)>> {
        let mut page_id = self.root;
        loop {
            let n = self.parse_page(pager, page_id)?;
            if n.is_leaf() {
                return self.entry_at_or_right(pager, blobs, n, 0);
            }
            page_id = n.leftmost;
        }
    }

    /// Last entry of the tree.
    pub fn last(
        &self,
        pager: &mut Pager,
        blobs: &mut BlobManager,
    ) -> Result<Option<(Vec<u8>, LeafPayload)>> {
        let mut page_id = self.root;
        loop {
            let n = self.parse_page(pager, page_id)?;
            if n.is_leaf() {
                if let Some(entry) = n.leaf_entries().last() {
                    let key = self.full_key(pager, blobs, &entry.key)?;
                    return Ok(Some((key, entry.payload.clone())));
                }
                // An empty leaf is only ever the empty root.
                return Ok(None);
            }
            page_id = match n.inner_entries().last() {
                Some(last) => last.child,
                None => n.leftmost,
            };
        }
    }

    // ------------------------------------------------------------------
    // Counting
    // ------------------------------------------------------------------

    /// Number of records, or of distinct keys when `distinct` is set.
    pub fn count(&self, pager: &mut Pager, distinct: bool) -> Result<u64> {
        let mut page_id = self.root;
        loop {
            let n = self.parse_page(pager, page_id)?;
            if n.is_leaf() {
                // Found the leftmost leaf; walk the chain.
                let mut total = 0u64;
                let mut n = n;
                loop {
                    for entry in n.leaf_entries() {
                        total += if distinct { 1 } else { entry.payload.record_count() };
                    }
                    if n.right == 0 {
                        return Ok(total);
                    }
                    n = self.parse_page(pager, n.right)?;
                }
            }
            page_id = n.leftmost;
        }
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Read-only structural verification with an explicit work stack.
    pub fn check_integrity(&self, pager: &mut Pager, blobs: &mut BlobManager) -> Result<()> {
        struct Frame {
            page_id: PageId,
            level: Option<u8>,
            lower: Option<Vec<u8>>,
            upper: Option<Vec<u8>>,
        }

        let mut visited: HashSet<PageId> = HashSet::new();
        let mut leaves_in_order: Vec<PageId> = Vec::new();
        let mut stack = vec![Frame { page_id: self.root, level: None, lower: None, upper: None }];

        while let Some(frame) = stack.pop() {
            if !visited.insert(frame.page_id) {
                return Err(Error::with_detail(
                    ErrorKind::IntegrityViolated,
                    format!("page {} reachable twice", frame.page_id),
                ));
            }
            let n = self.parse_page(pager, frame.page_id)?;
            if let Some(expected) = frame.level {
                if n.level != expected {
                    return Err(Error::with_detail(
                        ErrorKind::IntegrityViolated,
                        format!("page {}: level {} where {expected} expected", frame.page_id, n.level),
                    ));
                }
            }

            // Key ordering within the node and against the subtree bounds.
            let mut prev: Option<Vec<u8>> = frame.lower.clone();
            let mut check_key = |key_bytes: Vec<u8>| -> Result<()> {
                if let Some(prev_key) = &prev {
                    if self.spec.cmp.compare(prev_key, &key_bytes)? != Ordering::Less {
                        return Err(Error::with_detail(
                            ErrorKind::IntegrityViolated,
                            format!("page {}: keys out of order", frame.page_id),
                        ));
                    }
                }
                if let Some(upper) = &frame.upper {
                    if self.spec.cmp.compare(&key_bytes, upper)? != Ordering::Less {
                        return Err(Error::with_detail(
                            ErrorKind::IntegrityViolated,
                            format!("page {}: key escapes its separator bound", frame.page_id),
                        ));
                    }
                }
                prev = Some(key_bytes);
                Ok(())
            };

            match &n.body {
                NodeBody::Leaf(entries) => {
                    if frame.page_id != self.root && entries.is_empty() {
                        return Err(Error::with_detail(
                            ErrorKind::IntegrityViolated,
                            format!("page {}: empty non-root leaf", frame.page_id),
                        ));
                    }
                    for entry in entries {
                        let key_bytes = self.full_key(pager, blobs, &entry.key)?;
                        if let KeyRepr::Extended { full_len, .. } = &entry.key {
                            if key_bytes.len() as u32 != *full_len {
                                return Err(Error::with_detail(
                                    ErrorKind::IntegrityViolated,
                                    "extended key length mismatch",
                                ));
                            }
                        }
                        check_key(key_bytes)?;
                        for rec in self.payload_records(pager, &entry.payload)? {
                            if let RecordRef::Blob { id, size } = rec {
                                if blobs.size(pager, id)? != size {
                                    return Err(Error::with_detail(
                                        ErrorKind::IntegrityViolated,
                                        "record blob size mismatch",
                                    ));
                                }
                            }
                        }
                    }
                    leaves_in_order.push(frame.page_id);
                }
                NodeBody::Inner(entries) => {
                    if entries.is_empty() {
                        return Err(Error::with_detail(
                            ErrorKind::IntegrityViolated,
                            format!("page {}: internal node without separators", frame.page_id),
                        ));
                    }
                    let child_level = n.level - 1;
                    let mut separators = Vec::with_capacity(entries.len());
                    for entry in entries {
                        let key_bytes = self.full_key(pager, blobs, &entry.key)?;
                        check_key(key_bytes.clone())?;
                        separators.push(key_bytes);
                    }
                    // Children are pushed right-to-left so the walk visits
                    // them left-to-right.
                    let mut frames = Vec::with_capacity(entries.len() + 1);
                    frames.push(Frame {
                        page_id: n.leftmost,
                        level: Some(child_level),
                        lower: frame.lower.clone(),
                        upper: Some(separators[0].clone()),
                    });
                    for (i, entry) in entries.iter().enumerate() {
                        frames.push(Frame {
                            page_id: entry.child,
                            level: Some(child_level),
                            lower: Some(separators[i].clone()),
                            upper: separators.get(i + 1).cloned().or_else(|| frame.upper.clone()),
                        });
                    }
                    while let Some(f) = frames.pop() {
                        stack.push(f);
                    }
                }
            }
        }

        // Sibling links must mirror the in-order leaf sequence.
        for (i, &leaf_id) in leaves_in_order.iter().enumerate() {
            let n = self.parse_page(pager, leaf_id)?;
            let want_left = if i == 0 { 0 } else { leaves_in_order[i - 1] };
            let want_right =
                if i + 1 == leaves_in_order.len() { 0 } else { leaves_in_order[i + 1] };
            if n.left != want_left || n.right != want_right {
                return Err(Error::with_detail(
                    ErrorKind::IntegrityViolated,
                    format!("page {leaf_id}: sibling links inconsistent"),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Free every page and blob of the tree (database erase).
    pub fn free_all(&mut self, pager: &mut Pager, blobs: &mut BlobManager) -> Result<()> {
        let mut stack = vec![self.root];
        while let Some(page_id) = stack.pop() {
            let n = self.parse_page(pager, page_id)?;
            match &n.body {
                NodeBody::Leaf(entries) => {
                    for entry in entries {
                        self.free_payload(pager, blobs, &entry.payload)?;
                        self.free_key(pager, blobs, &entry.key)?;
                    }
                }
                NodeBody::Inner(entries) => {
                    stack.push(n.leftmost);
                    for entry in entries {
                        self.free_key(pager, blobs, &entry.key)?;
                        stack.push(entry.child);
                    }
                }
            }
            pager.free_page(page_id);
        }
        self.root = 0;
        Ok(())
    }
}

/// Position of `child` among a parent's children: -1 for the leftmost
/// pointer, otherwise the entry index.
fn child_position(parent: &Node, child: PageId) -> Result<i64> {
    if parent.leftmost == child {
        return Ok(-1);
    }
    for (i, entry) in parent.inner_entries().iter().enumerate() {
        if entry.child == child {
            return Ok(i as i64);
        }
    }
    Err(Error::with_detail(
        ErrorKind::InternalError,
        format!("page {child} missing from its parent"),
    ))
}
