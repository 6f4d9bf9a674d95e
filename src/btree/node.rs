//! B+tree node layouts and entry codecs
//!
//! Two layout families share one node header. The compact layout serves
//! databases with fixed-width keys, fixed-width records and no duplicates:
//! keys and records are parallel fixed-stride arrays and search is a stride
//! binary search with no indirection. The general layout serves everything
//! else: a slot directory of u16 offsets at the start of the body points
//! into variable-width entries, and each leaf entry carries a flag byte
//! distinguishing inline bytes, blob ids, duplicate groups and extended-key
//! overflows.
//!
//! Node header (after the 32-byte page header):
//!
//! ```text
//! 32..34  entry count
//! 34      layout tag
//! 35      level (0 = leaf)
//! 36      node flags (key region compressed)
//! 37..40  reserved / compressed key-region length (compact layout)
//! 40..48  left sibling
//! 48..56  right sibling
//! 56..64  leftmost child (internal nodes)
//! 64..    body
//! ```
//!
//! Mutations parse the node, edit the entry vector, and rebuild the body;
//! point lookups on the compact layout search the raw page directly.

use std::cmp::Ordering;

use crate::compare::KeyCompare;
use crate::compress::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::encoding::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::types::{BlobId, PageId};

pub const OFF_COUNT: usize = 32;
pub const OFF_LAYOUT: usize = 34;
pub const OFF_LEVEL: usize = 35;
pub const OFF_NODE_FLAGS: usize = 36;
pub const OFF_KEYS_COMP_LEN: usize = 37;
pub const OFF_LEFT: usize = 40;
pub const OFF_RIGHT: usize = 48;
pub const OFF_LEFTMOST: usize = 56;
pub const NODE_BODY_OFF: usize = 64;

const NODE_FLAG_KEYS_COMPRESSED: u8 = 0x01;

/// Bytes of an extended key kept in the leaf for comparison.
pub const EXT_KEY_PREFIX: usize = 24;

/// Records up to this long stay inline in a general-layout leaf.
pub const INLINE_RECORD_MAX: usize = 64;

/// Duplicates per key before the group moves to an external table.
pub const DUP_TABLE_THRESHOLD: usize = 8;

/// Node layout family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layout {
    Compact = 1,
    General = 2,
}

impl Layout {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Layout::Compact),
            2 => Ok(Layout::General),
            _ => Err(Error::with_detail(ErrorKind::IntegrityViolated, "unknown node layout tag")),
        }
    }
}

// ============================================================================
// Entry model
// ============================================================================

/// A key as stored in a node: inline bytes, or a prefix plus overflow blob.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRepr {
    Inline(Vec<u8>),
    Extended { prefix: Vec<u8>, blob: BlobId, full_len: u32 },
}

impl KeyRepr {
    pub fn encoded_len(&self) -> usize {
        match self {
            KeyRepr::Inline(k) => 2 + k.len(),
            KeyRepr::Extended { prefix, .. } => 4 + 2 + prefix.len() + 8,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, KeyRepr::Extended { .. })
    }
}

/// A record reference: the bytes themselves, or a blob.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordRef {
    Inline(Vec<u8>),
    Blob { id: BlobId, size: u32 },
}

impl RecordRef {
    pub fn encoded_len(&self) -> usize {
        match self {
            RecordRef::Inline(data) => 1 + 4 + data.len(),
            RecordRef::Blob { .. } => 1 + 8 + 4,
        }
    }

    /// Original record length.
    pub fn size(&self) -> u32 {
        match self {
            RecordRef::Inline(data) => data.len() as u32,
            RecordRef::Blob { size, .. } => *size,
        }
    }
}

/// What a leaf entry points at.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafPayload {
    Single(RecordRef),
    DupInline(Vec<RecordRef>),
    DupTable { page: PageId, count: u64 },
}

impl LeafPayload {
    pub fn encoded_len(&self) -> usize {
        match self {
            LeafPayload::Single(r) => r.encoded_len(),
            LeafPayload::DupInline(refs) => 2 + refs.iter().map(|r| r.encoded_len()).sum::<usize>(),
            LeafPayload::DupTable { .. } => 8 + 8,
        }
    }

    /// Number of records behind this payload.
    pub fn record_count(&self) -> u64 {
        match self {
            LeafPayload::Single(_) => 1,
            LeafPayload::DupInline(refs) => refs.len() as u64,
            LeafPayload::DupTable { count, .. } => *count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub key: KeyRepr,
    pub payload: LeafPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerEntry {
    pub key: KeyRepr,
    pub child: PageId,
}

#[derive(Debug, PartialEq)]
pub enum NodeBody {
    Leaf(Vec<LeafEntry>),
    Inner(Vec<InnerEntry>),
}

/// Parsed form of one btree page.
#[derive(Debug)]
pub struct Node {
    pub layout: Layout,
    pub level: u8,
    pub left: PageId,
    pub right: PageId,
    pub leftmost: PageId,
    pub body: NodeBody,
}

impl Node {
    pub fn new_leaf(layout: Layout) -> Self {
        Node { layout, level: 0, left: 0, right: 0, leftmost: 0, body: NodeBody::Leaf(Vec::new()) }
    }

    pub fn new_inner(layout: Layout, level: u8, leftmost: PageId) -> Self {
        Node { layout, level, left: 0, right: 0, leftmost, body: NodeBody::Inner(Vec::new()) }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn count(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(v) => v.len(),
            NodeBody::Inner(v) => v.len(),
        }
    }

    pub fn leaf_entries(&self) -> &Vec<LeafEntry> {
        match &self.body {
            NodeBody::Leaf(v) => v,
            NodeBody::Inner(_) => unreachable!("leaf access on inner node"),
        }
    }

    pub fn leaf_entries_mut(&mut self) -> &mut Vec<LeafEntry> {
        match &mut self.body {
            NodeBody::Leaf(v) => v,
            NodeBody::Inner(_) => unreachable!("leaf access on inner node"),
        }
    }

    pub fn inner_entries(&self) -> &Vec<InnerEntry> {
        match &self.body {
            NodeBody::Inner(v) => v,
            NodeBody::Leaf(_) => unreachable!("inner access on leaf node"),
        }
    }

    pub fn inner_entries_mut(&mut self) -> &mut Vec<InnerEntry> {
        match &mut self.body {
            NodeBody::Inner(v) => v,
            NodeBody::Leaf(_) => unreachable!("inner access on leaf node"),
        }
    }
}

// ============================================================================
// Layout parameters
// ============================================================================

/// Schema facts the codec needs; owned by `TreeSpec` in the btree module.
#[derive(Debug, Clone, Copy)]
pub struct NodeSchema {
    pub layout: Layout,
    /// Fixed key width (compact layout only).
    pub key_width: u16,
    /// Fixed record width (compact leaves only).
    pub record_width: u32,
    /// Codec for the compact key region.
    pub key_codec: Codec,
    pub page_size: u32,
}

/// Entries per compact node.
pub fn compact_capacity(page_size: u32, key_width: u16, value_width: u32) -> usize {
    (page_size as usize - NODE_BODY_OFF) / (key_width as usize + value_width as usize)
}

impl NodeSchema {
    fn leaf_capacity(&self) -> usize {
        compact_capacity(self.page_size, self.key_width, self.record_width)
    }

    fn inner_capacity(&self) -> usize {
        compact_capacity(self.page_size, self.key_width, 8)
    }

    /// Encoded body size of a node, excluding the node header.
    pub fn encoded_size(&self, node: &Node) -> usize {
        match self.layout {
            Layout::Compact => match &node.body {
                // Stride arrays are preallocated; capacity is entry-count
                // bound, not byte bound. Report bytes for symmetry only.
                NodeBody::Leaf(v) => v.len() * (self.key_width as usize + self.record_width as usize),
                NodeBody::Inner(v) => v.len() * (self.key_width as usize + 8),
            },
            Layout::General => match &node.body {
                NodeBody::Leaf(v) => v
                    .iter()
                    .map(|e| 2 + 1 + e.key.encoded_len() + e.payload.encoded_len())
                    .sum(),
                NodeBody::Inner(v) => {
                    v.iter().map(|e| 2 + 1 + e.key.encoded_len() + 8).sum()
                }
            },
        }
    }

    /// Whether the node still fits one page.
    pub fn fits(&self, node: &Node) -> bool {
        match self.layout {
            Layout::Compact => {
                let cap = if node.is_leaf() { self.leaf_capacity() } else { self.inner_capacity() };
                node.count() <= cap
            }
            Layout::General => NODE_BODY_OFF + self.encoded_size(node) <= self.page_size as usize,
        }
    }

    /// Half-full test used by merge/redistribute. The root is exempt.
    pub fn underfull(&self, node: &Node) -> bool {
        match self.layout {
            Layout::Compact => {
                let cap = if node.is_leaf() { self.leaf_capacity() } else { self.inner_capacity() };
                node.count() < cap / 2
            }
            Layout::General => {
                2 * self.encoded_size(node) < self.page_size as usize - NODE_BODY_OFF
            }
        }
    }

    /// Fanout reported by the parameter query.
    pub fn max_keys_per_page(&self) -> usize {
        match self.layout {
            Layout::Compact => self.leaf_capacity(),
            Layout::General => {
                // Conservative estimate for variable entries: slot plus flag
                // plus a modest key and an inline record reference.
                (self.page_size as usize - NODE_BODY_OFF) / (2 + 1 + 2 + 16 + 1 + 4 + 16)
            }
        }
    }
}

// ============================================================================
// Parse and rebuild
// ============================================================================

pub fn parse(data: &[u8], schema: &NodeSchema) -> Result<Node> {
    let count = read_u16(data, OFF_COUNT) as usize;
    let layout = Layout::from_u8(data[OFF_LAYOUT])?;
    let level = data[OFF_LEVEL];
    let left = read_u64(data, OFF_LEFT);
    let right = read_u64(data, OFF_RIGHT);
    let leftmost = read_u64(data, OFF_LEFTMOST);
    if layout != schema.layout {
        return Err(Error::with_detail(ErrorKind::IntegrityViolated, "node layout tag mismatch"));
    }

    let body = match layout {
        Layout::Compact => parse_compact(data, schema, count, level == 0)?,
        Layout::General => parse_general(data, schema, count, level == 0)?,
    };
    Ok(Node { layout, level, left, right, leftmost, body })
}

fn parse_compact(data: &[u8], schema: &NodeSchema, count: usize, leaf: bool) -> Result<NodeBody> {
    let kw = schema.key_width as usize;
    let cap = if leaf { schema.leaf_capacity() } else { schema.inner_capacity() };
    if count > cap {
        return Err(Error::with_detail(ErrorKind::IntegrityViolated, "compact node overflows capacity"));
    }

    // The key region may be stored compressed; the value region is always at
    // its fixed offset.
    let key_region_len = cap * kw;
    let keys: Vec<u8> = if data[OFF_NODE_FLAGS] & NODE_FLAG_KEYS_COMPRESSED != 0 {
        let comp_len = read_u16(data, OFF_KEYS_COMP_LEN) as usize;
        schema.key_codec.decompress(&data[NODE_BODY_OFF..NODE_BODY_OFF + comp_len])?
    } else {
        data[NODE_BODY_OFF..NODE_BODY_OFF + count * kw].to_vec()
    };
    if keys.len() < count * kw {
        return Err(Error::with_detail(ErrorKind::IntegrityViolated, "compact key region truncated"));
    }
    let val_off = NODE_BODY_OFF + key_region_len;

    if leaf {
        let rw = schema.record_width as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let key = keys[i * kw..(i + 1) * kw].to_vec();
            let rec = data[val_off + i * rw..val_off + (i + 1) * rw].to_vec();
            entries.push(LeafEntry {
                key: KeyRepr::Inline(key),
                payload: LeafPayload::Single(RecordRef::Inline(rec)),
            });
        }
        Ok(NodeBody::Leaf(entries))
    } else {
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let key = keys[i * kw..(i + 1) * kw].to_vec();
            let child = read_u64(data, val_off + i * 8);
            entries.push(InnerEntry { key: KeyRepr::Inline(key), child });
        }
        Ok(NodeBody::Inner(entries))
    }
}

fn parse_general(data: &[u8], schema: &NodeSchema, count: usize, leaf: bool) -> Result<NodeBody> {
    let _ = schema;
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(read_u16(data, NODE_BODY_OFF + i * 2) as usize);
    }
    if leaf {
        let mut entries = Vec::with_capacity(count);
        for off in offsets {
            entries.push(decode_leaf_entry(data, off)?.0);
        }
        Ok(NodeBody::Leaf(entries))
    } else {
        let mut entries = Vec::with_capacity(count);
        for off in offsets {
            entries.push(decode_inner_entry(data, off)?.0);
        }
        Ok(NodeBody::Inner(entries))
    }
}

/// Rebuild the page body from a parsed node. The caller verified `fits`.
pub fn write(node: &Node, data: &mut [u8], schema: &NodeSchema) -> Result<()> {
    write_u16(data, OFF_COUNT, node.count() as u16);
    data[OFF_LAYOUT] = node.layout as u8;
    data[OFF_LEVEL] = node.level;
    data[OFF_NODE_FLAGS] = 0;
    write_u16(data, OFF_KEYS_COMP_LEN, 0);
    data[OFF_KEYS_COMP_LEN + 2] = 0;
    write_u64(data, OFF_LEFT, node.left);
    write_u64(data, OFF_RIGHT, node.right);
    write_u64(data, OFF_LEFTMOST, node.leftmost);
    // Stale bytes from removed entries must not linger.
    data[NODE_BODY_OFF..].fill(0);

    match node.layout {
        Layout::Compact => write_compact(node, data, schema),
        Layout::General => write_general(node, data),
    }
}

fn write_compact(node: &Node, data: &mut [u8], schema: &NodeSchema) -> Result<()> {
    let kw = schema.key_width as usize;
    let cap = if node.is_leaf() { schema.leaf_capacity() } else { schema.inner_capacity() };
    if node.count() > cap {
        return Err(Error::with_detail(ErrorKind::InternalError, "compact node written over capacity"));
    }
    let val_off = NODE_BODY_OFF + cap * kw;

    let mut keys = Vec::with_capacity(node.count() * kw);
    match &node.body {
        NodeBody::Leaf(entries) => {
            let rw = schema.record_width as usize;
            for (i, entry) in entries.iter().enumerate() {
                let (key, rec) = match (&entry.key, &entry.payload) {
                    (KeyRepr::Inline(k), LeafPayload::Single(RecordRef::Inline(r))) => (k, r),
                    _ => {
                        return Err(Error::with_detail(
                            ErrorKind::InternalError,
                            "compact layout holds only inline keys and records",
                        ))
                    }
                };
                if key.len() != kw || rec.len() != rw {
                    return Err(Error::new(ErrorKind::InternalError));
                }
                keys.extend_from_slice(key);
                data[val_off + i * rw..val_off + (i + 1) * rw].copy_from_slice(rec);
            }
        }
        NodeBody::Inner(entries) => {
            for (i, entry) in entries.iter().enumerate() {
                let key = match &entry.key {
                    KeyRepr::Inline(k) => k,
                    KeyRepr::Extended { .. } => {
                        return Err(Error::with_detail(
                            ErrorKind::InternalError,
                            "compact layout holds only inline keys",
                        ))
                    }
                };
                if key.len() != kw {
                    return Err(Error::new(ErrorKind::InternalError));
                }
                keys.extend_from_slice(key);
                write_u64(data, val_off + i * 8, entry.child);
            }
        }
    }

    if !schema.key_codec.is_none() && !keys.is_empty() {
        let packed = schema.key_codec.compress(&keys)?;
        if packed.len() < keys.len() && packed.len() <= u16::MAX as usize {
            data[OFF_NODE_FLAGS] = NODE_FLAG_KEYS_COMPRESSED;
            write_u16(data, OFF_KEYS_COMP_LEN, packed.len() as u16);
            data[NODE_BODY_OFF..NODE_BODY_OFF + packed.len()].copy_from_slice(&packed);
            return Ok(());
        }
    }
    data[NODE_BODY_OFF..NODE_BODY_OFF + keys.len()].copy_from_slice(&keys);
    Ok(())
}

fn write_general(node: &Node, data: &mut [u8]) -> Result<()> {
    let count = node.count();
    let mut cursor = NODE_BODY_OFF + count * 2;
    match &node.body {
        NodeBody::Leaf(entries) => {
            for (i, entry) in entries.iter().enumerate() {
                write_u16(data, NODE_BODY_OFF + i * 2, cursor as u16);
                cursor = encode_leaf_entry(entry, data, cursor)?;
            }
        }
        NodeBody::Inner(entries) => {
            for (i, entry) in entries.iter().enumerate() {
                write_u16(data, NODE_BODY_OFF + i * 2, cursor as u16);
                cursor = encode_inner_entry(entry, data, cursor)?;
            }
        }
    }
    if cursor > data.len() {
        return Err(Error::with_detail(ErrorKind::InternalError, "general node written over capacity"));
    }
    Ok(())
}

// ============================================================================
// Entry codecs (general layout)
// ============================================================================

const EFLAG_EXT_KEY: u8 = 0x01;
const EFLAG_PAYLOAD_MASK: u8 = 0x06;
const EFLAG_PAYLOAD_SINGLE: u8 = 0x00;
const EFLAG_PAYLOAD_DUP_INLINE: u8 = 0x02;
const EFLAG_PAYLOAD_DUP_TABLE: u8 = 0x04;

const RFLAG_BLOB: u8 = 0x01;

fn encode_key(key: &KeyRepr, data: &mut [u8], mut off: usize) -> usize {
    match key {
        KeyRepr::Inline(k) => {
            write_u16(data, off, k.len() as u16);
            off += 2;
            data[off..off + k.len()].copy_from_slice(k);
            off + k.len()
        }
        KeyRepr::Extended { prefix, blob, full_len } => {
            write_u32(data, off, *full_len);
            off += 4;
            write_u16(data, off, prefix.len() as u16);
            off += 2;
            data[off..off + prefix.len()].copy_from_slice(prefix);
            off += prefix.len();
            write_u64(data, off, *blob);
            off + 8
        }
    }
}

fn decode_key(data: &[u8], mut off: usize, extended: bool) -> Result<(KeyRepr, usize)> {
    if extended {
        let full_len = read_u32(data, off);
        off += 4;
        let plen = read_u16(data, off) as usize;
        off += 2;
        let prefix = data[off..off + plen].to_vec();
        off += plen;
        let blob = read_u64(data, off);
        Ok((KeyRepr::Extended { prefix, blob, full_len }, off + 8))
    } else {
        let klen = read_u16(data, off) as usize;
        off += 2;
        if off + klen > data.len() {
            return Err(Error::with_detail(ErrorKind::IntegrityViolated, "key overruns node"));
        }
        Ok((KeyRepr::Inline(data[off..off + klen].to_vec()), off + klen))
    }
}

pub fn encode_record_ref(rec: &RecordRef, data: &mut [u8], mut off: usize) -> usize {
    match rec {
        RecordRef::Inline(bytes) => {
            data[off] = 0;
            off += 1;
            write_u32(data, off, bytes.len() as u32);
            off += 4;
            data[off..off + bytes.len()].copy_from_slice(bytes);
            off + bytes.len()
        }
        RecordRef::Blob { id, size } => {
            data[off] = RFLAG_BLOB;
            off += 1;
            write_u64(data, off, *id);
            off += 8;
            write_u32(data, off, *size);
            off + 4
        }
    }
}

pub fn decode_record_ref(data: &[u8], mut off: usize) -> Result<(RecordRef, usize)> {
    let rflags = data[off];
    off += 1;
    if rflags & RFLAG_BLOB != 0 {
        let id = read_u64(data, off);
        off += 8;
        let size = read_u32(data, off);
        Ok((RecordRef::Blob { id, size }, off + 4))
    } else {
        let len = read_u32(data, off) as usize;
        off += 4;
        if off + len > data.len() {
            return Err(Error::with_detail(ErrorKind::IntegrityViolated, "record overruns node"));
        }
        Ok((RecordRef::Inline(data[off..off + len].to_vec()), off + len))
    }
}

fn encode_leaf_entry(entry: &LeafEntry, data: &mut [u8], mut off: usize) -> Result<usize> {
    let mut eflags = match &entry.payload {
        LeafPayload::Single(_) => EFLAG_PAYLOAD_SINGLE,
        LeafPayload::DupInline(_) => EFLAG_PAYLOAD_DUP_INLINE,
        LeafPayload::DupTable { .. } => EFLAG_PAYLOAD_DUP_TABLE,
    };
    if entry.key.is_extended() {
        eflags |= EFLAG_EXT_KEY;
    }
    let end = off + 1 + entry.key.encoded_len() + entry.payload.encoded_len();
    if end > data.len() {
        return Err(Error::with_detail(ErrorKind::InternalError, "leaf entry written over capacity"));
    }
    data[off] = eflags;
    off += 1;
    off = encode_key(&entry.key, data, off);
    match &entry.payload {
        LeafPayload::Single(rec) => {
            off = encode_record_ref(rec, data, off);
        }
        LeafPayload::DupInline(refs) => {
            write_u16(data, off, refs.len() as u16);
            off += 2;
            for rec in refs {
                off = encode_record_ref(rec, data, off);
            }
        }
        LeafPayload::DupTable { page, count } => {
            write_u64(data, off, *page);
            off += 8;
            write_u64(data, off, *count);
            off += 8;
        }
    }
    Ok(off)
}

fn decode_leaf_entry(data: &[u8], mut off: usize) -> Result<(LeafEntry, usize)> {
    let eflags = data[off];
    off += 1;
    let (key, next) = decode_key(data, off, eflags & EFLAG_EXT_KEY != 0)?;
    off = next;
    let payload = match eflags & EFLAG_PAYLOAD_MASK {
        EFLAG_PAYLOAD_SINGLE => {
            let (rec, next) = decode_record_ref(data, off)?;
            off = next;
            LeafPayload::Single(rec)
        }
        EFLAG_PAYLOAD_DUP_INLINE => {
            let n = read_u16(data, off) as usize;
            off += 2;
            let mut refs = Vec::with_capacity(n);
            for _ in 0..n {
                let (rec, next) = decode_record_ref(data, off)?;
                off = next;
                refs.push(rec);
            }
            LeafPayload::DupInline(refs)
        }
        EFLAG_PAYLOAD_DUP_TABLE => {
            let page = read_u64(data, off);
            off += 8;
            let count = read_u64(data, off);
            off += 8;
            LeafPayload::DupTable { page, count }
        }
        _ => return Err(Error::with_detail(ErrorKind::IntegrityViolated, "bad leaf entry flags")),
    };
    Ok((LeafEntry { key, payload }, off))
}

fn encode_inner_entry(entry: &InnerEntry, data: &mut [u8], mut off: usize) -> Result<usize> {
    let end = off + 1 + entry.key.encoded_len() + 8;
    if end > data.len() {
        return Err(Error::with_detail(ErrorKind::InternalError, "inner entry written over capacity"));
    }
    let mut eflags = 0;
    if entry.key.is_extended() {
        eflags |= EFLAG_EXT_KEY;
    }
    data[off] = eflags;
    off += 1;
    off = encode_key(&entry.key, data, off);
    write_u64(data, off, entry.child);
    Ok(off + 8)
}

fn decode_inner_entry(data: &[u8], mut off: usize) -> Result<(InnerEntry, usize)> {
    let eflags = data[off];
    off += 1;
    let (key, next) = decode_key(data, off, eflags & EFLAG_EXT_KEY != 0)?;
    off = next;
    let child = read_u64(data, off);
    Ok((InnerEntry { key, child }, off + 8))
}

// ============================================================================
// Raw header access
// ============================================================================

/// Patch a sibling link without parsing the node.
pub fn set_left_sibling(data: &mut [u8], id: PageId) {
    write_u64(data, OFF_LEFT, id);
}

pub fn set_right_sibling(data: &mut [u8], id: PageId) {
    write_u64(data, OFF_RIGHT, id);
}

pub fn node_level(data: &[u8]) -> u8 {
    data[OFF_LEVEL]
}

pub fn node_count(data: &[u8]) -> usize {
    read_u16(data, OFF_COUNT) as usize
}

// ============================================================================
// Comparison
// ============================================================================

/// Compare a stored key against probe bytes. Extended keys compare by prefix
/// first and dereference their overflow blob only on a prefix tie; custom
/// comparators always see full keys.
pub fn compare_key(
    stored: &KeyRepr,
    probe: &[u8],
    cmp: &KeyCompare,
    resolve: &mut dyn FnMut(BlobId) -> Result<Vec<u8>>,
) -> Result<Ordering> {
    match stored {
        KeyRepr::Inline(k) => cmp.compare(k, probe),
        KeyRepr::Extended { prefix, blob, .. } => {
            if matches!(cmp, KeyCompare::Custom(_) | KeyCompare::Unresolved) {
                let full = resolve(*blob)?;
                return cmp.compare(&full, probe);
            }
            let probe_pre = &probe[..probe.len().min(prefix.len())];
            match prefix[..probe_pre.len().min(prefix.len())].cmp(probe_pre) {
                Ordering::Equal => {
                    if probe.len() <= prefix.len() {
                        // The stored key is longer than its prefix, so it is
                        // longer than the probe and memcmp-greater.
                        Ok(Ordering::Greater)
                    } else {
                        let full = resolve(*blob)?;
                        Ok(full.as_slice().cmp(probe))
                    }
                }
                other => Ok(other),
            }
        }
    }
}

/// Materialize the full key bytes.
pub fn key_bytes(
    key: &KeyRepr,
    resolve: &mut dyn FnMut(BlobId) -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    match key {
        KeyRepr::Inline(k) => Ok(k.clone()),
        KeyRepr::Extended { blob, .. } => resolve(*blob),
    }
}

/// Binary search over a node's keys. Returns `(slot, exact)` where `slot` is
/// the insertion position when no exact match exists.
pub fn search<K: KeyAt>(
    keys: &K,
    probe: &[u8],
    cmp: &KeyCompare,
    resolve: &mut dyn FnMut(BlobId) -> Result<Vec<u8>>,
) -> Result<(usize, bool)> {
    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_key(keys.key_at(mid), probe, cmp, resolve)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Key accessor shared by leaf and inner entry vectors.
pub trait KeyAt {
    fn len(&self) -> usize;
    fn key_at(&self, i: usize) -> &KeyRepr;
}

impl KeyAt for Vec<LeafEntry> {
    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn key_at(&self, i: usize) -> &KeyRepr {
        &self[i].key
    }
}

impl KeyAt for Vec<InnerEntry> {
    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn key_at(&self, i: usize) -> &KeyRepr {
        &self[i].key
    }
}

/// Stride binary search over a raw compact leaf, no parse, no indirection.
/// Returns `(slot, exact)` like [`search`].
pub fn search_compact_raw(
    data: &[u8],
    schema: &NodeSchema,
    probe: &[u8],
    cmp: &KeyCompare,
) -> Result<(usize, bool)> {
    debug_assert_eq!(schema.layout, Layout::Compact);
    if data[OFF_NODE_FLAGS] & NODE_FLAG_KEYS_COMPRESSED != 0 {
        // Compressed key regions go through the parsed path.
        return Err(Error::new(ErrorKind::NotImplemented));
    }
    let kw = schema.key_width as usize;
    let count = node_count(data);
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let key = &data[NODE_BODY_OFF + mid * kw..NODE_BODY_OFF + (mid + 1) * kw];
        match cmp.compare(key, probe)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Fixed-width record read from a raw compact leaf.
pub fn compact_record_at(data: &[u8], schema: &NodeSchema, slot: usize) -> Vec<u8> {
    let kw = schema.key_width as usize;
    let rw = schema.record_width as usize;
    let cap = compact_capacity(schema.page_size, schema.key_width, schema.record_width);
    let val_off = NODE_BODY_OFF + cap * kw;
    data[val_off + slot * rw..val_off + (slot + 1) * rw].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn general_schema() -> NodeSchema {
        NodeSchema {
            layout: Layout::General,
            key_width: 0,
            record_width: 0,
            key_codec: Codec::None,
            page_size: 1024,
        }
    }

    fn compact_schema() -> NodeSchema {
        NodeSchema {
            layout: Layout::Compact,
            key_width: 4,
            record_width: 8,
            key_codec: Codec::None,
            page_size: 1024,
        }
    }

    #[test]
    fn test_general_leaf_roundtrip() {
        let schema = general_schema();
        let mut node = Node::new_leaf(Layout::General);
        node.left = 11;
        node.right = 12;
        node.leaf_entries_mut().extend([
            LeafEntry {
                key: KeyRepr::Inline(b"alpha".to_vec()),
                payload: LeafPayload::Single(RecordRef::Inline(b"one".to_vec())),
            },
            LeafEntry {
                key: KeyRepr::Extended {
                    prefix: b"bbbbbbbbbbbbbbbbbbbbbbbb".to_vec(),
                    blob: 0xdead,
                    full_len: 300,
                },
                payload: LeafPayload::Single(RecordRef::Blob { id: 77, size: 1000 }),
            },
            LeafEntry {
                key: KeyRepr::Inline(b"carrot".to_vec()),
                payload: LeafPayload::DupInline(vec![
                    RecordRef::Inline(b"x".to_vec()),
                    RecordRef::Blob { id: 88, size: 99 },
                ]),
            },
            LeafEntry {
                key: KeyRepr::Inline(b"durian".to_vec()),
                payload: LeafPayload::DupTable { page: 5, count: 40 },
            },
        ]);

        let mut data = vec![0u8; 1024];
        write(&node, &mut data, &schema).unwrap();
        let parsed = parse(&data, &schema).unwrap();
        assert_eq!(parsed.left, 11);
        assert_eq!(parsed.right, 12);
        assert_eq!(parsed.body, node.body);
    }

    #[test]
    fn test_general_inner_roundtrip() {
        let schema = general_schema();
        let mut node = Node::new_inner(Layout::General, 1, 99);
        node.inner_entries_mut().extend([
            InnerEntry { key: KeyRepr::Inline(b"m".to_vec()), child: 3 },
            InnerEntry { key: KeyRepr::Inline(b"t".to_vec()), child: 4 },
        ]);
        let mut data = vec![0u8; 1024];
        write(&node, &mut data, &schema).unwrap();
        let parsed = parse(&data, &schema).unwrap();
        assert_eq!(parsed.leftmost, 99);
        assert_eq!(parsed.level, 1);
        assert_eq!(parsed.body, node.body);
    }

    #[test]
    fn test_compact_roundtrip_and_raw_search() {
        let schema = compact_schema();
        let mut node = Node::new_leaf(Layout::Compact);
        for i in [10u32, 20, 30, 40, 50] {
            node.leaf_entries_mut().push(LeafEntry {
                key: KeyRepr::Inline(i.to_le_bytes().to_vec()),
                payload: LeafPayload::Single(RecordRef::Inline((i as u64).to_le_bytes().to_vec())),
            });
        }
        let mut data = vec![0u8; 1024];
        write(&node, &mut data, &schema).unwrap();
        assert_eq!(parse(&data, &schema).unwrap().body, node.body);

        let cmp = KeyCompare::UInt32;
        let (slot, exact) =
            search_compact_raw(&data, &schema, &30u32.to_le_bytes(), &cmp).unwrap();
        assert!(exact);
        assert_eq!(slot, 2);
        assert_eq!(compact_record_at(&data, &schema, slot), 30u64.to_le_bytes().to_vec());

        let (slot, exact) =
            search_compact_raw(&data, &schema, &35u32.to_le_bytes(), &cmp).unwrap();
        assert!(!exact);
        assert_eq!(slot, 3);
    }

    #[test]
    fn test_compact_key_compression() {
        let schema = NodeSchema { key_codec: Codec::Zlib, ..compact_schema() };
        let mut node = Node::new_leaf(Layout::Compact);
        for i in 0u32..30 {
            node.leaf_entries_mut().push(LeafEntry {
                key: KeyRepr::Inline(i.to_le_bytes().to_vec()),
                payload: LeafPayload::Single(RecordRef::Inline(vec![0u8; 8])),
            });
        }
        let mut data = vec![0u8; 1024];
        write(&node, &mut data, &schema).unwrap();
        assert_eq!(data[OFF_NODE_FLAGS] & NODE_FLAG_KEYS_COMPRESSED, NODE_FLAG_KEYS_COMPRESSED);
        assert_eq!(parse(&data, &schema).unwrap().body, node.body);
    }

    #[test]
    fn test_fits_and_underfull() {
        let schema = general_schema();
        let mut node = Node::new_leaf(Layout::General);
        assert!(schema.fits(&node));
        assert!(schema.underfull(&node));

        // ~24 bytes per entry; a 1 KiB page fills up around 40 entries.
        let mut i = 0u32;
        while schema.fits(&node) {
            node.leaf_entries_mut().push(LeafEntry {
                key: KeyRepr::Inline(format!("key-{i:04}").into_bytes()),
                payload: LeafPayload::Single(RecordRef::Inline(b"0123456789".to_vec())),
            });
            i += 1;
        }
        assert!(i > 4, "page must hold a reasonable fanout");
        assert!(!schema.underfull(&node));
    }

    #[test]
    fn test_search_parsed_entries() {
        let cmp = KeyCompare::Memcmp;
        let entries: Vec<LeafEntry> = [b"b", b"d", b"f"]
            .iter()
            .map(|k| LeafEntry {
                key: KeyRepr::Inline(k.to_vec()),
                payload: LeafPayload::Single(RecordRef::Inline(Vec::new())),
            })
            .collect();
        let mut resolve = |_: BlobId| -> Result<Vec<u8>> { unreachable!() };
        assert_eq!(search(&entries, b"d", &cmp, &mut resolve).unwrap(), (1, true));
        assert_eq!(search(&entries, b"a", &cmp, &mut resolve).unwrap(), (0, false));
        assert_eq!(search(&entries, b"e", &cmp, &mut resolve).unwrap(), (2, false));
        assert_eq!(search(&entries, b"g", &cmp, &mut resolve).unwrap(), (3, false));
    }

    #[test]
    fn test_extended_key_compare() {
        let cmp = KeyCompare::Memcmp;
        let long_key = vec![b'k'; 100];
        let stored = KeyRepr::Extended {
            prefix: long_key[..EXT_KEY_PREFIX].to_vec(),
            blob: 1,
            full_len: 100,
        };
        let long_clone = long_key.clone();
        let mut resolve = move |_: BlobId| Ok(long_clone.clone());

        // Shorter probe that matches the prefix: stored key is greater.
        assert_eq!(
            compare_key(&stored, b"kkk", &cmp, &mut resolve).unwrap(),
            Ordering::Greater
        );
        // Equal full key resolves through the blob.
        assert_eq!(
            compare_key(&stored, &long_key, &cmp, &mut resolve).unwrap(),
            Ordering::Equal
        );
        // Probe past the prefix tie, differing after it.
        let mut bigger = long_key.clone();
        bigger.push(b'z');
        assert_eq!(
            compare_key(&stored, &bigger, &cmp, &mut resolve).unwrap(),
            Ordering::Less
        );
        // Prefix itself decides when it differs.
        assert_eq!(
            compare_key(&stored, b"z", &cmp, &mut resolve).unwrap(),
            Ordering::Less
        );
    }
}
