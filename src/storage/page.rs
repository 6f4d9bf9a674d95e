//! Page buffer and header layout
//!
//! Every unit of I/O and caching is one fixed-size page. The first 32 bytes
//! of each page are the common header:
//!
//! ```text
//! 0..4    crc32 over bytes 4.. (zero when CRC is disabled)
//! 4       page kind tag
//! 5..8    reserved
//! 8..16   self id
//! 16..24  owning database name (btree pages; zero otherwise)
//! 24..32  kind-specific word (freelist: next page; blob: used/live counts;
//!         duplicate table: next chain page)
//! ```
//!
//! The header stays plaintext when encryption is on; the cipher covers the
//! payload only.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};
use crate::storage::encoding::{read_u64, write_u64};
use crate::types::PageId;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 32;

pub const OFF_CRC: usize = 0;
pub const OFF_KIND: usize = 4;
pub const OFF_ID: usize = 8;
pub const OFF_OWNER: usize = 16;
pub const OFF_KIND_WORD: usize = 24;

/// Byte offset of the btree node level within a btree page. Writeback orders
/// parents after children by reading this single byte, without parsing nodes.
pub const NODE_LEVEL_OFF: usize = 35;

/// Page type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Header = 1,
    BtreeInternal = 2,
    BtreeLeaf = 3,
    Blob = 4,
    Freelist = 5,
    DupTable = 6,
}

impl PageKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => PageKind::Header,
            2 => PageKind::BtreeInternal,
            3 => PageKind::BtreeLeaf,
            4 => PageKind::Blob,
            5 => PageKind::Freelist,
            6 => PageKind::DupTable,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::IntegrityViolated,
                    format!("unknown page kind tag {v}"),
                ))
            }
        })
    }
}

/// A resident page. Shared ownership through [`PageRef`]; a page with more
/// than one live reference counts as pinned and is never evicted.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    dirty: bool,
    pub data: Vec<u8>,
}

pub type PageRef = Arc<RwLock<Page>>;

impl Page {
    /// Create a zeroed page with its header initialized.
    pub fn new(id: PageId, page_size: u32, kind: PageKind, owner: u64) -> Self {
        let mut data = vec![0u8; page_size as usize];
        data[OFF_KIND] = kind as u8;
        write_u64(&mut data, OFF_ID, id);
        write_u64(&mut data, OFF_OWNER, owner);
        Page { id, dirty: false, data }
    }

    /// Wrap bytes read from the device. The stored self-id must match.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Result<Self> {
        PageKind::from_u8(data[OFF_KIND])?;
        let stored = read_u64(&data, OFF_ID);
        if stored != id {
            return Err(Error::with_detail(
                ErrorKind::IntegrityViolated,
                format!("page {id} carries self-id {stored}"),
            ));
        }
        Ok(Page { id, dirty: false, data })
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> PageKind {
        // The tag was validated when the page entered the cache.
        PageKind::from_u8(self.data[OFF_KIND]).unwrap_or(PageKind::Header)
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        self.data[OFF_KIND] = kind as u8;
        self.dirty = true;
    }

    pub fn owner(&self) -> u64 {
        read_u64(&self.data, OFF_OWNER)
    }

    pub fn set_owner(&mut self, owner: u64) {
        write_u64(&mut self.data, OFF_OWNER, owner);
        self.dirty = true;
    }

    pub fn kind_word(&self) -> u64 {
        read_u64(&self.data, OFF_KIND_WORD)
    }

    pub fn set_kind_word(&mut self, word: u64) {
        write_u64(&mut self.data, OFF_KIND_WORD, word);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Writeback stratum: children before parents across kinds and btree
    /// levels, the environment header last. Equal-rank pages that link to
    /// each other through their kind word (duplicate tables, the freelist)
    /// are not ordered by the rank; the pager's writeback walk follows
    /// [`Page::chain_next`] to persist chain tails before the heads that
    /// reference them.
    pub fn flush_rank(&self) -> u32 {
        match self.kind() {
            PageKind::Blob => 0,
            PageKind::DupTable => 1,
            PageKind::BtreeLeaf => 2,
            PageKind::BtreeInternal => 3 + self.data[NODE_LEVEL_OFF] as u32,
            PageKind::Freelist => 1000,
            PageKind::Header => 1001,
        }
    }

    /// The page this one forward-references through its kind word, for
    /// kinds whose kind word is a chain link. Blob pages keep allocation
    /// state there instead and never link.
    pub fn chain_next(&self) -> Option<PageId> {
        match self.kind() {
            PageKind::DupTable | PageKind::Freelist => {
                let next = self.kind_word();
                if next != 0 {
                    Some(next)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut page = Page::new(7, 1024, PageKind::BtreeLeaf, 42);
        assert_eq!(page.id(), 7);
        assert_eq!(page.kind(), PageKind::BtreeLeaf);
        assert_eq!(page.owner(), 42);
        assert!(!page.is_dirty());

        page.set_kind_word(0xabcd);
        assert_eq!(page.kind_word(), 0xabcd);
        assert!(page.is_dirty());

        let reparsed = Page::from_bytes(7, page.data.clone()).unwrap();
        assert_eq!(reparsed.kind(), PageKind::BtreeLeaf);
        assert_eq!(reparsed.owner(), 42);
    }

    #[test]
    fn test_self_id_mismatch() {
        let page = Page::new(7, 1024, PageKind::Blob, 0);
        let err = Page::from_bytes(8, page.data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
    }

    #[test]
    fn test_chain_next_only_for_linking_kinds() {
        let mut table = Page::new(4, 1024, PageKind::DupTable, 0);
        assert_eq!(table.chain_next(), None);
        table.set_kind_word(9);
        assert_eq!(table.chain_next(), Some(9));

        let mut freelist = Page::new(5, 1024, PageKind::Freelist, 0);
        freelist.set_kind_word(11);
        assert_eq!(freelist.chain_next(), Some(11));

        // A blob page's kind word is its bump/live-count state, not a link.
        let mut blob = Page::new(6, 1024, PageKind::Blob, 0);
        blob.set_kind_word(0xdead_beef);
        assert_eq!(blob.chain_next(), None);
    }

    #[test]
    fn test_flush_rank_orders_parents_after_children() {
        let leaf = Page::new(1, 1024, PageKind::BtreeLeaf, 1);
        let mut inner = Page::new(2, 1024, PageKind::BtreeInternal, 1);
        inner.data[NODE_LEVEL_OFF] = 1;
        let mut root = Page::new(3, 1024, PageKind::BtreeInternal, 1);
        root.data[NODE_LEVEL_OFF] = 2;
        let header = Page::new(0, 1024, PageKind::Header, 0);

        assert!(leaf.flush_rank() < inner.flush_rank());
        assert!(inner.flush_rank() < root.flush_rank());
        assert!(root.flush_rank() < header.flush_rank());
    }
}
