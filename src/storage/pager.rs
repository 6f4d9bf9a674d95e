//! Pager: page lifecycle between the cache and the device
//!
//! The pager is the only component that moves pages across the device
//! boundary. Fetch reads, verifies and decrypts; allocation draws from the
//! freelist before extending the file; writeback seals pages and persists
//! them children-first so that no page referencing a target reaches the disk
//! before the target does.

use std::collections::HashMap;

use crate::error::{Error, ErrorKind, Result};
use crate::os::Device;
use crate::storage::cache::{CacheMode, PageCache};
use crate::storage::codec::PageTransform;
use crate::storage::freelist::Freelist;
use crate::storage::page::{Page, PageKind, PageRef};
use crate::types::PageId;

pub struct Pager {
    device: Box<dyn Device>,
    cache: PageCache,
    transform: PageTransform,
    freelist: Freelist,
    page_size: u32,
    file_size_limit: u64,
    read_only: bool,
    /// First page id that has never been allocated (current end of store).
    next_page_id: PageId,
}

impl Pager {
    pub fn new(
        mut device: Box<dyn Device>,
        transform: PageTransform,
        page_size: u32,
        cache_size: u64,
        cache_mode: CacheMode,
        file_size_limit: u64,
        read_only: bool,
    ) -> Result<Self> {
        let len = device.len()?;
        if len % page_size as u64 != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidFileHeader,
                "backing store is not a whole number of pages",
            ));
        }
        Ok(Pager {
            device,
            cache: PageCache::new(cache_size, page_size, cache_mode),
            transform,
            freelist: Freelist::new(),
            page_size,
            file_size_limit,
            read_only,
            next_page_id: len / page_size as u64,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Total pages ever allocated (the store's length in pages).
    pub fn total_pages(&self) -> PageId {
        self.next_page_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn transform(&self) -> &PageTransform {
        &self.transform
    }

    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    pub fn freelist_mut(&mut self) -> &mut Freelist {
        &mut self.freelist
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    // ------------------------------------------------------------------
    // Fetch and allocation
    // ------------------------------------------------------------------

    /// Bring a page into the cache (or find it there) and pin it.
    pub fn fetch(&mut self, id: PageId) -> Result<PageRef> {
        if let Some(page) = self.cache.get(id) {
            return Ok(page);
        }
        if id >= self.next_page_id {
            return Err(Error::with_detail(
                ErrorKind::IntegrityViolated,
                format!("page {id} is beyond the end of the store"),
            ));
        }
        let mut data = vec![0u8; self.page_size as usize];
        self.device.read(id * self.page_size as u64, &mut data)?;
        self.transform.open(id, &mut data)?;
        let page = Page::from_bytes(id, data)?;
        log::trace!("fetched page {id} ({:?})", page.kind());
        let page = self.cache.insert(page);
        self.maintain_cache()?;
        Ok(page)
    }

    /// Allocate one page, preferring the freelist over extending the store.
    pub fn alloc(&mut self, kind: PageKind, owner: u64) -> Result<PageRef> {
        if self.read_only {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        let id = match self.freelist.alloc() {
            Some(id) => id,
            None => self.extend(1)?,
        };
        let mut page = Page::new(id, self.page_size, kind, owner);
        page.mark_dirty();
        let page = self.cache.insert(page);
        self.maintain_cache()?;
        Ok(page)
    }

    /// Allocate `count` contiguous pages for a multi-page blob.
    pub fn alloc_run(&mut self, count: usize, kind: PageKind, owner: u64) -> Result<Vec<PageRef>> {
        if self.read_only {
            return Err(Error::new(ErrorKind::WriteProtected));
        }
        let start = match self.freelist.alloc_run(count) {
            Some(start) => start,
            None => self.extend(count)?,
        };
        let mut pages = Vec::with_capacity(count);
        for id in start..start + count as PageId {
            let mut page = Page::new(id, self.page_size, kind, owner);
            page.mark_dirty();
            pages.push(self.cache.insert(page));
        }
        self.maintain_cache()?;
        Ok(pages)
    }

    fn extend(&mut self, count: usize) -> Result<PageId> {
        let start = self.next_page_id;
        let new_len = (start + count as PageId) * self.page_size as u64;
        if self.file_size_limit != 0 && new_len > self.file_size_limit {
            return Err(Error::with_detail(
                ErrorKind::LimitsReached,
                format!("file size limit {} exceeded", self.file_size_limit),
            ));
        }
        self.next_page_id += count as PageId;
        Ok(start)
    }

    /// Return a page to the freelist and drop it from the cache.
    pub fn free_page(&mut self, id: PageId) {
        self.cache.remove(id);
        self.freelist.release(id);
    }

    pub fn free_run(&mut self, start: PageId, count: usize) {
        for id in start..start + count as PageId {
            self.cache.remove(id);
        }
        self.freelist.release_run(start, count);
    }

    /// Drop a cached page without freeing it (corrupt page discard).
    pub fn discard(&mut self, id: PageId) {
        self.cache.remove(id);
    }

    // ------------------------------------------------------------------
    // Writeback
    // ------------------------------------------------------------------

    /// Persist every dirty page, children before parents, then flush the
    /// device.
    pub fn flush_all(&mut self, fsync: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        // Grow the store up front so every page offset is writable.
        let want = self.next_page_id * self.page_size as u64;
        if self.device.len()? < want {
            self.device.truncate(want)?;
        }
        let dirty = writeback_order(self.cache.dirty_pages());
        let count = dirty.len();
        for page_ref in dirty {
            self.write_page(&page_ref)?;
        }
        self.device.flush(fsync)?;
        if count > 0 {
            log::trace!("flushed {count} dirty pages (fsync={fsync})");
        }
        self.cache.evict_clean();
        Ok(())
    }

    fn write_page(&mut self, page_ref: &PageRef) -> Result<()> {
        let mut page = page_ref.write();
        let mut image = page.data.clone();
        self.transform.seal(page.id(), &mut image);
        // Failure keeps the page dirty so the flush can be retried.
        self.device.write(page.id() * self.page_size as u64, &image)?;
        page.clear_dirty();
        Ok(())
    }

    /// Post-operation cache maintenance: evict clean LRU victims; in strict
    /// mode, flush dirty pages first so the cap actually holds.
    pub fn maintain_cache(&mut self) -> Result<()> {
        if !self.cache.over_capacity() {
            return Ok(());
        }
        self.cache.evict_clean();
        if self.cache.strict() && self.cache.over_capacity() && !self.read_only {
            self.flush_all(false)?;
            self.cache.evict_clean();
        }
        Ok(())
    }

    /// Whether any resident page is dirty.
    pub fn has_dirty(&self) -> bool {
        !self.cache.dirty_pages().is_empty()
    }

    /// Drop every cached page. Used when an environment closes.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Flush the device without writing pages (journal-style barrier).
    pub fn sync_device(&mut self, fsync: bool) -> Result<()> {
        self.device.flush(fsync)
    }
}

/// Order dirty pages so that no page is persisted before a page it
/// references. Ranks put children below parents (blobs, duplicate tables,
/// btree pages by level, then the freelist and the header); within a rank,
/// pages chained through their kind word are walked with an explicit work
/// stack so chain tails persist before the heads pointing at them. The id
/// is only the final tiebreak between unrelated pages.
fn writeback_order(mut dirty: Vec<PageRef>) -> Vec<PageRef> {
    let links: HashMap<PageId, Option<PageId>> = dirty
        .iter()
        .map(|p| {
            let page = p.read();
            (page.id(), page.chain_next())
        })
        .collect();

    // Distance to the end of the dirty part of each chain: a tail (or a
    // page whose successor is already clean) is 0, every referrer is one
    // more than its referent. Ascending distance persists referents first.
    let mut dist: HashMap<PageId, u32> = HashMap::new();
    for page_ref in &dirty {
        let start = page_ref.read().id();
        if dist.contains_key(&start) {
            continue;
        }
        let mut stack = vec![start];
        loop {
            let top = *stack.last().expect("stack seeded above");
            match links.get(&top).copied().flatten() {
                Some(next)
                    if links.contains_key(&next)
                        && !dist.contains_key(&next)
                        && !stack.contains(&next) =>
                {
                    stack.push(next);
                }
                _ => break,
            }
        }
        while let Some(id) = stack.pop() {
            let d = links
                .get(&id)
                .copied()
                .flatten()
                .and_then(|next| dist.get(&next).copied())
                .map_or(0, |d| d + 1);
            dist.insert(id, d);
        }
    }

    dirty.sort_by_key(|p| {
        let page = p.read();
        (page.flush_rank(), dist.get(&page.id()).copied().unwrap_or(0), page.id())
    });
    dirty
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::*;
    use crate::os::MemDevice;

    fn page_refs(pages: impl IntoIterator<Item = Page>) -> Vec<PageRef> {
        pages.into_iter().map(|p| Arc::new(RwLock::new(p))).collect()
    }

    fn ordered_ids(pages: Vec<PageRef>) -> Vec<PageId> {
        writeback_order(pages).iter().map(|p| p.read().id()).collect()
    }

    fn mem_pager() -> Pager {
        let transform = PageTransform::new(true, None, [0u8; 16]);
        Pager::new(
            Box::new(MemDevice::new()),
            transform,
            1024,
            64 * 1024,
            CacheMode::Normal,
            0,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_alloc_fetch_roundtrip() {
        let mut pager = mem_pager();
        let page = pager.alloc(PageKind::BtreeLeaf, 5).unwrap();
        let id = page.read().id();
        page.write().data[100] = 0xaa;
        page.write().mark_dirty();
        drop(page);

        pager.flush_all(false).unwrap();
        pager.clear_cache();

        let page = pager.fetch(id).unwrap();
        let guard = page.read();
        assert_eq!(guard.kind(), PageKind::BtreeLeaf);
        assert_eq!(guard.owner(), 5);
        assert_eq!(guard.data[100], 0xaa);
    }

    #[test]
    fn test_freelist_reuse() {
        let mut pager = mem_pager();
        let first = pager.alloc(PageKind::Blob, 0).unwrap().read().id();
        let second = pager.alloc(PageKind::Blob, 0).unwrap().read().id();
        assert_ne!(first, second);

        pager.free_page(first);
        let third = pager.alloc(PageKind::Blob, 0).unwrap().read().id();
        assert_eq!(third, first, "freed page is reused before extending");
    }

    #[test]
    fn test_fetch_beyond_end_fails() {
        let mut pager = mem_pager();
        let err = pager.fetch(99).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
    }

    #[test]
    fn test_file_size_limit() {
        let transform = PageTransform::new(false, None, [0u8; 16]);
        let mut pager = Pager::new(
            Box::new(MemDevice::new()),
            transform,
            1024,
            64 * 1024,
            CacheMode::Normal,
            2048,
            false,
        )
        .unwrap();
        pager.alloc(PageKind::Blob, 0).unwrap();
        pager.alloc(PageKind::Blob, 0).unwrap();
        let err = pager.alloc(PageKind::Blob, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitsReached);
    }

    #[test]
    fn test_alloc_run_is_contiguous() {
        let mut pager = mem_pager();
        let pages = pager.alloc_run(3, PageKind::Blob, 0).unwrap();
        let ids: Vec<_> = pages.iter().map(|p| p.read().id()).collect();
        assert_eq!(ids, vec![ids[0], ids[0] + 1, ids[0] + 2]);
    }

    #[test]
    fn test_writeback_flushes_chain_tail_first() {
        // Head 1 -> 2 -> 3: ascending ids head-first, exactly how a grown
        // freelist or duplicate-table chain allocates. The referent must
        // reach the disk before its referrer regardless of the ids.
        let mut head = Page::new(1, 1024, PageKind::Freelist, 0);
        head.set_kind_word(2);
        let mut mid = Page::new(2, 1024, PageKind::Freelist, 0);
        mid.set_kind_word(3);
        let tail = Page::new(3, 1024, PageKind::Freelist, 0);

        assert_eq!(ordered_ids(page_refs([head, mid, tail])), vec![3, 2, 1]);
    }

    #[test]
    fn test_writeback_chain_and_rank_interaction() {
        // The duplicate-table chain flushes tail first and the whole chain
        // precedes the leaf that references its head; the header goes last.
        let mut table_head = Page::new(5, 1024, PageKind::DupTable, 1);
        table_head.set_kind_word(6);
        let table_tail = Page::new(6, 1024, PageKind::DupTable, 1);
        let leaf = Page::new(2, 1024, PageKind::BtreeLeaf, 1);
        let header = Page::new(0, 1024, PageKind::Header, 0);

        assert_eq!(
            ordered_ids(page_refs([header, leaf, table_head, table_tail])),
            vec![6, 5, 2, 0]
        );
    }

    #[test]
    fn test_writeback_ignores_links_to_clean_pages() {
        // A chain link to a page that is not in the dirty set (already
        // persisted) imposes no ordering.
        let mut head = Page::new(7, 1024, PageKind::DupTable, 1);
        head.set_kind_word(99);
        let other = Page::new(8, 1024, PageKind::DupTable, 1);

        assert_eq!(ordered_ids(page_refs([other, head])), vec![7, 8]);
    }

    #[test]
    fn test_corrupt_page_detected() {
        let mut pager = mem_pager();
        let id = {
            let page = pager.alloc(PageKind::Blob, 0).unwrap();
            page.write().mark_dirty();
            let id = page.read().id();
            id
        };
        pager.flush_all(false).unwrap();
        pager.clear_cache();

        // Flip one byte behind the pager's back.
        pager.device.write(id * 1024 + 200, b"x").unwrap();
        let err = pager.fetch(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
    }
}
