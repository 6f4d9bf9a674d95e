//! Page cache with pinning and LRU eviction
//!
//! Pages are shared as [`PageRef`]s; any outstanding clone of the `Arc`
//! counts as a pin. Eviction approximates LRU with a monotonic use tick:
//! unpinned clean pages are the victims, dirty pages must be flushed by the
//! pager before they can go, and pinned pages never go.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::page::{Page, PageRef};
use crate::types::PageId;

/// Eviction regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Evict after the fact when the configured capacity is exceeded.
    Normal,
    /// Hard cap: evict before admitting new pages.
    Strict,
    /// Never evict (in-memory environments, `cache-unlimited`).
    Unlimited,
}

struct CacheEntry {
    page: PageRef,
    tick: u64,
}

pub struct PageCache {
    entries: HashMap<PageId, CacheEntry>,
    tick: u64,
    capacity_pages: usize,
    mode: CacheMode,
}

impl PageCache {
    pub fn new(capacity_bytes: u64, page_size: u32, mode: CacheMode) -> Self {
        let capacity_pages = (capacity_bytes / page_size as u64).max(8) as usize;
        PageCache { entries: HashMap::new(), tick: 0, capacity_pages, mode }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether eviction should run before the next page is admitted.
    pub fn over_capacity(&self) -> bool {
        match self.mode {
            CacheMode::Unlimited => false,
            CacheMode::Normal | CacheMode::Strict => self.entries.len() > self.capacity_pages,
        }
    }

    pub fn strict(&self) -> bool {
        self.mode == CacheMode::Strict
    }

    /// Look up a resident page and refresh its use tick.
    pub fn get(&mut self, id: PageId) -> Option<PageRef> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(&id)?;
        entry.tick = tick;
        Some(entry.page.clone())
    }

    /// Admit a page. The caller is responsible for running eviction.
    pub fn insert(&mut self, page: Page) -> PageRef {
        self.tick += 1;
        let id = page.id();
        let page = Arc::new(RwLock::new(page));
        self.entries.insert(id, CacheEntry { page: page.clone(), tick: self.tick });
        page
    }

    /// Drop a page outright (freed pages, discarded read errors).
    pub fn remove(&mut self, id: PageId) -> Option<PageRef> {
        self.entries.remove(&id).map(|e| e.page)
    }

    /// Evict unpinned clean pages, oldest first, until the cache is back
    /// within capacity. Returns the number of pages evicted.
    pub fn evict_clean(&mut self) -> usize {
        if self.mode == CacheMode::Unlimited {
            return 0;
        }
        let excess = self.entries.len().saturating_sub(self.capacity_pages);
        if excess == 0 {
            return 0;
        }
        let mut victims: Vec<(u64, PageId)> = self
            .entries
            .iter()
            .filter(|(_, e)| Arc::strong_count(&e.page) == 1 && !e.page.read().is_dirty())
            .map(|(&id, e)| (e.tick, id))
            .collect();
        victims.sort_unstable();
        let mut evicted = 0;
        for (_, id) in victims.into_iter().take(excess) {
            self.entries.remove(&id);
            evicted += 1;
            log::trace!("evicted page {id}");
        }
        evicted
    }

    /// Snapshot of all dirty resident pages.
    pub fn dirty_pages(&self) -> Vec<PageRef> {
        self.entries
            .values()
            .filter(|e| e.page.read().is_dirty())
            .map(|e| e.page.clone())
            .collect()
    }

    /// Snapshot of every resident page id.
    pub fn resident_ids(&self) -> Vec<PageId> {
        self.entries.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
