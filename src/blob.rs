//! Blob manager
//!
//! Variable-length payloads referenced from the btree live out-of-line as
//! blobs. A blob id encodes the byte address of its header in the backing
//! store, so locating a blob is pure arithmetic. Small blobs share the tail
//! region of a common blob page; large blobs occupy a contiguous run of
//! dedicated pages.
//!
//! Blob header, 16 bytes:
//!
//! ```text
//! 0..4    stored length (after compression)
//! 4..8    original length
//! 8..12   payload capacity of the allocation
//! 12      flags (compressed, spans-pages)
//! 13..16  reserved
//! ```
//!
//! A shared blob page tracks its bump offset and live-blob count in the page
//! header's kind word; the page is freed when the last blob on it dies.

use crate::compress::Codec;
use crate::error::{Error, ErrorKind, Result};
use crate::storage::encoding::{read_u32, write_u32};
use crate::storage::page::{PageKind, PAGE_HEADER_SIZE};
use crate::storage::Pager;
use crate::types::{BlobId, PageId};

pub const BLOB_HEADER_SIZE: usize = 16;

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_SPANS: u8 = 0x02;

/// Allocation state for shared small-blob pages. The open page is an
/// in-memory hint only; after reopen, allocation starts a fresh page.
#[derive(Debug, Default)]
pub struct BlobManager {
    open_page: Option<PageId>,
}

#[derive(Debug, Clone, Copy)]
struct BlobHeader {
    stored: u32,
    original: u32,
    capacity: u32,
    flags: u8,
}

impl BlobHeader {
    fn parse(data: &[u8], off: usize) -> Result<Self> {
        if off + BLOB_HEADER_SIZE > data.len() {
            return Err(Error::with_detail(ErrorKind::IntegrityViolated, "blob header out of page"));
        }
        let header = BlobHeader {
            stored: read_u32(data, off),
            original: read_u32(data, off + 4),
            capacity: read_u32(data, off + 8),
            flags: data[off + 12],
        };
        if header.stored > header.capacity {
            return Err(Error::with_detail(ErrorKind::IntegrityViolated, "blob length exceeds capacity"));
        }
        Ok(header)
    }

    fn write(&self, data: &mut [u8], off: usize) {
        write_u32(data, off, self.stored);
        write_u32(data, off + 4, self.original);
        write_u32(data, off + 8, self.capacity);
        data[off + 12] = self.flags;
        data[off + 13] = 0;
        data[off + 14] = 0;
        data[off + 15] = 0;
    }
}

fn split_id(id: BlobId, page_size: u32) -> (PageId, usize) {
    (id / page_size as u64, (id % page_size as u64) as usize)
}

fn page_payload(page_size: u32) -> usize {
    page_size as usize - PAGE_HEADER_SIZE
}

fn shared_page_state(word: u64) -> (usize, u32) {
    ((word & 0xffff_ffff) as usize, ((word >> 32) & 0xffff) as u32)
}

fn shared_page_word(used: usize, live: u32) -> u64 {
    (used as u64 & 0xffff_ffff) | ((live as u64 & 0xffff) << 32)
}

impl BlobManager {
    pub fn new() -> Self {
        BlobManager { open_page: None }
    }

    /// Forget the open shared page (environment close/reopen).
    pub fn reset(&mut self) {
        self.open_page = None;
    }

    /// Allocate a blob holding `data`, compressed through `codec`.
    pub fn alloc(&mut self, pager: &mut Pager, data: &[u8], codec: Codec) -> Result<BlobId> {
        let stored = codec.compress(data)?;
        let mut flags = if codec.is_none() { 0 } else { FLAG_COMPRESSED };
        let page_size = pager.page_size();

        let small_cap = round_up(stored.len().max(8));
        if BLOB_HEADER_SIZE + small_cap <= page_payload(page_size) {
            return self.alloc_shared(pager, &stored, data.len() as u32, small_cap, flags);
        }

        // Large blob: a dedicated contiguous run.
        flags |= FLAG_SPANS;
        let per_page = page_payload(page_size);
        let pages = (BLOB_HEADER_SIZE + stored.len()).div_ceil(per_page);
        let capacity = pages * per_page - BLOB_HEADER_SIZE;
        let run = pager.alloc_run(pages, PageKind::Blob, 0)?;
        let start = run[0].read().id();

        let header = BlobHeader {
            stored: stored.len() as u32,
            original: data.len() as u32,
            capacity: capacity as u32,
            flags,
        };
        {
            let mut first = run[0].write();
            header.write(&mut first.data, PAGE_HEADER_SIZE);
            first.mark_dirty();
        }
        write_spanned(&run, &stored);
        Ok(start * page_size as u64 + PAGE_HEADER_SIZE as u64)
    }

    fn alloc_shared(
        &mut self,
        pager: &mut Pager,
        stored: &[u8],
        original: u32,
        capacity: usize,
        flags: u8,
    ) -> Result<BlobId> {
        let page_size = pager.page_size();
        let need = BLOB_HEADER_SIZE + capacity;

        let page_ref = match self.open_page {
            Some(id) => {
                let page = pager.fetch(id)?;
                let (used, _) = shared_page_state(page.read().kind_word());
                if used + need <= page_size as usize {
                    page
                } else {
                    let fresh = pager.alloc(PageKind::Blob, 0)?;
                    fresh.write().set_kind_word(shared_page_word(PAGE_HEADER_SIZE, 0));
                    self.open_page = Some(fresh.read().id());
                    fresh
                }
            }
            None => {
                let fresh = pager.alloc(PageKind::Blob, 0)?;
                fresh.write().set_kind_word(shared_page_word(PAGE_HEADER_SIZE, 0));
                self.open_page = Some(fresh.read().id());
                fresh
            }
        };

        let mut page = page_ref.write();
        let (used, live) = shared_page_state(page.kind_word());
        let off = used;
        let header = BlobHeader {
            stored: stored.len() as u32,
            original,
            capacity: capacity as u32,
            flags,
        };
        header.write(&mut page.data, off);
        page.data[off + BLOB_HEADER_SIZE..off + BLOB_HEADER_SIZE + stored.len()]
            .copy_from_slice(stored);
        page.set_kind_word(shared_page_word(used + need, live + 1));
        page.mark_dirty();
        Ok(page.id() * page_size as u64 + off as u64)
    }

    /// Read a blob back, undoing compression.
    pub fn read(&self, pager: &mut Pager, id: BlobId) -> Result<Vec<u8>> {
        let page_size = pager.page_size();
        let (page_id, off) = split_id(id, page_size);
        let page_ref = pager.fetch(page_id)?;

        let (header, stored) = {
            let page = page_ref.read();
            if page.kind() != PageKind::Blob {
                return Err(Error::with_detail(ErrorKind::IntegrityViolated, "blob id points off a blob page"));
            }
            let header = BlobHeader::parse(&page.data, off)?;
            if header.flags & FLAG_SPANS != 0 {
                (header, Vec::new())
            } else {
                let start = off + BLOB_HEADER_SIZE;
                let end = start + header.stored as usize;
                if end > page.data.len() {
                    return Err(Error::with_detail(ErrorKind::IntegrityViolated, "blob overruns its page"));
                }
                (header, page.data[start..end].to_vec())
            }
        };

        let stored = if header.flags & FLAG_SPANS != 0 {
            drop(page_ref);
            read_spanned(pager, page_id, header.stored as usize, page_size)?
        } else {
            stored
        };

        let data = if header.flags & FLAG_COMPRESSED != 0 {
            Codec::Zlib.decompress(&stored)?
        } else {
            stored
        };
        if data.len() != header.original as usize {
            return Err(Error::with_detail(ErrorKind::IntegrityViolated, "blob length mismatch after decode"));
        }
        Ok(data)
    }

    /// Original (uncompressed) length without decoding the payload.
    pub fn size(&self, pager: &mut Pager, id: BlobId) -> Result<u32> {
        let (page_id, off) = split_id(id, pager.page_size());
        let page_ref = pager.fetch(page_id)?;
        let page = page_ref.read();
        Ok(BlobHeader::parse(&page.data, off)?.original)
    }

    /// Replace the payload. In place when the new bytes fit the existing
    /// allocation; otherwise a fresh blob is allocated and the old one freed.
    /// Returns the (possibly new) blob id.
    pub fn overwrite(
        &mut self,
        pager: &mut Pager,
        id: BlobId,
        data: &[u8],
        codec: Codec,
    ) -> Result<BlobId> {
        let page_size = pager.page_size();
        let (page_id, off) = split_id(id, page_size);
        let header = {
            let page_ref = pager.fetch(page_id)?;
            let page = page_ref.read();
            BlobHeader::parse(&page.data, off)?
        };

        let stored = codec.compress(data)?;
        if stored.len() > header.capacity as usize {
            self.free(pager, id)?;
            return self.alloc(pager, data, codec);
        }

        let mut flags = header.flags & FLAG_SPANS;
        if !codec.is_none() {
            flags |= FLAG_COMPRESSED;
        }
        let updated = BlobHeader {
            stored: stored.len() as u32,
            original: data.len() as u32,
            capacity: header.capacity,
            flags,
        };
        if header.flags & FLAG_SPANS != 0 {
            let per_page = page_payload(page_size);
            let pages = (BLOB_HEADER_SIZE + header.capacity as usize).div_ceil(per_page);
            let mut run = Vec::with_capacity(pages);
            for pid in page_id..page_id + pages as PageId {
                run.push(pager.fetch(pid)?);
            }
            {
                let mut first = run[0].write();
                updated.write(&mut first.data, PAGE_HEADER_SIZE);
                first.mark_dirty();
            }
            write_spanned(&run, &stored);
        } else {
            let page_ref = pager.fetch(page_id)?;
            let mut page = page_ref.write();
            updated.write(&mut page.data, off);
            page.data[off + BLOB_HEADER_SIZE..off + BLOB_HEADER_SIZE + stored.len()]
                .copy_from_slice(&stored);
            page.mark_dirty();
        }
        Ok(id)
    }

    /// Release a blob's storage.
    pub fn free(&mut self, pager: &mut Pager, id: BlobId) -> Result<()> {
        let page_size = pager.page_size();
        let (page_id, off) = split_id(id, page_size);
        let (header, live_after) = {
            let page_ref = pager.fetch(page_id)?;
            let mut page = page_ref.write();
            let header = BlobHeader::parse(&page.data, off)?;
            if header.flags & FLAG_SPANS != 0 {
                (header, 0)
            } else {
                let (used, live) = shared_page_state(page.kind_word());
                let live = live.saturating_sub(1);
                page.set_kind_word(shared_page_word(used, live));
                page.mark_dirty();
                (header, live)
            }
        };

        if header.flags & FLAG_SPANS != 0 {
            let per_page = page_payload(page_size);
            let pages = (BLOB_HEADER_SIZE + header.capacity as usize).div_ceil(per_page);
            pager.free_run(page_id, pages);
        } else if live_after == 0 {
            if self.open_page == Some(page_id) {
                self.open_page = None;
            }
            pager.free_page(page_id);
        }
        Ok(())
    }
}

fn round_up(len: usize) -> usize {
    (len + 7) & !7
}

/// Scatter `stored` across a run of pages, first page after the blob header.
fn write_spanned(run: &[crate::storage::PageRef], stored: &[u8]) {
    let mut remaining = stored;
    for (i, page_ref) in run.iter().enumerate() {
        let mut page = page_ref.write();
        let start = if i == 0 { PAGE_HEADER_SIZE + BLOB_HEADER_SIZE } else { PAGE_HEADER_SIZE };
        let room = page.data.len() - start;
        let take = remaining.len().min(room);
        page.data[start..start + take].copy_from_slice(&remaining[..take]);
        page.mark_dirty();
        remaining = &remaining[take..];
        if remaining.is_empty() {
            break;
        }
    }
    debug_assert!(remaining.is_empty());
}

fn read_spanned(
    pager: &mut Pager,
    start_page: PageId,
    stored_len: usize,
    page_size: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(stored_len);
    let mut page_id = start_page;
    while out.len() < stored_len {
        let page_ref = pager.fetch(page_id)?;
        let page = page_ref.read();
        let start = if page_id == start_page {
            PAGE_HEADER_SIZE + BLOB_HEADER_SIZE
        } else {
            PAGE_HEADER_SIZE
        };
        let take = (stored_len - out.len()).min(page_size as usize - start);
        out.extend_from_slice(&page.data[start..start + take]);
        page_id += 1;
    }
    Ok(out)
}
