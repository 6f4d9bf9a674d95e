//! External duplicate tables
//!
//! When a key's duplicate group outgrows its inline form the group moves to a
//! chain of dedicated pages. Each chain page stores a count followed by
//! record references; the page header's kind word links to the next page in
//! the chain. Once promoted, a group stays external until the key dies.

use crate::error::Result;
use crate::storage::encoding::{read_u16, write_u16};
use crate::storage::page::{PageKind, PAGE_HEADER_SIZE};
use crate::storage::Pager;
use crate::types::PageId;

use super::node::{decode_record_ref, encode_record_ref, RecordRef};

const COUNT_OFF: usize = PAGE_HEADER_SIZE;
const REFS_OFF: usize = PAGE_HEADER_SIZE + 2;

/// Create a new chain holding `refs`; returns the first page id.
pub fn create(pager: &mut Pager, owner: u64, refs: &[RecordRef]) -> Result<PageId> {
    let first = pager.alloc(PageKind::DupTable, owner)?;
    let first_id = first.read().id();
    drop(first);
    rewrite(pager, owner, first_id, refs)?;
    Ok(first_id)
}

/// Read the whole group in order.
pub fn read_all(pager: &mut Pager, first: PageId) -> Result<Vec<RecordRef>> {
    let mut refs = Vec::new();
    let mut page_id = first;
    while page_id != 0 {
        let page_ref = pager.fetch(page_id)?;
        let page = page_ref.read();
        let count = read_u16(&page.data, COUNT_OFF) as usize;
        let mut off = REFS_OFF;
        for _ in 0..count {
            let (rec, next) = decode_record_ref(&page.data, off)?;
            refs.push(rec);
            off = next;
        }
        page_id = page.kind_word();
    }
    Ok(refs)
}

/// Rewrite the chain starting at `first` to hold exactly `refs`, reusing its
/// pages, extending or shrinking the chain as needed.
pub fn rewrite(pager: &mut Pager, owner: u64, first: PageId, refs: &[RecordRef]) -> Result<()> {
    let page_size = pager.page_size() as usize;
    let mut remaining = refs;
    let mut page_id = first;
    let mut prev: Option<PageId> = None;

    loop {
        let page_ref = if page_id != 0 {
            pager.fetch(page_id)?
        } else {
            let fresh = pager.alloc(PageKind::DupTable, owner)?;
            let fresh_id = fresh.read().id();
            if let Some(prev_id) = prev {
                let prev_ref = pager.fetch(prev_id)?;
                prev_ref.write().set_kind_word(fresh_id);
            }
            fresh
        };
        let current_id = page_ref.read().id();
        let next_in_chain = page_ref.read().kind_word();

        // Pack as many refs as fit this page.
        let mut taken = 0;
        let mut off = REFS_OFF;
        {
            let mut page = page_ref.write();
            page.data[COUNT_OFF..].fill(0);
            for rec in remaining {
                if off + rec.encoded_len() > page_size {
                    break;
                }
                off = encode_record_ref(rec, &mut page.data, off);
                taken += 1;
            }
            write_u16(&mut page.data, COUNT_OFF, taken as u16);
            // Keep the link to the rest of the chain while it is needed;
            // the tail is unlinked (and freed) once everything fits.
            page.set_kind_word(if taken == remaining.len() { 0 } else { next_in_chain });
            page.mark_dirty();
        }
        remaining = &remaining[taken..];
        prev = Some(current_id);

        if remaining.is_empty() {
            // Free any leftover tail of the old chain.
            let mut tail = next_in_chain;
            while tail != 0 {
                let tail_ref = pager.fetch(tail)?;
                let next = tail_ref.read().kind_word();
                drop(tail_ref);
                pager.free_page(tail);
                tail = next;
            }
            return Ok(());
        }
        page_id = next_in_chain;
    }
}

/// Free every page of a chain. The caller has already dealt with the blob
/// references stored in it.
pub fn free_chain(pager: &mut Pager, first: PageId) -> Result<()> {
    let mut page_id = first;
    while page_id != 0 {
        let page_ref = pager.fetch(page_id)?;
        let next = page_ref.read().kind_word();
        drop(page_ref);
        pager.free_page(page_id);
        page_id = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MemDevice;
    use crate::storage::cache::CacheMode;
    use crate::storage::codec::PageTransform;

    fn mem_pager() -> Pager {
        Pager::new(
            Box::new(MemDevice::new()),
            PageTransform::new(false, None, [0u8; 16]),
            1024,
            1024 * 1024,
            CacheMode::Unlimited,
            0,
            false,
        )
        .unwrap()
    }

    fn inline(tag: u8, len: usize) -> RecordRef {
        RecordRef::Inline(vec![tag; len])
    }

    #[test]
    fn test_single_page_roundtrip() {
        let mut pager = mem_pager();
        let refs = vec![inline(1, 4), inline(2, 4), RecordRef::Blob { id: 9, size: 100 }];
        let first = create(&mut pager, 7, &refs).unwrap();
        assert_eq!(read_all(&mut pager, first).unwrap(), refs);
    }

    #[test]
    fn test_chain_spans_pages_and_shrinks() {
        let mut pager = mem_pager();
        // ~105 bytes each; a 1 KiB page holds about nine.
        let refs: Vec<RecordRef> = (0..40).map(|i| inline(i as u8, 100)).collect();
        let first = create(&mut pager, 7, &refs).unwrap();
        assert_eq!(read_all(&mut pager, first).unwrap(), refs);
        let pages_before = pager.total_pages();

        // Shrinking back to two refs frees the tail of the chain.
        let small = vec![inline(1, 4), inline(2, 4)];
        rewrite(&mut pager, 7, first, &small).unwrap();
        assert_eq!(read_all(&mut pager, first).unwrap(), small);
        assert!(pager.freelist().len() >= 3);
        assert_eq!(pager.total_pages(), pages_before);
    }

    #[test]
    fn test_free_chain() {
        let mut pager = mem_pager();
        let refs: Vec<RecordRef> = (0..40).map(|i| inline(i as u8, 100)).collect();
        let first = create(&mut pager, 7, &refs).unwrap();
        free_chain(&mut pager, first).unwrap();
        assert!(pager.freelist().contains(first));
    }
}
