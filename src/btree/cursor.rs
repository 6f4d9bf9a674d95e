//! Tree-side cursor position
//!
//! A cursor's committed-tree position is the owned bytes of its current key
//! plus an index into that key's duplicate group. Movement re-seeks through
//! the tree, so page splits, merges and cache eviction never invalidate a
//! position; a cursor parked on an erased key simply lands on the next
//! neighbor when it moves.

use crate::blob::BlobManager;
use crate::error::Result;
use crate::storage::Pager;

use super::node::LeafPayload;
use super::Btree;

/// A hit returned by cursor movement over the committed tree.
#[derive(Debug, Clone)]
pub struct TreeHit {
    pub key: Vec<u8>,
    pub payload: LeafPayload,
    pub dup: u32,
}

/// Committed-tree position of a cursor. `None` means nil.
#[derive(Debug, Clone, Default)]
pub struct TreeCursor {
    pub key: Option<Vec<u8>>,
    pub dup: u32,
}

impl TreeCursor {
    pub fn nil() -> Self {
        TreeCursor { key: None, dup: 0 }
    }

    pub fn is_nil(&self) -> bool {
        self.key.is_none()
    }

    fn settle(&mut self, hit: Option<(Vec<u8>, LeafPayload)>, dup: u32) -> Option<TreeHit> {
        match hit {
            Some((key, payload)) => {
                self.key = Some(key.clone());
                self.dup = dup;
                Some(TreeHit { key, payload, dup })
            }
            None => {
                self.key = None;
                self.dup = 0;
                None
            }
        }
    }

    pub fn seek_first(
        &mut self,
        tree: &Btree,
        pager: &mut Pager,
        blobs: &mut BlobManager,
    ) -> Result<Option<TreeHit>> {
        let hit = tree.first(pager, blobs)?;
        Ok(self.settle(hit, 0))
    }

    pub fn seek_last(
        &mut self,
        tree: &Btree,
        pager: &mut Pager,
        blobs: &mut BlobManager,
    ) -> Result<Option<TreeHit>> {
        match tree.last(pager, blobs)? {
            Some((key, payload)) => {
                let dup = payload.record_count().saturating_sub(1) as u32;
                Ok(self.settle(Some((key, payload)), dup))
            }
            None => Ok(self.settle(None, 0)),
        }
    }

    /// Position on `key` exactly; leaves the cursor nil on a miss.
    pub fn seek_exact(
        &mut self,
        tree: &Btree,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Option<TreeHit>> {
        match tree.lookup(pager, blobs, key)? {
            Some(payload) => Ok(self.settle(Some((key.to_vec(), payload)), 0)),
            None => Ok(self.settle(None, 0)),
        }
    }

    /// Step forward: through the current duplicate group first, then to the
    /// next key. `skip_dups` jumps straight to the next key;
    /// `only_dups` refuses to leave the current key.
    pub fn next(
        &mut self,
        tree: &Btree,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        skip_dups: bool,
        only_dups: bool,
    ) -> Result<Option<TreeHit>> {
        let current = match &self.key {
            None => return self.seek_first(tree, pager, blobs),
            Some(key) => key.clone(),
        };
        if !skip_dups {
            if let Some(payload) = tree.lookup(pager, blobs, &current)? {
                if (self.dup as u64) + 1 < payload.record_count() {
                    let dup = self.dup + 1;
                    return Ok(self.settle(Some((current, payload)), dup));
                }
            }
        }
        if only_dups {
            return Ok(None);
        }
        let hit = tree.successor(pager, blobs, &current)?;
        Ok(self.settle(hit, 0))
    }

    /// Step backward, mirroring [`TreeCursor::next`].
    pub fn prev(
        &mut self,
        tree: &Btree,
        pager: &mut Pager,
        blobs: &mut BlobManager,
        skip_dups: bool,
        only_dups: bool,
    ) -> Result<Option<TreeHit>> {
        let current = match &self.key {
            None => return self.seek_last(tree, pager, blobs),
            Some(key) => key.clone(),
        };
        if !skip_dups && self.dup > 0 {
            if let Some(payload) = tree.lookup(pager, blobs, &current)? {
                let dup = self.dup - 1;
                return Ok(self.settle(Some((current, payload)), dup));
            }
        }
        if only_dups {
            return Ok(None);
        }
        match tree.predecessor(pager, blobs, &current)? {
            Some((key, payload)) => {
                let dup = if skip_dups {
                    0
                } else {
                    payload.record_count().saturating_sub(1) as u32
                };
                Ok(self.settle(Some((key, payload)), dup))
            }
            None => Ok(self.settle(None, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::KeyCompare;
    use crate::compress::Codec;
    use crate::config::DbConfig;
    use crate::os::MemDevice;
    use crate::storage::cache::CacheMode;
    use crate::storage::codec::PageTransform;
    use crate::btree::TreeSpec;
    use crate::types::{DbFlags, InsertFlags};

    fn setup() -> (Pager, BlobManager, Btree) {
        let mut pager = Pager::new(
            Box::new(MemDevice::new()),
            PageTransform::new(false, None, [0u8; 16]),
            1024,
            1024 * 1024,
            CacheMode::Unlimited,
            0,
            false,
        )
        .unwrap();
        let cfg = DbConfig { flags: DbFlags::ENABLE_DUPLICATE_KEYS, ..Default::default() }
            .validated()
            .unwrap();
        let spec =
            TreeSpec::new(1, &cfg, KeyCompare::Memcmp, Codec::None, Codec::None, 1024).unwrap();
        let tree = Btree::create(&mut pager, spec).unwrap();
        (pager, BlobManager::new(), tree)
    }

    #[test]
    fn test_scan_with_duplicates() {
        let (mut pager, mut blobs, mut tree) = setup();
        tree.insert(&mut pager, &mut blobs, b"a", b"1", InsertFlags::empty(), None).unwrap();
        for rec in [b"x", b"y"] {
            tree.insert(&mut pager, &mut blobs, b"b", rec, InsertFlags::DUPLICATE, None).unwrap();
        }
        tree.insert(&mut pager, &mut blobs, b"c", b"3", InsertFlags::empty(), None).unwrap();

        let mut cursor = TreeCursor::nil();
        let mut seen = Vec::new();
        while let Some(hit) = cursor.next(&tree, &mut pager, &mut blobs, false, false).unwrap() {
            seen.push((hit.key.clone(), hit.dup));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 0),
                (b"b".to_vec(), 0),
                (b"b".to_vec(), 1),
                (b"c".to_vec(), 0),
            ]
        );
        assert!(cursor.is_nil());
    }

    #[test]
    fn test_skip_duplicates_backward() {
        let (mut pager, mut blobs, mut tree) = setup();
        for key in [b"a", b"b", b"c"] {
            for rec in [b"1", b"2", b"3"] {
                tree.insert(&mut pager, &mut blobs, key, rec, InsertFlags::DUPLICATE, None)
                    .unwrap();
            }
        }
        let mut cursor = TreeCursor::nil();
        let mut keys = Vec::new();
        while let Some(hit) = cursor.prev(&tree, &mut pager, &mut blobs, true, false).unwrap() {
            keys.push(hit.key.clone());
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_survives_erase_under_cursor() {
        let (mut pager, mut blobs, mut tree) = setup();
        for key in [b"a", b"b", b"c"] {
            tree.insert(&mut pager, &mut blobs, key, b"v", InsertFlags::empty(), None).unwrap();
        }
        let mut cursor = TreeCursor::nil();
        let hit = cursor.next(&tree, &mut pager, &mut blobs, false, false).unwrap().unwrap();
        assert_eq!(hit.key, b"a");

        // Erase the key under the cursor; the next step lands on "b".
        tree.erase(&mut pager, &mut blobs, b"a", None, Default::default()).unwrap();
        let hit = cursor.next(&tree, &mut pager, &mut blobs, false, false).unwrap().unwrap();
        assert_eq!(hit.key, b"b");
    }

    #[test]
    fn test_only_duplicates_stays_on_key() {
        let (mut pager, mut blobs, mut tree) = setup();
        for rec in [b"1", b"2"] {
            tree.insert(&mut pager, &mut blobs, b"k", rec, InsertFlags::DUPLICATE, None).unwrap();
        }
        tree.insert(&mut pager, &mut blobs, b"z", b"v", InsertFlags::empty(), None).unwrap();

        let mut cursor = TreeCursor::nil();
        cursor.seek_exact(&tree, &mut pager, &mut blobs, b"k").unwrap().unwrap();
        assert!(cursor.next(&tree, &mut pager, &mut blobs, false, true).unwrap().is_some());
        assert!(cursor.next(&tree, &mut pager, &mut blobs, false, true).unwrap().is_none());
    }
}
