use crate::storage::page::PageId;

/// Free-page list: pages freed by splits, merges and index drops, reused
/// newest-first by the allocator. The in-memory list is authoritative for
/// the session; at commit a bounded prefix is persisted to the store's
/// single free-list page, and the transaction layer snapshots the whole
/// list so a rollback can restore it.
pub struct FreeList {
    free_pages: Vec<PageId>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            free_pages: Vec::new(),
        }
    }

    /// Allocate a free page. Returns None if no free pages available.
    pub fn allocate(&mut self) -> Option<PageId> {
        self.free_pages.pop()
    }

    /// Return a page to the free list.
    pub fn free(&mut self, page_id: PageId) {
        self.free_pages.push(page_id);
    }

    /// Number of free pages.
    pub fn len(&self) -> usize {
        self.free_pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_pages.is_empty()
    }

    /// Serialize the whole list for persistence.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_capped(self.free_pages.len())
    }

    /// Serialize at most `max` entries (a single free-list page holds a
    /// bounded number; excess ids survive only in memory).
    pub fn serialize_capped(&self, max: usize) -> Vec<u8> {
        let count = self.free_pages.len().min(max);
        let mut buf = Vec::with_capacity(8 + count * 8);
        buf.extend_from_slice(&(count as u64).to_le_bytes());
        for &page_id in self.free_pages.iter().take(count) {
            buf.extend_from_slice(&page_id.to_le_bytes());
        }
        buf
    }

    /// Snapshot of the free page ids, in list order.
    pub fn serialize_ids(&self) -> Vec<PageId> {
        self.free_pages.clone()
    }

    /// Rebuild from a snapshot (transaction rollback).
    pub fn from_ids(free_pages: Vec<PageId>) -> Self {
        FreeList { free_pages }
    }

    /// Deserialize from a free-list page cell. A short or empty payload
    /// yields an empty list.
    pub fn deserialize(data: &[u8]) -> Self {
        if data.len() < 8 {
            return FreeList::new();
        }
        let count = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        let mut free_pages = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 8 + i * 8;
            if offset + 8 > data.len() {
                break;
            }
            let page_id = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
            free_pages.push(page_id);
        }
        FreeList { free_pages }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The allocator reuses the most recently freed page first, so pages
    /// emptied by a delete are the next ones a split fills again.
    #[test]
    fn test_reuse_is_newest_first() {
        let mut fl = FreeList::new();
        assert!(fl.allocate().is_none());

        for page_id in [3u64, 7, 9] {
            fl.free(page_id);
        }
        assert_eq!(fl.allocate(), Some(9));
        fl.free(12);
        assert_eq!(fl.allocate(), Some(12));
        assert_eq!(fl.allocate(), Some(7));
        assert_eq!(fl.allocate(), Some(3));
        assert!(fl.is_empty());
    }

    /// Persisting through the free-list page keeps at most the cap;
    /// everything beyond it stays allocatable in memory but is gone after
    /// a restart.
    #[test]
    fn test_persistence_cap_drops_excess_ids() {
        let mut fl = FreeList::new();
        for page_id in 1..=600u64 {
            fl.free(page_id);
        }

        let persisted = FreeList::deserialize(&fl.serialize_capped(500));
        assert_eq!(persisted.len(), 500);
        // The oldest 500 survive; the in-memory list still has all 600.
        assert_eq!(fl.len(), 600);
        assert_eq!(fl.serialize_ids().last(), Some(&600));
        assert_eq!(persisted.serialize_ids(), (1..=500).collect::<Vec<u64>>());
    }

    /// The rollback snapshot restores the exact allocation order, so an
    /// aborted transaction replays page reuse deterministically.
    #[test]
    fn test_snapshot_restores_allocation_order() {
        let mut fl = FreeList::new();
        for page_id in [11u64, 5, 42] {
            fl.free(page_id);
        }
        let snapshot = fl.serialize_ids();

        // Drain the live list, then roll back.
        while fl.allocate().is_some() {}
        let mut restored = FreeList::from_ids(snapshot);
        assert_eq!(restored.allocate(), Some(42));
        assert_eq!(restored.allocate(), Some(5));
        assert_eq!(restored.allocate(), Some(11));
    }

    /// A fresh store has no free-list page; the pager hands deserialize
    /// whatever the cell holds, including nothing.
    #[test]
    fn test_roundtrip_and_empty_payload() {
        let empty = FreeList::deserialize(&[]);
        assert!(empty.is_empty());

        let mut fl = FreeList::new();
        fl.free(2);
        fl.free(8);
        let reloaded = FreeList::deserialize(&fl.serialize());
        assert_eq!(reloaded.serialize_ids(), vec![2, 8]);
    }
}
