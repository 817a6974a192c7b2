//! # In-Memory Page Store
//!
//! Heap-backed [`PageStore`] implementation. Pages live in a hash map keyed
//! by id; freed ids go onto a free list and are recycled before new ids are
//! minted. Ids 0 (unassigned) and 1 (stub) are never handed out.
//!
//! The map is guarded by a single mutex. The engine's page cache absorbs
//! almost all traffic, so store-level contention is not a concern for this
//! implementation; a durable store would shard.

use eyre::{bail, ensure};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{PageStore, MAX_PAGE_ID};
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::Result;

pub struct MemPageStore {
    page_size: usize,
    next_id: AtomicU64,
    state: Mutex<State>,
}

struct State {
    pages: HashMap<u64, Box<[u8]>>,
    free: Vec<u64>,
}

impl MemPageStore {
    pub fn new(page_size: usize) -> Result<Self> {
        ensure!(
            page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "illegal page size: {}",
            page_size
        );
        Ok(Self {
            page_size,
            // Ids 0 and 1 are reserved.
            next_id: AtomicU64::new(2),
            state: Mutex::new(State {
                pages: HashMap::new(),
                free: Vec::new(),
            }),
        })
    }

    /// Number of live (allocated, not freed) pages. Test support.
    pub fn live_pages(&self) -> usize {
        let state = self.state.lock();
        state.pages.len()
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    fn read_page(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(buf.len() == self.page_size, "short read buffer");
        let state = self.state.lock();
        match state.pages.get(&id) {
            Some(page) => {
                buf.copy_from_slice(page);
                Ok(())
            }
            None => bail!("read of unallocated page {}", id),
        }
    }

    fn write_page(&self, id: u64, buf: &[u8]) -> Result<()> {
        ensure!(buf.len() == self.page_size, "short write buffer");
        ensure!(id > 1 && id <= MAX_PAGE_ID, "write of reserved page id {}", id);
        let mut state = self.state.lock();
        match state.pages.get_mut(&id) {
            Some(page) => page.copy_from_slice(buf),
            None => bail!("write of unallocated page {}", id),
        }
        Ok(())
    }

    fn alloc_page(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::AcqRel);
                ensure!(id <= MAX_PAGE_ID, "page id space exhausted");
                id
            }
        };
        state
            .pages
            .insert(id, vec![0u8; self.page_size].into_boxed_slice());
        Ok(id)
    }

    fn delete_page(&self, id: u64) -> Result<()> {
        ensure!(id > 1, "delete of reserved page id {}", id);
        let mut state = self.state.lock();
        ensure!(
            state.pages.remove(&id).is_some(),
            "delete of unallocated page {}",
            id
        );
        state.free.push(id);
        Ok(())
    }

    fn sync(&self, _metadata: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_skips_reserved_ids() {
        let store = MemPageStore::new(512).unwrap();
        let id = store.alloc_page().unwrap();
        assert!(id >= 2);
    }

    #[test]
    fn pages_roundtrip() {
        let store = MemPageStore::new(512).unwrap();
        let id = store.alloc_page().unwrap();

        let data = vec![0xabu8; 512];
        store.write_page(id, &data).unwrap();

        let mut out = vec![0u8; 512];
        store.read_page(id, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn deleted_pages_are_recycled() {
        let store = MemPageStore::new(512).unwrap();
        let id = store.alloc_page().unwrap();
        store.delete_page(id).unwrap();
        assert_eq!(store.alloc_page().unwrap(), id);
    }

    #[test]
    fn read_of_deleted_page_fails() {
        let store = MemPageStore::new(512).unwrap();
        let id = store.alloc_page().unwrap();
        store.delete_page(id).unwrap();
        let mut buf = vec![0u8; 512];
        assert!(store.read_page(id, &mut buf).is_err());
    }

    #[test]
    fn rejects_bad_page_sizes() {
        assert!(MemPageStore::new(511).is_err());
        assert!(MemPageStore::new(256).is_err());
        assert!(MemPageStore::new(1 << 17).is_err());
    }
}
