//! # Fragmented Values
//!
//! Values whose encoded leaf entry would exceed the per-tree maximum are
//! spilled to dedicated fragment pages. The leaf then stores a descriptor
//! with the fragmented bit set in its value header:
//!
//! ```text
//! [u32 LE: full value length][6-byte page id]...
//! ```
//!
//! The value bytes are split across full pages in order; the final page is
//! zero-padded. Reassembly and deletion walk the id list. A transactional
//! delete of a fragmented value does not free the pages immediately: the
//! descriptor moves to the transaction's fragmented trash, and the pages
//! are reclaimed at commit (rollback restores the entry, descriptor
//! intact).

use eyre::ensure;

use crate::error::Result;
use crate::storage::PageStore;

const ID_LEN: usize = 6;

/// Byte length of a descriptor covering `value_len` bytes.
pub(crate) fn descriptor_len(value_len: usize, page_size: usize) -> usize {
    4 + value_len.div_ceil(page_size) * ID_LEN
}

/// Spills `value` to fragment pages and returns the descriptor, which must
/// not exceed `max_desc_len`.
pub(crate) fn fragment_value(
    store: &dyn PageStore,
    value: &[u8],
    max_desc_len: i32,
) -> Result<Vec<u8>> {
    let page_size = store.page_size();
    let desc_len = descriptor_len(value.len(), page_size);
    ensure!(
        max_desc_len > 0 && desc_len <= max_desc_len as usize,
        "value of {} bytes cannot be fragmented into {} descriptor bytes",
        value.len(),
        max_desc_len,
    );

    let mut desc = Vec::with_capacity(desc_len);
    desc.extend_from_slice(&(value.len() as u32).to_le_bytes());

    let mut page = vec![0u8; page_size];
    let mut written = Vec::new();
    for chunk in value.chunks(page_size) {
        let id = match store.alloc_page() {
            Ok(id) => id,
            Err(e) => {
                // Unwind pages already taken.
                for &id in &written {
                    let _ = store.delete_page(id);
                }
                return Err(e);
            }
        };
        page[..chunk.len()].copy_from_slice(chunk);
        page[chunk.len()..].fill(0);
        store.write_page(id, &page)?;
        written.push(id);
        desc.extend_from_slice(&id.to_le_bytes()[..ID_LEN]);
    }

    log::trace!(
        "fragmented {} bytes across {} pages",
        value.len(),
        written.len()
    );
    Ok(desc)
}

/// Rebuilds a value from its descriptor.
pub(crate) fn reconstruct(store: &dyn PageStore, desc: &[u8]) -> Result<Vec<u8>> {
    ensure!(desc.len() >= 4, "truncated fragment descriptor");
    let total = u32::from_le_bytes(desc[..4].try_into().unwrap()) as usize; // INVARIANT: length checked
    let ids = &desc[4..];
    ensure!(ids.len() % ID_LEN == 0, "misaligned fragment descriptor");

    let page_size = store.page_size();
    let mut value = Vec::with_capacity(total);
    let mut page = vec![0u8; page_size];
    for id_bytes in ids.chunks(ID_LEN) {
        let mut raw = [0u8; 8];
        raw[..ID_LEN].copy_from_slice(id_bytes);
        let id = u64::from_le_bytes(raw);
        store.read_page(id, &mut page)?;
        let take = page_size.min(total - value.len());
        value.extend_from_slice(&page[..take]);
    }
    ensure!(value.len() == total, "fragment descriptor short of pages");
    Ok(value)
}

/// Frees the backing pages of a descriptor.
pub(crate) fn delete_fragments(store: &dyn PageStore, desc: &[u8]) -> Result<()> {
    ensure!(desc.len() >= 4, "truncated fragment descriptor");
    for id_bytes in desc[4..].chunks(ID_LEN) {
        let mut raw = [0u8; 8];
        raw[..ID_LEN].copy_from_slice(id_bytes);
        store.delete_page(u64::from_le_bytes(raw))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemPageStore;

    #[test]
    fn roundtrip_multi_page_value() {
        let store = MemPageStore::new(512).unwrap();
        let value: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();

        let desc = fragment_value(&store, &value, 512).unwrap();
        assert_eq!(desc.len(), 4 + 4 * ID_LEN);
        assert_eq!(reconstruct(&store, &desc).unwrap(), value);
    }

    #[test]
    fn delete_releases_pages() {
        let store = MemPageStore::new(512).unwrap();
        let value = vec![9u8; 1500];
        let before = store.live_pages();

        let desc = fragment_value(&store, &value, 512).unwrap();
        assert_eq!(store.live_pages(), before + 3);
        delete_fragments(&store, &desc).unwrap();
        assert_eq!(store.live_pages(), before);
    }

    #[test]
    fn descriptor_over_budget_fails() {
        let store = MemPageStore::new(512).unwrap();
        let value = vec![0u8; 512 * 100];
        assert!(fragment_value(&store, &value, 16).is_err());
    }

    #[test]
    fn exact_page_multiple_has_no_padding_leak() {
        let store = MemPageStore::new(512).unwrap();
        let value = vec![7u8; 1024];
        let desc = fragment_value(&store, &value, 512).unwrap();
        assert_eq!(reconstruct(&store, &desc).unwrap(), value);
    }
}
