//! # BurrowDB Configuration Constants
//!
//! This module centralizes the engine's configuration constants. Constants
//! that depend on each other are co-located and their relationships
//! documented, so a change to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (per database, 512..=65536, power of two)
//!       │
//!       ├─> TN_HEADER_SIZE (12 bytes, fixed by the node format)
//!       │
//!       ├─> max_key_size   = min(16383, PAGE_SIZE/2 - 22)
//!       │     A key and its separator copy must both fit in an internal
//!       │     node alongside another key, or splits can never terminate.
//!       │
//!       └─> max_entry_size = (PAGE_SIZE - TN_HEADER_SIZE) * 3 / 4
//!             An entry larger than this is spilled to fragment pages so
//!             that at least two entries always fit in a leaf.
//!
//! DEFAULT_CACHE_SIZE (node buffers)
//!       │
//!       └─> MIN_CACHE_SIZE: a mutation path can pin a root-to-leaf path
//!           plus one split sibling per level; eviction needs headroom
//!           beyond that or alloc_latched() fails under load.
//!
//! LOCK_TABLE_PARTITIONS (power of two)
//!       └─> partition index is taken from the high bits of the scramble
//!           hash; a non-power-of-two count would bias the distribution.
//! ```

/// Smallest supported page size. The node format requires room for the
/// 12-byte header, one maximum-length encoded key in an internal node, and
/// two 8-byte child pointers.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. Segment tails and search-vector pointers are
/// stored as u16, so a page can never exceed 65536 bytes.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default page size when the builder does not override it.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Tree-node header size: type byte, reserved byte, and five u16 fields
/// (garbage, left tail, right tail, vector start, vector end).
pub const TN_HEADER_SIZE: usize = 12;

/// Reserved page id for stub nodes that keep stale cursor frames coherent
/// after a root collapse or close.
pub const STUB_ID: u64 = 1;

/// Default number of node buffers in the cache.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Minimum number of node buffers. A store descends at most
/// `MAX_TREE_HEIGHT` levels holding two latched nodes, and a split pins one
/// unevictable sibling per level.
pub const MIN_CACHE_SIZE: usize = 16;

/// Number of independently latched lock-table partitions. Must be a power
/// of two.
pub const LOCK_TABLE_PARTITIONS: usize = 16;

/// Default row-lock timeout when the builder does not override it.
pub const DEFAULT_LOCK_TIMEOUT_NANOS: u64 = 1_000_000_000;

/// Capacity of the first block in a locker's lock stack.
pub const FIRST_BLOCK_CAPACITY: usize = 8;

/// Largest lock-stack block. Limited by the bits available in the per-block
/// upgrade bitmap.
pub const HIGHEST_BLOCK_CAPACITY: usize = 64;

const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_PAGE_SIZE >= MIN_PAGE_SIZE && DEFAULT_PAGE_SIZE <= MAX_PAGE_SIZE);
const _: () = assert!(LOCK_TABLE_PARTITIONS.is_power_of_two());
const _: () = assert!(MIN_CACHE_SIZE >= 2 * 2 + 2);

/// Largest key accepted by a tree with the given page size.
#[inline]
pub const fn max_key_size(page_size: usize) -> usize {
    let limit = page_size / 2 - 22;
    if limit > 16383 {
        16383
    } else {
        limit
    }
}

/// Largest encoded entry stored directly in a leaf; anything bigger is
/// fragmented.
#[inline]
pub const fn max_entry_size(page_size: usize) -> usize {
    (page_size - TN_HEADER_SIZE) * 3 / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_key_size_is_capped_at_encoding_limit() {
        assert_eq!(max_key_size(65536), 16383);
        assert_eq!(max_key_size(512), 234);
    }

    #[test]
    fn max_entry_size_leaves_room_for_two_entries() {
        let page = 4096;
        assert!(2 * (page - TN_HEADER_SIZE) / 4 < page - TN_HEADER_SIZE);
        assert_eq!(max_entry_size(page), (page - TN_HEADER_SIZE) * 3 / 4);
    }
}
