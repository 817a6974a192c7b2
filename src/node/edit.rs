//! # In-Node Editing
//!
//! Entry creation, update, compaction, and the segment allocator. The
//! overall strategy when an entry must be placed at position `pos`:
//!
//! 1. Shift the shorter half of the search vector to open a slot, and
//!    allocate the entry bytes from whichever segment has room.
//! 2. If no contiguous room remains around the vector, either compact the
//!    node in place (when reclaiming garbage suffices), rebalance entries
//!    into a sibling, or report that the node must split.
//! 3. Otherwise re-center the vector (biased right, even-aligned) and
//!    allocate.
//!
//! Compaction copies live entries into a spare page buffer and swaps it in,
//! leaving the right segment empty and the vector recentered.
//!
//! Every routine that changes entry positions also fixes the bound cursor
//! frames before returning, so a frame always references a live vector slot
//! or the insertion gap `!pos`.

use std::sync::Arc;

use super::entry::*;
use super::rebalance::{try_rebalance_internal_left, try_rebalance_internal_right};
use super::rebalance::{try_rebalance_leaf_left, try_rebalance_leaf_right};
use super::split::split_internal;
use super::{put_child_id, put_u16le, u16le, Node, NodeInner, TreeCx};
use crate::config::TN_HEADER_SIZE;
use crate::error::Result;

/// Outcome of leaf-entry allocation.
pub(crate) enum LeafLoc {
    /// Entry space allocated and pointed to by the search vector.
    Loc(i32),
    /// Node must split. `max` is the largest entry that could fit after a
    /// full compaction; non-positive when nothing fits.
    Split { max: i32 },
}

/// Key bytes handed to internal-entry creation: either already encoded
/// (copied verbatim from another page) or plain (encoded on write; required
/// on any path that may split).
#[derive(Clone, Copy)]
pub(crate) enum KeySrc<'a> {
    Encoded(&'a [u8]),
    Plain(&'a [u8]),
}

impl KeySrc<'_> {
    fn write_to(&self, page: &mut [u8], loc: usize) {
        match self {
            KeySrc::Encoded(bytes) => {
                page[loc..loc + bytes.len()].copy_from_slice(bytes);
            }
            KeySrc::Plain(key) => {
                encode_key(key, page, loc);
            }
        }
    }
}

/// Outcome of internal-entry creation.
pub(crate) enum InResult {
    /// Entry placed in this node. Locations are returned so merge and
    /// rebalance can bulk-fill key bytes and child ids afterward.
    Here { entry_loc: i32, new_child_loc: i32 },
    /// Node split; the key and child id were routed to the proper side (or
    /// the key was promoted), and `self.split` is now set.
    Split,
}

/// Ordered pair of overlapping same-page moves. Copies are sequenced so a
/// destination never clobbers the other pair's source.
fn array_copies_2(
    page: &mut [u8],
    start1: i32,
    dest1: i32,
    len1: i32,
    start2: i32,
    dest2: i32,
    len2: i32,
) {
    #[inline]
    fn mv(page: &mut [u8], start: i32, dest: i32, len: i32) {
        let (start, dest, len) = (start as usize, dest as usize, len as usize);
        page.copy_within(start..start + len, dest);
    }
    if dest1 < start1 {
        mv(page, start1, dest1, len1);
        mv(page, start2, dest2, len2);
    } else {
        mv(page, start2, dest2, len2);
        mv(page, start1, dest1, len1);
    }
}

fn array_copies_3(
    page: &mut [u8],
    start1: i32,
    dest1: i32,
    len1: i32,
    start2: i32,
    dest2: i32,
    len2: i32,
    start3: i32,
    dest3: i32,
    len3: i32,
) {
    if dest1 < start1 {
        page.copy_within(start1 as usize..(start1 + len1) as usize, dest1 as usize);
        array_copies_2(page, start2, dest2, len2, start3, dest3, len3);
    } else {
        array_copies_2(page, start2, dest2, len2, start3, dest3, len3);
        page.copy_within(start1 as usize..(start1 + len1) as usize, dest1 as usize);
    }
}

impl NodeInner {
    /// Allocates `encoded_len` bytes from one of the segments, preferring
    /// the larger one. Returns the entry location, or `None` when neither
    /// segment has contiguous room.
    pub(crate) fn alloc_page_entry(
        &mut self,
        encoded_len: i32,
        left_space: i32,
        right_space: i32,
    ) -> Option<i32> {
        if encoded_len <= left_space && left_space >= right_space {
            let entry_loc = self.left_seg_tail;
            self.left_seg_tail = entry_loc + encoded_len;
            Some(entry_loc)
        } else if encoded_len <= right_space {
            let entry_loc = self.right_seg_tail - encoded_len + 1;
            self.right_seg_tail = entry_loc - 1;
            Some(entry_loc)
        } else {
            None
        }
    }

    /// Allocates space for a leaf entry at complement position `pos`,
    /// already pointed to by the search vector. Attempts, in order: direct
    /// allocation with a vector half-shift, compaction, rebalancing into a
    /// sibling, and finally reports a required split.
    pub(crate) fn create_leaf_entry(
        &mut self,
        cx: &TreeCx<'_>,
        node: &Arc<Node>,
        mut pos: i32,
        encoded_len: i32,
    ) -> Result<LeafLoc> {
        let mut search_vec_start = self.search_vec_start;
        let mut search_vec_end = self.search_vec_end;

        let mut left_space = search_vec_start - self.left_seg_tail;
        let mut right_space = self.right_seg_tail - search_vec_end - 1;

        let entry_loc: i32;
        'alloc: {
            if pos < ((search_vec_end - search_vec_start + 2) >> 1) {
                // Shift subset of search vector left or prepend.
                left_space -= 2;
                if left_space >= 0 {
                    if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space)
                    {
                        search_vec_start -= 2;
                        self.page.copy_within(
                            search_vec_start as usize + 2
                                ..(search_vec_start + 2 + pos) as usize,
                            search_vec_start as usize,
                        );
                        pos += search_vec_start;
                        self.search_vec_start = search_vec_start;
                        entry_loc = loc;
                        break 'alloc;
                    }
                }
                left_space += 2;
            } else {
                // Shift subset of search vector right or append.
                right_space -= 2;
                if right_space >= 0 {
                    if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space)
                    {
                        pos += search_vec_start;
                        search_vec_end += 2;
                        self.page.copy_within(
                            pos as usize..search_vec_end as usize,
                            pos as usize + 2,
                        );
                        self.search_vec_end = search_vec_end;
                        self.search_vec_start = search_vec_start;
                        put_u16le(&mut self.page, pos, loc);
                        return Ok(LeafLoc::Loc(loc));
                    }
                }
                right_space += 2;
            }

            // Remaining space surrounding the vector after the insert.
            let remaining = left_space + right_space - encoded_len - 2;

            if self.garbage > remaining {
                'compact: {
                    if self.garbage + remaining < 0 {
                        // Compaction alone cannot make room; try pushing
                        // entries into a sibling before splitting.
                        let parent_frame = match node.any_parent_frame() {
                            Some(f) => f,
                            None => break 'compact,
                        };

                        // Direction order is seeded by the node id so a
                        // repeated workload does not always shove the same
                        // way.
                        if node.id() & 1 == 0 {
                            let adj = try_rebalance_leaf_left(
                                cx,
                                node,
                                self,
                                &parent_frame,
                                pos,
                                -remaining,
                            );
                            if adj == 0 {
                                if !try_rebalance_leaf_right(
                                    cx,
                                    node,
                                    self,
                                    &parent_frame,
                                    pos,
                                    -remaining,
                                ) {
                                    break 'compact;
                                }
                            } else {
                                pos -= adj;
                            }
                        } else if !try_rebalance_leaf_right(
                            cx,
                            node,
                            self,
                            &parent_frame,
                            pos,
                            -remaining,
                        ) {
                            let adj = try_rebalance_leaf_left(
                                cx,
                                node,
                                self,
                                &parent_frame,
                                pos,
                                -remaining,
                            );
                            if adj == 0 {
                                break 'compact;
                            }
                            pos -= adj;
                        }
                    }

                    return Ok(LeafLoc::Loc(self.compact_leaf(cx, encoded_len, pos, true)));
                }

                // Max possible entry allowed, accounting for the entry
                // pointer plus worst-case key and value length headers.
                let max = self.garbage + left_space + right_space - (2 + 2 + 2);
                return Ok(LeafLoc::Split { max });
            }

            let vec_len = search_vec_end - search_vec_start + 2;
            let new_search_vec_start;

            if remaining > 0 || self.right_seg_tail & 1 != 0 {
                // Re-center the vector, biased right, even-aligned.
                new_search_vec_start =
                    (self.right_seg_tail - vec_len + (1 - 2) - (remaining >> 1)) & !1;
                entry_loc = self.left_seg_tail;
                self.left_seg_tail = entry_loc + encoded_len;
            } else if self.left_seg_tail & 1 == 0 {
                // Move the vector left.
                new_search_vec_start = self.left_seg_tail + ((remaining >> 1) & !1);
                entry_loc = self.right_seg_tail - encoded_len + 1;
                self.right_seg_tail = entry_loc - 1;
            } else {
                // Vector is misaligned; only compaction restores it.
                return Ok(LeafLoc::Loc(self.compact_leaf(cx, encoded_len, pos, true)));
            }

            array_copies_2(
                &mut self.page,
                search_vec_start,
                new_search_vec_start,
                pos,
                search_vec_start + pos,
                new_search_vec_start + pos + 2,
                vec_len - pos,
            );

            pos += new_search_vec_start;
            self.search_vec_start = new_search_vec_start;
            self.search_vec_end = new_search_vec_start + vec_len;
        }

        put_u16le(&mut self.page, pos, entry_loc);
        Ok(LeafLoc::Loc(entry_loc))
    }

    /// Compacts a leaf by copying live entries into a spare buffer,
    /// reserving room for a new entry of `encoded_len` at normalized
    /// position `pos`. The vector points at the reservation on return.
    pub(crate) fn compact_leaf(
        &mut self,
        cx: &TreeCx<'_>,
        encoded_len: i32,
        mut pos: i32,
        for_insert: bool,
    ) -> i32 {
        let mut search_vec_loc = self.search_vec_start;
        let mut new_search_vec_size = self.search_vec_end - search_vec_loc + 2;
        if for_insert {
            new_search_vec_size += 2;
        }
        pos += search_vec_loc;

        // New vector location, leaving room to grow on both ends.
        let search_vec_cap = self.garbage + self.right_seg_tail + 1 - self.left_seg_tail
            - encoded_len;
        let new_search_vec_start =
            self.page.len() as i32 - (((search_vec_cap + new_search_vec_size) >> 1) & !1);

        let mut dest_loc = TN_HEADER_SIZE as i32;
        let mut new_search_vec_loc = new_search_vec_start;
        let mut new_loc = 0;
        let search_vec_end = self.search_vec_end;

        let mut dest = cx.db.remove_spare_buffer();

        while search_vec_loc <= search_vec_end {
            if search_vec_loc == pos {
                // Reserve a slot for the new or updated entry.
                new_loc = new_search_vec_loc;
                if for_insert {
                    new_search_vec_loc += 2;
                } else {
                    search_vec_loc += 2;
                    new_search_vec_loc += 2;
                    continue;
                }
            }
            let source_loc = u16le(&self.page, search_vec_loc);
            let len = leaf_entry_length_at(&self.page, source_loc);
            dest[dest_loc as usize..(dest_loc + len) as usize]
                .copy_from_slice(&self.page[source_loc as usize..(source_loc + len) as usize]);
            put_u16le(&mut dest, new_search_vec_loc, dest_loc);
            dest_loc += len;
            search_vec_loc += 2;
            new_search_vec_loc += 2;
        }

        // Point the reserved slot at the allocation.
        put_u16le(
            &mut dest,
            if new_loc == 0 { new_search_vec_loc } else { new_loc },
            dest_loc,
        );

        let old = std::mem::replace(&mut self.page, dest);
        cx.db.add_spare_buffer(old);

        self.garbage = 0;
        self.left_seg_tail = dest_loc + encoded_len;
        self.right_seg_tail = self.page.len() as i32 - 1;
        self.search_vec_start = new_search_vec_start;
        self.search_vec_end = new_search_vec_start + new_search_vec_size - 2;

        dest_loc
    }

    /// Replaces the value of the leaf entry at found position `pos`. The
    /// existing entry slot is reused when the new value fits; otherwise the
    /// old bytes become garbage and a fresh entry is allocated, splitting
    /// the node as a last resort.
    pub(crate) fn update_leaf_value(
        &mut self,
        cx: &TreeCx<'_>,
        node: &Arc<Node>,
        pos: i32,
        mut fragmented: u8,
        value: &[u8],
    ) -> Result<()> {
        let search_vec_start = self.search_vec_start;

        let start;
        let key_len;
        let garbage;
        'quick: {
            let start_loc = u16le(&self.page, search_vec_start + pos);
            let value_header_loc = skip_key_at(&self.page, start_loc as usize) as i32;
            let mut loc = value_header_loc + 1;

            let header = self.page[value_header_loc as usize];
            let mut len = 0i32;
            if header & 0x80 != 0 {
                'large_value: {
                    if header & 0x20 == 0 {
                        len = 1 + (((header as i32 & 0x1f) << 8)
                            | self.page[loc as usize] as i32);
                        loc += 1;
                    } else if header != GHOST_HEADER {
                        len = 1 + (((header as i32 & 0x0f) << 16)
                            | ((self.page[loc as usize] as i32) << 8)
                            | self.page[loc as usize + 1] as i32);
                        loc += 2;
                    } else {
                        // Ghost.
                        break 'large_value;
                    }
                    if header & VALUE_FRAGMENTED != 0 {
                        let desc = self.page[loc as usize..(loc + len) as usize].to_vec();
                        cx.db.delete_fragments(&desc)?;
                        if fragmented == 0 {
                            // Clear the bit so a quick copy is legal.
                            self.page[value_header_loc as usize] = header & !VALUE_FRAGMENTED;
                        }
                    }
                }
            } else {
                len = header as i32;
            }

            let value_len = value.len() as i32;
            if value_len > len {
                // Old slot too small; it all becomes garbage.
                key_len = value_header_loc - start_loc;
                garbage = self.garbage + loc + len - start_loc;
                start = start_loc;
                break 'quick;
            }

            if value_len == len {
                if value_len == 0 {
                    // Replaces a ghost with an empty value.
                    self.page[value_header_loc as usize] = 0;
                } else {
                    self.page[loc as usize..(loc + value_len) as usize].copy_from_slice(value);
                    if fragmented != 0 {
                        self.page[value_header_loc as usize] |= fragmented;
                    }
                }
            } else {
                let first = copy_to_leaf_value(
                    &mut self.page,
                    fragmented,
                    value,
                    value_header_loc as usize,
                ) as i32;
                self.garbage += loc + len - first - value_len;
            }

            return Ok(());
        }

        // Out-of-place update; similar to create_leaf_entry except the
        // search vector does not grow.

        let search_vec_end = self.search_vec_end;
        let left_space = search_vec_start - self.left_seg_tail;
        let right_space = self.right_seg_tail - search_vec_end - 1;

        let mut value = std::borrow::Cow::Borrowed(value);
        let mut encoded_len = if fragmented != 0 {
            key_len + calculate_fragmented_value_length(&value)
        } else {
            let mut len = key_len + calculate_leaf_value_length(&value);
            if len > cx.tree.max_entry_size() as i32 {
                let desc = cx
                    .db
                    .fragment_value(&value, cx.tree.max_entry_size() as i32 - key_len)?;
                value = std::borrow::Cow::Owned(desc);
                fragmented = VALUE_FRAGMENTED;
                len = key_len + calculate_fragmented_value_length(&value);
            }
            len
        };

        let mut vec_pos = pos;
        let entry_loc: i32;
        'alloc: {
            if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space) {
                vec_pos += search_vec_start;
                entry_loc = loc;
                break 'alloc;
            }

            let remaining = left_space + right_space - encoded_len;

            if garbage > remaining {
                let key = self.retrieve_key(pos);
                if garbage + remaining < 0 {
                    if self.split.is_none() {
                        // Node is full; split and store through the split.
                        // Garbage is left as-is: the split skips the old
                        // entry and accounts for it there.
                        super::split::split_leaf_and_create_entry(
                            cx,
                            node,
                            self,
                            &key,
                            fragmented,
                            &value,
                            encoded_len,
                            pos,
                            false,
                        )?;
                        return Ok(());
                    }

                    // Already split; shrink the value by fragmenting into
                    // whatever space can be reclaimed.
                    eyre::ensure!(
                        fragmented == 0,
                        "fragmented entry does not fit in split node"
                    );
                    let max = (garbage + left_space + right_space)
                        .min(cx.tree.max_entry_size() as i32);
                    let desc = cx.db.fragment_value(&value, max - key_len)?;
                    value = std::borrow::Cow::Owned(desc);
                    fragmented = VALUE_FRAGMENTED;
                    encoded_len = key_len + calculate_fragmented_value_length(&value);
                }

                self.garbage = garbage;
                let loc = self.compact_leaf(cx, encoded_len, pos, false);
                copy_to_leaf_entry(&mut self.page, &key, fragmented, &value, loc as usize);
                return Ok(());
            }

            let vec_len = search_vec_end - search_vec_start + 2;
            let new_search_vec_start;

            if remaining > 0 || self.right_seg_tail & 1 != 0 {
                new_search_vec_start =
                    (self.right_seg_tail - vec_len + 1 - (remaining >> 1)) & !1;
                entry_loc = self.left_seg_tail;
                self.left_seg_tail = entry_loc + encoded_len;
            } else if self.left_seg_tail & 1 == 0 {
                new_search_vec_start = self.left_seg_tail + ((remaining >> 1) & !1);
                entry_loc = self.right_seg_tail - encoded_len + 1;
                self.right_seg_tail = entry_loc - 1;
            } else {
                let key = self.retrieve_key(pos);
                self.garbage = garbage;
                let loc = self.compact_leaf(cx, encoded_len, pos, false);
                copy_to_leaf_entry(&mut self.page, &key, fragmented, &value, loc as usize);
                return Ok(());
            }

            self.page.copy_within(
                search_vec_start as usize..(search_vec_start + vec_len) as usize,
                new_search_vec_start as usize,
            );

            vec_pos = pos + new_search_vec_start;
            self.search_vec_start = new_search_vec_start;
            self.search_vec_end = new_search_vec_start + vec_len - 2;
        }

        // Copy the existing key, then the value, and repoint the vector.
        self.page.copy_within(
            start as usize..(start + key_len) as usize,
            entry_loc as usize,
        );
        copy_to_leaf_value(
            &mut self.page,
            fragmented,
            &value,
            (entry_loc + key_len) as usize,
        );
        put_u16le(&mut self.page, vec_pos, entry_loc);

        self.garbage = garbage;
        Ok(())
    }

    /// Creates an internal-node entry: a key at 2-based `key_pos` and a
    /// child-id slot at 8-based byte offset `new_child_pos`. The key bytes
    /// (encoded) and child id are written when given; otherwise the caller
    /// fills the returned locations. When the node is full it is split
    /// (`allow_split`) and `InResult::Split` is returned with the key and
    /// child already routed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_internal_entry(
        &mut self,
        cx: &TreeCx<'_>,
        node: &Arc<Node>,
        mut key_pos: i32,
        encoded_len: i32,
        mut new_child_pos: i32,
        key: Option<KeySrc<'_>>,
        new_child_id: Option<u64>,
        allow_split: bool,
    ) -> Result<InResult> {
        let mut search_vec_start = self.search_vec_start;
        let mut search_vec_end = self.search_vec_end;

        let mut left_space = search_vec_start - self.left_seg_tail;
        let mut right_space =
            self.right_seg_tail - search_vec_end - ((search_vec_end - search_vec_start) << 2) - 17;

        let entry_loc: i32;
        let abs_key_pos: i32;
        let abs_child_loc: i32;
        'alloc: {
            // Room is needed for one vector entry (2 bytes) and one child
            // id (8 bytes); pick the shift direction that moves less.
            if new_child_pos < ((3 * (search_vec_end - search_vec_start + 2) + key_pos + 8) >> 1) {
                // Shift vector left by 10, child ids left by 8.
                left_space -= 10;
                if left_space >= 0 {
                    if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space)
                    {
                        self.page.copy_within(
                            search_vec_start as usize..(search_vec_start + key_pos) as usize,
                            (search_vec_start - 10) as usize,
                        );
                        self.page.copy_within(
                            (search_vec_start + key_pos) as usize
                                ..(search_vec_end + 2 + new_child_pos) as usize,
                            (search_vec_start + key_pos - 8) as usize,
                        );
                        search_vec_start -= 10;
                        self.search_vec_start = search_vec_start;
                        abs_key_pos = key_pos + search_vec_start;
                        search_vec_end -= 8;
                        self.search_vec_end = search_vec_end;
                        abs_child_loc = new_child_pos + search_vec_end + 2;
                        entry_loc = loc;
                        break 'alloc;
                    }
                }
                left_space += 10;
            } else {
                // Shift vector left by 2, child ids right by 8.
                left_space -= 2;
                right_space -= 8;
                if left_space >= 0 && right_space >= 0 {
                    if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space)
                    {
                        self.page.copy_within(
                            search_vec_start as usize..(search_vec_start + key_pos) as usize,
                            (search_vec_start - 2) as usize,
                        );
                        search_vec_start -= 2;
                        self.search_vec_start = search_vec_start;
                        abs_key_pos = key_pos + search_vec_start;
                        let move_start = search_vec_end + new_child_pos + 2;
                        let move_len =
                            ((search_vec_end - search_vec_start) << 2) + 8 - new_child_pos;
                        self.page.copy_within(
                            move_start as usize..(move_start + move_len) as usize,
                            (move_start + 8) as usize,
                        );
                        abs_child_loc = new_child_pos + search_vec_end + 2;
                        entry_loc = loc;
                        break 'alloc;
                    }
                }
                left_space += 2;
                right_space += 8;
            }

            // Remaining space around the vector after the insert.
            let remaining = left_space + right_space - encoded_len - 10;

            if self.garbage > remaining {
                'compact: {
                    if self.garbage + remaining < 0 {
                        // Compaction will not make room; try to rebalance
                        // into a sibling before splitting.
                        let parent_frame = match node.any_parent_frame() {
                            Some(f) => f,
                            None => break 'compact,
                        };

                        if node.id() & 1 == 0 {
                            let adjust = try_rebalance_internal_left(
                                cx,
                                node,
                                self,
                                &parent_frame,
                                key_pos,
                                -remaining,
                            )?;
                            if adjust == 0 {
                                if !try_rebalance_internal_right(
                                    cx,
                                    node,
                                    self,
                                    &parent_frame,
                                    key_pos,
                                    -remaining,
                                )? {
                                    break 'compact;
                                }
                            } else {
                                key_pos -= adjust;
                                new_child_pos -= adjust << 2;
                            }
                        } else if !try_rebalance_internal_right(
                            cx,
                            node,
                            self,
                            &parent_frame,
                            key_pos,
                            -remaining,
                        )? {
                            let adjust = try_rebalance_internal_left(
                                cx,
                                node,
                                self,
                                &parent_frame,
                                key_pos,
                                -remaining,
                            )?;
                            if adjust == 0 {
                                break 'compact;
                            }
                            key_pos -= adjust;
                            new_child_pos -= adjust << 2;
                        }
                    }

                    let r = self.compact_internal(cx, encoded_len, key_pos, new_child_pos);
                    if let Some(key) = key {
                        key.write_to(&mut self.page, r.entry_loc as usize);
                    }
                    if let Some(id) = new_child_id {
                        put_child_id(&mut self.page, r.new_child_loc, id);
                    }
                    return Ok(InResult::Here {
                        entry_loc: r.entry_loc,
                        new_child_loc: r.new_child_loc,
                    });
                }

                // Node is full: split it.
                eyre::ensure!(allow_split, "internal entry requires split where none allowed");
                let key = match key {
                    Some(KeySrc::Plain(k)) => k,
                    _ => eyre::bail!("split insert requires the plain key bytes"),
                };
                let id = new_child_id
                    .ok_or_else(|| eyre::eyre!("split insert requires the child id"))?;
                split_internal(cx, node, self, encoded_len, key_pos, new_child_pos, key, id)?;
                return Ok(InResult::Split);
            }

            let vec_len = search_vec_end - search_vec_start + 2;
            let child_ids_len = (vec_len << 2) + 8;
            let new_search_vec_start;

            if remaining > 0 || self.right_seg_tail & 1 != 0 {
                new_search_vec_start = (self.right_seg_tail - vec_len - child_ids_len + (1 - 10)
                    - (remaining >> 1))
                    & !1;
                entry_loc = self.left_seg_tail;
                self.left_seg_tail = entry_loc + encoded_len;
            } else if self.left_seg_tail & 1 == 0 {
                new_search_vec_start = self.left_seg_tail + ((remaining >> 1) & !1);
                entry_loc = self.right_seg_tail - encoded_len + 1;
                self.right_seg_tail = entry_loc - 1;
            } else {
                let r = self.compact_internal(cx, encoded_len, key_pos, new_child_pos);
                if let Some(key) = key {
                    key.write_to(&mut self.page, r.entry_loc as usize);
                }
                if let Some(id) = new_child_id {
                    put_child_id(&mut self.page, r.new_child_loc, id);
                }
                return Ok(InResult::Here {
                    entry_loc: r.entry_loc,
                    new_child_loc: r.new_child_loc,
                });
            }

            let new_search_vec_end = new_search_vec_start + vec_len;

            array_copies_3(
                &mut self.page,
                // Vector up to the new key position.
                search_vec_start,
                new_search_vec_start,
                key_pos,
                // Vector after the new key position, through the head of
                // the child ids, up to the new child position.
                search_vec_start + key_pos,
                new_search_vec_start + key_pos + 2,
                vec_len - key_pos + new_child_pos,
                // Child ids after the new child position.
                search_vec_end + 2 + new_child_pos,
                new_search_vec_end + 10 + new_child_pos,
                child_ids_len - new_child_pos,
            );

            abs_key_pos = key_pos + new_search_vec_start;
            abs_child_loc = new_child_pos + new_search_vec_end + 2;
            self.search_vec_start = new_search_vec_start;
            self.search_vec_end = new_search_vec_end;
        }

        put_u16le(&mut self.page, abs_key_pos, entry_loc);
        if let Some(key) = key {
            key.write_to(&mut self.page, entry_loc as usize);
        }
        if let Some(id) = new_child_id {
            put_child_id(&mut self.page, abs_child_loc, id);
        }

        Ok(InResult::Here {
            entry_loc,
            new_child_loc: abs_child_loc,
        })
    }

    /// Grows an internal key in place (rebalance updates a parent
    /// separator). The node must have room; separators never split their
    /// parent from this path.
    pub(crate) fn update_internal_key(
        &mut self,
        cx: &TreeCx<'_>,
        pos: i32,
        growth: i32,
        encoded_key: &[u8],
    ) -> Result<()> {
        let encoded_len = encoded_key.len() as i32;
        let garbage = self.garbage + encoded_len - growth;

        let search_vec_start = self.search_vec_start;
        let search_vec_end = self.search_vec_end;

        let left_space = search_vec_start - self.left_seg_tail;
        let right_space =
            self.right_seg_tail - search_vec_end - ((search_vec_end - search_vec_start) << 2) - 17;

        let entry_loc: i32;
        let abs_pos: i32;
        'alloc: {
            if let Some(loc) = self.alloc_page_entry(encoded_len, left_space, right_space) {
                abs_pos = pos + search_vec_start;
                entry_loc = loc;
                break 'alloc;
            }

            'make_room: {
                let remaining = left_space + right_space - encoded_len;

                if garbage > remaining {
                    eyre::ensure!(
                        garbage + remaining >= 0,
                        "updated separator does not fit after compaction"
                    );
                    break 'make_room;
                }

                let vec_len = search_vec_end - search_vec_start + 2;
                let child_ids_len = (vec_len << 2) + 8;
                let new_search_vec_start;

                if remaining > 0 || self.right_seg_tail & 1 != 0 {
                    new_search_vec_start = (self.right_seg_tail - vec_len - child_ids_len + 1
                        - (remaining >> 1))
                        & !1;
                    entry_loc = self.left_seg_tail;
                    self.left_seg_tail = entry_loc + encoded_len;
                } else if self.left_seg_tail & 1 == 0 {
                    new_search_vec_start = self.left_seg_tail + ((remaining >> 1) & !1);
                    entry_loc = self.right_seg_tail - encoded_len + 1;
                    self.right_seg_tail = entry_loc - 1;
                } else {
                    break 'make_room;
                }

                self.page.copy_within(
                    search_vec_start as usize
                        ..(search_vec_start + vec_len + child_ids_len) as usize,
                    new_search_vec_start as usize,
                );

                abs_pos = pos + new_search_vec_start;
                self.search_vec_start = new_search_vec_start;
                self.search_vec_end = new_search_vec_start + vec_len - 2;
                break 'alloc;
            }

            // Make room by compaction.
            self.garbage = garbage;
            let r = self.compact_internal(cx, encoded_len, pos, i32::MIN);
            self.page[r.entry_loc as usize..r.entry_loc as usize + encoded_key.len()]
                .copy_from_slice(encoded_key);
            return Ok(());
        }

        self.page[entry_loc as usize..entry_loc as usize + encoded_key.len()]
            .copy_from_slice(encoded_key);
        put_u16le(&mut self.page, abs_pos, entry_loc);
        self.garbage = garbage;
        Ok(())
    }

    /// Compacts an internal node, reserving room for a key at normalized
    /// `key_pos` and (when `child_pos >= 0`) a child-id gap at normalized
    /// byte offset `child_pos`. Pass `i32::MIN` for updates.
    pub(crate) fn compact_internal(
        &mut self,
        cx: &TreeCx<'_>,
        encoded_len: i32,
        mut key_pos: i32,
        child_pos: i32,
    ) -> InCompact {
        let mut search_vec_loc = self.search_vec_start;
        key_pos += search_vec_loc;
        // Vector size, possibly with the new entry; child_pos >> 30 folds
        // the "update" sentinel into a -2 adjustment.
        let new_search_vec_size =
            self.search_vec_end - search_vec_loc + (2 + 2) + (child_pos >> 30);

        let search_vec_cap = self.garbage + self.right_seg_tail + 1 - self.left_seg_tail
            - encoded_len;
        let new_search_vec_start = self.page.len() as i32
            - (((search_vec_cap + new_search_vec_size + ((new_search_vec_size + 2) << 2)) >> 1)
                & !1);

        let mut dest_loc = TN_HEADER_SIZE as i32;
        let mut new_search_vec_loc = new_search_vec_start;
        let mut new_loc = 0;
        let search_vec_end = self.search_vec_end;

        let mut dest = cx.db.remove_spare_buffer();

        while search_vec_loc <= search_vec_end {
            if search_vec_loc == key_pos {
                // Reserve a slot for the new or updated key.
                new_loc = new_search_vec_loc;
                if child_pos >= 0 {
                    new_search_vec_loc += 2;
                } else {
                    search_vec_loc += 2;
                    new_search_vec_loc += 2;
                    continue;
                }
            }
            put_u16le(&mut dest, new_search_vec_loc, dest_loc);
            let source_loc = u16le(&self.page, search_vec_loc);
            let len = key_length_at(&self.page, source_loc);
            dest[dest_loc as usize..(dest_loc + len) as usize]
                .copy_from_slice(&self.page[source_loc as usize..(source_loc + len) as usize]);
            dest_loc += len;
            search_vec_loc += 2;
            new_search_vec_loc += 2;
        }

        let new_child_loc;
        if child_pos >= 0 {
            if new_loc == 0 {
                new_loc = new_search_vec_loc;
                new_search_vec_loc += 2;
            }

            // Copy child ids, leaving a gap for the inserted one.
            let src = (self.search_vec_end + 2) as usize;
            dest[new_search_vec_loc as usize..(new_search_vec_loc + child_pos) as usize]
                .copy_from_slice(&self.page[src..src + child_pos as usize]);
            let tail_len = (new_search_vec_size << 2) - child_pos;
            dest[(new_search_vec_loc + child_pos + 8) as usize
                ..(new_search_vec_loc + child_pos + 8 + tail_len) as usize]
                .copy_from_slice(
                    &self.page[src + child_pos as usize..src + (child_pos + tail_len) as usize],
                );
            new_child_loc = new_search_vec_loc + child_pos;
        } else {
            if new_loc == 0 {
                new_loc = new_search_vec_loc;
            }
            let src = (self.search_vec_end + 2) as usize;
            let len = ((new_search_vec_size << 2) + 8) as usize;
            dest[new_search_vec_loc as usize..new_search_vec_loc as usize + len]
                .copy_from_slice(&self.page[src..src + len]);
            new_child_loc = i32::MIN;
        }

        let old = std::mem::replace(&mut self.page, dest);
        cx.db.add_spare_buffer(old);

        put_u16le(&mut self.page, new_loc, dest_loc);

        self.garbage = 0;
        self.left_seg_tail = dest_loc + encoded_len;
        self.right_seg_tail = self.page.len() as i32 - 1;
        self.search_vec_start = new_search_vec_start;
        self.search_vec_end = new_search_vec_loc - 2;

        InCompact {
            entry_loc: dest_loc,
            new_child_loc,
        }
    }
}

pub(crate) struct InCompact {
    pub entry_loc: i32,
    pub new_child_loc: i32,
}
