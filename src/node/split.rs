//! # Node Splits
//!
//! A split moves entries from a full node into a freshly allocated sibling.
//! The sibling is pinned unevictable and the splitting node carries a
//! [`Split`] descriptor until a cursor inserts the separator into the
//! parent; any descent that observes the descriptor routes itself through
//! [`Split::select_sibling`].
//!
//! Leaf splits special-case inserts at the extreme left and right edges so
//! ascending and descending bulk loads produce packed nodes: only the new
//! entry moves to the sibling. Otherwise entries are walked from the guess
//! side until available bytes on both sides balance; when the new entry
//! cannot fit on its guessed side it is stored into the other one after the
//! vectors are finalized.
//!
//! Internal splits promote one existing key to the parent rather than
//! copying it, re-guessing the side once when the first walk comes up
//! empty. When the node holds exactly two keys and the insertion lands in
//! the middle, the incoming key itself is promoted without being stored in
//! either half.
//!
//! The split key is always an "appropriate middle key": the shortest byte
//! string strictly between the last key of the left side and the first key
//! of the right side.

use std::sync::Arc;

use super::edit::{KeySrc, LeafLoc};
use super::entry::*;
use super::{
    put_child_id, put_u16le, u16le, Node, NodeInner, TreeCx, HIGH_EXTREMITY, LOW_EXTREMITY,
    TYPE_TN_BIN, TYPE_TN_IN,
};
use crate::config::TN_HEADER_SIZE;
use crate::cursor::CursorFrame;
use crate::encoding::compare_keys;
use crate::error::{Error, Result};

/// Descriptor of a split in progress.
#[derive(Debug)]
pub(crate) struct Split {
    /// True when the sibling holds the high keys.
    pub(crate) right: bool,
    pub(crate) sibling: Arc<Node>,
    /// Separator: greater than every key on the left side, no greater than
    /// any key on the right side.
    pub(crate) key: Vec<u8>,
}

impl Split {
    pub(crate) fn encoded_key_len(&self) -> i32 {
        calculate_key_length(&self.key)
    }

    /// True when a search for `key` must continue in the sibling.
    pub(crate) fn select_sibling(&self, key: &[u8]) -> bool {
        let goes_right = compare_keys(key, &self.key).is_ge();
        goes_right == self.right
    }
}

impl NodeInner {
    /// Separator between the key at `low_pos` of this node and `high_key`.
    pub(crate) fn mid_key_high(&self, low_pos: i32, high_key: &[u8]) -> Vec<u8> {
        crate::encoding::mid_key(&self.retrieve_key(low_pos), high_key)
    }

    /// Separator between `low_key` and the key at `high_pos` of this node.
    pub(crate) fn mid_key_low(&self, low_key: &[u8], high_pos: i32) -> Vec<u8> {
        crate::encoding::mid_key(low_key, &self.retrieve_key(high_pos))
    }

    /// Separator between the key at `low_pos` of this node and the key at
    /// `high_pos` of `high`.
    pub(crate) fn mid_key_nodes(&self, low_pos: i32, high: &NodeInner, high_pos: i32) -> Vec<u8> {
        crate::encoding::mid_key(&self.retrieve_key(low_pos), &high.retrieve_key(high_pos))
    }

    /// Starts a split whose sibling takes the low keys. The new left node
    /// cannot be a high extremity, and this node stops being a low one.
    fn new_split_left(&mut self, sibling: &Arc<Node>, sib_inner: &mut NodeInner) -> Split {
        sib_inner.typ = self.typ & !HIGH_EXTREMITY;
        self.typ &= !LOW_EXTREMITY;
        Split {
            right: false,
            sibling: Arc::clone(sibling),
            key: Vec::new(),
        }
    }

    fn new_split_right(&mut self, sibling: &Arc<Node>, sib_inner: &mut NodeInner) -> Split {
        sib_inner.typ = self.typ & !LOW_EXTREMITY;
        self.typ &= !HIGH_EXTREMITY;
        Split {
            right: true,
            sibling: Arc::clone(sibling),
            key: Vec::new(),
        }
    }
}

/// Rebinds cursor frames from a just-split node onto its sibling. Both
/// inners are exclusively latched and final, so found frames map by entry
/// counts; not-found frames are re-searched on the side their remembered
/// key belongs to.
pub(crate) fn rebind_split_frames(
    node: &Node,
    node_inner: &mut NodeInner,
    sibling: &Arc<Node>,
    sib_inner: &mut NodeInner,
    split: &Split,
) {
    let slot_unit = if node_inner.is_leaf() { 0 } else { 1 };
    let node_slots = node_inner.num_keys() + slot_unit;
    let sib_slots = sib_inner.num_keys() + slot_unit;

    for frame in node.live_frames() {
        let mut state = frame.state.lock();
        let fp = state.pos;
        if fp >= 0 {
            let idx = fp >> 1;
            if split.right {
                if idx >= node_slots {
                    state.pos = (idx - node_slots) << 1;
                    drop(state);
                    frame.move_binding(node, sibling);
                }
            } else if idx < sib_slots {
                drop(state);
                frame.move_binding(node, sibling);
            } else {
                state.pos = (idx - sib_slots) << 1;
            }
        } else {
            // An unpositioned frame (empty-leaf binding) has no key to
            // re-derive from; it stays put at the low gap.
            let Some(key) = state.not_found_key.clone() else {
                state.pos = !0;
                continue;
            };
            if split.select_sibling(&key) {
                state.pos = sib_inner.binary_search(&key);
                drop(state);
                frame.move_binding(node, sibling);
            } else {
                state.pos = node_inner.binary_search(&key);
            }
        }
    }
}

/// Splits a leaf while placing a new or updated entry. On return
/// `inner.split` is set and the sibling is unevictable, awaiting the
/// parent insert.
#[allow(clippy::too_many_arguments)]
pub(crate) fn split_leaf_and_create_entry(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    key: &[u8],
    fragmented: u8,
    value: &[u8],
    encoded_len: i32,
    mut pos: i32,
    for_insert: bool,
) -> Result<()> {
    if inner.split.is_some() {
        return Err(cx.db.poison("split of split node"));
    }

    if inner.page.is_empty() {
        // Node is a closed tree root.
        eyre::bail!(Error::ClosedIndex);
    }

    log::trace!("leaf split: node {} pos {}", node.id(), pos);

    let (sibling, mut sib_guard) = cx.db.alloc_unevictable_node(cx.tree)?;
    let sib = &mut *sib_guard;
    sib.garbage = 0;
    let new_page_len = sib.page.len() as i32;

    if for_insert && pos == 0 {
        // Insert at the left edge, possibly a descending load. Only the
        // new entry goes into the new left node, with its vector at the
        // extreme left so further descending inserts pack naturally.
        let mut split = inner.new_split_left(&sibling, sib);
        split.key = inner.mid_key_low(key, 0);

        sib.left_seg_tail = TN_HEADER_SIZE as i32;
        sib.search_vec_start = TN_HEADER_SIZE as i32;
        sib.search_vec_end = TN_HEADER_SIZE as i32;

        let dest_loc = new_page_len - encoded_len;
        copy_to_leaf_entry(&mut sib.page, key, fragmented, value, dest_loc as usize);
        put_u16le(&mut sib.page, TN_HEADER_SIZE as i32, dest_loc);

        sib.right_seg_tail = dest_loc - 1;
        inner.split = Some(split);
        return Ok(());
    }

    let search_vec_start = inner.search_vec_start;
    let search_vec_end = inner.search_vec_end;

    pos += search_vec_start;

    if for_insert && pos == search_vec_end + 2 {
        // Insert at the right edge, possibly an ascending load.
        let mut split = inner.new_split_right(&sibling, sib);
        split.key = inner.mid_key_high(pos - search_vec_start - 2, key);

        sib.right_seg_tail = new_page_len - 1;
        sib.search_vec_start = new_page_len - 2;
        sib.search_vec_end = new_page_len - 2;

        copy_to_leaf_entry(&mut sib.page, key, fragmented, value, TN_HEADER_SIZE);
        put_u16le(&mut sib.page, new_page_len - 2, TN_HEADER_SIZE as i32);

        sib.left_seg_tail = TN_HEADER_SIZE as i32 + encoded_len;
        inner.split = Some(split);
        return Ok(());
    }

    // Bytes available in the unsplit node.
    let mut avail = inner.available_leaf_bytes();

    let mut garbage_accum = 0;
    let mut new_loc = 0;
    let mut new_avail = new_page_len - TN_HEADER_SIZE as i32;

    // Guess the split side from the insert position. Entry sizes vary, so
    // the guess can be wrong; then the new entry goes into this node,
    // which has space after the split.

    if pos - search_vec_start < search_vec_end - pos {
        // Split into a new left node.
        let mut dest_loc = new_page_len;
        let mut new_search_vec_loc = TN_HEADER_SIZE as i32;
        let mut search_vec_loc = search_vec_start;

        while new_avail > avail {
            let entry_loc = u16le(&inner.page, search_vec_loc);
            let entry_len = leaf_entry_length_at(&inner.page, entry_loc);

            if search_vec_loc == pos {
                new_avail -= encoded_len + 2;
                if new_avail < 0 {
                    // New entry does not fit into the new node.
                    break;
                }
                new_loc = new_search_vec_loc;
                if for_insert {
                    // Reserve a slot for the new entry.
                    new_search_vec_loc += 2;
                    if new_avail <= avail {
                        // Balanced enough.
                        break;
                    }
                } else {
                    // The old entry is not copied.
                    garbage_accum += entry_len;
                    avail += entry_len;
                    search_vec_loc += 2;
                    new_search_vec_loc += 2;
                    continue;
                }
            }

            new_avail -= entry_len + 2;
            if new_avail < 0 {
                break;
            }

            dest_loc -= entry_len;
            sib.page[dest_loc as usize..(dest_loc + entry_len) as usize].copy_from_slice(
                &inner.page[entry_loc as usize..(entry_loc + entry_len) as usize],
            );
            put_u16le(&mut sib.page, new_search_vec_loc, dest_loc);

            garbage_accum += entry_len;
            avail += entry_len + 2;
            search_vec_loc += 2;
            new_search_vec_loc += 2;
        }

        let split = inner.new_split_left(&sibling, sib);
        inner.split = Some(split);

        // Prune the left end of this node.
        inner.search_vec_start = search_vec_loc;
        inner.garbage += garbage_accum;

        sib.left_seg_tail = TN_HEADER_SIZE as i32;
        sib.search_vec_start = TN_HEADER_SIZE as i32;
        sib.search_vec_end = new_search_vec_loc - 2;

        if new_loc == 0 {
            // The new entry did not fit into the left node; store it into
            // this node, which has space now.
            sib.right_seg_tail = dest_loc - 1;
            store_into_split_leaf(cx, node, inner, key, fragmented, value, encoded_len, for_insert)?;
        } else {
            dest_loc -= encoded_len;
            copy_to_leaf_entry(&mut sib.page, key, fragmented, value, dest_loc as usize);
            put_u16le(&mut sib.page, new_loc, dest_loc);
            sib.right_seg_tail = dest_loc - 1;
        }

        // Choose the middle key only now: storing into this node can have
        // changed its first key.
        let sep = sib.mid_key_nodes(sib.highest_key_pos(), inner, 0);
        inner.split.as_mut().expect("split set above").key = sep;
    } else {
        // Split into a new right node.
        let mut dest_loc = TN_HEADER_SIZE as i32;
        let mut new_search_vec_loc = new_page_len - 2;
        let mut search_vec_loc = search_vec_end;

        while new_avail > avail {
            let entry_loc = u16le(&inner.page, search_vec_loc);
            let entry_len = leaf_entry_length_at(&inner.page, entry_loc);

            if for_insert {
                if search_vec_loc + 2 == pos {
                    new_avail -= encoded_len + 2;
                    if new_avail < 0 {
                        break;
                    }
                    // Reserve a slot for the new entry.
                    new_loc = new_search_vec_loc;
                    new_search_vec_loc -= 2;
                    if new_avail <= avail {
                        break;
                    }
                }
            } else if search_vec_loc == pos {
                new_avail -= encoded_len + 2;
                if new_avail < 0 {
                    break;
                }
                // The old entry is not copied.
                new_loc = new_search_vec_loc;
                garbage_accum += entry_len;
                avail += entry_len;
                search_vec_loc -= 2;
                new_search_vec_loc -= 2;
                continue;
            }

            new_avail -= entry_len + 2;
            if new_avail < 0 {
                break;
            }

            sib.page[dest_loc as usize..(dest_loc + entry_len) as usize].copy_from_slice(
                &inner.page[entry_loc as usize..(entry_loc + entry_len) as usize],
            );
            put_u16le(&mut sib.page, new_search_vec_loc, dest_loc);
            dest_loc += entry_len;

            garbage_accum += entry_len;
            avail += entry_len + 2;
            search_vec_loc -= 2;
            new_search_vec_loc -= 2;
        }

        let split = inner.new_split_right(&sibling, sib);
        inner.split = Some(split);

        // Prune the right end of this node.
        inner.search_vec_end = search_vec_loc;
        inner.garbage += garbage_accum;

        sib.right_seg_tail = new_page_len - 1;
        sib.search_vec_start = new_search_vec_loc + 2;
        sib.search_vec_end = new_page_len - 2;

        if new_loc == 0 {
            sib.left_seg_tail = dest_loc;
            store_into_split_leaf(cx, node, inner, key, fragmented, value, encoded_len, for_insert)?;
        } else {
            copy_to_leaf_entry(&mut sib.page, key, fragmented, value, dest_loc as usize);
            put_u16le(&mut sib.page, new_loc, dest_loc);
            dest_loc += encoded_len;
            sib.left_seg_tail = dest_loc;
        }

        let sep = inner.mid_key_nodes(inner.highest_key_pos(), sib, 0);
        inner.split.as_mut().expect("split set above").key = sep;
    }

    Ok(())
}

/// Stores an entry into a node that just split and has room again.
#[allow(clippy::too_many_arguments)]
fn store_into_split_leaf(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    key: &[u8],
    mut fragmented: u8,
    value: &[u8],
    mut encoded_len: i32,
    for_insert: bool,
) -> Result<()> {
    let pos = inner.binary_search(key);
    if for_insert {
        if pos >= 0 {
            return Err(cx.db.poison("key already exists after split"));
        }
        let mut value = std::borrow::Cow::Borrowed(value);
        loop {
            match inner.create_leaf_entry(cx, node, !pos, encoded_len)? {
                LeafLoc::Loc(entry_loc) => {
                    copy_to_leaf_entry(
                        &mut inner.page,
                        key,
                        fragmented,
                        &value,
                        entry_loc as usize,
                    );
                    return Ok(());
                }
                LeafLoc::Split { max } => {
                    eyre::ensure!(
                        fragmented == 0,
                        "fragmented entry does not fit in split node"
                    );
                    let max = max.min(cx.tree.max_entry_size() as i32);
                    let encoded_key_len = calculate_key_length(key);
                    let desc = cx.db.fragment_value(&value, max - encoded_key_len)?;
                    value = std::borrow::Cow::Owned(desc);
                    fragmented = VALUE_FRAGMENTED;
                    encoded_len = encoded_key_len + calculate_fragmented_value_length(&value);
                }
            }
        }
    } else {
        if pos < 0 {
            return Err(cx.db.poison("key not found after split"));
        }
        inner.update_leaf_value(cx, node, pos, fragmented, value)
    }
}

/// Splits an internal node while inserting a key at `key_pos` and a child
/// id at 8-based byte offset `new_child_pos`. The new child must already be
/// present in the in-memory child table.
#[allow(clippy::too_many_arguments)]
pub(crate) fn split_internal(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    encoded_len: i32,
    key_pos: i32,
    new_child_pos: i32,
    key: &[u8],
    new_child_id: u64,
) -> Result<()> {
    if inner.split.is_some() {
        return Err(cx.db.poison("split of split node"));
    }

    log::trace!("internal split: node {} key_pos {}", node.id(), key_pos);

    let (sibling, mut sib_guard) = cx.db.alloc_unevictable_node(cx.tree)?;
    let sib = &mut *sib_guard;
    sib.garbage = 0;
    let new_page_len = sib.page.len() as i32;

    let search_vec_start = inner.search_vec_start;
    let search_vec_end = inner.search_vec_end;

    if search_vec_end - search_vec_start == 2 && key_pos == 2 {
        // Two keys with the insert in the middle: promote the incoming key
        // itself. Only expected with very large keys.

        let left_key_loc = u16le(&inner.page, search_vec_start);
        let left_key_len = key_length_at(&inner.page, left_key_loc);

        // Assume another large key arrives later: entry at the far left,
        // vector at the far right.
        sib.page[TN_HEADER_SIZE..TN_HEADER_SIZE + left_key_len as usize].copy_from_slice(
            &inner.page[left_key_loc as usize..(left_key_loc + left_key_len) as usize],
        );
        let left_search_vec_start = new_page_len - (2 + 8 + 8);
        put_u16le(&mut sib.page, left_search_vec_start, TN_HEADER_SIZE as i32);

        // Copy one or two left child ids into the left node, and write the
        // new child id into whichever side it belongs (8: left, 16: right).
        let src = (search_vec_end + 2) as usize;
        sib.page[left_search_vec_start as usize + 2
            ..left_search_vec_start as usize + 2 + new_child_pos as usize]
            .copy_from_slice(&inner.page[src..src + new_child_pos as usize]);
        if new_child_pos == 8 {
            put_child_id(&mut sib.page, left_search_vec_start + 2 + 8, new_child_id);
        } else {
            eyre::ensure!(new_child_pos == 16, "unexpected child position in promote");
            put_child_id(&mut inner.page, search_vec_end + 2 + 8, new_child_id);
        }

        // Split the child table; the caller already inserted the new
        // child, making four entries.
        let right_children = inner.child_nodes.split_off(2);
        sib.child_nodes = std::mem::replace(&mut inner.child_nodes, right_children);

        sib.left_seg_tail = TN_HEADER_SIZE as i32 + left_key_len;
        sib.right_seg_tail = left_search_vec_start + (2 + 8 + 8 - 1);
        sib.search_vec_start = left_search_vec_start;
        sib.search_vec_end = left_search_vec_start;

        // Prune this node's left end by shifting its one remaining vector
        // entry over the freed child-id space.
        inner.page.copy_within(
            search_vec_end as usize..search_vec_end as usize + 2,
            (search_vec_end + 8) as usize,
        );
        inner.search_vec_start = search_vec_end + 8;
        inner.search_vec_end = search_vec_end + 8;

        inner.garbage += left_key_len;

        let mut split = inner.new_split_left(&sibling, sib);
        split.key = key.to_vec();
        inner.split = Some(split);
        return Ok(());
    }

    let key_loc = key_pos + search_vec_start;

    // Guess the split side from the position; a wrong guess is redone on
    // the other side once. -2: forced left, -1: guess left, 1: guess
    // right, 2: forced right.
    let mut split_side: i32 = if key_pos < search_vec_end - search_vec_start - key_pos {
        -1
    } else {
        1
    };

    'do_split: loop {
        let mut garbage_accum = 0;
        let mut new_key_loc;

        // Bytes used in the unsplit node (header included), and in the new
        // node, both adjusted for the extra child id.
        let mut size = 5 * (search_vec_end - search_vec_start) + (1 + 8 + 8) + inner.left_seg_tail
            + inner.page.len() as i32
            - inner.right_seg_tail
            - inner.garbage
            - 8;
        let mut new_size = TN_HEADER_SIZE as i32 + 8;

        if split_side < 0 {
            // Split into a new left node.
            new_key_loc = 0;
            let mut dest_loc = new_page_len;
            let mut new_search_vec_loc = TN_HEADER_SIZE as i32;
            let mut search_vec_loc = search_vec_start;

            'copy_loop_left: loop {
                if search_vec_loc == key_loc {
                    new_key_loc = new_search_vec_loc;
                    // Reserve a slot for the new entry.
                    new_search_vec_loc += 2;
                    new_size += encoded_len + (2 + 8);
                }

                let mut entry_loc = u16le(&inner.page, search_vec_loc);
                let mut entry_len = key_length_at(&inner.page, entry_loc);

                let size_change = entry_len + (2 + 8);
                size -= size_change;
                new_size += size_change;

                'size_check: {
                    if size <= TN_HEADER_SIZE as i32 || new_size >= new_page_len {
                        // Moved too many entries; undo the last move and
                        // promote that entry instead.
                        if search_vec_loc == key_loc {
                            new_key_loc = 0;
                        }
                        new_search_vec_loc -= 2;
                        entry_loc = u16le(&inner.page, search_vec_loc - 2);
                        entry_len = key_length_at(&inner.page, entry_loc);
                        dest_loc += entry_len;
                    } else {
                        search_vec_loc += 2;
                        // The last examined key is dropped, not moved;
                        // garbage must account for it.
                        garbage_accum += entry_len;
                        if new_size < size {
                            // Keep moving entries until balanced.
                            break 'size_check;
                        }
                    }

                    // Enough entries accumulated...
                    if new_key_loc != 0 {
                        // ...and the promoted split key is found.
                        let mut split = inner.new_split_left(&sibling, sib);
                        split.key = retrieve_key_at(&inner.page, entry_loc);
                        inner.split = Some(split);
                        break 'copy_loop_left;
                    }

                    if split_side == -1 {
                        // Guessed wrong; do over on the right side.
                        split_side = 2;
                        continue 'do_split;
                    }

                    eyre::ensure!(split_side == -2, "internal split side state corrupt");
                }

                // Copy the key entry into the new node.
                dest_loc -= entry_len;
                sib.page[dest_loc as usize..(dest_loc + entry_len) as usize].copy_from_slice(
                    &inner.page[entry_loc as usize..(entry_loc + entry_len) as usize],
                );
                put_u16le(&mut sib.page, new_search_vec_loc, dest_loc);
                new_search_vec_loc += 2;
            }

            let entry_loc = dest_loc - encoded_len;

            // Copy existing child ids around a gap for the new one.
            {
                let src = (search_vec_end + 2) as usize;
                sib.page[new_search_vec_loc as usize
                    ..new_search_vec_loc as usize + new_child_pos as usize]
                    .copy_from_slice(&inner.page[src..src + new_child_pos as usize]);

                put_child_id(&mut sib.page, new_search_vec_loc + new_child_pos, new_child_id);

                let tail_len = ((search_vec_loc - search_vec_start) << 2) - new_child_pos;
                sib.page[(new_search_vec_loc + new_child_pos + 8) as usize
                    ..(new_search_vec_loc + new_child_pos + 8 + tail_len) as usize]
                    .copy_from_slice(
                        &inner.page[src + new_child_pos as usize
                            ..src + (new_child_pos + tail_len) as usize],
                    );

                // Split the in-memory child table.
                let left_len = ((new_search_vec_loc - TN_HEADER_SIZE as i32) >> 1) as usize + 1;
                let right_children = inner.child_nodes.split_off(left_len);
                sib.child_nodes = std::mem::replace(&mut inner.child_nodes, right_children);
            }

            // Write the new key into the left node.
            encode_key(key, &mut sib.page, entry_loc as usize);
            put_u16le(&mut sib.page, new_key_loc, entry_loc);

            sib.left_seg_tail = TN_HEADER_SIZE as i32;
            sib.right_seg_tail = entry_loc - 1;
            sib.search_vec_start = TN_HEADER_SIZE as i32;
            sib.search_vec_end = new_search_vec_loc - 2;

            // Prune the left end of this node by shifting its vector
            // toward the child ids.
            let shift = (search_vec_loc - search_vec_start) << 2;
            let len = search_vec_end - search_vec_loc + 2;
            inner.page.copy_within(
                search_vec_loc as usize..(search_vec_loc + len) as usize,
                (search_vec_loc + shift) as usize,
            );
            inner.search_vec_start = search_vec_loc + shift;
            inner.search_vec_end = search_vec_end + shift;

            inner.garbage += garbage_accum;
        } else {
            // Split into a new right node. Keys are copied first; the
            // vector is then shifted into place and the child ids follow.
            new_key_loc = 0;
            let mut dest_loc = TN_HEADER_SIZE as i32;
            let mut new_search_vec_loc = new_page_len;
            let mut search_vec_loc = search_vec_end + 2;

            'copy_loop_right: loop {
                if search_vec_loc == key_loc {
                    new_search_vec_loc -= 2;
                    new_key_loc = new_search_vec_loc;
                    new_size += encoded_len + (2 + 8);
                }

                search_vec_loc -= 2;

                let mut entry_loc = u16le(&inner.page, search_vec_loc);
                let mut entry_len = key_length_at(&inner.page, entry_loc);

                let size_change = entry_len + (2 + 8);
                size -= size_change;
                new_size += size_change;

                'size_check: {
                    if size <= TN_HEADER_SIZE as i32 || new_size >= new_page_len {
                        search_vec_loc += 2;
                        if search_vec_loc == key_loc {
                            new_key_loc = 0;
                        }
                        new_search_vec_loc += 2;
                        entry_loc = u16le(&inner.page, search_vec_loc);
                        entry_len = key_length_at(&inner.page, entry_loc);
                        dest_loc -= entry_len;
                    } else {
                        garbage_accum += entry_len;
                        if new_size < size {
                            break 'size_check;
                        }
                    }

                    if new_key_loc != 0 {
                        let mut split = inner.new_split_right(&sibling, sib);
                        split.key = retrieve_key_at(&inner.page, entry_loc);
                        inner.split = Some(split);
                        break 'copy_loop_right;
                    }

                    if split_side == 1 {
                        split_side = -2;
                        continue 'do_split;
                    }

                    eyre::ensure!(split_side == 2, "internal split side state corrupt");
                }

                // Copy the key entry into the new node.
                sib.page[dest_loc as usize..(dest_loc + entry_len) as usize].copy_from_slice(
                    &inner.page[entry_loc as usize..(entry_loc + entry_len) as usize],
                );
                new_search_vec_loc -= 2;
                put_u16le(&mut sib.page, new_search_vec_loc, dest_loc);
                dest_loc += entry_len;
            }

            let entry_loc = dest_loc;

            // Center the new vector between the segments, leaving room for
            // the child ids after it.
            let new_vec_len = new_page_len - new_search_vec_loc;
            {
                let highest_loc = new_page_len - (5 * new_vec_len) - 8;
                let mid_loc = ((dest_loc + encoded_len + highest_loc + 1) >> 1) & !1;
                sib.page.copy_within(
                    new_search_vec_loc as usize..(new_search_vec_loc + new_vec_len) as usize,
                    mid_loc as usize,
                );
                new_key_loc -= new_search_vec_loc - mid_loc;
                new_search_vec_loc = mid_loc;
            }

            let new_search_vec_end = new_search_vec_loc + new_vec_len - 2;

            // Copy existing child ids and insert the new one.
            {
                let head_len = new_child_pos - ((search_vec_loc - search_vec_start + 2) << 2);
                let mut new_dest_loc = new_search_vec_end + 2;
                let src_base = search_vec_end + 2;
                sib.page[new_dest_loc as usize..(new_dest_loc + head_len) as usize]
                    .copy_from_slice(
                        &inner.page[(src_base + new_child_pos - head_len) as usize
                            ..(src_base + new_child_pos) as usize],
                    );

                new_dest_loc += head_len;
                put_child_id(&mut sib.page, new_dest_loc, new_child_id);

                let tail_len = ((search_vec_end - search_vec_start) << 2) + 16 - new_child_pos;
                sib.page[(new_dest_loc + 8) as usize..(new_dest_loc + 8 + tail_len) as usize]
                    .copy_from_slice(
                        &inner.page[(src_base + new_child_pos) as usize
                            ..(src_base + new_child_pos + tail_len) as usize],
                    );

                // Split the in-memory child table.
                let right_len = ((new_search_vec_end - new_search_vec_loc) >> 1) as usize + 2;
                let keep = inner.child_nodes.len() - right_len;
                sib.child_nodes = inner.child_nodes.split_off(keep);
            }

            // Write the new key into the right node.
            encode_key(key, &mut sib.page, entry_loc as usize);
            put_u16le(&mut sib.page, new_key_loc, entry_loc);

            sib.left_seg_tail = dest_loc + encoded_len;
            sib.right_seg_tail = new_page_len - 1;
            sib.search_vec_start = new_search_vec_loc;
            sib.search_vec_end = new_search_vec_end;

            // Prune the right end of this node by shifting its vector
            // toward the child ids.
            let len = search_vec_loc - search_vec_start;
            inner.page.copy_within(
                search_vec_start as usize..(search_vec_start + len) as usize,
                (search_vec_end + 2 - len) as usize,
            );
            inner.search_vec_start = search_vec_end + 2 - len;

            inner.garbage += garbage_accum;
        }

        break;
    }

    Ok(())
}

/// Inserts a split child's separator and new sibling into this parent
/// node. The parent and the split child are exclusively latched by the
/// caller; the child's split is consumed, its frames rebound, and the
/// parent's child table extended. May split the parent in turn.
pub(crate) fn insert_split_child_ref(
    cx: &TreeCx<'_>,
    parent_node: &Arc<Node>,
    parent: &mut NodeInner,
    key_pos: i32,
    child: &Arc<Node>,
    child_inner: &mut NodeInner,
) -> Result<()> {
    let split = child_inner
        .split
        .take()
        .ok_or_else(|| eyre::eyre!("child is not split"))?;

    let sibling = Arc::clone(&split.sibling);
    let mut sib_guard = sibling.inner.write_arc();

    rebind_split_frames(child, child_inner, &sibling, &mut sib_guard, &split);

    let mut new_child_pos = key_pos >> 1;
    if split.right {
        new_child_pos += 1;
    }

    // Parent frames above the split key shift right.
    for frame in parent_node.live_frames() {
        let mut state = frame.state.lock();
        if state.pos > key_pos {
            state.pos += 2;
        }
    }

    // Frames at the split key position live in one of the halves; those
    // over the right half move up with it.
    let right_node: &Arc<Node> = if split.right { &sibling } else { child };
    for child_frame in right_node.live_frames() {
        let state = child_frame.state.lock();
        if let Some(parent_frame) = &state.parent {
            parent_frame.state.lock().pos += 2;
        }
    }

    // Extend the in-memory child table before the page-level insert; the
    // split path relies on it being current.
    parent
        .child_nodes
        .insert(new_child_pos as usize, Some(Arc::clone(&sibling)));

    parent.create_internal_entry(
        cx,
        parent_node,
        key_pos,
        split.encoded_key_len(),
        new_child_pos << 3,
        Some(KeySrc::Plain(&split.key)),
        Some(sibling.id()),
        true,
    )?;

    drop(sib_guard);
    cx.db.make_evictable(&sibling);

    Ok(())
}

/// Completes a root split by reusing the root's page: the old root content
/// moves into a fresh dirty node, and the root is rewritten as a single-key
/// internal node over the two halves. Every cursor frame formerly bound to
/// the root gets a new parent frame bound to the new root at position 0 or
/// 2, reusing stub-bound parent frames when a stub is given.
pub(crate) fn finish_split_root(
    cx: &TreeCx<'_>,
    root: &Arc<Node>,
    inner: &mut NodeInner,
    stub: Option<&Arc<Node>>,
) -> Result<()> {
    let (child, mut child_guard) = cx.db.alloc_dirty_node(cx.tree)?;

    log::debug!("root split: tree {} grows a level", cx.tree.id());

    {
        let child_inner = &mut *child_guard;

        // Swap the root's page and state into the child.
        std::mem::swap(&mut child_inner.page, &mut inner.page);
        child_inner.typ = inner.typ;
        child_inner.garbage = inner.garbage;
        child_inner.left_seg_tail = inner.left_seg_tail;
        child_inner.right_seg_tail = inner.right_seg_tail;
        child_inner.search_vec_start = inner.search_vec_start;
        child_inner.search_vec_end = inner.search_vec_end;
        child_inner.child_nodes = std::mem::take(&mut inner.child_nodes);
        root.transfer_frames_to(&child);

        // Re-home the moved cursor frames.
        for frame in child.live_frames() {
            frame.state.lock().node = Some(Arc::clone(&child));
        }
    }

    let split = inner
        .split
        .take()
        .ok_or_else(|| eyre::eyre!("root is not split"))?;
    let sibling = Arc::clone(&split.sibling);
    let mut sib_guard = sibling.inner.write_arc();

    rebind_split_frames(&child, &mut child_guard, &sibling, &mut sib_guard, &split);

    let (left, right) = if split.right {
        (Arc::clone(&child), Arc::clone(&sibling))
    } else {
        (Arc::clone(&sibling), Arc::clone(&child))
    };

    let new_page_len = inner.page.len() as i32;
    let left_seg_tail = encode_key(&split.key, &mut inner.page, TN_HEADER_SIZE) as i32;

    // Single-entry search vector, centered the way compact_internal
    // centers it.
    let search_vec_start =
        new_page_len - (((new_page_len - left_seg_tail + (2 + 8 + 8)) >> 1) & !1);
    put_u16le(&mut inner.page, search_vec_start, TN_HEADER_SIZE as i32);
    put_child_id(&mut inner.page, search_vec_start + 2, left.id());
    put_child_id(&mut inner.page, search_vec_start + 2 + 8, right.id());

    let child_is_leaf = child_guard.is_leaf();
    inner.child_nodes = vec![Some(Arc::clone(&left)), Some(Arc::clone(&right))];
    inner.typ = if child_is_leaf {
        TYPE_TN_BIN | LOW_EXTREMITY | HIGH_EXTREMITY
    } else {
        TYPE_TN_IN | LOW_EXTREMITY | HIGH_EXTREMITY
    };
    inner.garbage = 0;
    inner.left_seg_tail = left_seg_tail;
    inner.right_seg_tail = new_page_len - 1;
    inner.search_vec_start = search_vec_start;
    inner.search_vec_end = search_vec_start;

    // Add a parent frame on the new root for every cursor in both halves.
    for (target, pos) in [(&left, 0i32), (&right, 2i32)] {
        for frame in target.live_frames() {
            let existing = frame.state.lock().parent.clone();
            let parent_frame = match existing {
                None => Arc::new(CursorFrame::new()),
                Some(pf) => {
                    let bound_to_stub = match (&pf.state.lock().node, stub) {
                        (Some(n), Some(stub_node)) => Arc::ptr_eq(n, stub_node),
                        _ => false,
                    };
                    if !bound_to_stub {
                        return Err(cx.db.poison("stub mismatch in root split"));
                    }
                    pf.unbind();
                    pf
                }
            };
            parent_frame.bind(root, pos);
            frame.state.lock().parent = Some(parent_frame);
        }
    }

    drop(child_guard);
    drop(sib_guard);
    cx.db.make_evictable(&sibling);

    Ok(())
}
