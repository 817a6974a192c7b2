//! # Rebalancing
//!
//! Before a full node splits, these routines try to move entries into a
//! sibling. Everything here is strictly non-blocking: the parent and the
//! sibling are try-latched through a bound cursor's parent frame, and any
//! contention, stale binding, mismatched dirty generation, or lack of room
//! makes the attempt fail cleanly so the caller falls back to splitting.
//!
//! Moving leaf entries changes the parent's separator key, which is
//! recomputed as a mid key over the new boundary. Moving internal entries
//! rotates through the parent: the boundary key of the donor becomes the
//! new separator and the old separator drops into the receiving sibling.
//!
//! Cursor frames bound to the donor whose positions fall inside the moved
//! region are rebound to the sibling before any latch is released; their
//! parent-frame positions shift by one child either way. Not-found frames
//! near the boundary additionally compare their remembered key against the
//! new separator, because the separator itself moved.

use std::sync::Arc;

use super::edit::{KeySrc, LeafLoc};
use super::entry::*;
use super::{u16le, Node, NodeInner, TreeCx};
use crate::cursor::CursorFrame;
use crate::encoding::compare_keys;

/// Attempts to move leading entries of this leaf into the left sibling.
/// Returns the 2-based position decrement applied to this node, or 0 when
/// the attempt failed. `pos` itself cannot move left.
pub(crate) fn try_rebalance_leaf_left(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    parent_frame: &Arc<CursorFrame>,
    pos: i32,
    min_amount: i32,
) -> i32 {
    let mut move_amount = 0;
    let last_search_vec_loc;

    {
        let mut search_vec_loc = inner.search_vec_start;
        let search_vec_end = search_vec_loc + pos - 2;

        // The last entry is never examined; at least one must remain.
        loop {
            if search_vec_loc >= search_vec_end {
                return 0;
            }
            let entry_loc = u16le(&inner.page, search_vec_loc);
            move_amount += leaf_entry_length_at(&inner.page, entry_loc) + 2;
            if move_amount >= min_amount {
                last_search_vec_loc = search_vec_loc + 2; // exclusive
                break;
            }
            search_vec_loc += 2;
        }
    }

    let Some((_parent_node, mut parent)) = parent_frame.try_acquire_exclusive() else {
        return 0;
    };

    let child_pos = parent_frame.state.lock().pos;
    if child_pos <= 0
        || parent.split.is_some()
        || parent.cached_state != inner.cached_state
        || !parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .and_then(|c| c.as_ref())
            .is_some_and(|c| Arc::ptr_eq(c, node))
    {
        return 0;
    }

    let Ok(Some((left_node, mut left))) =
        cx.db.try_latch_child_not_split(cx, &mut parent, child_pos - 2)
    else {
        return 0;
    };

    // Latches are not released on unexpected errors from here on; leaving
    // them held keeps half-applied state from being persisted.

    let new_key;
    let new_key_len;
    let parent_key_loc;
    let parent_key_growth;

    {
        let left_avail = left.available_leaf_bytes();
        if left_avail < move_amount {
            return 0;
        }
        // The parent separator will be replaced; verify it has room.
        let high_pos = last_search_vec_loc - inner.search_vec_start;
        new_key = crate::encoding::mid_key(
            &inner.retrieve_key(high_pos - 2),
            &inner.retrieve_key(high_pos),
        );
        new_key_len = calculate_key_length(&new_key);
        parent_key_loc = u16le(&parent.page, parent.search_vec_start + child_pos - 2);
        parent_key_growth = new_key_len - key_length_at(&parent.page, parent_key_loc);
        if parent_key_growth > 0 && parent_key_growth > parent.available_internal_bytes() {
            return 0;
        }
    }

    match cx.db.mark_dirty(cx.tree, &left_node, &mut left) {
        Ok(true) => parent.update_child_ref_id(child_pos - 2, left_node.id()),
        Ok(false) => {}
        Err(_) => return 0,
    }

    log::trace!("leaf rebalance left: node {} moves {} bytes", node.id(), move_amount);

    // Update the parent separator.
    if parent_key_growth <= 0 {
        encode_key(&new_key, &mut parent.page, parent_key_loc as usize);
        parent.garbage -= parent_key_growth;
    } else if parent
        .update_internal_key(cx, child_pos - 2, parent_key_growth, &encode_owned(&new_key))
        .is_err()
    {
        return 0;
    }

    let mut garbage_accum = 0;
    let mut search_vec_loc = inner.search_vec_start;
    let last_pos = last_search_vec_loc - search_vec_loc;

    while search_vec_loc < last_search_vec_loc {
        let entry_loc = u16le(&inner.page, search_vec_loc);
        let encoded_len = leaf_entry_length_at(&inner.page, entry_loc);
        let target = left.highest_key_pos() + 2;
        let Ok(LeafLoc::Loc(left_entry_loc)) =
            left.create_leaf_entry(cx, &left_node, target, encoded_len)
        else {
            // The sibling had verified room; this cannot fail.
            std::mem::forget(left);
            std::mem::forget(parent);
            let _ = cx.db.poison("leaf rebalance overflow");
            return 0;
        };
        left.page[left_entry_loc as usize..(left_entry_loc + encoded_len) as usize]
            .copy_from_slice(&inner.page[entry_loc as usize..(entry_loc + encoded_len) as usize]);
        garbage_accum += encoded_len;
        search_vec_loc += 2;
    }

    inner.garbage += garbage_accum;
    inner.search_vec_start = last_search_vec_loc;

    // Rebind or shift the cursor frames. Not-found frames at the boundary
    // must be compared against the new separator, because a fresh search
    // could now land them just past the left node's high position.
    let left_end_pos = left.highest_key_pos() + 2;
    for frame in node.live_frames() {
        let mut state = frame.state.lock();
        let frame_pos = state.pos;
        let mask = frame_pos >> 31;
        let new_pos = (frame_pos ^ mask) - last_pos;
        let moves = new_pos < 0
            || (new_pos == 0
                && mask != 0
                && state
                    .not_found_key
                    .as_ref()
                    .is_some_and(|k| compare_keys(k, &new_key).is_lt()));
        if moves {
            state.pos = (left_end_pos + new_pos) ^ mask;
            if let Some(pf) = state.parent.clone() {
                pf.state.lock().pos -= 2;
            }
            drop(state);
            frame.move_binding(node, &left_node);
        } else {
            state.pos = new_pos ^ mask;
        }
    }

    drop(left);
    drop(parent);

    last_pos
}

/// Attempts to move trailing entries of this leaf into the right sibling.
/// Returns false when the attempt failed. `pos` itself cannot move right.
pub(crate) fn try_rebalance_leaf_right(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    parent_frame: &Arc<CursorFrame>,
    pos: i32,
    min_amount: i32,
) -> bool {
    let mut move_amount = 0;
    let first_search_vec_loc;

    {
        let search_vec_start = inner.search_vec_start + pos;
        let mut search_vec_loc = inner.search_vec_end;

        // The first entry is never examined; at least one must remain.
        loop {
            if search_vec_loc <= search_vec_start {
                return false;
            }
            let entry_loc = u16le(&inner.page, search_vec_loc);
            move_amount += leaf_entry_length_at(&inner.page, entry_loc) + 2;
            if move_amount >= min_amount {
                first_search_vec_loc = search_vec_loc;
                break;
            }
            search_vec_loc -= 2;
        }
    }

    let Some((_parent_node, mut parent)) = parent_frame.try_acquire_exclusive() else {
        return false;
    };

    let child_pos = parent_frame.state.lock().pos;
    if child_pos >= parent.highest_internal_pos()
        || parent.split.is_some()
        || parent.cached_state != inner.cached_state
        || !parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .and_then(|c| c.as_ref())
            .is_some_and(|c| Arc::ptr_eq(c, node))
    {
        return false;
    }

    let Ok(Some((right_node, mut right))) =
        cx.db.try_latch_child_not_split(cx, &mut parent, child_pos + 2)
    else {
        return false;
    };

    let new_key;
    let new_key_len;
    let parent_key_loc;
    let parent_key_growth;

    {
        let right_avail = right.available_leaf_bytes();
        if right_avail < move_amount {
            return false;
        }
        let high_pos = first_search_vec_loc - inner.search_vec_start;
        new_key = crate::encoding::mid_key(
            &inner.retrieve_key(high_pos - 2),
            &inner.retrieve_key(high_pos),
        );
        new_key_len = calculate_key_length(&new_key);
        parent_key_loc = u16le(&parent.page, parent.search_vec_start + child_pos);
        parent_key_growth = new_key_len - key_length_at(&parent.page, parent_key_loc);
        if parent_key_growth > 0 && parent_key_growth > parent.available_internal_bytes() {
            return false;
        }
    }

    match cx.db.mark_dirty(cx.tree, &right_node, &mut right) {
        Ok(true) => parent.update_child_ref_id(child_pos + 2, right_node.id()),
        Ok(false) => {}
        Err(_) => return false,
    }

    log::trace!("leaf rebalance right: node {} moves {} bytes", node.id(), move_amount);

    if parent_key_growth <= 0 {
        encode_key(&new_key, &mut parent.page, parent_key_loc as usize);
        parent.garbage -= parent_key_growth;
    } else if parent
        .update_internal_key(cx, child_pos, parent_key_growth, &encode_owned(&new_key))
        .is_err()
    {
        return false;
    }

    let mut garbage_accum = 0;
    let mut search_vec_loc = inner.search_vec_end;
    let moved = search_vec_loc - first_search_vec_loc + 2;

    while search_vec_loc >= first_search_vec_loc {
        let entry_loc = u16le(&inner.page, search_vec_loc);
        let encoded_len = leaf_entry_length_at(&inner.page, entry_loc);
        let Ok(LeafLoc::Loc(right_entry_loc)) =
            right.create_leaf_entry(cx, &right_node, 0, encoded_len)
        else {
            std::mem::forget(right);
            std::mem::forget(parent);
            let _ = cx.db.poison("leaf rebalance overflow");
            return false;
        };
        right.page[right_entry_loc as usize..(right_entry_loc + encoded_len) as usize]
            .copy_from_slice(&inner.page[entry_loc as usize..(entry_loc + encoded_len) as usize]);
        garbage_accum += encoded_len;
        search_vec_loc -= 2;
    }

    inner.garbage += garbage_accum;
    inner.search_vec_end = first_search_vec_loc - 2;

    // Shift the frames already in the right node.
    for frame in right_node.live_frames() {
        let mut state = frame.state.lock();
        let frame_pos = state.pos;
        let mask = frame_pos >> 31;
        state.pos = ((frame_pos ^ mask) + moved) ^ mask;
    }

    // Move affected frames out of this node. Frame positions past the
    // pending insert already carry its +2 shift, while the boundary below
    // is in pre-insert coordinates, so those positions step back first.
    // Not-found frames exactly at the boundary stay unless a fresh search
    // would land them in the right node under the new separator.
    let left_end_pos = first_search_vec_loc - inner.search_vec_start;
    for frame in node.live_frames() {
        let mut state = frame.state.lock();
        let frame_pos = state.pos;
        let mask = frame_pos >> 31;
        let mut fpos = frame_pos ^ mask;
        if fpos > pos {
            fpos -= 2;
        }
        let new_pos = fpos - left_end_pos;
        let moves = new_pos >= 0
            && ((new_pos != 0 || mask == 0)
                || state
                    .not_found_key
                    .as_ref()
                    .is_some_and(|k| compare_keys(k, &new_key).is_ge()));
        if moves {
            state.pos = new_pos ^ mask;
            if let Some(pf) = state.parent.clone() {
                pf.state.lock().pos += 2;
            }
            drop(state);
            frame.move_binding(node, &right_node);
        }
    }

    drop(right);
    drop(parent);

    true
}

fn encode_owned(key: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; calculate_key_length(key) as usize];
    encode_key(key, &mut out, 0);
    out
}

/// Attempts to move leading entries of this internal node into the left
/// sibling, rotating the boundary key through the parent. Returns the
/// 2-based position decrement, or 0 on failure.
pub(crate) fn try_rebalance_internal_left(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    parent_frame: &Arc<CursorFrame>,
    key_pos: i32,
    min_amount: i32,
) -> crate::error::Result<i32> {
    let Some((parent_node, mut parent)) = parent_frame.try_acquire_exclusive() else {
        return Ok(0);
    };
    let _keep = parent_node;

    let child_pos = parent_frame.state.lock().pos;
    if child_pos <= 0
        || parent.split.is_some()
        || parent.cached_state != inner.cached_state
        || !parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .and_then(|c| c.as_ref())
            .is_some_and(|c| Arc::ptr_eq(c, node))
    {
        return Ok(0);
    }

    let mut right_shrink = 0;
    let mut left_growth = 0;
    let last_search_vec_loc;

    {
        let mut search_vec_loc = inner.search_vec_start;
        let search_vec_end = search_vec_loc + key_pos - 2;

        // The last entry is never examined; at least one must remain.
        loop {
            if search_vec_loc >= search_vec_end {
                return Ok(0);
            }
            let key_loc = u16le(&inner.page, search_vec_loc);
            let len = key_length_at(&inner.page, key_loc) + (2 + 8);

            right_shrink += len;
            left_growth += len;

            if right_shrink >= min_amount {
                last_search_vec_loc = search_vec_loc;

                // The leftmost key to move comes from the parent, and the
                // first moved key does not grow the left node.
                left_growth -= len;
                let pk_loc = u16le(&parent.page, parent.search_vec_start + child_pos - 2);
                left_growth += key_length_at(&parent.page, pk_loc) + (2 + 8);
                break;
            }
            search_vec_loc += 2;
        }
    }

    let Some((left_node, mut left)) =
        cx.db.try_latch_child_not_split(cx, &mut parent, child_pos - 2)?
    else {
        return Ok(0);
    };

    // Latches are not released on unexpected errors from here on.

    let search_key_loc;
    let search_key_len;
    let parent_key_loc;
    let parent_key_len;
    let parent_key_growth;

    {
        if left.available_internal_bytes() < left_growth {
            return Ok(0);
        }
        search_key_loc = u16le(&inner.page, last_search_vec_loc);
        search_key_len = key_length_at(&inner.page, search_key_loc);
        parent_key_loc = u16le(&parent.page, parent.search_vec_start + child_pos - 2);
        parent_key_len = key_length_at(&parent.page, parent_key_loc);
        parent_key_growth = search_key_len - parent_key_len;
        if parent_key_growth > 0 && parent_key_growth > parent.available_internal_bytes() {
            return Ok(0);
        }
    }

    match cx.db.mark_dirty(cx.tree, &left_node, &mut left) {
        Ok(true) => parent.update_child_ref_id(child_pos - 2, left_node.id()),
        Ok(false) => {}
        Err(_) => return Ok(0),
    }

    log::trace!("internal rebalance left: node {}", node.id());

    let mut garbage_accum = search_key_len;
    let mut search_vec_loc = inner.search_vec_start;
    let moved = last_search_vec_loc - search_vec_loc + 2;

    // The leftmost key to move comes from the parent.
    {
        let pos = left.highest_internal_pos();
        let parent_key =
            parent.page[parent_key_loc as usize..(parent_key_loc + parent_key_len) as usize]
                .to_vec();
        left.create_internal_entry(
            cx,
            &left_node,
            pos,
            parent_key_len,
            (pos + 2) << 2,
            Some(KeySrc::Encoded(&parent_key)),
            None,
            false,
        )?;
    }

    // Remaining keys come from this node.
    while search_vec_loc < last_search_vec_loc {
        let key_loc = u16le(&inner.page, search_vec_loc);
        let encoded_len = key_length_at(&inner.page, key_loc);
        let pos = left.highest_internal_pos();
        let key = inner.page[key_loc as usize..(key_loc + encoded_len) as usize].to_vec();
        left.create_internal_entry(
            cx,
            &left_node,
            pos,
            encoded_len,
            (pos + 2) << 2,
            Some(KeySrc::Encoded(&key)),
            None,
            false,
        )?;
        garbage_accum += encoded_len;
        search_vec_loc += 2;
    }

    // Move the promoted boundary key into the parent.
    if parent_key_growth <= 0 {
        let key =
            inner.page[search_key_loc as usize..(search_key_loc + search_key_len) as usize]
                .to_vec();
        parent.page[parent_key_loc as usize..parent_key_loc as usize + key.len()]
            .copy_from_slice(&key);
        parent.garbage -= parent_key_growth;
    } else {
        let key =
            inner.page[search_key_loc as usize..(search_key_loc + search_key_len) as usize]
                .to_vec();
        parent.update_internal_key(cx, child_pos - 2, parent_key_growth, &key)?;
    }

    // Move the encoded child pointers into the gaps created above.
    {
        let start = inner.search_vec_end + 2;
        let len = moved << 2;
        let mut end = left.search_vec_end;
        end = end + ((end - left.search_vec_start) << 2) + (2 + 16) - len;
        let ids = inner.page[start as usize..(start + len) as usize].to_vec();
        left.page[end as usize..(end + len) as usize].copy_from_slice(&ids);
        let tail = (start - last_search_vec_loc) << 2;
        inner.page.copy_within(
            (start + len) as usize..(start + len + tail) as usize,
            start as usize,
        );
    }

    inner.garbage += garbage_accum;
    inner.search_vec_start = last_search_vec_loc + 2;

    // Move the child-node table entries.
    {
        let take = (moved >> 1) as usize;
        let moved_children: Vec<_> = inner.child_nodes.drain(..take).collect();
        left.child_nodes.extend(moved_children);
    }

    // Rebind or shift cursor frames.
    let left_end_pos = left.highest_internal_pos() + 2;
    for frame in node.live_frames() {
        let mut state = frame.state.lock();
        let new_pos = state.pos - moved;
        if new_pos < 0 {
            state.pos = left_end_pos + new_pos;
            if let Some(pf) = state.parent.clone() {
                pf.state.lock().pos -= 2;
            }
            drop(state);
            frame.move_binding(node, &left_node);
        } else {
            state.pos = new_pos;
        }
    }

    Ok(moved)
}

/// Attempts to move trailing entries of this internal node into the right
/// sibling, rotating the boundary key through the parent.
pub(crate) fn try_rebalance_internal_right(
    cx: &TreeCx<'_>,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    parent_frame: &Arc<CursorFrame>,
    key_pos: i32,
    min_amount: i32,
) -> crate::error::Result<bool> {
    let Some((parent_node, mut parent)) = parent_frame.try_acquire_exclusive() else {
        return Ok(false);
    };
    let _keep = parent_node;

    let child_pos = parent_frame.state.lock().pos;
    if child_pos >= parent.highest_internal_pos()
        || parent.split.is_some()
        || parent.cached_state != inner.cached_state
        || !parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .and_then(|c| c.as_ref())
            .is_some_and(|c| Arc::ptr_eq(c, node))
    {
        return Ok(false);
    }

    let mut left_shrink = 0;
    let mut right_growth = 0;
    let first_search_vec_loc;

    {
        let search_vec_start = inner.search_vec_start + key_pos;
        let mut search_vec_loc = inner.search_vec_end;

        // The first entry is never examined; at least one must remain.
        loop {
            if search_vec_loc <= search_vec_start {
                return Ok(false);
            }
            let key_loc = u16le(&inner.page, search_vec_loc);
            let len = key_length_at(&inner.page, key_loc) + (2 + 8);

            left_shrink += len;
            right_growth += len;

            if left_shrink >= min_amount {
                first_search_vec_loc = search_vec_loc;

                // The rightmost key to move comes from the parent, and the
                // first moved key does not grow the right node.
                right_growth -= len;
                let pk_loc = u16le(&parent.page, parent.search_vec_start + child_pos);
                right_growth += key_length_at(&parent.page, pk_loc) + (2 + 8);
                break;
            }
            search_vec_loc -= 2;
        }
    }

    let Some((right_node, mut right)) =
        cx.db.try_latch_child_not_split(cx, &mut parent, child_pos + 2)?
    else {
        return Ok(false);
    };

    let search_key_loc;
    let search_key_len;
    let parent_key_loc;
    let parent_key_len;
    let parent_key_growth;

    {
        if right.available_internal_bytes() < right_growth {
            return Ok(false);
        }
        search_key_loc = u16le(&inner.page, first_search_vec_loc);
        search_key_len = key_length_at(&inner.page, search_key_loc);
        parent_key_loc = u16le(&parent.page, parent.search_vec_start + child_pos);
        parent_key_len = key_length_at(&parent.page, parent_key_loc);
        parent_key_growth = search_key_len - parent_key_len;
        if parent_key_growth > 0 && parent_key_growth > parent.available_internal_bytes() {
            return Ok(false);
        }
    }

    match cx.db.mark_dirty(cx.tree, &right_node, &mut right) {
        Ok(true) => parent.update_child_ref_id(child_pos + 2, right_node.id()),
        Ok(false) => {}
        Err(_) => return Ok(false),
    }

    log::trace!("internal rebalance right: node {}", node.id());

    let mut garbage_accum = search_key_len;
    let mut search_vec_loc = inner.search_vec_end;
    let moved = search_vec_loc - first_search_vec_loc + 2;

    // The rightmost key to move comes from the parent.
    {
        let parent_key =
            parent.page[parent_key_loc as usize..(parent_key_loc + parent_key_len) as usize]
                .to_vec();
        right.create_internal_entry(
            cx,
            &right_node,
            0,
            parent_key_len,
            0,
            Some(KeySrc::Encoded(&parent_key)),
            None,
            false,
        )?;
    }

    // Remaining keys come from this node.
    while search_vec_loc > first_search_vec_loc {
        let key_loc = u16le(&inner.page, search_vec_loc);
        let encoded_len = key_length_at(&inner.page, key_loc);
        let key = inner.page[key_loc as usize..(key_loc + encoded_len) as usize].to_vec();
        right.create_internal_entry(
            cx,
            &right_node,
            0,
            encoded_len,
            0,
            Some(KeySrc::Encoded(&key)),
            None,
            false,
        )?;
        garbage_accum += encoded_len;
        search_vec_loc -= 2;
    }

    // Move the promoted boundary key into the parent.
    {
        let key =
            inner.page[search_key_loc as usize..(search_key_loc + search_key_len) as usize]
                .to_vec();
        if parent_key_growth <= 0 {
            parent.page[parent_key_loc as usize..parent_key_loc as usize + key.len()]
                .copy_from_slice(&key);
            parent.garbage -= parent_key_growth;
        } else {
            parent.update_internal_key(cx, child_pos, parent_key_growth, &key)?;
        }
    }

    // Move the encoded child pointers.
    {
        let start = inner.search_vec_end + 2;
        let len = ((start - inner.search_vec_start) << 2) + 8 - (moved << 2);
        let src = (start + len) as usize;
        let ids = inner.page[src..src + (moved << 2) as usize].to_vec();
        inner
            .page
            .copy_within(start as usize..(start + len) as usize, (start - moved) as usize);
        let dst = (right.search_vec_end + 2) as usize;
        right.page[dst..dst + ids.len()].copy_from_slice(&ids);
    }

    inner.garbage += garbage_accum;
    inner.search_vec_end = first_search_vec_loc - 2;

    // Move the child-node table entries.
    {
        let keep = inner.child_nodes.len() - (moved >> 1) as usize;
        let moved_children = inner.child_nodes.split_off(keep);
        right.child_nodes.splice(0..0, moved_children);
    }

    // Shift the frames already in the right node.
    for frame in right_node.live_frames() {
        let mut state = frame.state.lock();
        state.pos += moved;
    }

    // Move affected frames out of this node. The children that moved start
    // at the position just past the promoted key's left child; positions
    // past the pending insert already carry its +2 shift and step back
    // first, since the boundary is in pre-insert coordinates.
    let adjust = first_search_vec_loc - inner.search_vec_start + 2;
    for frame in node.live_frames() {
        let mut state = frame.state.lock();
        let mut fpos = state.pos;
        if fpos > key_pos {
            fpos -= 2;
        }
        let new_pos = fpos - adjust;
        if new_pos >= 0 {
            state.pos = new_pos;
            if let Some(pf) = state.parent.clone() {
                pf.state.lock().pos += 2;
            }
            drop(state);
            frame.move_binding(node, &right_node);
        }
    }

    Ok(true)
}
