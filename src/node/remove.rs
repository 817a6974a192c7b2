//! # Deletion, Ghosting, and Merging
//!
//! A transactional delete does not remove the entry: the value header is
//! overwritten with the ghost sentinel and the pre-image goes to the undo
//! log, so the delete stays invisible to other transactions (which block on
//! the row lock) and reversible until commit. The lock manager calls back
//! at commit time to physically delete ghosted entries while the exclusive
//! lock is still held.
//!
//! Physical removal (`delete_leaf_entry`) shifts the shorter half of the
//! search vector and accounts the entry as garbage. Removing a separator
//! from an internal node also drops the adjacent child id, choosing
//! whichever of the two shift strategies moves fewer bytes.
//!
//! Merges move every entry of a right node into the tail of its left
//! sibling and delete the right node; the root collapses by swapping the
//! lone child's content into the root object and repurposing the orphan as
//! a stub that keeps stale cursor frames coherent.

use std::sync::Arc;

use super::edit::{KeySrc, LeafLoc};
use super::entry::*;
use super::{child_id_at, put_child_id, u16le, Node, NodeInner, TreeCx, HIGH_EXTREMITY};
use crate::config::STUB_ID;
use crate::error::Result;
use crate::txn::{Transaction, UndoOp};

impl NodeInner {
    /// Transactionally deletes the leaf entry at `pos` by replacing its
    /// value with a ghost. The caller holds the commit latch shared and
    /// this node's exclusive latch, and owns the key's exclusive lock.
    pub(crate) fn txn_delete_leaf_entry(
        &mut self,
        cx: &TreeCx<'_>,
        txn: &mut Transaction,
        key: &[u8],
        pos: i32,
    ) -> Result<()> {
        let entry_loc = self.entry_loc(pos);
        let value_header_loc = skip_key_at(&self.page, entry_loc as usize) as i32;
        let mut loc = value_header_loc + 1;

        let header = self.page[value_header_loc as usize];
        'do_undo: {
            if header & 0x80 == 0 {
                // Short value.
                loc += header as i32;
            } else {
                if header & 0x20 == 0 {
                    loc += 1 + (((header as i32 & 0x1f) << 8) | self.page[loc as usize] as i32);
                } else if header != GHOST_HEADER {
                    loc += 2
                        + (((header as i32 & 0x0f) << 16)
                            | ((self.page[loc as usize] as i32) << 8)
                            | self.page[loc as usize + 1] as i32);
                } else {
                    // Already a ghost; nothing to undo.
                    break 'do_undo;
                }

                if header & VALUE_FRAGMENTED != 0 {
                    // The backing pages are reclaimed when the transaction
                    // commits.
                    let value_start =
                        value_header_loc + 2 + ((header as i32 & 0x20) >> 5);
                    let desc =
                        self.page[value_start as usize..loc as usize].to_vec();
                    txn.trash_fragmented(cx.tree.id(), key, desc);
                }
            }

            // Record the whole entry so rollback can restore it.
            txn.undo_store(
                cx.tree.id(),
                UndoOp::Insert,
                &self.page[entry_loc as usize..loc as usize],
            )?;
        }

        // The ghost is deleted when the lock is finally released.
        cx.db.lock_manager().ghosted(txn.locker(), cx.tree, key);

        self.page[value_header_loc as usize] = GHOST_HEADER;
        self.garbage += loc - value_header_loc - 1;

        txn.redo_delete(cx.tree.id(), key);
        Ok(())
    }

    /// Copies the existing entry to the undo log before an update
    /// overwrites it. Fragmented values move to the trash and have their
    /// fragmented bit cleared so the slot can be reused.
    pub(crate) fn txn_pre_update_leaf_entry(
        &mut self,
        cx: &TreeCx<'_>,
        txn: &mut Transaction,
        key: &[u8],
        pos: i32,
    ) -> Result<()> {
        let entry_loc = self.entry_loc(pos);
        let value_header_loc = skip_key_at(&self.page, entry_loc as usize) as i32;
        let mut loc = value_header_loc + 1;

        let header = self.page[value_header_loc as usize];
        if header & 0x80 == 0 {
            loc += header as i32;
        } else {
            if header & 0x20 == 0 {
                loc += 1 + (((header as i32 & 0x1f) << 8) | self.page[loc as usize] as i32);
            } else if header != GHOST_HEADER {
                loc += 2
                    + (((header as i32 & 0x0f) << 16)
                        | ((self.page[loc as usize] as i32) << 8)
                        | self.page[loc as usize + 1] as i32);
            } else {
                // Ghost; nothing to undo.
                return Ok(());
            }

            if header & VALUE_FRAGMENTED != 0 {
                let value_start = value_header_loc + 2 + ((header as i32 & 0x20) >> 5);
                let desc = self.page[value_start as usize..loc as usize].to_vec();
                txn.trash_fragmented(cx.tree.id(), key, desc);
                txn.undo_store(
                    cx.tree.id(),
                    UndoOp::Update,
                    &self.page[entry_loc as usize..loc as usize],
                )?;
                // Clearing the bit keeps the update from double-deleting
                // the fragments and lets the slot be reused.
                self.page[value_header_loc as usize] = header & !VALUE_FRAGMENTED;
                return Ok(());
            }
        }

        txn.undo_store(
            cx.tree.id(),
            UndoOp::Update,
            &self.page[entry_loc as usize..loc as usize],
        )
    }

    /// Physically removes the leaf entry at `pos`, shifting the shorter
    /// half of the search vector. Fragmented values release their backing
    /// pages immediately.
    pub(crate) fn delete_leaf_entry(
        &mut self,
        cx: &TreeCx<'_>,
        node: &Node,
        pos: i32,
    ) -> Result<()> {
        let search_vec_start = self.search_vec_start;
        let entry_loc = u16le(&self.page, search_vec_start + pos);

        let (key_len, key_start) = decode_key_at(&self.page, entry_loc as usize);
        let deleted_key = self.page[key_start..key_start + key_len].to_vec();

        let mut loc = (key_start + key_len) as i32;
        let header = self.page[loc as usize];
        loc += 1;
        if header & 0x80 == 0 {
            loc += header as i32;
        } else if header & 0x20 == 0 {
            let len = 1 + (((header as i32 & 0x1f) << 8) | self.page[loc as usize] as i32);
            loc += 1;
            if header & VALUE_FRAGMENTED != 0 {
                let desc = self.page[loc as usize..(loc + len) as usize].to_vec();
                cx.db.delete_fragments(&desc)?;
            }
            loc += len;
        } else if header != GHOST_HEADER {
            let len = 1
                + (((header as i32 & 0x0f) << 16)
                    | ((self.page[loc as usize] as i32) << 8)
                    | self.page[loc as usize + 1] as i32);
            loc += 2;
            if header & VALUE_FRAGMENTED != 0 {
                let desc = self.page[loc as usize..(loc + len) as usize].to_vec();
                cx.db.delete_fragments(&desc)?;
            }
            loc += len;
        }

        // The whole encoded entry becomes garbage.
        self.garbage += loc - entry_loc;

        let search_vec_end = self.search_vec_end;

        if pos < ((search_vec_end - search_vec_start + 2) >> 1) {
            // Shift the left side of the vector to the right.
            self.page.copy_within(
                search_vec_start as usize..(search_vec_start + pos) as usize,
                (search_vec_start + 2) as usize,
            );
            self.search_vec_start = search_vec_start + 2;
        } else {
            // Shift the right side of the vector to the left.
            let abs = pos + search_vec_start;
            self.page.copy_within(
                (abs + 2) as usize..(search_vec_end + 2) as usize,
                abs as usize,
            );
            self.search_vec_end = search_vec_end - 2;
        }

        node.adjust_frames_for_delete(pos, &deleted_key);
        Ok(())
    }

    /// Removes the separator key and adjacent child id for a merged-away
    /// child. `child_pos` is the 2-based child position.
    pub(crate) fn delete_child_ref(&mut self, node: &Node, mut child_pos: i32) {
        // Fix affected cursor frames first.
        for frame in node.live_frames() {
            let mut state = frame.state.lock();
            if state.pos >= child_pos {
                state.pos -= 2;
            }
        }

        let key_pos = if child_pos == 0 { 0 } else { child_pos - 2 };
        let mut search_vec_start = self.search_vec_start;

        let entry_loc = u16le(&self.page, search_vec_start + key_pos);
        self.garbage += key_length_at(&self.page, entry_loc);

        self.child_nodes.remove((child_pos >> 1) as usize);
        child_pos <<= 2; // rescale to the 8-byte id array

        let search_vec_end = self.search_vec_end;

        // Remove one vector entry (2 bytes) and one child id (8 bytes),
        // shifting whichever side moves less.
        if child_pos < (3 * (search_vec_end - search_vec_start) + key_pos + 8) >> 1 {
            // Shift preceding child ids right by 8, vector right by 10.
            self.page.copy_within(
                (search_vec_start + key_pos + 2) as usize
                    ..(search_vec_end + 2 + child_pos) as usize,
                (search_vec_start + key_pos + 2 + 8) as usize,
            );
            self.page.copy_within(
                search_vec_start as usize..(search_vec_start + key_pos) as usize,
                (search_vec_start + 10) as usize,
            );
            search_vec_start += 10;
            self.search_vec_end = search_vec_end + 8;
        } else {
            // Shift following child ids left by 8, vector right by 2.
            let src = search_vec_end + child_pos + 2 + 8;
            let len = ((search_vec_end - search_vec_start) << 2) + 8 - child_pos;
            self.page.copy_within(
                src as usize..(src + len) as usize,
                (search_vec_end + child_pos + 2) as usize,
            );
            self.page.copy_within(
                search_vec_start as usize..(search_vec_start + key_pos) as usize,
                (search_vec_start + 2) as usize,
            );
            search_vec_start += 2;
        }

        self.search_vec_start = search_vec_start;
    }
}

/// Moves all entries of `right` into the tail of `left` and deletes the
/// right node. Caller guarantees room and holds exclusive latches on both;
/// the right node object is reclaimed.
pub(crate) fn move_leaf_to_left_and_delete(
    cx: &TreeCx<'_>,
    left_node: &Arc<Node>,
    left: &mut NodeInner,
    right_node: &Arc<Node>,
    right: &mut NodeInner,
) -> Result<()> {
    cx.db.prepare_to_delete(right_node, right)?;

    let search_vec_end = right.search_vec_end;
    let left_end_pos = left.highest_key_pos() + 2;

    let mut search_vec_start = right.search_vec_start;
    while search_vec_start <= search_vec_end {
        let entry_loc = u16le(&right.page, search_vec_start);
        let encoded_len = leaf_entry_length_at(&right.page, entry_loc);
        let target = left.highest_key_pos() + 2;
        let LeafLoc::Loc(left_entry_loc) = left.create_leaf_entry(cx, left_node, target, encoded_len)?
        else {
            return Err(cx.db.poison("leaf merge overflow"));
        };
        left.page[left_entry_loc as usize..(left_entry_loc + encoded_len) as usize]
            .copy_from_slice(&right.page[entry_loc as usize..(entry_loc + encoded_len) as usize]);
        search_vec_start += 2;
    }

    // All cursors in the right node move to the left node.
    for frame in right_node.live_frames() {
        let mut state = frame.state.lock();
        let frame_pos = state.pos;
        state.pos = frame_pos + if frame_pos < 0 { -left_end_pos } else { left_end_pos };
        drop(state);
        frame.move_binding(right_node, left_node);
    }

    // If the right node was the high extremity, the left node now is.
    left.typ |= right.typ & HIGH_EXTREMITY;

    cx.db.delete_node(right_node, right)
}

/// Moves all entries of the right internal node into the tail of `left`,
/// absorbing the parent separator between them, and deletes the right
/// node.
pub(crate) fn move_internal_to_left_and_delete(
    cx: &TreeCx<'_>,
    left_node: &Arc<Node>,
    left: &mut NodeInner,
    right_node: &Arc<Node>,
    right: &mut NodeInner,
    parent_key: &[u8],
) -> Result<()> {
    cx.db.prepare_to_delete(right_node, right)?;

    // Absorb the parent key, adopting the right node's first child.
    let mut left_end_pos = left.highest_internal_pos();
    let mut right_child_ids_loc = right.search_vec_end + 2;
    {
        let first_child_id = child_id_at(&right.page, right_child_ids_loc);
        right_child_ids_loc += 8;
        let pos = left_end_pos;
        left_end_pos += 2;
        left.create_internal_entry(
            cx,
            left_node,
            pos,
            parent_key.len() as i32,
            left_end_pos << 2,
            Some(KeySrc::Encoded(parent_key)),
            Some(first_child_id),
            false,
        )?;
    }

    let search_vec_end = right.search_vec_end;
    let mut search_vec_start = right.search_vec_start;
    while search_vec_start <= search_vec_end {
        let entry_loc = u16le(&right.page, search_vec_start);
        let encoded_len = key_length_at(&right.page, entry_loc);
        let key = right.page[entry_loc as usize..(entry_loc + encoded_len) as usize].to_vec();
        let child_id = child_id_at(&right.page, right_child_ids_loc);
        right_child_ids_loc += 8;

        let pos = left.highest_internal_pos();
        left.create_internal_entry(
            cx,
            left_node,
            pos,
            encoded_len,
            (pos + 2) << 2,
            Some(KeySrc::Encoded(&key)),
            Some(child_id),
            false,
        )?;
        search_vec_start += 2;
    }

    // Merge the in-memory child tables.
    let moved_children = std::mem::take(&mut right.child_nodes);
    left.child_nodes.extend(moved_children);

    // All cursors in the right node move to the left node.
    for frame in right_node.live_frames() {
        let mut state = frame.state.lock();
        state.pos += left_end_pos;
        drop(state);
        frame.move_binding(right_node, left_node);
    }

    left.typ |= right.typ & HIGH_EXTREMITY;

    cx.db.delete_node(right_node, right)
}

/// Collapses a non-leaf root that has lost all keys: the lone child's
/// content is swapped into the root node object, and the orphan child is
/// repurposed as a stub that keeps stale cursor frames alive until they
/// unbind. Caller holds exclusive latches on both; neither may be split.
pub(crate) fn root_delete(
    cx: &TreeCx<'_>,
    root: &Arc<Node>,
    inner: &mut NodeInner,
    child: &Arc<Node>,
    child_inner: &mut NodeInner,
) -> Result<()> {
    cx.db.prepare_to_delete(child, child_inner)?;
    let to_delete = child.id();

    log::debug!("root collapse: tree {} drops a level", cx.tree.id());

    let stub_type = inner.typ;

    // The root takes over the child's content.
    std::mem::swap(&mut inner.page, &mut child_inner.page);
    inner.typ = child_inner.typ;
    inner.garbage = child_inner.garbage;
    inner.left_seg_tail = child_inner.left_seg_tail;
    inner.right_seg_tail = child_inner.right_seg_tail;
    inner.search_vec_start = child_inner.search_vec_start;
    inner.search_vec_end = child_inner.search_vec_end;
    let old_root_children = std::mem::replace(
        &mut inner.child_nodes,
        std::mem::take(&mut child_inner.child_nodes),
    );
    root.swap_frames(child);

    // Repurpose the child into a stub. It carries the reserved id, stays
    // clean so it can never be written, and is evicted once every stale
    // frame has unbound.
    child.set_id(STUB_ID);
    child_inner.cached_state = super::CACHED_CLEAN;
    child_inner.typ = stub_type;
    child_inner.clear_entries();
    child_inner.child_nodes = old_root_children;
    // The stub's lone child is the real root, in memory and on page.
    if !child_inner.child_nodes.is_empty() {
        child_inner.child_nodes.truncate(1);
        child_inner.child_nodes[0] = Some(Arc::clone(root));
    } else {
        child_inner.child_nodes.push(Some(Arc::clone(root)));
    }
    put_child_id(
        &mut child_inner.page,
        child_inner.search_vec_end + 2,
        root.id(),
    );

    // Re-home the swapped cursor frames.
    for frame in root.live_frames() {
        frame.state.lock().node = Some(Arc::clone(root));
    }
    for frame in child.live_frames() {
        frame.state.lock().node = Some(Arc::clone(child));
    }

    cx.tree.add_stub(child);
    cx.db.delete_page_id(to_delete)?;
    Ok(())
}
