//! # Cursors and Cursor Frames
//!
//! A cursor marks a logical position in a tree as a chain of frames, one
//! per level, each bound to a node. A frame's position is a 2-based offset
//! into the node's search vector; negative values encode the bitwise
//! complement of an insertion point for "not found" positions, in which
//! case the original search key is remembered so structural modifications
//! can re-derive the position.
//!
//! Frames are registered with their node, and every structural
//! modification (insert, delete, rebalance, split, merge, root change)
//! fixes all bound frames before releasing its latches. A bound frame
//! therefore also pins its node's identity: eviction refuses nodes with
//! bound frames, so re-latching through a frame never races a recycled
//! buffer.
//!
//! ## Descent protocol
//!
//! Searches latch-couple from the root with shared latches: the child is
//! latched before the parent is released. A stale child-table entry forces
//! an upgrade; since a shared latch cannot upgrade directly, it is dropped
//! and the exclusive latch re-acquired, restarting from the root if the
//! node's id changed in the window. Once exclusive, the child is allocated
//! and registered in the child table, the parent is released, and the page
//! read happens under the child's latch alone; concurrent readers of the
//! same child serialize behind that latch.
//!
//! Mutations descend with exclusive latches, dirtying the path
//! copy-on-write as they go (a re-dirtied node gets a new page id, which
//! the parent's child table must record). A split encountered on the way
//! down is finished immediately, since the parent is already held.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::Database;
use crate::error::Result;
use crate::node::{internal_pos, Node, NodeReadGuard, NodeWriteGuard, TreeCx};
use crate::node::{
    finish_split_root, insert_split_child_ref, move_internal_to_left_and_delete,
    move_leaf_to_left_and_delete, root_delete,
};
use crate::node::{
    calculate_fragmented_value_length, calculate_key_length_checked,
    calculate_leaf_value_length, copy_to_leaf_entry, key_length_at, u16le, VALUE_FRAGMENTED,
};
use crate::node::{split_leaf_and_create_entry, LeafLoc};
use crate::config::TN_HEADER_SIZE;
use crate::tree::Tree;
use crate::txn::Transaction;

/// Position marker bound to one node. See the module docs for the
/// position encoding and maintenance rules.
pub struct CursorFrame {
    pub(crate) state: Mutex<FrameState>,
}

pub(crate) struct FrameState {
    pub node: Option<Arc<Node>>,
    pub pos: i32,
    /// Search key remembered by not-found frames, for rebalance and split
    /// comparisons after the surrounding entries move.
    pub not_found_key: Option<Vec<u8>>,
    pub parent: Option<Arc<CursorFrame>>,
}

impl CursorFrame {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FrameState {
                node: None,
                pos: 0,
                not_found_key: None,
                parent: None,
            }),
        }
    }

    pub(crate) fn parent(&self) -> Option<Arc<CursorFrame>> {
        self.state.lock().parent.clone()
    }

    pub(crate) fn pos(&self) -> i32 {
        self.state.lock().pos
    }

    pub(crate) fn set_pos(&self, pos: i32) {
        self.state.lock().pos = pos;
    }

    /// Binds this frame to `node` at `pos`. Caller holds a latch on the
    /// node.
    pub(crate) fn bind(self: &Arc<Self>, node: &Arc<Node>, pos: i32) {
        {
            let mut state = self.state.lock();
            state.node = Some(Arc::clone(node));
            state.pos = pos;
        }
        node.add_frame(self);
    }

    /// Unbinds from the current node, if any.
    pub(crate) fn unbind(self: &Arc<Self>) {
        let node = self.state.lock().node.take();
        if let Some(node) = node {
            node.remove_frame(self);
        }
    }

    /// Moves the binding from one node to another during a structural
    /// modification. Caller holds exclusive latches on both.
    pub(crate) fn move_binding(self: &Arc<Self>, from: &Node, to: &Arc<Node>) {
        from.remove_frame(self);
        self.state.lock().node = Some(Arc::clone(to));
        to.add_frame(self);
    }

    /// Latches the bound node exclusively, revalidating the binding, which
    /// can move while the latch is awaited.
    pub(crate) fn acquire_exclusive(self: &Arc<Self>) -> Option<(Arc<Node>, NodeWriteGuard)> {
        loop {
            let node = self.state.lock().node.clone()?;
            let guard = node.inner.write_arc();
            let still = self
                .state
                .lock()
                .node
                .as_ref()
                .is_some_and(|n| Arc::ptr_eq(n, &node));
            if still {
                return Some((node, guard));
            }
        }
    }

    /// Non-blocking variant, used by rebalance.
    pub(crate) fn try_acquire_exclusive(self: &Arc<Self>) -> Option<(Arc<Node>, NodeWriteGuard)> {
        let node = self.state.lock().node.clone()?;
        let guard = node.inner.try_write_arc()?;
        let still = self
            .state
            .lock()
            .node
            .as_ref()
            .is_some_and(|n| Arc::ptr_eq(n, &node));
        if still {
            Some((node, guard))
        } else {
            None
        }
    }

    /// Latches the bound node shared, revalidating the binding.
    pub(crate) fn acquire_shared(self: &Arc<Self>) -> Option<(Arc<Node>, NodeReadGuard)> {
        loop {
            let node = self.state.lock().node.clone()?;
            let guard = node.inner.read_arc();
            let still = self
                .state
                .lock()
                .node
                .as_ref()
                .is_some_and(|n| Arc::ptr_eq(n, &node));
            if still {
                return Some((node, guard));
            }
        }
    }
}

/// A tree cursor. Traversal methods do not take row locks; transactional
/// reads go through `Tree::load`, which fixes the position with a cursor
/// and then negotiates the lock without holding any latch.
pub struct TreeCursor {
    db: Arc<Database>,
    tree: Arc<Tree>,
    leaf: Option<Arc<CursorFrame>>,
}

impl TreeCursor {
    pub(crate) fn new(db: Arc<Database>, tree: Arc<Tree>) -> Self {
        Self {
            db,
            tree,
            leaf: None,
        }
    }

    /// Unbinds all frames; the cursor no longer references any node.
    pub fn reset(&mut self) {
        let mut frame = self.leaf.take();
        while let Some(f) = frame {
            f.unbind();
            frame = f.state.lock().parent.take();
        }
    }

    /// Current key, if positioned on an entry.
    pub fn key(&self) -> Option<Vec<u8>> {
        let frame = self.leaf.as_ref()?;
        let (_, guard) = frame.acquire_shared()?;
        let pos = frame.pos();
        if pos >= 0 && guard.has_keys() {
            Some(guard.retrieve_key(pos))
        } else {
            None
        }
    }

    /// Value at the current position; `None` when unpositioned, not found,
    /// or ghosted.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.leaf.as_ref() else {
            return Ok(None);
        };
        let Some((_, guard)) = frame.acquire_shared() else {
            return Ok(None);
        };
        let pos = frame.pos();
        if pos < 0 || !guard.has_keys() {
            return Ok(None);
        }
        guard.retrieve_leaf_value(&self.db, pos)
    }

    /// Positions at `key` and returns its value. The cursor stays bound,
    /// found or not.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.find_bind(key)?;
        let frame = self.leaf.as_ref().expect("find_bind left a leaf frame");
        let pos = frame.pos();
        if pos >= 0 {
            guard.retrieve_leaf_value(&self.db, pos)
        } else {
            Ok(None)
        }
    }

    /// Descends to the leaf for `key` with shared latches, binding frames
    /// at every level. Returns the still-held leaf latch.
    pub(crate) fn find_bind(&mut self, key: &[u8]) -> Result<NodeReadGuard> {
        self.reset();

        let mut parent_frame: Option<Arc<CursorFrame>> = None;
        let mut node: Arc<Node> = Arc::clone(self.tree.root());
        let mut guard: NodeReadGuard = node.inner.read_arc();
        // Root splits always finish before the root latch is released, so
        // a split root is never observed here.

        loop {
            if guard.is_leaf() {
                let pos = guard.binary_search(key);
                let frame = Arc::new(CursorFrame::new());
                frame.state.lock().parent = parent_frame;
                if pos < 0 {
                    frame.state.lock().not_found_key = Some(key.to_vec());
                }
                frame.bind(&node, pos);
                self.leaf = Some(frame);
                return Ok(guard);
            }

            let child_pos = internal_pos(guard.binary_search(key));
            let frame = Arc::new(CursorFrame::new());
            frame.state.lock().parent = parent_frame.take();
            frame.bind(&node, child_pos);
            parent_frame = Some(Arc::clone(&frame));

            let child_id = guard.child_ref_id(child_pos);
            let cached = guard
                .child_nodes
                .get((child_pos >> 1) as usize)
                .cloned()
                .flatten();

            if let Some(child) = cached {
                if child.id() == child_id {
                    let child_guard = child.inner.read_arc();
                    // Double check: eviction may have raced the unlatched
                    // id read.
                    if child.id() == child_id {
                        drop(guard);
                        self.db.used(&child);
                        let (sel_node, sel_guard) =
                            select_split_side_shared(child, child_guard, key);
                        node = sel_node;
                        guard = sel_guard;
                        continue;
                    }
                    drop(child_guard);
                }
            }

            // Child must be loaded; the shared latch cannot mutate the
            // child table, so upgrade. A direct upgrade is not possible:
            // drop and re-acquire, revalidating the node id.
            let node_id = node.id();
            drop(guard);
            let mut xguard = node.inner.write_arc();

            if node.id() != node_id && !Arc::ptr_eq(&node, self.tree.root()) {
                // Evicted or redirected while unlatched; retry from the
                // root, which is reliable.
                drop(xguard);
                return self.find_bind(key);
            }

            if xguard.split.is_some() {
                // Split while the latch was released.
                let (sel_node, sel_guard) = select_split_side_exclusive(node, xguard, key);
                node = sel_node;
                xguard = sel_guard;
            }

            if Arc::ptr_eq(&node, self.tree.root()) && xguard.is_leaf() {
                // A delete collapsed the root while the latch was free.
                frame.unbind();
                let pos = xguard.binary_search(key);
                let leaf_frame = Arc::new(CursorFrame::new());
                leaf_frame.state.lock().parent = frame.parent();
                if pos < 0 {
                    leaf_frame.state.lock().not_found_key = Some(key.to_vec());
                }
                leaf_frame.bind(&node, pos);
                self.leaf = Some(leaf_frame);
                let down = parking_lot::lock_api::ArcRwLockWriteGuard::downgrade(xguard);
                return Ok(down);
            }

            // Positions may have changed while unlatched.
            let child_pos = internal_pos(xguard.binary_search(key));
            frame.set_pos(child_pos);
            let child_id = xguard.child_ref_id(child_pos);

            let cached = xguard
                .child_nodes
                .get((child_pos >> 1) as usize)
                .cloned()
                .flatten();
            if let Some(child) = cached {
                if child.id() == child_id {
                    let child_guard = child.inner.read_arc();
                    if child.id() == child_id {
                        drop(xguard);
                        self.db.used(&child);
                        let (sel_node, sel_guard) =
                            select_split_side_shared(child, child_guard, key);
                        node = sel_node;
                        guard = sel_guard;
                        continue;
                    }
                    drop(child_guard);
                }
            }

            // Register the child, release the parent, then read the page;
            // late-arriving readers serialize behind the child's latch.
            let (child, mut child_guard) =
                self.db
                    .load_child_registered(&self.tree, &mut xguard, child_pos, child_id)?;
            drop(xguard);
            self.db.load_child_read(&child, &mut child_guard, child_id)?;
            self.db.make_evictable(&child);
            self.db.used(&child);

            node = child;
            guard = parking_lot::lock_api::ArcRwLockWriteGuard::downgrade(child_guard);
        }
    }

    /// Positions at `key`, starting the search from the current position.
    /// When the target lands in the already-bound leaf the descent is
    /// skipped entirely, which makes clustered access patterns cheap; any
    /// miss falls back to a full search.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.leaf.clone() else {
            return self.find(key);
        };
        let Some((_, guard)) = frame.acquire_shared() else {
            return self.find(key);
        };
        if guard.split.is_some() || !guard.has_keys() {
            drop(guard);
            return self.find(key);
        }

        let hint = frame.pos().max(0).min(guard.highest_key_pos());
        let pos = guard.binary_search_hint(key, hint);

        if pos >= 0 {
            frame.set_pos(pos);
            frame.state.lock().not_found_key = None;
            return guard.retrieve_leaf_value(&self.db, pos);
        }

        // A miss inside the leaf's key range is authoritative; one at
        // either edge may belong to a neighboring leaf.
        let gap = !pos;
        let interior = gap > 0 && gap <= guard.highest_key_pos();
        let covered = interior
            || (gap == 0 && guard.typ & crate::node::LOW_EXTREMITY != 0)
            || (gap > guard.highest_key_pos()
                && guard.typ & crate::node::HIGH_EXTREMITY != 0);
        if covered {
            frame.set_pos(pos);
            frame.state.lock().not_found_key = Some(key.to_vec());
            return Ok(None);
        }

        drop(guard);
        self.find(key)
    }

    /// Positions at the first entry; `Ok(false)` when the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.to_extreme(true)
    }

    /// Positions at the last entry; `Ok(false)` when the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.to_extreme(false)
    }

    fn to_extreme(&mut self, low: bool) -> Result<bool> {
        self.reset();
        let node = Arc::clone(self.tree.root());
        let guard = node.inner.read_arc();
        self.descend_extreme(None, node, guard, low)
    }

    /// Descends to the lowest or highest leaf under `node`, binding frames.
    fn descend_extreme(
        &mut self,
        mut parent_frame: Option<Arc<CursorFrame>>,
        mut node: Arc<Node>,
        mut guard: NodeReadGuard,
        low: bool,
    ) -> Result<bool> {
        loop {
            if guard.is_leaf() {
                let pos = if low { 0 } else { guard.highest_key_pos() };
                let has = guard.has_keys();
                let frame = Arc::new(CursorFrame::new());
                frame.state.lock().parent = parent_frame;
                frame.bind(&node, if has { pos.max(0) } else { !0 });
                self.leaf = Some(frame);
                return Ok(has);
            }

            let child_pos = if low { 0 } else { guard.highest_internal_pos() };
            let frame = Arc::new(CursorFrame::new());
            frame.state.lock().parent = parent_frame.take();
            frame.bind(&node, child_pos);
            parent_frame = Some(Arc::clone(&frame));

            let (child, child_guard) = self.shared_child(&node, guard, &frame, child_pos)?;
            node = child;
            guard = child_guard;
        }
    }

    /// Latches the child at `child_pos` shared, loading it if needed.
    /// Consumes and releases the parent guard.
    fn shared_child(
        &mut self,
        parent: &Arc<Node>,
        guard: NodeReadGuard,
        frame: &Arc<CursorFrame>,
        child_pos: i32,
    ) -> Result<(Arc<Node>, NodeReadGuard)> {
        let child_id = guard.child_ref_id(child_pos);
        let cached = guard
            .child_nodes
            .get((child_pos >> 1) as usize)
            .cloned()
            .flatten();

        if let Some(child) = cached {
            if child.id() == child_id {
                let child_guard = child.inner.read_arc();
                if child.id() == child_id {
                    drop(guard);
                    self.db.used(&child);
                    // A split child is descended through whichever side the
                    // position selects; extreme descents keep the latched
                    // side, because select-by-key is meaningless here and
                    // the split sides are ordered siblings already.
                    return Ok((child, child_guard));
                }
                drop(child_guard);
            }
        }

        drop(guard);
        let mut xguard = parent.inner.write_arc();
        // The parent cannot have been evicted (our frame pins it), but its
        // shape can have changed; revalidate the position bounds.
        let child_pos = child_pos.clamp(0, xguard.highest_internal_pos());
        frame.set_pos(child_pos);
        let child_id = xguard.child_ref_id(child_pos);
        let cached = xguard
            .child_nodes
            .get((child_pos >> 1) as usize)
            .cloned()
            .flatten();
        if let Some(child) = cached {
            if child.id() == child_id {
                let child_guard = child.inner.read_arc();
                if child.id() == child_id {
                    drop(xguard);
                    self.db.used(&child);
                    return Ok((child, child_guard));
                }
                drop(child_guard);
            }
        }

        let (child, mut child_guard) =
            self.db
                .load_child_registered(&self.tree, &mut xguard, child_pos, child_id)?;
        drop(xguard);
        self.db.load_child_read(&child, &mut child_guard, child_id)?;
        self.db.make_evictable(&child);
        self.db.used(&child);
        Ok((
            child,
            parking_lot::lock_api::ArcRwLockWriteGuard::downgrade(child_guard),
        ))
    }

    /// Advances to the next entry, returning its key and value.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.step(true)
    }

    /// Steps back to the previous entry.
    pub fn previous(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.step(false)
    }

    fn step(&mut self, forward: bool) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        loop {
            let Some(frame) = self.leaf.clone() else {
                return Ok(None);
            };
            let Some((node, guard)) = frame.acquire_shared() else {
                return Ok(None);
            };

            if guard.split.is_some() {
                // Help complete the split before stepping across it.
                drop(guard);
                let Some((node, xguard)) = frame.acquire_exclusive() else {
                    return Ok(None);
                };
                if xguard.split.is_some() {
                    self.finish_split(&frame, node, xguard)?;
                }
                continue;
            }

            let fp = frame.pos();
            let candidate = if forward {
                if fp >= 0 {
                    fp + 2
                } else {
                    !fp
                }
            } else if fp >= 0 {
                fp - 2
            } else {
                !fp - 2
            };

            if candidate >= 0 && candidate <= guard.highest_key_pos() {
                frame.set_pos(candidate);
                frame.state.lock().not_found_key = None;
                let key = guard.retrieve_key(candidate);
                let value = guard.retrieve_leaf_value(&self.db, candidate)?;
                return Ok(Some((key, value)));
            }

            // Off the edge of this leaf: climb until a parent has a next
            // child, then descend its extreme edge.
            drop(guard);
            let Some(parent) = frame.parent() else {
                // Root leaf: no more entries.
                return Ok(None);
            };
            let _ = node;

            let Some((pnode, pguard)) = parent.acquire_shared() else {
                return Ok(None);
            };
            let ppos = parent.pos();
            let next_pos = if forward { ppos + 2 } else { ppos - 2 };

            if next_pos < 0 || next_pos > pguard.highest_internal_pos() {
                // This subtree is exhausted; pop the leaf frame and retry
                // one level up by making the parent the stepping frame.
                drop(pguard);
                if !self.climb(&parent, forward)? {
                    return Ok(None);
                }
                continue;
            }

            // Unbind the old path below the parent.
            frame.unbind();
            parent.set_pos(next_pos);

            let (child, child_guard) = self.shared_child(&pnode, pguard, &parent, next_pos)?;
            let ok = self.descend_extreme(Some(parent), child, child_guard, forward)?;
            if !ok {
                // Empty leaf (all entries ghost-deleted then merged away
                // concurrently); keep stepping.
                continue;
            }
            let frame = self.leaf.clone().expect("descend bound a leaf");
            let Some((_, guard)) = frame.acquire_shared() else {
                continue;
            };
            let pos = frame.pos();
            if pos < 0 {
                continue;
            }
            let key = guard.retrieve_key(pos);
            let value = guard.retrieve_leaf_value(&self.db, pos)?;
            return Ok(Some((key, value)));
        }
    }

    /// Moves the stepping anchor one level up, when a whole subtree is
    /// exhausted. Returns false at the root.
    fn climb(&mut self, parent: &Arc<CursorFrame>, forward: bool) -> Result<bool> {
        let Some(grand) = parent.parent() else {
            return Ok(false);
        };
        let Some((gnode, gguard)) = grand.acquire_shared() else {
            return Ok(false);
        };
        let gpos = grand.pos();
        let next = if forward { gpos + 2 } else { gpos - 2 };
        if next < 0 || next > gguard.highest_internal_pos() {
            drop(gguard);
            return self.climb(&grand, forward);
        }

        // Unbind the exhausted path below the grandparent.
        let mut f = self.leaf.take();
        while let Some(fr) = f {
            if Arc::ptr_eq(&fr, &grand) {
                break;
            }
            let up = fr.state.lock().parent.take();
            fr.unbind();
            f = up;
        }

        grand.set_pos(next);
        let (child, child_guard) = self.shared_child(&gnode, gguard, &grand, next)?;
        self.descend_extreme(Some(grand), child, child_guard, forward)?;
        Ok(true)
    }

    // ---- mutation ------------------------------------------------------

    /// Descends for mutation: exclusive latches, copy-on-write dirtying,
    /// finishing any pending child splits on the way. Returns the latched
    /// dirty leaf; frames are bound along the path.
    pub(crate) fn exclusive_descent(
        &mut self,
        key: &[u8],
    ) -> Result<(Arc<Node>, NodeWriteGuard)> {
        self.reset();
        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        let mut parent_frame: Option<Arc<CursorFrame>> = None;
        let mut node: Arc<Node> = Arc::clone(self.tree.root());
        let mut guard: NodeWriteGuard = node.inner.write_arc();
        self.db.mark_dirty(&self.tree, &node, &mut guard)?;

        loop {
            if guard.is_leaf() {
                let pos = guard.binary_search(key);
                let frame = Arc::new(CursorFrame::new());
                frame.state.lock().parent = parent_frame;
                if pos < 0 {
                    frame.state.lock().not_found_key = Some(key.to_vec());
                }
                frame.bind(&node, pos);
                self.leaf = Some(frame);
                return Ok((node, guard));
            }

            let child_pos = internal_pos(guard.binary_search(key));
            let frame = Arc::new(CursorFrame::new());
            frame.state.lock().parent = parent_frame.take();
            frame.bind(&node, child_pos);
            parent_frame = Some(Arc::clone(&frame));

            loop {
                let child_pos = frame.pos();
                let (child, mut child_guard) =
                    self.db.latch_child_exclusive(&self.tree, &mut guard, child_pos)?;

                if child_guard.split.is_some() {
                    // Finish the pending split now; the parent is held.
                    insert_split_child_ref(
                        &cx,
                        &node,
                        &mut guard,
                        child_pos,
                        &child,
                        &mut child_guard,
                    )?;
                    drop(child_guard);

                    if guard.split.is_some() {
                        // Absorbing the separator split this node in turn;
                        // finish it before continuing the descent.
                        let split_node = Arc::clone(&node);
                        self.finish_split(&frame, split_node, guard)?;
                        let Some((n2, g2)) = frame.acquire_exclusive() else {
                            eyre::bail!("descent frame unbound during split");
                        };
                        node = n2;
                        guard = g2;
                    }

                    // Positions changed; re-search this node.
                    let new_pos = internal_pos(guard.binary_search(key));
                    frame.set_pos(new_pos);
                    continue;
                }

                if self.db.mark_dirty(&self.tree, &child, &mut child_guard)? {
                    guard.update_child_ref_id(child_pos, child.id());
                }

                drop(guard);
                node = child;
                guard = child_guard;
                break;
            }
        }
    }

    /// Stores `value` under `key`, returning the previous value. `None`
    /// deletes. Row locking and redo are the caller's concern; the commit
    /// latch must be held shared.
    pub(crate) fn store(
        &mut self,
        txn: Option<&mut Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let encoded_key_len =
            calculate_key_length_checked(key, self.tree.max_key_size())?;

        let (node, mut guard) = self.exclusive_descent(key)?;
        let frame = self.leaf.clone().expect("descent bound a leaf");
        let pos = frame.pos();

        let old = if pos >= 0 {
            guard.retrieve_leaf_value(&self.db, pos)?
        } else {
            None
        };

        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        match value {
            Some(value) => {
                let mut txn = txn;
                if pos >= 0 {
                    if let Some(txn) = txn.as_deref_mut() {
                        guard.txn_pre_update_leaf_entry(&cx, txn, key, pos)?;
                    }
                    guard.update_leaf_value(&cx, &node, pos, 0, value)?;
                } else {
                    if let Some(txn) = txn.as_deref_mut() {
                        txn.undo_delete_key(self.tree.id(), key)?;
                    }
                    let ins_pos = !pos;
                    node.adjust_frames_for_insert(ins_pos, key);

                    let mut fragmented = 0u8;
                    let mut stored = std::borrow::Cow::Borrowed(value);
                    let mut encoded_len =
                        encoded_key_len + calculate_leaf_value_length(value);
                    if encoded_len > self.tree.max_entry_size() as i32 {
                        let desc = self.db.fragment_value(
                            value,
                            self.tree.max_entry_size() as i32 - encoded_key_len,
                        )?;
                        stored = std::borrow::Cow::Owned(desc);
                        fragmented = VALUE_FRAGMENTED;
                        encoded_len =
                            encoded_key_len + calculate_fragmented_value_length(&stored);
                    }

                    match guard.create_leaf_entry(&cx, &node, ins_pos, encoded_len)? {
                        LeafLoc::Loc(entry_loc) => {
                            copy_to_leaf_entry(
                                &mut guard.page,
                                key,
                                fragmented,
                                &stored,
                                entry_loc as usize,
                            );
                            frame.set_pos(ins_pos);
                            frame.state.lock().not_found_key = None;
                        }
                        LeafLoc::Split { .. } => {
                            split_leaf_and_create_entry(
                                &cx,
                                &node,
                                &mut guard,
                                key,
                                fragmented,
                                &stored,
                                encoded_len,
                                ins_pos,
                                true,
                            )?;
                        }
                    }
                }

                if guard.split.is_some() {
                    self.finish_split(&frame, node, guard)?;
                }
            }
            None => {
                if pos >= 0 && old.is_some() {
                    match txn {
                        Some(txn) => {
                            guard.txn_delete_leaf_entry(&cx, txn, key, pos)?;
                            drop(guard);
                        }
                        None => {
                            guard.delete_leaf_entry(&cx, &node, pos)?;
                            let should = guard.should_merge();
                            drop(guard);
                            if should {
                                self.merge_leaf(&frame)?;
                            }
                        }
                    }
                }
            }
        }

        Ok(old)
    }

    /// Stores raw value bytes, preserving a fragmented flag. Used by undo
    /// restoration, which must re-create entries byte-compatible with
    /// their pre-images.
    pub(crate) fn store_physical(
        &mut self,
        key: &[u8],
        fragmented: u8,
        value: &[u8],
    ) -> Result<()> {
        let encoded_key_len = calculate_key_length_checked(key, self.tree.max_key_size())?;
        let (node, mut guard) = self.exclusive_descent(key)?;
        let frame = self.leaf.clone().expect("descent bound a leaf");
        let pos = frame.pos();

        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        if pos >= 0 {
            guard.update_leaf_value(&cx, &node, pos, fragmented, value)?;
        } else {
            let ins_pos = !pos;
            node.adjust_frames_for_insert(ins_pos, key);
            let encoded_len = encoded_key_len
                + if fragmented != 0 {
                    calculate_fragmented_value_length(value)
                } else {
                    calculate_leaf_value_length(value)
                };
            match guard.create_leaf_entry(&cx, &node, ins_pos, encoded_len)? {
                LeafLoc::Loc(entry_loc) => {
                    copy_to_leaf_entry(
                        &mut guard.page,
                        key,
                        fragmented,
                        value,
                        entry_loc as usize,
                    );
                    frame.set_pos(ins_pos);
                    frame.state.lock().not_found_key = None;
                }
                LeafLoc::Split { .. } => {
                    split_leaf_and_create_entry(
                        &cx, &node, &mut guard, key, fragmented, value, encoded_len, ins_pos,
                        true,
                    )?;
                }
            }
        }

        if guard.split.is_some() {
            self.finish_split(&frame, node, guard)?;
        }
        Ok(())
    }

    /// Physically deletes the entry for `key` if it is a ghost. Called by
    /// lock release at commit, with the exclusive row lock still held.
    pub(crate) fn delete_ghost(&mut self, key: &[u8]) -> Result<()> {
        let (node, mut guard) = self.exclusive_descent(key)?;
        let frame = self.leaf.clone().expect("descent bound a leaf");
        let pos = frame.pos();
        if pos >= 0 && guard.is_ghost(pos) {
            let cx = TreeCx {
                db: self.db.as_ref(),
                tree: &self.tree,
            };
            guard.delete_leaf_entry(&cx, &node, pos)?;
            let should = guard.should_merge();
            drop(guard);
            if should {
                self.merge_leaf(&frame)?;
            }
        }
        Ok(())
    }

    /// Completes a pending split on the frame's node: climbs to the parent
    /// and inserts the separator, recursing when the parent splits too and
    /// growing a new root when the root itself split.
    pub(crate) fn finish_split(
        &self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
        guard: NodeWriteGuard,
    ) -> Result<()> {
        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        let mut node = node;
        let mut guard = guard;
        let mut frame = Arc::clone(frame);

        loop {
            if Arc::ptr_eq(&node, self.tree.root()) {
                let stub = self.tree.pop_stub();
                let result = match &stub {
                    Some(stub_node) => {
                        let _stub_guard = stub_node.inner.write_arc();
                        finish_split_root(&cx, &node, &mut guard, Some(stub_node))
                    }
                    None => finish_split_root(&cx, &node, &mut guard, None),
                };
                if let Err(e) = result {
                    return Err(self.db.poison_on(e, guard));
                }
                return Ok(());
            }

            let parent_frame = frame
                .parent()
                .ok_or_else(|| eyre::eyre!("split node has no parent frame"))?;

            // Parent-before-child: release the child, latch the parent,
            // re-latch the child.
            drop(guard);

            let Some((pnode, mut pguard)) = parent_frame.acquire_exclusive() else {
                eyre::bail!("split node's parent frame unbound");
            };

            if pguard.split.is_some() {
                // The parent must be finished first.
                self.finish_split(&parent_frame, Arc::clone(&pnode), pguard)?;
                guard = node.inner.write_arc();
                continue;
            }

            let reguard = node.inner.write_arc();
            if reguard.split.is_none() {
                // Another cursor finished it.
                return Ok(());
            }
            let mut child_guard = reguard;

            let key_pos = parent_frame.pos().max(0);
            if let Err(e) = insert_split_child_ref(
                &cx,
                &pnode,
                &mut pguard,
                key_pos,
                &node,
                &mut child_guard,
            ) {
                drop(child_guard);
                return Err(self.db.poison_on(e, pguard));
            }
            drop(child_guard);

            if pguard.split.is_some() {
                node = pnode;
                guard = pguard;
                frame = parent_frame;
                continue;
            }
            return Ok(());
        }
    }

    /// Merges an underfull leaf into a sibling, propagating underflow up
    /// the tree and collapsing the root when it empties. All sibling and
    /// parent latching is left-to-right to stay deadlock-free.
    fn merge_leaf(&self, frame: &Arc<CursorFrame>) -> Result<()> {
        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        let Some(parent_frame) = frame.parent() else {
            // The leaf is the root; an empty root leaf is fine.
            return Ok(());
        };

        let Some((pnode, mut pguard)) = parent_frame.acquire_exclusive() else {
            return Ok(());
        };
        if pguard.split.is_some() {
            // Opportunistic merge under a splitting parent is skipped.
            return Ok(());
        }

        let child_pos = parent_frame.pos();
        if child_pos < 0 || child_pos > pguard.highest_internal_pos() {
            return Ok(());
        }

        // Left-to-right: left sibling, node, right sibling.
        let (left, node_pair, right);
        {
            left = if child_pos > 0 {
                Some(
                    self.db
                        .latch_child_exclusive(&self.tree, &mut pguard, child_pos - 2)?,
                )
            } else {
                None
            };

            let Some((node, guard)) = frame.acquire_exclusive() else {
                return Ok(());
            };
            if !guard.should_merge() {
                return Ok(());
            }
            node_pair = (node, guard);

            right = if child_pos < pguard.highest_internal_pos() {
                Some(
                    self.db
                        .latch_child_exclusive(&self.tree, &mut pguard, child_pos + 2)?,
                )
            } else {
                None
            };
        }
        let (node, mut guard) = node_pair;

        let cap = (guard.page.len() - TN_HEADER_SIZE) as i32;
        let node_content = cap - guard.available_leaf_bytes();

        if let Some((lnode, mut lguard)) = left {
            if lguard.split.is_none() && lguard.available_leaf_bytes() >= node_content {
                if self.db.mark_dirty(&self.tree, &lnode, &mut lguard)? {
                    pguard.update_child_ref_id(child_pos - 2, lnode.id());
                }
                move_leaf_to_left_and_delete(&cx, &lnode, &mut lguard, &node, &mut guard)?;
                drop(guard);
                drop(lguard);
                drop(right);
                pguard.delete_child_ref(&pnode, child_pos);
                return self.merge_internal(&parent_frame, pnode, pguard);
            }
            drop(lguard);
        }

        if let Some((rnode, mut rguard)) = right {
            let right_content = cap - rguard.available_leaf_bytes();
            if rguard.split.is_none() && guard.available_leaf_bytes() >= right_content {
                if self.db.mark_dirty(&self.tree, &node, &mut guard)? {
                    pguard.update_child_ref_id(child_pos, node.id());
                }
                move_leaf_to_left_and_delete(&cx, &node, &mut guard, &rnode, &mut rguard)?;
                drop(rguard);
                drop(guard);
                pguard.delete_child_ref(&pnode, child_pos + 2);
                return self.merge_internal(&parent_frame, pnode, pguard);
            }
        }

        Ok(())
    }

    /// Propagates a merge into an internal node whose child count just
    /// shrank.
    fn merge_internal(
        &self,
        frame: &Arc<CursorFrame>,
        node: Arc<Node>,
        mut guard: NodeWriteGuard,
    ) -> Result<()> {
        let cx = TreeCx {
            db: self.db.as_ref(),
            tree: &self.tree,
        };

        if Arc::ptr_eq(&node, self.tree.root()) {
            if !guard.is_leaf() && !guard.has_keys() {
                // Collapse the root into its lone child.
                let (child, mut child_guard) =
                    self.db.latch_child_exclusive(&self.tree, &mut guard, 0)?;
                if child_guard.split.is_some() {
                    return Ok(());
                }
                root_delete(&cx, &node, &mut guard, &child, &mut child_guard)?;
            }
            return Ok(());
        }

        if !guard.should_merge() {
            return Ok(());
        }

        let Some(parent_frame) = frame.parent() else {
            return Ok(());
        };
        drop(guard);

        let Some((pnode, mut pguard)) = parent_frame.acquire_exclusive() else {
            return Ok(());
        };
        if pguard.split.is_some() {
            return Ok(());
        }

        let child_pos = parent_frame.pos();
        if child_pos < 0 || child_pos > pguard.highest_internal_pos() {
            return Ok(());
        }

        let left = if child_pos > 0 {
            Some(
                self.db
                    .latch_child_exclusive(&self.tree, &mut pguard, child_pos - 2)?,
            )
        } else {
            None
        };

        let Some((node, mut guard)) = frame.acquire_exclusive() else {
            return Ok(());
        };
        if !guard.should_merge() {
            return Ok(());
        }

        let right = if child_pos < pguard.highest_internal_pos() {
            Some(
                self.db
                    .latch_child_exclusive(&self.tree, &mut pguard, child_pos + 2)?,
            )
        } else {
            None
        };

        let cap = (guard.page.len() - TN_HEADER_SIZE) as i32;

        if let Some((lnode, mut lguard)) = left {
            let sep_loc = u16le(&pguard.page, pguard.search_vec_start + child_pos - 2);
            let sep_len = key_length_at(&pguard.page, sep_loc);
            let node_content = cap - guard.available_internal_bytes();
            if lguard.split.is_none()
                && lguard.available_internal_bytes() >= node_content + sep_len + (2 + 8)
            {
                if self.db.mark_dirty(&self.tree, &lnode, &mut lguard)? {
                    pguard.update_child_ref_id(child_pos - 2, lnode.id());
                }
                let sep =
                    pguard.page[sep_loc as usize..(sep_loc + sep_len) as usize].to_vec();
                move_internal_to_left_and_delete(
                    &cx, &lnode, &mut lguard, &node, &mut guard, &sep,
                )?;
                drop(guard);
                drop(lguard);
                drop(right);
                pguard.delete_child_ref(&pnode, child_pos);
                return self.merge_internal(&parent_frame, pnode, pguard);
            }
            drop(lguard);
        }

        if let Some((rnode, mut rguard)) = right {
            let sep_loc = u16le(&pguard.page, pguard.search_vec_start + child_pos);
            let sep_len = key_length_at(&pguard.page, sep_loc);
            let right_content = cap - rguard.available_internal_bytes();
            if rguard.split.is_none()
                && guard.available_internal_bytes() >= right_content + sep_len + (2 + 8)
            {
                if self.db.mark_dirty(&self.tree, &node, &mut guard)? {
                    pguard.update_child_ref_id(child_pos, node.id());
                }
                let sep =
                    pguard.page[sep_loc as usize..(sep_loc + sep_len) as usize].to_vec();
                move_internal_to_left_and_delete(
                    &cx, &node, &mut guard, &rnode, &mut rguard, &sep,
                )?;
                drop(rguard);
                drop(guard);
                pguard.delete_child_ref(&pnode, child_pos + 2);
                return self.merge_internal(&parent_frame, pnode, pguard);
            }
        }

        Ok(())
    }
}

impl Drop for TreeCursor {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Routes a shared descent through a pending split, latching the selected
/// side and releasing the other.
fn select_split_side_shared(
    node: Arc<Node>,
    guard: NodeReadGuard,
    key: &[u8],
) -> (Arc<Node>, NodeReadGuard) {
    let Some(split) = guard.split.as_ref() else {
        return (node, guard);
    };
    if split.select_sibling(key) {
        let sibling = Arc::clone(&split.sibling);
        let sib_guard = sibling.inner.read_arc();
        drop(guard);
        (sibling, sib_guard)
    } else {
        (node, guard)
    }
}

fn select_split_side_exclusive(
    node: Arc<Node>,
    guard: NodeWriteGuard,
    key: &[u8],
) -> (Arc<Node>, NodeWriteGuard) {
    let Some(split) = guard.split.as_ref() else {
        return (node, guard);
    };
    if split.select_sibling(key) {
        let sibling = Arc::clone(&split.sibling);
        let sib_guard = sibling.inner.write_arc();
        drop(guard);
        (sibling, sib_guard)
    } else {
        (node, guard)
    }
}
