//! # Node Cache
//!
//! A bounded pool of node buffers. Nodes are never freed: once the pool is
//! full, allocating a node means evicting the least-recently-used victim
//! and recycling its object, so an `Arc<Node>` can silently change identity
//! whenever its latch is free. Holders of unlatched references (parent
//! child tables) detect this by comparing the stored child id against the
//! node's current id.
//!
//! ## Eviction
//!
//! The usage list is a doubly linked LRU ordered by last access, guarded by
//! one mutex (`used` moves a node to the hot end). A victim must satisfy,
//! under a try-acquired exclusive latch: no bound cursor frames, no pending
//! split, not a root (roots are simply never in the list), and every
//! resident child evictable under its own try-latch. Dirty victims are
//! written out first. If any latch cannot be acquired the attempt is
//! abandoned and the next victim is tried.
//!
//! For an undo-log node the walk prefers the deeper node in the chain,
//! because undo chains are written tail-first; evicting the shallow node
//! while a deeper one is dirty would strand it.
//!
//! ## Dirty generations
//!
//! A checkpoint flips a single state bit: nodes carrying the old dirty
//! value belong to the snapshot being written, nodes dirtied afterward get
//! the new value, and clean nodes are zero. This lets mutations proceed
//! while a checkpoint writes.
//!
//! ## Spare buffers
//!
//! Compaction copies surviving entries into a scratch page and swaps it
//! in; the displaced buffer returns to a small free list so steady-state
//! compaction allocates nothing.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::{MIN_CACHE_SIZE, STUB_ID};
use crate::error::{Error, Result};
use crate::node::{Node, NodeInner, NodeWriteGuard, CACHED_CLEAN, TYPE_NONE, TYPE_UNDO_LOG};
use crate::storage::PageStore;

const NIL: u32 = u32::MAX;

/// Intrusive LRU list over pool slots. Cold end is popped for eviction;
/// `touch` moves a slot to the hot end.
struct UsageList {
    head: u32, // coldest
    tail: u32, // hottest
    prev: Vec<u32>,
    next: Vec<u32>,
    linked: Vec<bool>,
}

impl UsageList {
    fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            prev: Vec::new(),
            next: Vec::new(),
            linked: Vec::new(),
        }
    }

    fn ensure_slot(&mut self, slot: u32) {
        let need = slot as usize + 1;
        if self.prev.len() < need {
            self.prev.resize(need, NIL);
            self.next.resize(need, NIL);
            self.linked.resize(need, false);
        }
    }

    fn unlink(&mut self, slot: u32) {
        if !self.linked[slot as usize] {
            return;
        }
        let (p, n) = (self.prev[slot as usize], self.next[slot as usize]);
        if p == NIL {
            self.head = n;
        } else {
            self.next[p as usize] = n;
        }
        if n == NIL {
            self.tail = p;
        } else {
            self.prev[n as usize] = p;
        }
        self.prev[slot as usize] = NIL;
        self.next[slot as usize] = NIL;
        self.linked[slot as usize] = false;
    }

    fn push_hot(&mut self, slot: u32) {
        self.ensure_slot(slot);
        self.unlink(slot);
        self.prev[slot as usize] = self.tail;
        self.next[slot as usize] = NIL;
        if self.tail == NIL {
            self.head = slot;
        } else {
            self.next[self.tail as usize] = slot;
        }
        self.tail = slot;
        self.linked[slot as usize] = true;
    }

    fn push_cold(&mut self, slot: u32) {
        self.ensure_slot(slot);
        self.unlink(slot);
        self.next[slot as usize] = self.head;
        self.prev[slot as usize] = NIL;
        if self.head == NIL {
            self.tail = slot;
        } else {
            self.prev[self.head as usize] = slot;
        }
        self.head = slot;
        self.linked[slot as usize] = true;
    }

    fn pop_cold(&mut self) -> Option<u32> {
        let slot = self.head;
        if slot == NIL {
            return None;
        }
        self.unlink(slot);
        Some(slot)
    }

    fn len(&self) -> usize {
        self.linked.iter().filter(|&&l| l).count()
    }
}

pub struct NodeCache {
    page_size: usize,
    max_nodes: usize,
    nodes: Mutex<Vec<Arc<Node>>>,
    usage: Mutex<UsageList>,
    spares: Mutex<Vec<Box<[u8]>>>,
}

impl NodeCache {
    pub fn new(page_size: usize, max_nodes: usize) -> Self {
        Self {
            page_size,
            max_nodes: max_nodes.max(MIN_CACHE_SIZE),
            nodes: Mutex::new(Vec::new()),
            usage: Mutex::new(UsageList::new()),
            spares: Mutex::new(Vec::new()),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Allocates an exclusively latched node, evicting the LRU victim when
    /// the pool is full. The returned node is not in the usage list; the
    /// caller makes it evictable once it is safe to do so.
    pub(crate) fn alloc_latched(
        &self,
        store: &dyn PageStore,
    ) -> Result<(Arc<Node>, NodeWriteGuard)> {
        // A freed node sitting at the cold end is reused before the pool
        // grows; deleted nodes park there.
        let cold = {
            let mut usage = self.usage.lock();
            usage.pop_cold()
        };
        if let Some(slot) = cold {
            let node = {
                let nodes = self.nodes.lock();
                Arc::clone(&nodes[slot as usize])
            };
            if node.id() == 0 {
                if let Some(mut guard) = node.inner.try_write_arc() {
                    if node.id() == 0 && !node.has_frames() && guard.split.is_none() {
                        reset_node(&node, &mut guard);
                        return Ok((node, guard));
                    }
                    drop(guard);
                }
            }
            // Not reusable; restore its cold position.
            self.usage.lock().push_cold(slot);
        }

        {
            let mut nodes = self.nodes.lock();
            if nodes.len() < self.max_nodes {
                let slot = nodes.len() as u32;
                let node = Arc::new(Node::new(slot, self.page_size));
                nodes.push(Arc::clone(&node));
                let guard = node
                    .inner
                    .try_write_arc()
                    .expect("freshly created node is contended");
                return Ok((node, guard));
            }
        }

        let mut attempts = self.usage.lock().len();
        while attempts > 0 {
            attempts -= 1;

            let slot = {
                let mut usage = self.usage.lock();
                match usage.pop_cold() {
                    Some(s) => s,
                    None => break,
                }
            };
            let node = {
                let nodes = self.nodes.lock();
                Arc::clone(&nodes[slot as usize])
            };

            let Some(guard) = node.inner.try_write_arc() else {
                self.usage.lock().push_hot(slot);
                continue;
            };

            match evict(&node, guard, store) {
                Ok(Some((victim, mut vguard))) => {
                    if !Arc::ptr_eq(&victim, &node) {
                        // A deeper undo node was chosen; the original stays
                        // in rotation and the victim leaves the list.
                        self.usage.lock().push_hot(node.slot);
                        self.usage.lock().unlink(victim.slot);
                    }
                    reset_node(&victim, &mut vguard);
                    return Ok((victim, vguard));
                }
                Ok(None) => {
                    self.usage.lock().push_hot(slot);
                    continue;
                }
                Err(e) => {
                    self.usage.lock().push_hot(slot);
                    return Err(e);
                }
            }
        }

        log::warn!("node cache exhausted: all {} buffers busy", self.max_nodes);
        eyre::bail!(Error::CacheExhausted)
    }

    /// Records an access, moving the node to the hot end of the list.
    /// Nodes not in the list (roots, pinned siblings) are left out.
    pub(crate) fn used(&self, node: &Node) {
        let mut usage = self.usage.lock();
        usage.ensure_slot(node.slot);
        if usage.linked[node.slot as usize] {
            usage.push_hot(node.slot);
        }
    }

    pub(crate) fn make_evictable(&self, node: &Node) {
        self.usage.lock().push_hot(node.slot);
    }

    /// Parks a freed node at the cold end for immediate reuse.
    pub(crate) fn make_least_used(&self, node: &Node) {
        self.usage.lock().push_cold(node.slot);
    }

    pub(crate) fn make_unevictable(&self, node: &Node) {
        let mut usage = self.usage.lock();
        usage.ensure_slot(node.slot);
        usage.unlink(node.slot);
    }

    /// Takes a scratch page buffer for compaction.
    pub(crate) fn remove_spare_buffer(&self) -> Box<[u8]> {
        self.spares
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.page_size].into_boxed_slice())
    }

    /// Returns a scratch buffer. Callers must pair this with every
    /// `remove_spare_buffer` on all exit paths.
    pub(crate) fn add_spare_buffer(&self, buffer: Box<[u8]>) {
        debug_assert_eq!(buffer.len(), self.page_size);
        let mut spares = self.spares.lock();
        if spares.len() < 4 {
            spares.push(buffer);
        }
    }

    /// Snapshot of the pool for checkpoint scans.
    pub(crate) fn nodes_snapshot(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }
}

fn reset_node(node: &Node, inner: &mut NodeInner) {
    node.set_id(0);
    inner.typ = TYPE_NONE;
    inner.cached_state = CACHED_CLEAN;
    inner.child_nodes.clear();
    inner.split = None;
    node.clear_frames();
}

/// Evicts `node` or, for undo-log chains, a deeper node in its chain.
/// Returns the node whose buffer is now free, still exclusively latched,
/// or `None` when nothing could be evicted. The input guard is consumed.
fn evict(
    node: &Arc<Node>,
    guard: NodeWriteGuard,
    store: &dyn PageStore,
) -> Result<Option<(Arc<Node>, NodeWriteGuard)>> {
    if guard.typ != TYPE_UNDO_LOG {
        let mut guard = guard;
        return if evict_tree_node(node, &mut guard, store)? {
            Ok(Some((Arc::clone(node), guard)))
        } else {
            Ok(None)
        };
    }

    let mut current = Arc::clone(node);
    let mut guard = guard;
    loop {
        // Undo chains are written tail-first: prefer evicting the deeper
        // node before this one.
        let deeper = guard.child_nodes.first().and_then(|c| c.clone());
        if let Some(child) = deeper {
            let child_id = crate::node::child_id_at(
                &guard.page,
                crate::node::UNDO_LOWER_NODE_ID_OFFSET as i32,
            );
            // Quick id check short-circuits already-evicted children.
            if child_id == child.id() && child_id != 0 {
                match child.inner.try_write_arc() {
                    Some(child_guard) => {
                        if child_id == child.id() && child_guard.cached_state != CACHED_CLEAN {
                            // Evict the deeper node instead.
                            drop(guard);
                            current = child;
                            guard = child_guard;
                            continue;
                        }
                        drop(child_guard);
                    }
                    None => {
                        // Assume the child is in use and keep the chain.
                        return Ok(None);
                    }
                }
            }
        }
        do_evict(&current, &mut guard, store)?;
        return Ok(Some((current, guard)));
    }
}

/// Recursively evicts a tree node. Children still resident are evicted
/// first under try-latches; any contention abandons the whole attempt.
fn evict_tree_node(node: &Arc<Node>, inner: &mut NodeInner, store: &dyn PageStore) -> Result<bool> {
    if node.has_frames() || inner.split.is_some() {
        // In use by a cursor, or splitting. The split check is redundant:
        // a split node always has a cursor registered against it.
        return Ok(false);
    }

    if node.id() == STUB_ID {
        // A stub's lone child is the root (or another stub); it must not
        // be followed or the whole tree would be evicted.
        node.set_id(0);
        inner.child_nodes.clear();
        return Ok(true);
    }

    for i in 0..inner.child_nodes.len() {
        let Some(child) = inner.child_nodes[i].clone() else {
            continue;
        };
        let child_id = inner.child_ref_id_from_index(i);
        if child_id != child.id() {
            // Not our child; it was evicted already.
            inner.child_nodes[i] = None;
            continue;
        }
        match child.inner.try_write_arc() {
            Some(mut child_guard) => {
                if child_id == child.id() && !evict_tree_node(&child, &mut child_guard, store)? {
                    return Ok(false);
                }
                inner.child_nodes[i] = None;
            }
            None => {
                // Assume the child is in use; keep the parent too.
                return Ok(false);
            }
        }
    }

    do_evict(node, inner, store)?;
    Ok(true)
}

fn do_evict(node: &Arc<Node>, inner: &mut NodeInner, store: &dyn PageStore) -> Result<()> {
    if inner.cached_state != CACHED_CLEAN {
        log::trace!("evicting dirty node {}", node.id());
        inner.write_to_store(node, store)?;
        inner.cached_state = CACHED_CLEAN;
    }
    node.set_id(0);
    inner.typ = TYPE_NONE;
    inner.child_nodes.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemPageStore;

    fn store() -> MemPageStore {
        MemPageStore::new(512).unwrap()
    }

    #[test]
    fn alloc_grows_pool_to_capacity() {
        let cache = NodeCache::new(512, 16);
        let store = store();
        let mut held = Vec::new();
        for _ in 0..16 {
            let (node, guard) = cache.alloc_latched(&store).unwrap();
            held.push((node, guard));
        }
        assert_eq!(cache.node_count(), 16);
    }

    #[test]
    fn exhausted_pool_with_all_latched_fails() {
        let cache = NodeCache::new(512, 16);
        let store = store();
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(cache.alloc_latched(&store).unwrap());
        }
        // Everything is latched and nothing is evictable.
        let err = cache.alloc_latched(&store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CacheExhausted)
        ));
    }

    #[test]
    fn clean_unused_nodes_are_recycled() {
        let cache = NodeCache::new(512, 16);
        let store = store();
        for _ in 0..16 {
            let (node, guard) = cache.alloc_latched(&store).unwrap();
            drop(guard);
            cache.make_evictable(&node);
        }
        // Pool is full but every node is evictable.
        let (node, _guard) = cache.alloc_latched(&store).unwrap();
        assert_eq!(node.id(), 0);
        assert_eq!(cache.node_count(), 16);
    }

    #[test]
    fn dirty_victims_are_written_out() {
        let cache = NodeCache::new(512, 16);
        let store = store();
        let mut page_ids = Vec::new();
        for _ in 0..16 {
            let (node, mut guard) = cache.alloc_latched(&store).unwrap();
            let id = store.alloc_page().unwrap();
            node.set_id(id);
            guard.typ = crate::node::TYPE_TN_LEAF;
            guard.clear_entries();
            guard.cached_state = crate::node::CACHED_DIRTY_0;
            page_ids.push(id);
            drop(guard);
            cache.make_evictable(&node);
        }

        // Recycling forces a write of the victim.
        let _next = cache.alloc_latched(&store).unwrap();
        let mut buf = vec![0u8; 512];
        store.read_page(page_ids[0], &mut buf).unwrap();
        assert_eq!(buf[0], crate::node::TYPE_TN_LEAF);
    }

    #[test]
    fn spare_buffers_recycle() {
        let cache = NodeCache::new(512, 16);
        let buf = cache.remove_spare_buffer();
        assert_eq!(buf.len(), 512);
        cache.add_spare_buffer(buf);
        let again = cache.remove_spare_buffer();
        assert_eq!(again.len(), 512);
    }
}
