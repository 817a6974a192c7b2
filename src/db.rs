//! # Database Handle
//!
//! The single engine handle that every operation threads through: the page
//! store, the node cache, the lock manager, the commit latch, the dirty
//! generation bit, the poison flag, and the open-tree registry. There is
//! no global mutable state anywhere else.
//!
//! ## Copy-on-write dirtying
//!
//! A node is mutated only after `mark_dirty`: if its cached state already
//! matches the current generation nothing happens; otherwise a fresh page
//! id is allocated, the old id is released, and the caller updates the
//! parent's stored child id. The root keeps its object identity, so only
//! its page id moves.
//!
//! ## Checkpoint
//!
//! `checkpoint()` takes the commit latch exclusively, which waits out
//! every in-flight mutation (writers hold it shared), flips the dirty
//! generation bit, and releases the latch; nodes still carrying the old
//! generation are then written and the store synced, while new mutations
//! dirty pages into the new generation concurrently.
//!
//! ## Poisoning
//!
//! Invariant violations deliberately leak the latches involved (a damaged
//! page must never be evicted or written) and set the poison flag; every
//! entry point then refuses further work.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::cache::NodeCache;
use crate::config::{DEFAULT_CACHE_SIZE, DEFAULT_LOCK_TIMEOUT_NANOS, DEFAULT_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::lock::{LockManager, LockUpgradeRule, Locker};
use crate::node::{
    Node, NodeInner, NodeWriteGuard, TreeCx, CACHED_CLEAN, CACHED_DIRTY_0, CACHED_DIRTY_1,
    TYPE_NONE,
};
use crate::redo::{RedoLog, SharedRedoLog};
use crate::storage::{MemPageStore, PageStore};
use crate::tree::Tree;
use crate::txn::Transaction;

pub struct DatabaseBuilder {
    page_size: usize,
    cache_size: usize,
    lock_timeout_nanos: u64,
    upgrade_rule: LockUpgradeRule,
    capture_redo: bool,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            lock_timeout_nanos: DEFAULT_LOCK_TIMEOUT_NANOS,
            upgrade_rule: LockUpgradeRule::default(),
            capture_redo: false,
        }
    }
}

impl DatabaseBuilder {
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn cache_size(mut self, nodes: usize) -> Self {
        self.cache_size = nodes;
        self
    }

    pub fn lock_timeout_nanos(mut self, nanos: u64) -> Self {
        self.lock_timeout_nanos = nanos;
        self
    }

    pub fn lock_upgrade_rule(mut self, rule: LockUpgradeRule) -> Self {
        self.upgrade_rule = rule;
        self
    }

    /// Captures committed operations into an in-memory redo log,
    /// retrievable with [`Database::redo_log`].
    pub fn capture_redo(mut self, capture: bool) -> Self {
        self.capture_redo = capture;
        self
    }

    /// Opens against a fresh in-memory page store.
    pub fn open_memory(self) -> Result<Arc<Database>> {
        let store = Arc::new(MemPageStore::new(self.page_size)?);
        self.open(store)
    }

    pub fn open(self, store: Arc<dyn PageStore>) -> Result<Arc<Database>> {
        eyre::ensure!(
            store.page_size() == self.page_size,
            "store page size {} does not match configured {}",
            store.page_size(),
            self.page_size
        );
        let db = Arc::new(Database {
            store: Arc::clone(&store),
            cache: NodeCache::new(self.page_size, self.cache_size),
            lock_manager: Arc::new(LockManager::new(self.upgrade_rule)),
            commit_latch: RwLock::new(()),
            commit_state: AtomicU8::new(CACHED_DIRTY_0),
            poisoned: AtomicBool::new(false),
            poison_reason: Mutex::new(""),
            trees: Mutex::new(hashbrown::HashMap::new()),
            next_tree_id: AtomicU64::new(1),
            next_txn_id: AtomicU64::new(1),
            next_locker_id: AtomicU64::new(1),
            lock_timeout_nanos: self.lock_timeout_nanos,
            redo: self
                .capture_redo
                .then(|| Arc::new(Mutex::new(RedoLog::new()))),
        });
        log::debug!(
            "opened database: page_size={} cache={} nodes",
            self.page_size,
            db.cache.max_nodes()
        );
        Ok(db)
    }
}

pub struct Database {
    store: Arc<dyn PageStore>,
    cache: NodeCache,
    lock_manager: Arc<LockManager>,
    /// Held shared by every mutation, exclusive by checkpoint.
    commit_latch: RwLock<()>,
    /// Current dirty generation: alternates between the two dirty states.
    commit_state: AtomicU8,
    poisoned: AtomicBool,
    poison_reason: Mutex<&'static str>,
    trees: Mutex<hashbrown::HashMap<u64, Arc<Tree>>>,
    next_tree_id: AtomicU64,
    next_txn_id: AtomicU64,
    next_locker_id: AtomicU64,
    lock_timeout_nanos: u64,
    redo: Option<SharedRedoLog>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn lock_timeout_nanos(&self) -> u64 {
        self.lock_timeout_nanos
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    // ---- poison --------------------------------------------------------

    pub fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            eyre::bail!(Error::Poisoned(*self.poison_reason.lock()));
        }
        Ok(())
    }

    /// Records an invariant violation and returns the error to surface.
    /// Callers that hold latches over damaged state leak them via
    /// [`Database::poison_on`] so the damage cannot be persisted.
    pub(crate) fn poison(&self, reason: &'static str) -> eyre::Report {
        log::error!("engine poisoned: {reason}");
        *self.poison_reason.lock() = reason;
        self.poisoned.store(true, Ordering::Release);
        eyre::Report::new(Error::Poisoned(reason))
    }

    /// If `e` is a poison error, the guard is leaked: the latch stays held
    /// forever so the damaged page can neither be evicted nor written.
    pub(crate) fn poison_on(&self, e: eyre::Report, guard: NodeWriteGuard) -> eyre::Report {
        if matches!(e.downcast_ref::<Error>(), Some(Error::Poisoned(_))) {
            std::mem::forget(guard);
        }
        e
    }

    // ---- trees ---------------------------------------------------------

    /// Creates a new empty tree with a fresh id.
    pub fn create_tree(self: &Arc<Self>) -> Result<Arc<Tree>> {
        let id = self.next_tree_id.fetch_add(1, Ordering::AcqRel);
        self.open_or_create_tree(id)
    }

    /// Returns the open tree with this id, creating it if needed.
    pub fn open_or_create_tree(self: &Arc<Self>, id: u64) -> Result<Arc<Tree>> {
        let mut trees = self.trees.lock();
        if let Some(tree) = trees.get(&id) {
            return Ok(Arc::clone(tree));
        }

        // Root nodes never join the usage list, so they cannot be evicted.
        let (root, mut guard) = self.cache.alloc_latched(&*self.store)?;
        guard.as_empty_root(&root);
        drop(guard);

        let tree = Tree::new(self, id, root);
        trees.insert(id, Arc::clone(&tree));
        // Keep the id allocator ahead of explicitly created ids.
        self.next_tree_id.fetch_max(id + 1, Ordering::AcqRel);
        Ok(tree)
    }

    pub fn open_tree(self: &Arc<Self>, id: u64) -> Option<Arc<Tree>> {
        self.trees.lock().get(&id).cloned()
    }

    // ---- transactions --------------------------------------------------

    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        self.check_poisoned()?;
        let id = self.next_txn_id.fetch_add(1, Ordering::AcqRel);
        let locker = self.new_locker();
        Ok(Transaction::new(Arc::clone(self), id, locker))
    }

    pub fn new_locker(self: &Arc<Self>) -> Locker {
        let id = self.next_locker_id.fetch_add(1, Ordering::AcqRel);
        Locker::new(Arc::clone(&self.lock_manager), id)
    }

    // ---- commit latch and generations ----------------------------------

    pub(crate) fn commit_latch_shared(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.commit_latch.read()
    }

    #[inline]
    pub(crate) fn commit_state(&self) -> u8 {
        self.commit_state.load(Ordering::Acquire)
    }

    /// Flips the dirty generation under the exclusive commit latch, then
    /// writes out the previous generation and syncs the store.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_poisoned()?;

        let old_state = {
            let _exclusive = self.commit_latch.write();
            // Flipping bit 0 switches generations.
            self.commit_state.fetch_xor(1, Ordering::AcqRel)
        };

        let mut written = 0usize;
        for node in self.cache.nodes_snapshot() {
            let mut guard = node.inner.write_arc();
            if guard.cached_state == old_state && node.id() > 1 {
                guard.write_to_store(&node, &*self.store)?;
                guard.cached_state = CACHED_CLEAN;
                written += 1;
            }
        }
        self.store.sync(true)?;
        log::debug!("checkpoint wrote {written} pages");
        Ok(())
    }

    /// Writes every dirty node regardless of generation and syncs. The
    /// exclusive commit latch quiesces in-flight mutations, so no pending
    /// split can be caught mid-write.
    pub fn flush(&self) -> Result<()> {
        self.check_poisoned()?;
        let _exclusive = self.commit_latch.write();
        for node in self.cache.nodes_snapshot() {
            let mut guard = node.inner.write_arc();
            if matches!(guard.cached_state, CACHED_DIRTY_0 | CACHED_DIRTY_1) && node.id() > 1 {
                guard.write_to_store(&node, &*self.store)?;
                guard.cached_state = CACHED_CLEAN;
            }
        }
        self.store.sync(true)
    }

    // ---- node lifecycle ------------------------------------------------

    /// Marks a node dirty in the current generation, assigning it a fresh
    /// page id copy-on-write. Returns true when the id changed, in which
    /// case the caller must update the parent's stored child id.
    pub(crate) fn mark_dirty(
        &self,
        _tree: &Tree,
        node: &Arc<Node>,
        inner: &mut NodeInner,
    ) -> Result<bool> {
        let state = self.commit_state();
        if inner.cached_state == state && node.id() != 0 {
            return Ok(false);
        }

        // A node still dirty from the previous generation must reach the
        // store under its old id before that id is released.
        if inner.cached_state != CACHED_CLEAN && inner.cached_state != state && node.id() > 1 {
            inner.write_to_store(node, &*self.store)?;
        }

        let new_id = self.store.alloc_page()?;
        let old_id = node.id();
        node.set_id(new_id);
        inner.cached_state = state;
        if old_id > 1 {
            self.store.delete_page(old_id)?;
        }
        Ok(true)
    }

    /// Writes a previous-generation node before its page is deleted, so a
    /// checkpoint in progress keeps its snapshot.
    pub(crate) fn prepare_to_delete(&self, node: &Arc<Node>, inner: &mut NodeInner) -> Result<()> {
        let state = self.commit_state();
        if inner.cached_state != CACHED_CLEAN && inner.cached_state != state && node.id() > 1 {
            inner.write_to_store(node, &*self.store)?;
        }
        Ok(())
    }

    /// Frees a node's page and resets the object for quick reuse.
    pub(crate) fn delete_node(&self, node: &Arc<Node>, inner: &mut NodeInner) -> Result<()> {
        let id = node.id();
        node.set_id(0);
        inner.typ = TYPE_NONE;
        inner.cached_state = CACHED_CLEAN;
        inner.child_nodes.clear();
        node.clear_frames();
        if id > 1 {
            self.store.delete_page(id)?;
        }
        self.cache.make_least_used(node);
        Ok(())
    }

    pub(crate) fn delete_page_id(&self, id: u64) -> Result<()> {
        if id > 1 {
            self.store.delete_page(id)?;
        }
        Ok(())
    }

    /// Allocates a dirty node with a fresh page id, in the usage list.
    pub(crate) fn alloc_dirty_node(&self, _tree: &Tree) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let (node, mut guard) = self.cache.alloc_latched(&*self.store)?;
        let id = self.store.alloc_page()?;
        node.set_id(id);
        guard.cached_state = self.commit_state();
        self.cache.make_evictable(&node);
        Ok((node, guard))
    }

    /// Allocates a dirty node pinned out of the usage list; the caller
    /// makes it evictable once it is linked into its parent.
    pub(crate) fn alloc_unevictable_node(
        &self,
        _tree: &Tree,
    ) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let (node, mut guard) = self.cache.alloc_latched(&*self.store)?;
        let id = self.store.alloc_page()?;
        node.set_id(id);
        guard.cached_state = self.commit_state();
        Ok((node, guard))
    }

    /// Allocates a dirty node for the undo log, evictable from the start.
    pub(crate) fn alloc_undo_node(&self) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let (node, mut guard) = self.cache.alloc_latched(&*self.store)?;
        let id = self.store.alloc_page()?;
        node.set_id(id);
        guard.cached_state = self.commit_state();
        self.cache.make_evictable(&node);
        Ok((node, guard))
    }

    /// Faults an arbitrary page into a fresh node, exclusively latched.
    pub(crate) fn fetch_node(&self, id: u64) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let (node, mut guard) = self.cache.alloc_latched(&*self.store)?;
        if let Err(e) = self.read_into(&node, &mut guard, id) {
            node.set_id(0);
            guard.typ = TYPE_NONE;
            return Err(e);
        }
        self.cache.make_evictable(&node);
        Ok((node, guard))
    }

    fn read_into(&self, node: &Arc<Node>, guard: &mut NodeInner, id: u64) -> Result<()> {
        self.store.read_page(id, &mut guard.page)?;
        guard.read_from_page(node, id)?;
        guard.cached_state = CACHED_CLEAN;
        Ok(())
    }

    /// Allocates and registers a child node in the parent's child table
    /// without performing I/O, so the parent latch can be released before
    /// the page read.
    pub(crate) fn load_child_registered(
        &self,
        _tree: &Tree,
        parent: &mut NodeInner,
        child_pos: i32,
        child_id: u64,
    ) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let (node, guard) = self.cache.alloc_latched(&*self.store)?;
        node.set_id(child_id);
        let idx = (child_pos >> 1) as usize;
        parent.child_nodes[idx] = Some(Arc::clone(&node));
        Ok((node, guard))
    }

    /// Reads the registered child's page. On failure the child is reset so
    /// another thread treats it as evicted and reloads.
    pub(crate) fn load_child_read(
        &self,
        node: &Arc<Node>,
        guard: &mut NodeInner,
        child_id: u64,
    ) -> Result<()> {
        if let Err(e) = self.read_into(node, guard, child_id) {
            node.set_id(0);
            guard.typ = TYPE_NONE;
            return Err(e);
        }
        Ok(())
    }

    /// Latches the child at `child_pos` exclusively, loading it if needed.
    /// The parent stays latched throughout; mutation paths need it
    /// immediately afterward to record dirtied child ids.
    pub(crate) fn latch_child_exclusive(
        &self,
        tree: &Tree,
        parent: &mut NodeInner,
        child_pos: i32,
    ) -> Result<(Arc<Node>, NodeWriteGuard)> {
        let child_id = parent.child_ref_id(child_pos);
        if let Some(child) = parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .cloned()
            .flatten()
        {
            if child.id() == child_id {
                let guard = child.inner.write_arc();
                if child.id() == child_id {
                    self.cache.used(&child);
                    return Ok((child, guard));
                }
            }
        }

        let (child, mut guard) = self.load_child_registered(tree, parent, child_pos, child_id)?;
        self.load_child_read(&child, &mut guard, child_id)?;
        self.cache.make_evictable(&child);
        self.cache.used(&child);
        Ok((child, guard))
    }

    /// Non-blocking child latch for rebalance: never waits and never
    /// descends into a split child. Loads an unloaded child, keeping the
    /// parent latched.
    pub(crate) fn try_latch_child_not_split(
        &self,
        cx: &TreeCx<'_>,
        parent: &mut NodeInner,
        child_pos: i32,
    ) -> Result<Option<(Arc<Node>, NodeWriteGuard)>> {
        let child_id = parent.child_ref_id(child_pos);
        if let Some(child) = parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .cloned()
            .flatten()
        {
            if child.id() == child_id {
                let Some(guard) = child.inner.try_write_arc() else {
                    return Ok(None);
                };
                // Check again in case eviction snuck in.
                if child.id() != child_id || guard.split.is_some() {
                    return Ok(None);
                }
                // The LRU position is left alone: this access was not user
                // requested.
                return Ok(Some((child, guard)));
            }
        }

        let (child, mut guard) =
            self.load_child_registered(cx.tree, parent, child_pos, child_id)?;
        self.load_child_read(&child, &mut guard, child_id)?;
        self.cache.make_evictable(&child);
        Ok(Some((child, guard)))
    }

    /// Read-only child access for verification: uses the cached child when
    /// current, otherwise faults a transient copy.
    pub(crate) fn fetch_or_cached_child(
        &self,
        _tree: &Arc<Tree>,
        parent: &NodeInner,
        child_pos: i32,
        child_id: u64,
    ) -> Result<(Arc<Node>, crate::node::NodeReadGuard)> {
        if let Some(child) = parent
            .child_nodes
            .get((child_pos >> 1) as usize)
            .cloned()
            .flatten()
        {
            if child.id() == child_id {
                let guard = child.inner.read_arc();
                if child.id() == child_id {
                    return Ok((child, guard));
                }
            }
        }
        let (node, guard) = self.fetch_node(child_id)?;
        Ok((
            node,
            parking_lot::lock_api::ArcRwLockWriteGuard::downgrade(guard),
        ))
    }

    // ---- cache forwarding ----------------------------------------------

    pub(crate) fn used(&self, node: &Node) {
        self.cache.used(node);
    }

    pub(crate) fn make_evictable(&self, node: &Node) {
        self.cache.make_evictable(node);
    }

    pub(crate) fn remove_spare_buffer(&self) -> Box<[u8]> {
        self.cache.remove_spare_buffer()
    }

    pub(crate) fn add_spare_buffer(&self, buffer: Box<[u8]>) {
        self.cache.add_spare_buffer(buffer);
    }

    // ---- fragments -----------------------------------------------------

    pub(crate) fn fragment_value(&self, value: &[u8], max_desc_len: i32) -> Result<Vec<u8>> {
        crate::fragment::fragment_value(&*self.store, value, max_desc_len)
    }

    pub(crate) fn reconstruct_fragments(&self, desc: &[u8]) -> Result<Vec<u8>> {
        crate::fragment::reconstruct(&*self.store, desc)
    }

    pub(crate) fn delete_fragments(&self, desc: &[u8]) -> Result<()> {
        crate::fragment::delete_fragments(&*self.store, desc)
    }

    // ---- redo ----------------------------------------------------------

    /// The captured redo log, when capture was enabled.
    pub fn redo_log(&self) -> Option<SharedRedoLog> {
        self.redo.clone()
    }

    pub(crate) fn redo_txn_store(&self, txn_id: u64, tree_id: u64, key: &[u8], value: Option<&[u8]>) {
        if let Some(redo) = &self.redo {
            redo.lock().txn_store(txn_id, tree_id, key, value);
        }
    }

    pub(crate) fn redo_txn_commit(&self, txn_id: u64) {
        if let Some(redo) = &self.redo {
            redo.lock().txn_commit_final(txn_id);
        }
    }

    pub(crate) fn redo_txn_rollback(&self, txn_id: u64) {
        if let Some(redo) = &self.redo {
            redo.lock().txn_rollback_final(txn_id);
        }
    }
}
