//! # Tree
//!
//! A handle to one B+ tree: its pinned root node, the stub stack left by
//! root collapses, and the per-tree size limits derived from the page
//! size. The root node object is never evicted and never replaced; root
//! splits and collapses rewrite its content in place so cursors and child
//! tables stay valid.
//!
//! Operations without an explicit transaction run inside an internal
//! auto-commit transaction, so locking, undo, ghosts, and redo behave
//! identically either way.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::cursor::TreeCursor;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::node::{
    compare_keys_at, key_length_at, leaf_entry_length_at, u16le, Node, NodeInner,
};
use crate::txn::{LockMode, Transaction};

pub struct Tree {
    db: Weak<Database>,
    id: u64,
    root: Arc<Node>,
    /// Stubs from root collapses, newest last. A stub keeps stale cursor
    /// frames coherent until they unbind.
    stubs: Mutex<Vec<Arc<Node>>>,
    max_key_size: usize,
    max_entry_size: usize,
}

impl Tree {
    pub(crate) fn new(db: &Arc<Database>, id: u64, root: Arc<Node>) -> Arc<Self> {
        let page_size = db.page_size();
        Arc::new(Self {
            db: Arc::downgrade(db),
            id,
            root,
            stubs: Mutex::new(Vec::new()),
            max_key_size: crate::config::max_key_size(page_size),
            max_entry_size: crate::config::max_entry_size(page_size),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    pub(crate) fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub(crate) fn add_stub(&self, stub: &Arc<Node>) {
        self.stubs.lock().push(Arc::clone(stub));
    }

    pub(crate) fn pop_stub(&self) -> Option<Arc<Node>> {
        self.stubs.lock().pop()
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.db
            .upgrade()
            .ok_or_else(|| eyre::Report::new(Error::ClosedIndex))
    }

    /// Opens a traversal cursor. Cursor reads take no row locks.
    pub fn cursor(self: &Arc<Self>) -> Result<TreeCursor> {
        Ok(TreeCursor::new(self.db()?, Arc::clone(self)))
    }

    /// Loads the value for `key` under the transaction's lock mode, or
    /// with a short-lived shared lock when no transaction is given.
    ///
    /// The leaf position is fixed first under a shared latch and a
    /// zero-timeout lock attempt is made; only if that fails is the latch
    /// released for a blocking wait, after which the bound frame
    /// revalidates the position.
    pub fn load(self: &Arc<Self>, txn: Option<&mut Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db()?;
        db.check_poisoned()?;

        let mut cursor = TreeCursor::new(Arc::clone(&db), Arc::clone(self));
        let guard = cursor.find_bind(key)?;

        match txn {
            None => {
                let mut locker = db.new_locker();
                let r = locker.try_lock_shared(self.id, key, 0)?;
                if !r.is_held() {
                    locker.clear_waiting_for();
                    drop(guard);
                    locker.lock_shared(self.id, key, db.lock_timeout_nanos() as i64)?;
                    let value = cursor.value();
                    locker.scope_exit_all()?;
                    return value;
                }
                drop(guard);
                let value = cursor.value();
                locker.scope_exit_all()?;
                value
            }
            Some(txn) => {
                if txn.lock_mode() == LockMode::Unsafe {
                    drop(guard);
                    return cursor.value();
                }
                let timeout = txn.lock_timeout_nanos();
                let mode = txn.lock_mode();
                let locker = txn.locker();
                let r = locker.try_lock_shared(self.id, key, 0)?;
                let r = if r.is_held() {
                    r
                } else {
                    locker.clear_waiting_for();
                    drop(guard);
                    locker.lock_shared(self.id, key, timeout)?
                };
                let value = cursor.value();
                if r.is_acquired() && mode == LockMode::ReadCommitted {
                    locker.unlock()?;
                }
                value
            }
        }
    }

    /// Stores `value` under `key`, overwriting any existing value.
    pub fn store(self: &Arc<Self>, txn: Option<&mut Transaction>, key: &[u8], value: &[u8]) -> Result<()> {
        self.exchange(txn, key, Some(value)).map(|_| ())
    }

    /// Inserts only when `key` is absent (or ghosted). Returns false when
    /// an existing value was left untouched.
    pub fn insert(self: &Arc<Self>, txn: Option<&mut Transaction>, key: &[u8], value: &[u8]) -> Result<bool> {
        self.modify(txn, key, Some(value), ModifyCond::IfAbsent)
            .map(|old| old.is_none())
    }

    /// Replaces only when `key` is present. Returns false when absent.
    pub fn replace(self: &Arc<Self>, txn: Option<&mut Transaction>, key: &[u8], value: &[u8]) -> Result<bool> {
        self.modify(txn, key, Some(value), ModifyCond::IfPresent)
            .map(|old| old.is_some())
    }

    /// Stores and returns the previous value.
    pub fn exchange(
        self: &Arc<Self>,
        txn: Option<&mut Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        self.modify(txn, key, value, ModifyCond::Always)
    }

    /// Deletes `key`, returning true when a value was removed.
    pub fn delete(self: &Arc<Self>, txn: Option<&mut Transaction>, key: &[u8]) -> Result<bool> {
        self.modify(txn, key, None, ModifyCond::Always)
            .map(|old| old.is_some())
    }

    fn modify(
        self: &Arc<Self>,
        txn: Option<&mut Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
        cond: ModifyCond,
    ) -> Result<Option<Vec<u8>>> {
        let db = self.db()?;
        db.check_poisoned()?;

        match txn {
            Some(txn) => self.modify_in(&db, txn, key, value, cond),
            None => {
                // Auto-commit inside an internal transaction, so undo,
                // ghosts, and redo work uniformly.
                let mut txn = db.begin()?;
                let result = self.modify_in(&db, &mut txn, key, value, cond);
                match result {
                    Ok(old) => {
                        txn.commit()?;
                        Ok(old)
                    }
                    Err(e) => {
                        let _ = txn.rollback();
                        Err(e)
                    }
                }
            }
        }
    }

    fn modify_in(
        self: &Arc<Self>,
        db: &Arc<Database>,
        txn: &mut Transaction,
        key: &[u8],
        value: Option<&[u8]>,
        cond: ModifyCond,
    ) -> Result<Option<Vec<u8>>> {
        eyre::ensure!(
            key.len() <= self.max_key_size,
            Error::KeyTooLarge(key.len())
        );

        let lock_timeout_nanos = txn.lock_timeout_nanos();
        txn.locker()
            .lock_exclusive(self.id, key, lock_timeout_nanos)?;

        // Every mutation holds the commit latch shared; checkpoint takes
        // it exclusive to quiesce structural changes.
        let _commit = db.commit_latch_shared();

        let mut cursor = TreeCursor::new(Arc::clone(db), Arc::clone(self));

        if cond != ModifyCond::Always {
            let current = cursor.find(key)?;
            match cond {
                ModifyCond::IfAbsent if current.is_some() => return Ok(current),
                ModifyCond::IfPresent if current.is_none() => return Ok(None),
                _ => {}
            }
        }

        let old = cursor.store(Some(txn), key, value)?;
        match value {
            Some(v) => txn.redo_store(self.id, key, v),
            None => {
                // Transactional deletes record redo inside the ghost path;
                // nothing to add when the key was absent.
            }
        }
        Ok(old)
    }

    /// Physically deletes the ghosted entry for `key`. Invoked by lock
    /// release at commit while the exclusive row lock is still held.
    pub(crate) fn delete_ghost(self: &Arc<Self>, key: &[u8]) -> Result<()> {
        let db = self.db()?;
        let _commit = db.commit_latch_shared();
        let mut cursor = TreeCursor::new(Arc::clone(&db), Arc::clone(self));
        cursor.delete_ghost(key)
    }

    /// Restores an entry from an undo pre-image.
    pub(crate) fn undo_restore(self: &Arc<Self>, key: &[u8], fragmented: u8, value: &[u8]) -> Result<()> {
        let db = self.db()?;
        let _commit = db.commit_latch_shared();
        let mut cursor = TreeCursor::new(Arc::clone(&db), Arc::clone(self));
        cursor.store_physical(key, fragmented, value)
    }

    /// Removes an entry inserted by a rolled-back transaction.
    pub(crate) fn undo_remove(self: &Arc<Self>, key: &[u8]) -> Result<()> {
        let db = self.db()?;
        let _commit = db.commit_latch_shared();
        let mut cursor = TreeCursor::new(Arc::clone(&db), Arc::clone(self));
        cursor.store(None, key, None).map(|_| ())
    }

    /// Walks the whole tree verifying structural invariants: header
    /// bounds, key order, separator bounds, child counts, duplicate child
    /// ids, and the garbage accounting. The first violation is reported as
    /// a corrupt page.
    pub fn verify(self: &Arc<Self>) -> Result<()> {
        let db = self.db()?;
        let root = Arc::clone(&self.root);
        let guard = root.inner.read_arc();
        self.verify_node(&db, &root, &guard, None, None)
    }

    fn verify_node(
        self: &Arc<Self>,
        db: &Arc<Database>,
        node: &Arc<Node>,
        inner: &NodeInner,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<()> {
        let id = node.id();
        let fail = |detail: String| -> eyre::Report {
            eyre::Report::new(Error::CorruptPage { id, detail })
        };

        let page_len = inner.page.len() as i32;
        if inner.left_seg_tail < crate::config::TN_HEADER_SIZE as i32
            || inner.search_vec_start < inner.left_seg_tail
            || inner.search_vec_end < inner.search_vec_start - 2
            || inner.right_seg_tail < inner.search_vec_end
            || inner.right_seg_tail > page_len - 1
        {
            return Err(fail(format!(
                "segment bounds: left={} vec={}..{} right={}",
                inner.left_seg_tail,
                inner.search_vec_start,
                inner.search_vec_end,
                inner.right_seg_tail
            )));
        }
        let mut used = crate::config::TN_HEADER_SIZE as i32 + inner.right_seg_tail + 1
            - inner.left_seg_tail;

        if !inner.is_leaf() {
            if inner.num_keys() + 1 != inner.child_nodes.len() as i32 {
                return Err(fail(format!(
                    "child table: {} entries for {} keys",
                    inner.child_nodes.len(),
                    inner.num_keys()
                )));
            }
            let mut seen = Vec::new();
            for i in 0..=inner.num_keys() as usize {
                let child_id = inner.child_ref_id_from_index(i);
                if child_id <= 1 {
                    return Err(fail(format!("illegal child id {}", child_id)));
                }
                if seen.contains(&child_id) {
                    return Err(fail(format!("duplicate child id {}", child_id)));
                }
                seen.push(child_id);
            }
        }

        let mut pos = inner.search_vec_start;
        let mut prev_loc: Option<i32> = None;
        while pos <= inner.search_vec_end {
            let loc = u16le(&inner.page, pos);
            if loc < crate::config::TN_HEADER_SIZE as i32
                || loc >= page_len
                || (loc >= inner.left_seg_tail && loc <= inner.right_seg_tail)
            {
                return Err(fail(format!("entry location {}", loc)));
            }

            used += if inner.is_leaf() {
                leaf_entry_length_at(&inner.page, loc)
            } else {
                key_length_at(&inner.page, loc)
            };

            if let Some(prev) = prev_loc {
                if compare_keys_at(&inner.page, prev, loc).is_ge() {
                    return Err(fail("key order inversion".to_string()));
                }
            }
            prev_loc = Some(loc);

            // Separator bounds from the parent.
            let key = inner.retrieve_key(pos - inner.search_vec_start);
            if let Some(low) = low {
                if crate::encoding::compare_keys(&key, low).is_lt() {
                    return Err(fail("key below low separator".to_string()));
                }
            }
            if let Some(high) = high {
                if crate::encoding::compare_keys(&key, high).is_ge() {
                    return Err(fail("key at or above high separator".to_string()));
                }
            }

            pos += 2;
        }

        if !inner.is_leaf() {
            used += (inner.num_keys() + 1) * 8;
        }

        let garbage = page_len - used;
        if inner.garbage != garbage {
            return Err(fail(format!(
                "garbage accounting: {} != {}",
                inner.garbage, garbage
            )));
        }

        if !inner.is_leaf() {
            for i in 0..=inner.num_keys() {
                let child_pos = i << 1;
                let low_bound = if i == 0 {
                    low.map(|l| l.to_vec())
                } else {
                    Some(inner.retrieve_key(child_pos - 2))
                };
                let high_bound = if i == inner.num_keys() {
                    high.map(|h| h.to_vec())
                } else {
                    Some(inner.retrieve_key(child_pos))
                };

                let child_id = inner.child_ref_id(child_pos);
                let (child, child_guard) = db.fetch_or_cached_child(self, inner, child_pos, child_id)?;
                self.verify_node(
                    db,
                    &child,
                    &child_guard,
                    low_bound.as_deref(),
                    high_bound.as_deref(),
                )?;
            }
        }

        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum ModifyCond {
    Always,
    IfAbsent,
    IfPresent,
}
