//! # Undo Log
//!
//! Per-transaction log of pre-images, kept in a chain of `UNDO_LOG` nodes
//! written tail-first: the newest entries live in the top node, and each
//! node records the id of the next-deeper (older) node in its page. Undo
//! nodes are ordinary cache citizens: they are evictable, written out when
//! dirty, and re-faulted by id when rollback needs them again. Eviction
//! prefers the deeper node of a chain so the write order matches the link
//! order.
//!
//! ## Node Layout
//!
//! ```text
//! [0]     byte  node type (UNDO_LOG)
//! [1]     byte  reserved (0)
//! [2..4]  u16   top entry pointer (newest entry; page length when empty)
//! [4..12] u64   lower (deeper) node id; 0 when none
//! [12..]        free space, then entries packed toward the page end
//! ```
//!
//! Entry framing: `[op u8][varint tree id][varint len][payload]`. Rollback
//! walks entries newest-first within a node, then follows the lower link.

use std::sync::Arc;

use crate::db::Database;
use crate::encoding::{decode_varint, encode_varint, varint_len};
use crate::error::Result;
use crate::node::{put_child_id, Node, TYPE_UNDO_LOG, UNDO_HEADER_SIZE};

pub(crate) struct UndoLog {
    top: Option<Arc<Node>>,
    top_id: u64,
    entries: usize,
}

impl UndoLog {
    pub(crate) fn new() -> Self {
        Self {
            top: None,
            top_id: 0,
            entries: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Appends an entry; the newest entry is always popped first.
    pub(crate) fn push(&mut self, db: &Database, op: u8, tree_id: u64, payload: &[u8]) -> Result<()> {
        let entry_len = 1 + varint_len(tree_id) + varint_len(payload.len() as u64) + payload.len();

        let (node, mut guard) = match self.top.clone() {
            Some(node) if node.id() == self.top_id && self.top_id != 0 => {
                let guard = node.inner.write_arc();
                if node.id() == self.top_id && guard.typ == TYPE_UNDO_LOG {
                    (node, guard)
                } else {
                    // Recycled from under us; fault it back in.
                    drop(guard);
                    db.fetch_node(self.top_id)?
                }
            }
            Some(_) => db.fetch_node(self.top_id)?,
            None => {
                let pair = self.push_new_node(db, 0)?;
                self.top = Some(Arc::clone(&pair.0));
                self.top_id = pair.0.id();
                pair
            }
        };

        let top_ptr = guard.garbage;
        if top_ptr - (entry_len as i32) < UNDO_HEADER_SIZE as i32 {
            // No room; chain a new top node above this one.
            drop(guard);
            let (new_node, new_guard) = self.push_new_node(db, self.top_id)?;
            self.top = Some(Arc::clone(&new_node));
            self.top_id = new_node.id();
            let mut guard = new_guard;
            self.write_entry(&mut guard, op, tree_id, payload, entry_len);
            guard.cached_state = db.commit_state();
            drop(guard);
            db.make_evictable(&new_node);
            self.entries += 1;
            return Ok(());
        }

        self.write_entry(&mut guard, op, tree_id, payload, entry_len);
        guard.cached_state = db.commit_state();
        drop(guard);
        db.used(&node);
        self.entries += 1;
        Ok(())
    }

    fn write_entry(
        &self,
        guard: &mut crate::node::NodeInner,
        op: u8,
        tree_id: u64,
        payload: &[u8],
        entry_len: usize,
    ) {
        let start = (guard.garbage as usize) - entry_len;
        let page = &mut guard.page;
        let mut loc = start;
        page[loc] = op;
        loc += 1;
        loc += encode_varint(tree_id, &mut page[loc..]);
        loc += encode_varint(payload.len() as u64, &mut page[loc..]);
        page[loc..loc + payload.len()].copy_from_slice(payload);
        guard.garbage = start as i32;
    }

    fn push_new_node(
        &self,
        db: &Database,
        lower_id: u64,
    ) -> Result<(Arc<Node>, crate::node::NodeWriteGuard)> {
        let (node, mut guard) = db.alloc_undo_node()?;
        guard.typ = TYPE_UNDO_LOG;
        // The top pointer must fit a u16, so the last two page bytes are
        // never used, even on the largest page size.
        let end = guard.page.len() as i32 - 2;
        guard.garbage = end;
        guard.page[0] = TYPE_UNDO_LOG;
        guard.page[1] = 0;
        put_child_id(&mut guard.page, 4, lower_id);
        // Keep the chain walkable for eviction preference.
        guard.child_nodes.clear();
        if let Some(top) = &self.top {
            guard.child_nodes.push(Some(Arc::clone(top)));
        }
        Ok((node, guard))
    }

    /// Pops every entry, newest first, through `apply`, then frees the
    /// chain.
    pub(crate) fn rollback(
        &mut self,
        db: &Database,
        mut apply: impl FnMut(u8, u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut id = self.top_id;
        let mut node = self.top.take();

        while id != 0 {
            let (n, mut guard) = match node.take() {
                Some(n) if n.id() == id => {
                    let g = n.inner.write_arc();
                    if n.id() == id && g.typ == TYPE_UNDO_LOG {
                        (n, g)
                    } else {
                        drop(g);
                        db.fetch_node(id)?
                    }
                }
                _ => db.fetch_node(id)?,
            };

            let end = guard.page.len() - 2;
            let mut loc = guard.garbage as usize;
            while loc < end {
                let op = guard.page[loc];
                let mut p = loc + 1;
                let (tree_id, n1) = decode_varint(&guard.page[p..])?;
                p += n1;
                let (len, n2) = decode_varint(&guard.page[p..])?;
                p += n2;
                let payload = guard.page[p..p + len as usize].to_vec();
                apply(op, tree_id, &payload)?;
                loc = p + len as usize;
            }

            let lower = crate::node::child_id_at(&guard.page, 4);
            db.delete_node(&n, &mut guard)?;
            id = lower;
        }

        self.top_id = 0;
        self.entries = 0;
        Ok(())
    }

    /// Discards the chain without applying, freeing its pages.
    pub(crate) fn truncate(&mut self, db: &Database) -> Result<()> {
        self.rollback(db, |_, _, _| Ok(()))
    }
}
