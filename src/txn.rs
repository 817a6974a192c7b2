//! # Transactions
//!
//! A thin transaction object over the engine's real machinery: a
//! [`Locker`] carrying the scoped lock stack, the page-chained undo log,
//! the fragmented trash, and redo capture. Mutations made through a
//! transaction acquire exclusive row locks held to the end; reads take
//! shared locks whose lifetime depends on the lock mode.
//!
//! Commit writes the redo commit record, frees trashed fragment pages,
//! truncates the undo log, and releases every lock; ghosted entries are
//! physically deleted as their exclusive locks are released. Rollback
//! replays the undo log newest-first, clears ghost markers (the restored
//! entries must survive), and then releases the locks.

use std::sync::Arc;

use crate::db::Database;
use crate::error::Result;
use crate::lock::Locker;
use crate::node::{decode_key_at, decode_leaf_value_at, ValueRef};
use crate::undo::UndoLog;

/// How long read locks are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Shared locks are released as soon as the value is read.
    #[default]
    ReadCommitted,
    /// Shared locks are held to the end of the transaction.
    RepeatableRead,
    /// No read locks at all; sees latched-in values only.
    Unsafe,
}

/// Undo record kinds. The payload of `Insert` and `Update` is a full
/// encoded leaf entry (key and value, fragmented bit intact); `Delete`
/// carries just the key of an entry that did not exist before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOp {
    Insert,
    Update,
    Delete,
}

impl UndoOp {
    fn code(self) -> u8 {
        match self {
            UndoOp::Insert => 1,
            UndoOp::Update => 2,
            UndoOp::Delete => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => UndoOp::Insert,
            2 => UndoOp::Update,
            3 => UndoOp::Delete,
            other => eyre::bail!("unknown undo op {}", other),
        })
    }
}

pub struct Transaction {
    db: Arc<Database>,
    id: u64,
    locker: Locker,
    lock_mode: LockMode,
    lock_timeout_nanos: i64,
    undo: UndoLog,
    trash: Vec<(u64, Vec<u8>, Vec<u8>)>,
    redo_ops: usize,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(db: Arc<Database>, id: u64, locker: Locker) -> Self {
        let lock_timeout_nanos = db.lock_timeout_nanos() as i64;
        Self {
            db,
            id,
            locker,
            lock_mode: LockMode::default(),
            lock_timeout_nanos,
            undo: UndoLog::new(),
            trash: Vec::new(),
            redo_ops: 0,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    pub fn lock_timeout_nanos(&self) -> i64 {
        self.lock_timeout_nanos
    }

    pub fn set_lock_timeout_nanos(&mut self, nanos: i64) {
        self.lock_timeout_nanos = nanos;
    }

    pub fn locker(&mut self) -> &mut Locker {
        &mut self.locker
    }

    /// Opens a nested scope; exiting releases the locks acquired inside.
    pub fn enter(&mut self) {
        self.locker.scope_enter();
    }

    pub fn exit(&mut self) -> Result<()> {
        self.locker.scope_exit()
    }

    // ---- hooks used by the node layer ----------------------------------

    pub(crate) fn undo_store(&mut self, tree_id: u64, op: UndoOp, entry: &[u8]) -> Result<()> {
        self.undo.push(&self.db, op.code(), tree_id, entry)
    }

    /// Records that `key` did not exist, so rollback deletes it.
    pub(crate) fn undo_delete_key(&mut self, tree_id: u64, key: &[u8]) -> Result<()> {
        self.undo
            .push(&self.db, UndoOp::Delete.code(), tree_id, key)
    }

    pub(crate) fn trash_fragmented(&mut self, tree_id: u64, key: &[u8], desc: Vec<u8>) {
        self.trash.push((tree_id, key.to_vec(), desc));
    }

    pub(crate) fn redo_store(&mut self, tree_id: u64, key: &[u8], value: &[u8]) {
        self.redo_ops += 1;
        self.db.redo_txn_store(self.id, tree_id, key, Some(value));
    }

    pub(crate) fn redo_delete(&mut self, tree_id: u64, key: &[u8]) {
        self.redo_ops += 1;
        self.db.redo_txn_store(self.id, tree_id, key, None);
    }

    // ---- outcome -------------------------------------------------------

    /// Commits: the redo stream is finalized, trashed fragment pages are
    /// freed, the undo log is discarded, and all locks are released.
    /// Ghosted entries are deleted during lock release, while each
    /// exclusive lock is still held.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if self.redo_ops > 0 {
            self.db.redo_txn_commit(self.id);
        }

        for (_, _, desc) in self.trash.drain(..) {
            self.db.delete_fragments(&desc)?;
        }
        if !self.undo.is_empty() {
            self.undo.truncate(&self.db)?;
        }
        self.locker.scope_exit_all()
    }

    /// Rolls back: the undo log restores every pre-image, ghost markers
    /// are cleared so the restored entries survive, and locks release.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<()> {
        if self.redo_ops > 0 {
            self.db.redo_txn_rollback(self.id);
        }
        self.locker.clear_all_ghosts();
        self.trash.clear();

        let db = Arc::clone(&self.db);
        let mut undo = std::mem::replace(&mut self.undo, UndoLog::new());
        undo.rollback(&db, |code, tree_id, payload| {
            let tree = db.open_or_create_tree(tree_id)?;
            match UndoOp::from_code(code)? {
                UndoOp::Insert | UndoOp::Update => {
                    let (key, fragmented, value) = decode_undo_entry(payload)?;
                    tree.undo_restore(&key, fragmented, &value)
                }
                UndoOp::Delete => tree.undo_remove(payload),
            }
        })?;

        self.locker.scope_exit_all()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            // An abandoned transaction rolls back.
            if let Err(e) = self.rollback_in_place() {
                log::error!("implicit rollback failed: {e}");
            }
        }
    }
}

/// Splits an undo payload (a full encoded leaf entry) into its key, the
/// fragmented flag, and the raw value bytes.
pub(crate) fn decode_undo_entry(entry: &[u8]) -> Result<(Vec<u8>, u8, Vec<u8>)> {
    let (key_len, key_start) = decode_key_at(entry, 0);
    let key = entry[key_start..key_start + key_len].to_vec();
    match decode_leaf_value_at(entry, key_start + key_len) {
        ValueRef::Ghost => Ok((key, 0, Vec::new())),
        ValueRef::Plain(v) => Ok((key, 0, v.to_vec())),
        ValueRef::Fragmented(d) => Ok((key, crate::node::VALUE_FRAGMENTED, d.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_ops_roundtrip_codes() {
        for op in [UndoOp::Insert, UndoOp::Update, UndoOp::Delete] {
            assert_eq!(UndoOp::from_code(op.code()).unwrap(), op);
        }
        assert!(UndoOp::from_code(99).is_err());
    }

    #[test]
    fn undo_entry_decodes_key_and_value() {
        let mut entry = vec![0u8; 64];
        crate::node::copy_to_leaf_entry(&mut entry, b"key", 0, b"value", 0);
        let (key, fragmented, value) = decode_undo_entry(&entry).unwrap();
        assert_eq!(key, b"key");
        assert_eq!(fragmented, 0);
        assert_eq!(value, b"value");
    }

    #[test]
    fn undo_entry_preserves_fragmented_bit() {
        let mut entry = vec![0u8; 64];
        let desc = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        crate::node::copy_to_leaf_entry(
            &mut entry,
            b"key",
            crate::node::VALUE_FRAGMENTED,
            &desc,
            0,
        );
        let (_, fragmented, value) = decode_undo_entry(&entry).unwrap();
        assert_eq!(fragmented, crate::node::VALUE_FRAGMENTED);
        assert_eq!(value, &desc[..]);
    }
}
