//! # Locker
//!
//! A scoped stack of acquired locks, owned by one transaction and safely
//! usable by one thread at a time. Locks are recorded in fixed-capacity
//! blocks chained into a stack; capacities double from 8 up to 64, the
//! limit imposed by the per-block upgrade bitmap. A set bitmap bit marks an
//! entry that exists because of a promotion rather than a fresh
//! acquisition, which changes how it may be released.
//!
//! Scopes are nested savepoints: `scope_enter` records the stack position,
//! `scope_exit` releases everything acquired since (upgraded entries
//! revert to upgradable rather than releasing), and `promote` merges the
//! current scope into its parent so its locks survive the boundary.
//!
//! The single-lock `unlock`/`unlock_to_shared`/`unlock_to_upgradable`
//! operations act on the most recent acquisition. As in the system this
//! design derives from, they do not accurately track scopes: an unlock may
//! cross a scope boundary, and doing so has undefined behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::deadlock::DeadlockDetector;
use super::{Lock, LockManager, LockMode, LockResult};
use crate::config::{FIRST_BLOCK_CAPACITY, HIGHEST_BLOCK_CAPACITY};
use crate::error::{Error, Result};

/// Shared-to-exclusive upgrade policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockUpgradeRule {
    /// Shared to exclusive is always illegal.
    #[default]
    Strict,
    /// Allowed when the requester is the sole shared holder.
    Lenient,
    /// Always attempted. Deadlock-prone when two shared holders upgrade.
    Unchecked,
}

/// Identity of a locker as seen by locks and the deadlock detector. Also
/// the handle through which a waiting locker can be interrupted from
/// another thread.
pub struct LockOwner {
    pub(crate) id: u64,
    waiting_for: Mutex<Option<Arc<Lock>>>,
    interrupted: AtomicBool,
}

impl LockOwner {
    pub(crate) fn waiting_for(&self) -> Option<Arc<Lock>> {
        self.waiting_for.lock().clone()
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Interrupts a pending lock wait; the waiter reports `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

struct Block {
    locks: Vec<Arc<Lock>>,
    upgrades: u64,
    cap: usize,
    prev: Option<Box<Block>>,
}

impl Block {
    fn new(prev: Option<Box<Block>>, prev_capacity: usize) -> Self {
        let cap = if prev_capacity == 0 {
            FIRST_BLOCK_CAPACITY
        } else {
            (prev_capacity * 2).min(HIGHEST_BLOCK_CAPACITY)
        };
        Self {
            locks: Vec::with_capacity(cap),
            upgrades: 0,
            cap,
            prev,
        }
    }

    fn full(&self) -> bool {
        self.locks.len() >= self.cap
    }
}

enum Tail {
    Empty,
    One(Arc<Lock>),
    Blocks(Box<Block>),
}

/// Savepoint: number of blocks below plus entries in the tail block at
/// scope entry. `(0, 0)` marks an empty stack, `(0, 1)` a single bare
/// lock.
#[derive(Clone, Copy, PartialEq, Eq)]
struct TailMark {
    depth: usize,
    size: usize,
}

struct ParentScope {
    parent: Option<Box<ParentScope>>,
    mark: TailMark,
}

pub struct Locker {
    manager: Arc<LockManager>,
    owner: Arc<LockOwner>,
    parent_scope: Option<Box<ParentScope>>,
    tail: Tail,
}

impl Locker {
    pub fn new(manager: Arc<LockManager>, id: u64) -> Self {
        Self {
            manager,
            owner: Arc::new(LockOwner {
                id,
                waiting_for: Mutex::new(None),
                interrupted: AtomicBool::new(false),
            }),
            parent_scope: None,
            tail: Tail::Empty,
        }
    }

    pub fn id(&self) -> u64 {
        self.owner.id
    }

    pub(crate) fn owner(&self) -> &Arc<LockOwner> {
        &self.owner
    }

    /// Handle for interrupting this locker's pending waits from another
    /// thread.
    pub fn owner_handle(&self) -> &Arc<LockOwner> {
        &self.owner
    }

    pub(crate) fn set_waiting_for(&self, lock: Option<Arc<Lock>>) {
        *self.owner.waiting_for.lock() = lock;
    }

    pub fn clear_waiting_for(&self) {
        self.set_waiting_for(None);
    }

    // ---- acquisition ---------------------------------------------------

    /// Acquires a shared lock, failing on timeout, interruption, or a
    /// detected deadlock.
    pub fn lock_shared(&mut self, index_id: u64, key: &[u8], nanos_timeout: i64) -> Result<LockResult> {
        self.lock(LockMode::Shared, index_id, key, nanos_timeout)
    }

    pub fn lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        self.lock(LockMode::Upgradable, index_id, key, nanos_timeout)
    }

    pub fn lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        self.lock(LockMode::Exclusive, index_id, key, nanos_timeout)
    }

    fn lock(
        &mut self,
        mode: LockMode,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        let result = self.try_lock(mode, index_id, key, nanos_timeout)?;
        if result.is_held() {
            return Ok(result);
        }
        Err(self.failed(result, nanos_timeout))
    }

    /// Try-variants return the result instead of failing, except that a
    /// deadlock found after a timed-out wait is still an error.
    pub fn try_lock_shared(
        &mut self,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        self.try_lock(LockMode::Shared, index_id, key, nanos_timeout)
    }

    pub fn try_lock_upgradable(
        &mut self,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        self.try_lock(LockMode::Upgradable, index_id, key, nanos_timeout)
    }

    pub fn try_lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        self.try_lock(LockMode::Exclusive, index_id, key, nanos_timeout)
    }

    fn try_lock(
        &mut self,
        mode: LockMode,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        let manager = Arc::clone(&self.manager);
        let (result, lock) = manager.try_lock(mode, self, index_id, key, nanos_timeout);
        if let Some(lock) = lock {
            self.push(lock, result == LockResult::Upgraded);
        }
        if result == LockResult::TimedOutLock && nanos_timeout != 0 {
            self.detect_deadlock(nanos_timeout)?;
        }
        Ok(result)
    }

    /// Deadlock detection runs only after a timed-out wait, keeping the
    /// common path cheap.
    fn detect_deadlock(&self, nanos_timeout: i64) -> Result<()> {
        let waiting_for = self.owner.waiting_for();
        let Some(lock) = waiting_for else {
            return Ok(());
        };
        let result = DeadlockDetector::new(Arc::clone(&self.owner)).scan(&lock);
        self.set_waiting_for(None);
        if let Some(info) = result {
            log::debug!("deadlock detected; guilty locker {}", info.guilty);
            eyre::bail!(Error::Deadlock(info));
        }
        let _ = nanos_timeout;
        Ok(())
    }

    fn failed(&self, result: LockResult, nanos_timeout: i64) -> eyre::Report {
        match result {
            LockResult::Illegal => eyre::Report::new(Error::IllegalUpgrade),
            LockResult::Interrupted => eyre::Report::new(Error::LockInterrupted),
            _ => eyre::Report::new(Error::LockTimeout(nanos_timeout.max(0) as u64)),
        }
    }

    // ---- the stack -----------------------------------------------------

    fn mark(&self) -> TailMark {
        match &self.tail {
            Tail::Empty => TailMark { depth: 0, size: 0 },
            Tail::One(_) => TailMark { depth: 0, size: 1 },
            Tail::Blocks(b) => TailMark {
                depth: block_depth(b),
                size: b.locks.len(),
            },
        }
    }

    pub(crate) fn push(&mut self, lock: Arc<Lock>, upgrade: bool) {
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => {
                if !upgrade {
                    self.tail = Tail::One(lock);
                } else {
                    let mut block = Block::new(None, 0);
                    block.locks.push(lock);
                    block.upgrades = 1;
                    self.tail = Tail::Blocks(Box::new(block));
                }
            }
            Tail::One(first) => {
                // An upgrade of the last acquisition in this scope is not
                // recorded again; unlock of the top entry depends on this.
                if upgrade && Arc::ptr_eq(&first, &lock) && self.parent_scope.is_none() {
                    self.tail = Tail::One(first);
                    return;
                }
                let mut block = Block::new(None, 0);
                block.locks.push(first);
                block.locks.push(lock);
                if upgrade {
                    block.upgrades = 0b10;
                }
                self.tail = Tail::Blocks(Box::new(block));
            }
            Tail::Blocks(mut block) => {
                let size = block.locks.len();
                let at_scope_boundary = self
                    .parent_scope
                    .as_ref()
                    .is_some_and(|p| p.mark.depth == block_depth(&block) && p.mark.size == size);
                if upgrade
                    && !at_scope_boundary
                    && block.locks.last().is_some_and(|l| Arc::ptr_eq(l, &lock))
                {
                    self.tail = Tail::Blocks(block);
                    return;
                }
                if block.full() {
                    // Chain a new block with doubled capacity, up to the
                    // bitmap limit.
                    let capacity = block.cap;
                    let mut next = Block::new(Some(block), capacity);
                    next.locks.push(lock);
                    if upgrade {
                        next.upgrades = 1;
                    }
                    self.tail = Tail::Blocks(Box::new(next));
                } else {
                    let idx = block.locks.len();
                    block.locks.push(lock);
                    if upgrade {
                        block.upgrades |= 1u64 << idx;
                    }
                    self.tail = Tail::Blocks(block);
                }
            }
        }
    }

    fn peek(&self) -> Result<&Arc<Lock>> {
        match &self.tail {
            Tail::Empty => eyre::bail!("no locks held"),
            Tail::One(lock) => Ok(lock),
            Tail::Blocks(block) => Ok(block.locks.last().expect("block is never empty")),
        }
    }

    /// Index id of the last lock acquired within the current scope.
    pub fn last_locked_index(&self) -> Result<u64> {
        Ok(self.peek()?.index_id)
    }

    /// Key of the last lock acquired within the current scope.
    pub fn last_locked_key(&self) -> Result<Vec<u8>> {
        Ok(self.peek()?.key.to_vec())
    }

    /// Fully releases the last lock acquired. Fails when it is held as a
    /// non-immediate upgrade, which cannot simply be discarded.
    pub fn unlock(&mut self) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => eyre::bail!("no locks held"),
            Tail::One(lock) => manager.unlock(self, &lock),
            Tail::Blocks(mut block) => {
                let idx = block.locks.len() - 1;
                if block.upgrades & (1u64 << idx) != 0 {
                    self.tail = Tail::Blocks(block);
                    eyre::bail!("cannot unlock non-immediate upgrade");
                }
                let lock = block.locks.pop().expect("block is never empty");
                self.tail = restore_tail(block);
                manager.unlock(self, &lock)
            }
        }
    }

    /// Releases the last lock down to shared mode.
    pub fn unlock_to_shared(&mut self) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        match &self.tail {
            Tail::Empty => eyre::bail!("no locks held"),
            Tail::One(lock) => {
                let lock = Arc::clone(lock);
                manager.unlock_to_shared(self, &lock);
                Ok(())
            }
            Tail::Blocks(block) => {
                let idx = block.locks.len() - 1;
                if block.upgrades & (1u64 << idx) != 0 {
                    eyre::bail!("cannot unlock non-immediate upgrade");
                }
                let lock = Arc::clone(&block.locks[idx]);
                manager.unlock_to_shared(self, &lock);
                Ok(())
            }
        }
    }

    /// Releases the last lock (or upgrade) down to upgradable mode; a
    /// recorded upgrade is popped from the stack.
    pub fn unlock_to_upgradable(&mut self) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        match std::mem::replace(&mut self.tail, Tail::Empty) {
            Tail::Empty => eyre::bail!("no locks held"),
            Tail::One(lock) => {
                manager.unlock_to_upgradable(self, &lock);
                self.tail = Tail::One(lock);
                Ok(())
            }
            Tail::Blocks(mut block) => {
                let idx = block.locks.len() - 1;
                let lock = Arc::clone(&block.locks[idx]);
                manager.unlock_to_upgradable(self, &lock);
                if block.upgrades & (1u64 << idx) != 0 {
                    block.locks.pop();
                    block.upgrades &= !(1u64 << idx);
                    self.tail = restore_tail(block);
                } else {
                    self.tail = Tail::Blocks(block);
                }
                Ok(())
            }
        }
    }

    // ---- scopes --------------------------------------------------------

    /// Opens a nested savepoint.
    pub fn scope_enter(&mut self) {
        let mark = self.mark();
        let parent = self.parent_scope.take();
        self.parent_scope = Some(Box::new(ParentScope { parent, mark }));
    }

    /// Merges every lock acquired in the current scope into the parent, so
    /// scope exit will retain them.
    pub fn promote(&mut self) {
        let mark = self.mark();
        if let Some(parent) = self.parent_scope.as_mut() {
            parent.mark = mark;
        }
    }

    /// Releases all locks acquired since the current scope was entered, or
    /// everything when no scope is active.
    pub fn scope_unlock_all(&mut self) -> Result<()> {
        let mark = self
            .parent_scope
            .as_ref()
            .map(|p| p.mark)
            .unwrap_or(TailMark { depth: 0, size: 0 });
        self.unlock_to_mark(mark)
    }

    fn unlock_to_mark(&mut self, mark: TailMark) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        loop {
            match std::mem::replace(&mut self.tail, Tail::Empty) {
                Tail::Empty => return Ok(()),
                Tail::One(lock) => {
                    if mark.depth == 0 && mark.size >= 1 {
                        self.tail = Tail::One(lock);
                        return Ok(());
                    }
                    manager.unlock(self, &lock)?;
                    return Ok(());
                }
                Tail::Blocks(mut block) => {
                    let depth = block_depth(&block);
                    // A savepoint taken over a single bare lock maps onto
                    // the first entry of the bottom block.
                    let target = if depth == mark.depth || (mark.depth == 0 && depth == 1) {
                        mark.size
                    } else {
                        0
                    };
                    while block.locks.len() > target {
                        let idx = block.locks.len() - 1;
                        let lock = block.locks.pop().expect("sized above");
                        if block.upgrades & (1u64 << idx) != 0 {
                            block.upgrades &= !(1u64 << idx);
                            manager.unlock_to_upgradable(self, &lock);
                        } else {
                            manager.unlock(self, &lock)?;
                        }
                    }
                    if block.locks.is_empty() {
                        match block.prev.take() {
                            Some(prev) => {
                                self.tail = Tail::Blocks(prev);
                                continue;
                            }
                            None => {
                                self.tail = Tail::Empty;
                                return Ok(());
                            }
                        }
                    }
                    self.tail = Tail::Blocks(block);
                    return Ok(());
                }
            }
        }
    }

    /// Exits the current scope, releasing all locks acquired inside it.
    pub fn scope_exit(&mut self) -> Result<()> {
        self.scope_unlock_all()?;
        self.parent_scope = self.parent_scope.take().and_then(|p| p.parent);
        Ok(())
    }

    /// Releases every lock and exits all scopes.
    pub fn scope_exit_all(&mut self) -> Result<()> {
        self.parent_scope = None;
        self.scope_unlock_all()?;
        self.tail = Tail::Empty;
        Ok(())
    }

    /// Clears ghost markers on every held lock, so rollback does not
    /// delete entries the undo log is about to restore.
    pub(crate) fn clear_all_ghosts(&mut self) {
        let manager = Arc::clone(&self.manager);
        let mut visit = |lock: &Arc<Lock>| manager.clear_ghost(lock);
        match &self.tail {
            Tail::Empty => {}
            Tail::One(lock) => visit(lock),
            Tail::Blocks(block) => {
                let mut b = Some(block);
                while let Some(cur) = b {
                    for lock in &cur.locks {
                        visit(lock);
                    }
                    b = cur.prev.as_ref();
                }
            }
        }
    }
}

fn block_depth(block: &Block) -> usize {
    let mut depth = 1;
    let mut prev = block.prev.as_ref();
    while let Some(b) = prev {
        depth += 1;
        prev = b.prev.as_ref();
    }
    depth
}

fn restore_tail(block: Box<Block>) -> Tail {
    if block.locks.is_empty() {
        match block.prev {
            Some(prev) => Tail::Blocks(prev),
            None => Tail::Empty,
        }
    } else {
        Tail::Blocks(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockResult;

    const T: i64 = 1_000_000_000;

    fn locker() -> Locker {
        Locker::new(Arc::new(LockManager::new(LockUpgradeRule::Strict)), 1)
    }

    #[test]
    fn unlock_releases_most_recent() {
        let mut a = locker();
        a.lock_shared(1, b"x", T).unwrap();
        a.lock_shared(1, b"y", T).unwrap();
        assert_eq!(a.last_locked_key().unwrap(), b"y");
        a.unlock().unwrap();
        assert_eq!(a.last_locked_key().unwrap(), b"x");
        a.unlock().unwrap();
        assert!(a.last_locked_key().is_err());
    }

    #[test]
    fn scope_exit_releases_inner_locks_only() {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Strict));
        let mut a = Locker::new(Arc::clone(&mgr), 1);

        a.lock_exclusive(1, b"outer", T).unwrap();
        a.scope_enter();
        a.lock_exclusive(1, b"inner", T).unwrap();
        a.scope_exit().unwrap();

        // Inner is free again, outer still held.
        let mut b = Locker::new(Arc::clone(&mgr), 2);
        assert_eq!(b.try_lock_exclusive(1, b"inner", 0).unwrap(), LockResult::Acquired);
        assert_eq!(
            b.try_lock_exclusive(1, b"outer", 0).unwrap(),
            LockResult::TimedOutLock
        );
        b.clear_waiting_for();
        b.scope_exit_all().unwrap();
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn scope_unlock_all_restores_entry_lock_set() {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Strict));
        let mut a = Locker::new(Arc::clone(&mgr), 1);

        for i in 0..10u8 {
            a.lock_shared(1, &[i], T).unwrap();
        }
        a.scope_enter();
        for i in 10..30u8 {
            a.lock_shared(1, &[i], T).unwrap();
        }
        a.scope_unlock_all().unwrap();

        // First ten still held, the rest released.
        let mut b = Locker::new(Arc::clone(&mgr), 2);
        for i in 0..10u8 {
            assert_eq!(
                b.try_lock_exclusive(1, &[i], 0).unwrap(),
                LockResult::TimedOutLock,
                "key {i} should still be held"
            );
            b.clear_waiting_for();
        }
        for i in 10..30u8 {
            assert_eq!(
                b.try_lock_exclusive(1, &[i], 0).unwrap(),
                LockResult::Acquired,
                "key {i} should be free"
            );
        }
        b.scope_exit_all().unwrap();
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn promote_retains_inner_locks_across_exit() {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Strict));
        let mut a = Locker::new(Arc::clone(&mgr), 1);

        a.scope_enter();
        a.lock_exclusive(1, b"kept", T).unwrap();
        a.promote();
        a.scope_exit().unwrap();

        let mut b = Locker::new(Arc::clone(&mgr), 2);
        assert_eq!(
            b.try_lock_exclusive(1, b"kept", 0).unwrap(),
            LockResult::TimedOutLock
        );
        b.clear_waiting_for();
        b.scope_exit_all().unwrap();
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn scope_exit_reverts_upgrade_to_upgradable() {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Strict));
        let mut a = Locker::new(Arc::clone(&mgr), 1);

        a.lock_upgradable(1, b"k", T).unwrap();
        a.scope_enter();
        assert_eq!(a.lock_exclusive(1, b"k", T).unwrap(), LockResult::Upgraded);
        a.scope_exit().unwrap();

        // Back to upgradable: other lockers can take shared.
        let mut b = Locker::new(Arc::clone(&mgr), 2);
        assert_eq!(b.try_lock_shared(1, b"k", 0).unwrap(), LockResult::Acquired);
        b.scope_exit_all().unwrap();
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn unlock_of_non_immediate_upgrade_fails() {
        let mut a = locker();
        a.lock_upgradable(1, b"k", T).unwrap();
        a.scope_enter();
        a.lock_exclusive(1, b"k", T).unwrap();
        a.lock_shared(1, b"z", T).unwrap();
        a.unlock().unwrap(); // releases z
        let err = a.unlock().unwrap_err();
        assert!(err.to_string().contains("non-immediate upgrade"));
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn block_stack_grows_past_first_capacity() {
        let mut a = locker();
        for i in 0..100u8 {
            a.lock_shared(1, &[0, i], T).unwrap();
        }
        for _ in 0..100 {
            a.unlock().unwrap();
        }
        assert!(a.last_locked_key().is_err());
    }
}
