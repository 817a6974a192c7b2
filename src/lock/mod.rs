//! # Lock Manager
//!
//! Row locks keyed by `(index_id, key)`, spread over a fixed power-of-two
//! set of partitions. The partition is chosen from a scramble hash of the
//! index id and key bytes; each partition owns a map from key to lock
//! entry, and every lock carries its own state mutex and condvar so waits
//! never block an entire partition.
//!
//! ## Modes
//!
//! | held \ request | Shared       | Upgradable      | Exclusive      |
//! |----------------|--------------|-----------------|----------------|
//! | none           | Acquired     | Acquired        | Acquired       |
//! | OwnedShared    | OwnedShared  | Illegal         | Illegal*       |
//! | OwnedUpgradable| OwnedUpgradable | OwnedUpgradable | Upgraded    |
//! | OwnedExclusive | OwnedExclusive | OwnedExclusive | OwnedExclusive |
//!
//! *subject to the configured [`LockUpgradeRule`].
//!
//! An exclusive acquisition runs in two phases: first the owner role is
//! taken (queueing with other upgradable/exclusive requests), then the
//! shared holders are drained. Waiter queues are FIFO and segregated by
//! mode so exclusive requests cannot starve behind a stream of shared
//! ones: a queued upgradable/exclusive waiter blocks new shared grants.
//!
//! Timeouts are per-call in nanoseconds: negative waits forever, zero
//! never waits. A timed-out waiter leaves its locker's `waiting_for`
//! pointing at the lock so the deadlock detector can scan the wait-for
//! graph; the caller clears it after the scan.

pub(crate) mod deadlock;
pub(crate) mod locker;

pub use locker::{LockOwner, LockUpgradeRule, Locker};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::LOCK_TABLE_PARTITIONS;
use crate::tree::Tree;

/// Requested access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

/// Outcome of a lock attempt. The `Owned*` variants mean the locker
/// already held a strong enough lock and nothing new must be unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    Upgraded,
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    TimedOutLock,
    Interrupted,
    Illegal,
}

impl LockResult {
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    /// True for a fresh acquisition that must eventually be unlocked.
    pub fn is_acquired(self) -> bool {
        matches!(self, LockResult::Acquired | LockResult::Upgraded)
    }
}

/// Scrambles `(index_id, key)` into the hash that selects a partition and
/// a map bucket.
pub(crate) fn lock_hash(index_id: u64, key: &[u8]) -> u64 {
    let mut h = index_id.wrapping_mul(0x9E37_79B1);
    for &b in key {
        h = (h ^ b as u64).wrapping_mul(0x0100_0000_01b3);
        h ^= h >> 29;
    }
    h ^ (h >> 17)
}

struct Waiter {
    owner: Arc<LockOwner>,
    mode: LockMode,
    granted: bool,
}

pub(crate) struct LockState {
    /// Present while the lock is registered in its partition map; a stale
    /// `Arc` fetched during removal must retry through the map.
    pub(crate) in_map: bool,
    /// Upgradable or exclusive holder.
    pub(crate) owner: Option<Arc<LockOwner>>,
    pub(crate) exclusive: bool,
    /// The owner is draining shared holders for an upgrade; new shared
    /// requests must queue or the upgrade starves.
    upgrading: bool,
    pub(crate) shared_owners: SmallVec<[Arc<LockOwner>; 4]>,
    /// FIFO queue of upgradable and exclusive requests.
    queue_u: VecDeque<Arc<Mutex<Waiter>>>,
    /// FIFO queue of shared requests.
    queue_s: VecDeque<Arc<Mutex<Waiter>>>,
    /// Tree whose ghosted entry must be deleted when the exclusive lock is
    /// finally released by its owning transaction.
    pub(crate) ghost: Option<Arc<Tree>>,
}

pub struct Lock {
    pub(crate) index_id: u64,
    pub(crate) key: Box<[u8]>,
    pub(crate) hash: u64,
    pub(crate) state: Mutex<LockState>,
    pub(crate) cond: Condvar,
}

impl Lock {
    fn new(index_id: u64, key: &[u8], hash: u64) -> Self {
        Self {
            index_id,
            key: key.into(),
            hash,
            state: Mutex::new(LockState {
                in_map: true,
                owner: None,
                exclusive: false,
                upgrading: false,
                shared_owners: SmallVec::new(),
                queue_u: VecDeque::new(),
                queue_s: VecDeque::new(),
                ghost: None,
            }),
            cond: Condvar::new(),
        }
    }
}

struct Partition {
    locks: HashMap<(u64, Box<[u8]>), Arc<Lock>>,
}

pub struct LockManager {
    partitions: Box<[Mutex<Partition>]>,
    pub(crate) upgrade_rule: LockUpgradeRule,
}

impl LockManager {
    pub fn new(upgrade_rule: LockUpgradeRule) -> Self {
        let partitions = (0..LOCK_TABLE_PARTITIONS)
            .map(|_| {
                Mutex::new(Partition {
                    locks: HashMap::new(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            partitions,
            upgrade_rule,
        }
    }

    fn partition(&self, hash: u64) -> &Mutex<Partition> {
        &self.partitions[(hash as usize) & (LOCK_TABLE_PARTITIONS - 1)]
    }

    fn get_or_insert(&self, index_id: u64, key: &[u8], hash: u64) -> Arc<Lock> {
        let mut part = self.partition(hash).lock();
        part.locks
            .entry((index_id, key.into()))
            .or_insert_with(|| Arc::new(Lock::new(index_id, key, hash)))
            .clone()
    }

    /// Removes the lock from its partition when unowned and unawaited.
    fn try_retire(&self, lock: &Arc<Lock>) {
        let mut part = self.partition(lock.hash).lock();
        let mut state = lock.state.lock();
        if state.owner.is_none()
            && state.shared_owners.is_empty()
            && state.queue_u.is_empty()
            && state.queue_s.is_empty()
        {
            state.in_map = false;
            drop(state);
            part.locks.remove(&(lock.index_id, lock.key.clone()));
        }
    }

    /// Attempts a lock in the given mode. `nanos_timeout < 0` waits
    /// forever; `0` never waits.
    pub(crate) fn try_lock(
        &self,
        mode: LockMode,
        locker: &Locker,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> (LockResult, Option<Arc<Lock>>) {
        let hash = lock_hash(index_id, key);
        loop {
            let lock = self.get_or_insert(index_id, key, hash);
            let (result, retired) = self.try_lock_on(mode, locker, &lock, nanos_timeout);
            if retired {
                // The entry was pulled from the map mid-acquire; retry
                // through the map.
                continue;
            }
            let lock = result.is_acquired().then_some(lock);
            return (result, lock);
        }
    }

    /// Core acquire on a resolved lock entry. The boolean result demands a
    /// retry from the partition map.
    fn try_lock_on(
        &self,
        mode: LockMode,
        locker: &Locker,
        lock: &Arc<Lock>,
        nanos_timeout: i64,
    ) -> (LockResult, bool) {
        let me = locker.owner();
        let mut state = lock.state.lock();
        if !state.in_map {
            return (LockResult::Acquired, true);
        }

        // Already-owned checks are mode-independent up front.
        let owns_sx = state
            .owner
            .as_ref()
            .is_some_and(|o| Arc::ptr_eq(o, me));
        let owns_shared = state.shared_owners.iter().any(|o| Arc::ptr_eq(o, me));

        match mode {
            LockMode::Shared => {
                if owns_sx {
                    return (
                        if state.exclusive {
                            LockResult::OwnedExclusive
                        } else {
                            LockResult::OwnedUpgradable
                        },
                        false,
                    );
                }
                if owns_shared {
                    return (LockResult::OwnedShared, false);
                }
                // Grantable unless an exclusive holder exists, an upgrade
                // is draining, or an upgradable/exclusive waiter is queued
                // ahead.
                if !(state.exclusive && state.owner.is_some())
                    && !state.upgrading
                    && state.queue_u.is_empty()
                {
                    state.shared_owners.push(Arc::clone(me));
                    return (LockResult::Acquired, false);
                }
                self.wait(lock, state, locker, LockMode::Shared, nanos_timeout)
            }
            LockMode::Upgradable => {
                if owns_sx {
                    return (
                        if state.exclusive {
                            LockResult::OwnedExclusive
                        } else {
                            LockResult::OwnedUpgradable
                        },
                        false,
                    );
                }
                if owns_shared {
                    return (LockResult::Illegal, false);
                }
                if state.owner.is_none() && state.queue_u.is_empty() {
                    state.owner = Some(Arc::clone(me));
                    state.exclusive = false;
                    return (LockResult::Acquired, false);
                }
                self.wait(lock, state, locker, LockMode::Upgradable, nanos_timeout)
            }
            LockMode::Exclusive => {
                if owns_sx && state.exclusive {
                    return (LockResult::OwnedExclusive, false);
                }
                if owns_shared && !owns_sx {
                    // Shared-to-exclusive is governed by the upgrade rule.
                    let allowed = match self.upgrade_rule {
                        LockUpgradeRule::Strict => false,
                        LockUpgradeRule::Lenient => state.shared_owners.len() == 1,
                        LockUpgradeRule::Unchecked => true,
                    };
                    if !allowed {
                        return (LockResult::Illegal, false);
                    }
                    if state.owner.is_none() && state.queue_u.is_empty() {
                        state.shared_owners.retain(|o| !Arc::ptr_eq(o, me));
                        state.owner = Some(Arc::clone(me));
                        state.exclusive = false;
                        // Fall through to drain remaining shared holders.
                    } else {
                        let (r, retry) =
                            self.wait(lock, state, locker, LockMode::Upgradable, nanos_timeout);
                        if !r.is_held() || retry {
                            return (r, retry);
                        }
                        let mut state = lock.state.lock();
                        state.shared_owners.retain(|o| !Arc::ptr_eq(o, me));
                        drop(state);
                        return self.finish_exclusive(lock, locker, nanos_timeout, true, true);
                    }
                    drop(state);
                    return self.finish_exclusive(lock, locker, nanos_timeout, true, true);
                }

                if !owns_sx {
                    // Phase one: take the owner role.
                    if state.owner.is_none() && state.queue_u.is_empty() {
                        state.owner = Some(Arc::clone(me));
                        state.exclusive = false;
                    } else {
                        let (r, retry) =
                            self.wait(lock, state, locker, LockMode::Upgradable, nanos_timeout);
                        if !r.is_held() || retry {
                            return (r, retry);
                        }
                        return self.finish_exclusive(lock, locker, nanos_timeout, false, true);
                    }
                    drop(state);
                    return self.finish_exclusive(lock, locker, nanos_timeout, false, true);
                }

                // Owned upgradable: upgrade in place. The upgradable hold
                // survives a failed upgrade.
                drop(state);
                let (r, retry) = self.finish_exclusive(lock, locker, nanos_timeout, false, false);
                match r {
                    LockResult::Acquired => (LockResult::Upgraded, retry),
                    other => (other, retry),
                }
            }
        }
    }

    /// Phase two of an exclusive acquisition: the caller holds the owner
    /// role; wait until the shared holders drain, then set the exclusive
    /// bit. On timeout or interruption a freshly acquired owner role is
    /// released (and a demoted shared hold restored, for the upgrade-rule
    /// path) so nothing leaks.
    fn finish_exclusive(
        &self,
        lock: &Arc<Lock>,
        locker: &Locker,
        nanos_timeout: i64,
        restore_shared: bool,
        fresh_owner: bool,
    ) -> (LockResult, bool) {
        let me = locker.owner();
        let deadline = deadline_for(nanos_timeout);

        let mut state = lock.state.lock();
        state.upgrading = true;
        loop {
            debug_assert!(state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)));
            if state.shared_owners.is_empty() {
                state.upgrading = false;
                state.exclusive = true;
                return (
                    if restore_shared {
                        LockResult::Upgraded
                    } else {
                        LockResult::Acquired
                    },
                    false,
                );
            }
            if me.interrupted() {
                state.upgrading = false;
                self.abandon_owner_role(lock, &mut state, me, restore_shared, fresh_owner);
                return (LockResult::Interrupted, false);
            }
            match wait_step(lock, &mut state, deadline, nanos_timeout) {
                WaitStep::Continue => {}
                WaitStep::TimedOut => {
                    state.upgrading = false;
                    self.abandon_owner_role(lock, &mut state, me, restore_shared, fresh_owner);
                    locker.set_waiting_for(Some(Arc::clone(lock)));
                    return (LockResult::TimedOutLock, false);
                }
            }
        }
    }

    fn abandon_owner_role(
        &self,
        lock: &Lock,
        state: &mut LockState,
        me: &Arc<LockOwner>,
        restore_shared: bool,
        fresh_owner: bool,
    ) {
        if fresh_owner {
            state.owner = None;
            state.exclusive = false;
            if restore_shared {
                state.shared_owners.push(Arc::clone(me));
            }
            self.grant_waiters(lock, state);
        }
    }

    /// Queues the locker and waits to be granted.
    fn wait(
        &self,
        lock: &Arc<Lock>,
        mut state: parking_lot::MutexGuard<'_, LockState>,
        locker: &Locker,
        queue_mode: LockMode,
        nanos_timeout: i64,
    ) -> (LockResult, bool) {
        if nanos_timeout == 0 {
            locker.set_waiting_for(Some(Arc::clone(lock)));
            return (LockResult::TimedOutLock, false);
        }

        let me = locker.owner();
        let waiter = Arc::new(Mutex::new(Waiter {
            owner: Arc::clone(me),
            mode: queue_mode,
            granted: false,
        }));
        if queue_mode == LockMode::Shared {
            state.queue_s.push_back(Arc::clone(&waiter));
        } else {
            state.queue_u.push_back(Arc::clone(&waiter));
        }

        let deadline = deadline_for(nanos_timeout);

        loop {
            if waiter.lock().granted {
                // Ownership was transferred by the releasing thread.
                return (LockResult::Acquired, false);
            }
            if me.interrupted() {
                remove_waiter(&mut state, &waiter);
                return (LockResult::Interrupted, false);
            }
            match wait_step(lock, &mut state, deadline, nanos_timeout) {
                WaitStep::Continue => {}
                WaitStep::TimedOut => {
                    if waiter.lock().granted {
                        return (LockResult::Acquired, false);
                    }
                    remove_waiter(&mut state, &waiter);
                    locker.set_waiting_for(Some(Arc::clone(lock)));
                    return (LockResult::TimedOutLock, false);
                }
            }
        }
    }

    /// Grants queued waiters after a release. Caller holds the state lock.
    fn grant_waiters(&self, lock: &Lock, state: &mut LockState) {
        // Head of the upgradable/exclusive queue first.
        if state.owner.is_none() {
            if let Some(w) = state.queue_u.pop_front() {
                let mut waiter = w.lock();
                state.owner = Some(Arc::clone(&waiter.owner));
                state.exclusive = false;
                waiter.granted = true;
            }
        }
        // Shared requests drain whenever no exclusive holder remains, no
        // upgrade is draining, and no exclusive waiter is queued ahead.
        if !(state.exclusive && state.owner.is_some())
            && !state.upgrading
            && state.queue_u.is_empty()
        {
            while let Some(w) = state.queue_s.pop_front() {
                let mut waiter = w.lock();
                state.shared_owners.push(Arc::clone(&waiter.owner));
                waiter.granted = true;
            }
        }
        lock.cond.notify_all();
    }

    /// Fully releases the locker's hold on the lock, deleting a ghosted
    /// entry first when this is the final exclusive release.
    pub(crate) fn unlock(&self, locker: &Locker, lock: &Arc<Lock>) -> crate::error::Result<()> {
        let me = locker.owner();

        // A ghost is deleted while the exclusive lock is still held.
        let ghost = {
            let mut state = lock.state.lock();
            if state.exclusive && state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
                state.ghost.take()
            } else {
                None
            }
        };
        if let Some(tree) = ghost {
            tree.delete_ghost(&lock.key)?;
        }

        let mut state = lock.state.lock();
        if state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
            state.owner = None;
            state.exclusive = false;
        } else {
            state.shared_owners.retain(|o| !Arc::ptr_eq(o, me));
        }
        self.grant_waiters(lock, &mut state);
        drop(state);
        self.try_retire(lock);
        Ok(())
    }

    /// Demotes the locker's hold to shared.
    pub(crate) fn unlock_to_shared(&self, locker: &Locker, lock: &Arc<Lock>) {
        let me = locker.owner();
        let mut state = lock.state.lock();
        if state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
            state.owner = None;
            state.exclusive = false;
            state.ghost = None;
            state.shared_owners.push(Arc::clone(me));
        }
        self.grant_waiters(lock, &mut state);
    }

    /// Demotes an exclusive hold to upgradable.
    pub(crate) fn unlock_to_upgradable(&self, locker: &Locker, lock: &Arc<Lock>) {
        let me = locker.owner();
        let mut state = lock.state.lock();
        if state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
            state.exclusive = false;
            state.ghost = None;
        }
        self.grant_waiters(lock, &mut state);
    }

    /// Marks the lock's entry as ghosted: when the owning transaction
    /// finally releases the exclusive lock, the entry is deleted from
    /// `tree`.
    pub(crate) fn ghosted(&self, locker: &Locker, tree: &Arc<Tree>, key: &[u8]) {
        let hash = lock_hash(tree.id(), key);
        let lock = self.get_or_insert(tree.id(), key, hash);
        let me = locker.owner();
        let mut state = lock.state.lock();
        if state.exclusive && state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
            state.ghost = Some(Arc::clone(tree));
        }
    }

    /// Clears a pending ghost without deleting it; rollback restores the
    /// entry through the undo log instead.
    pub(crate) fn clear_ghost(&self, lock: &Arc<Lock>) {
        lock.state.lock().ghost = None;
    }

    /// Reports the strongest mode the locker holds on `(index_id, key)`.
    pub fn check(&self, locker: &Locker, index_id: u64, key: &[u8]) -> Option<LockResult> {
        let hash = lock_hash(index_id, key);
        let part = self.partition(hash).lock();
        let lock = part.locks.get(&(index_id, key.into()))?;
        let me = locker.owner();
        let state = lock.state.lock();
        if state.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, me)) {
            Some(if state.exclusive {
                LockResult::OwnedExclusive
            } else {
                LockResult::OwnedUpgradable
            })
        } else if state.shared_owners.iter().any(|o| Arc::ptr_eq(o, me)) {
            Some(LockResult::OwnedShared)
        } else {
            None
        }
    }
}

enum WaitStep {
    Continue,
    TimedOut,
}

fn deadline_for(nanos_timeout: i64) -> Option<Instant> {
    if nanos_timeout < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_nanos(nanos_timeout as u64))
    }
}

fn wait_step(
    lock: &Lock,
    state: &mut parking_lot::MutexGuard<'_, LockState>,
    deadline: Option<Instant>,
    _nanos_timeout: i64,
) -> WaitStep {
    match deadline {
        None => {
            // Periodic wakeups keep interruption responsive.
            let _ = lock.cond.wait_for(state, Duration::from_millis(100));
            WaitStep::Continue
        }
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return WaitStep::TimedOut;
            }
            let step = (deadline - now).min(Duration::from_millis(100));
            let _ = lock.cond.wait_for(state, step);
            WaitStep::Continue
        }
    }
}

fn remove_waiter(state: &mut LockState, waiter: &Arc<Mutex<Waiter>>) {
    state.queue_u.retain(|w| !Arc::ptr_eq(w, waiter));
    state.queue_s.retain(|w| !Arc::ptr_eq(w, waiter));
}

impl LockState {
    /// Lockers owning or queued ahead on this lock, for deadlock scans.
    pub(crate) fn involved_owners(&self) -> Vec<Arc<LockOwner>> {
        let mut out = Vec::new();
        if let Some(o) = &self.owner {
            out.push(Arc::clone(o));
        }
        out.extend(self.shared_owners.iter().cloned());
        for w in self.queue_u.iter().chain(self.queue_s.iter()) {
            out.push(Arc::clone(&w.lock().owner));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LOCK_TIMEOUT_NANOS;

    fn setup() -> (Arc<LockManager>, Locker, Locker) {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Strict));
        let a = Locker::new(Arc::clone(&mgr), 1);
        let b = Locker::new(Arc::clone(&mgr), 2);
        (mgr, a, b)
    }

    const T: i64 = DEFAULT_LOCK_TIMEOUT_NANOS as i64;

    #[test]
    fn shared_locks_coexist() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(b.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        a.scope_exit_all().unwrap();
        b.scope_exit_all().unwrap();
    }

    #[test]
    fn shared_reacquire_reports_owned() {
        let (_mgr, mut a, _b) = setup();
        assert_eq!(a.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(a.lock_shared(1, b"k", T).unwrap(), LockResult::OwnedShared);
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn exclusive_blocks_shared() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_exclusive(1, b"k", T).unwrap(), LockResult::Acquired);
        let r = b.try_lock_shared(1, b"k", 0).unwrap();
        assert_eq!(r, LockResult::TimedOutLock);
        b.clear_waiting_for();
        a.scope_exit_all().unwrap();
        assert_eq!(b.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        b.scope_exit_all().unwrap();
    }

    #[test]
    fn upgradable_allows_shared_but_not_second_upgradable() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_upgradable(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(b.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        let r = b.try_lock_upgradable(1, b"q", 0).unwrap();
        assert_eq!(r, LockResult::Acquired); // different key
        let r = b.try_lock_exclusive(1, b"k", 0).unwrap();
        assert_eq!(r, LockResult::Illegal); // shared holder under Strict
        a.scope_exit_all().unwrap();
        b.scope_exit_all().unwrap();
    }

    #[test]
    fn upgradable_upgrades_once_shared_drain() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_upgradable(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(b.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        // Cannot upgrade while b holds shared.
        assert_eq!(
            a.try_lock_exclusive(1, b"k", 0).unwrap(),
            LockResult::TimedOutLock
        );
        a.clear_waiting_for();
        b.scope_exit_all().unwrap();
        assert_eq!(a.lock_exclusive(1, b"k", T).unwrap(), LockResult::Upgraded);
        a.scope_exit_all().unwrap();
    }

    #[test]
    fn lenient_rule_allows_sole_shared_upgrade() {
        let mgr = Arc::new(LockManager::new(LockUpgradeRule::Lenient));
        let mut a = Locker::new(Arc::clone(&mgr), 1);
        assert_eq!(a.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(a.lock_exclusive(1, b"k", T).unwrap(), LockResult::Upgraded);
        a.scope_exit_all().unwrap();

        let mut b = Locker::new(Arc::clone(&mgr), 2);
        let mut c = Locker::new(Arc::clone(&mgr), 3);
        assert_eq!(b.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        assert_eq!(c.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);
        // Two shared holders: lenient refuses.
        assert_eq!(b.try_lock_exclusive(1, b"k", 0).unwrap(), LockResult::Illegal);
        b.scope_exit_all().unwrap();
        c.scope_exit_all().unwrap();
    }

    #[test]
    fn exclusive_waiter_blocks_new_shared() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_shared(1, b"k", T).unwrap(), LockResult::Acquired);

        // b queues for exclusive in another thread.
        let handle = {
            let mgr = Arc::clone(&_mgr);
            std::thread::spawn(move || {
                let r = b.lock_exclusive(1, b"k", 2 * T).unwrap();
                b.scope_exit_all().unwrap();
                let _ = mgr;
                r
            })
        };

        // Give b time to queue, then a third shared request must queue
        // behind it rather than barging.
        std::thread::sleep(Duration::from_millis(50));
        let mgr2 = Arc::clone(&_mgr);
        let mut c = Locker::new(mgr2, 9);
        assert_eq!(
            c.try_lock_shared(1, b"k", 0).unwrap(),
            LockResult::TimedOutLock
        );
        c.clear_waiting_for();

        a.scope_exit_all().unwrap();
        assert_eq!(handle.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn interruption_wakes_waiter() {
        let (_mgr, mut a, mut b) = setup();
        assert_eq!(a.lock_exclusive(1, b"k", T).unwrap(), LockResult::Acquired);

        let owner = Arc::clone(b.owner());
        let handle = std::thread::spawn(move || {
            let r = b.lock_shared(1, b"k", -1).unwrap_err();
            format!("{}", r)
        });
        std::thread::sleep(Duration::from_millis(50));
        owner.interrupt();
        let msg = handle.join().unwrap();
        assert!(msg.contains("interrupted"), "got: {msg}");
        a.scope_exit_all().unwrap();
    }
}
