//! # Typed Error Kinds
//!
//! BurrowDB propagates failures as `eyre::Result` like the rest of the
//! codebase, but every condition a caller might need to branch on is raised
//! through one of the typed kinds below so it can be recovered with
//! `report.downcast_ref::<...>()`.
//!
//! The lock-acquisition outcomes (`LockTimeout`, `Deadlock`, `Interrupted`,
//! `IllegalUpgrade`) are ordinary results inside the lock manager
//! (`LockResult`); they only become errors at the tree and transaction API
//! boundary.

use thiserror::Error;

/// Engine error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Key exceeds the per-tree maximum.
    #[error("key of {0} bytes exceeds the tree maximum")]
    KeyTooLarge(usize),

    /// A page failed structural validation: unknown node type, non-zero
    /// reserved byte, bad vector bounds, duplicate child id, key-order
    /// inversion, or garbage mismatch.
    #[error("corrupt page {id}: {detail}")]
    CorruptPage { id: u64, detail: String },

    /// Mutation against a node whose page buffer was replaced by the empty
    /// sentinel when its tree was closed.
    #[error("index is closed")]
    ClosedIndex,

    /// Shared-to-exclusive lock upgrade disallowed by the configured rule.
    #[error("illegal lock upgrade from shared mode")]
    IllegalUpgrade,

    /// Row-lock wait exceeded its timeout without a deadlock being found.
    #[error("lock acquisition timed out after {0}ns")]
    LockTimeout(u64),

    /// The waiting locker was interrupted.
    #[error("interrupted while waiting for a lock")]
    LockInterrupted,

    /// A cycle was found in the wait-for graph after a timed-out wait.
    #[error("deadlock detected (guilty locker {})", .0.guilty)]
    Deadlock(DeadlockInfo),

    /// Every node buffer is pinned, latched, or bound; no eviction victim
    /// could be found.
    #[error("node cache exhausted")]
    CacheExhausted,

    /// A prior invariant violation poisoned the engine; it refuses further
    /// work rather than persist damage.
    #[error("engine is poisoned: {0}")]
    Poisoned(&'static str),
}

/// Cycle description attached to a [`Error::Deadlock`] report.
#[derive(Debug, Clone)]
pub struct DeadlockInfo {
    /// Id of the locker chosen as the deadlock victim, usually the one most
    /// recently added to the cycle.
    pub guilty: u64,
    /// The `(index_id, key)` pairs participating in the cycle.
    pub locks: Vec<(u64, Vec<u8>)>,
}

pub type Result<T> = eyre::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_downcast_through_eyre() {
        let report = eyre::Report::new(Error::KeyTooLarge(20000));
        match report.downcast_ref::<Error>() {
            Some(Error::KeyTooLarge(len)) => assert_eq!(*len, 20000),
            other => panic!("unexpected downcast: {:?}", other),
        }
    }

    #[test]
    fn deadlock_reports_guilty_locker() {
        let err = Error::Deadlock(DeadlockInfo {
            guilty: 7,
            locks: vec![(1, b"a".to_vec()), (1, b"b".to_vec())],
        });
        assert!(err.to_string().contains("guilty locker 7"));
    }
}
