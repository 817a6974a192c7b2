//! # BurrowDB - Embedded Transactional Key-Value Engine
//!
//! BurrowDB stores opaque byte keys and values in copy-on-write B+ trees
//! backed by a single page store, with lock-based concurrency control and
//! latch-coupled node access. Keys are ordered lexicographically as
//! unsigned bytes; each named tree is an independent index over the shared
//! store.
//!
//! ## Quick Start
//!
//! ```
//! use burrowdb::Database;
//!
//! # fn main() -> eyre::Result<()> {
//! let db = Database::builder().page_size(4096).open_memory()?;
//! let tree = db.create_tree()?;
//!
//! tree.store(None, b"hello", b"world")?;
//! assert_eq!(tree.load(None, b"hello")?, Some(b"world".to_vec()));
//!
//! let mut txn = db.begin()?;
//! tree.store(Some(&mut txn), b"hello", b"txn")?;
//! txn.rollback()?;
//! assert_eq!(tree.load(None, b"hello")?, Some(b"world".to_vec()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │      Tree API (load/store/cursor)         │
//! ├───────────────┬───────────────────────────┤
//! │ Transactions  │  LockManager + Locker     │
//! │ (undo, redo)  │  (row locks, deadlocks)   │
//! ├───────────────┴───────────────────────────┤
//! │   Cursor frames / latch-coupled descent   │
//! ├───────────────────────────────────────────┤
//! │   Node: on-page B+tree layout and SMOs    │
//! ├───────────────────────────────────────────┤
//! │   NodeCache: LRU pool, dirty generations  │
//! ├───────────────────────────────────────────┤
//! │   PageStore (pluggable; crypto wrapper)   │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Parallel OS threads; every operation is synchronous. Node buffers are
//! guarded by short-lived non-reentrant latches acquired parent before
//! child; row locks are transaction-scoped with shared, upgradable, and
//! exclusive modes, FIFO waiter queues, and timeout-triggered deadlock
//! detection. A thread never holds a node latch while blocking on a row
//! lock.
//!
//! ## Module Overview
//!
//! - [`storage`]: the `PageStore` contract, in-memory store, crypto wrapper
//! - `node`: on-page node layout, search, splits, rebalancing, merges
//! - `cache`: bounded node pool with LRU eviction and dirty generations
//! - `cursor`: cursor frames and tree traversal
//! - `tree`: the public per-index API
//! - `lock`: lock manager, locker stacks, deadlock detector
//! - `txn`: transactions, undo log integration
//! - `redo`: redo visitor interface and in-memory log
//! - `fragment`: oversized-value spill pages

pub mod config;
pub mod encoding;
pub mod error;
pub mod storage;

mod cache;
mod cursor;
mod db;
mod fragment;
mod node;
mod redo;
mod tree;
mod txn;
mod undo;

pub mod lock;

pub use cursor::TreeCursor;
pub use db::{Database, DatabaseBuilder};
pub use error::{DeadlockInfo, Error};
pub use lock::{LockManager, LockOwner, LockResult, LockUpgradeRule, Locker};
pub use redo::{RedoApplier, RedoLog, RedoVisitor};
pub use tree::Tree;
pub use txn::{LockMode, Transaction};
