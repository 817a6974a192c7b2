//! # Redo Log
//!
//! The engine's redo stream is consumed through the [`RedoVisitor`]
//! interface: one method per record kind, each returning whether replay
//! should continue. The replay driver itself is an external collaborator;
//! what lives here is the visitor contract, an in-memory [`RedoLog`] that
//! captures committed operations as encoded records, and [`RedoApplier`],
//! a visitor that applies a log to a database to reproduce its logical
//! state.
//!
//! Records are framed as an opcode byte followed by varint-prefixed
//! fields. A `None` value in a store record encodes a delete.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::db::Database;
use crate::encoding::{decode_varint, encode_varint};
use crate::error::Result;

/// Receiver for replayed redo records. Every method returns true to
/// continue replay.
pub trait RedoVisitor {
    fn reset(&mut self) -> bool {
        true
    }
    fn timestamp(&mut self, _timestamp: u64) -> bool {
        true
    }
    fn shutdown(&mut self, _timestamp: u64) -> bool {
        true
    }
    fn close(&mut self, _timestamp: u64) -> bool {
        true
    }
    fn end_file(&mut self, _timestamp: u64) -> bool {
        true
    }
    fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool;
    fn store_no_lock(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool {
        self.store(index_id, key, value)
    }
    fn drop_index(&mut self, _index_id: u64) -> bool {
        true
    }
    fn rename_index(&mut self, _index_id: u64, _new_name: &[u8]) -> bool {
        true
    }
    fn txn_enter(&mut self, _txn_id: u64) -> bool {
        true
    }
    fn txn_rollback(&mut self, _txn_id: u64) -> bool {
        true
    }
    fn txn_rollback_final(&mut self, _txn_id: u64) -> bool {
        true
    }
    fn txn_commit(&mut self, _txn_id: u64) -> bool {
        true
    }
    fn txn_commit_final(&mut self, _txn_id: u64) -> bool {
        true
    }
    fn txn_store(&mut self, txn_id: u64, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool;
    fn txn_store_commit_final(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> bool {
        self.txn_store(txn_id, index_id, key, value) && self.txn_commit(txn_id)
    }
}

const OP_RESET: u8 = 1;
const OP_TIMESTAMP: u8 = 2;
const OP_SHUTDOWN: u8 = 3;
const OP_CLOSE: u8 = 4;
const OP_END_FILE: u8 = 5;
const OP_STORE: u8 = 16;
const OP_STORE_NO_LOCK: u8 = 17;
const OP_DELETE: u8 = 18;
const OP_DROP_INDEX: u8 = 32;
const OP_RENAME_INDEX: u8 = 33;
const OP_TXN_ENTER: u8 = 64;
const OP_TXN_ROLLBACK: u8 = 65;
const OP_TXN_ROLLBACK_FINAL: u8 = 66;
const OP_TXN_COMMIT: u8 = 67;
const OP_TXN_COMMIT_FINAL: u8 = 68;
const OP_TXN_STORE: u8 = 69;
const OP_TXN_DELETE: u8 = 70;
const OP_TXN_STORE_COMMIT_FINAL: u8 = 71;

/// In-memory redo record stream.
#[derive(Default)]
pub struct RedoLog {
    buf: Vec<u8>,
}

fn put_varint(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 9];
    let n = encode_varint(v, &mut tmp);
    buf.extend_from_slice(&tmp[..n]);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

impl RedoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.push(OP_RESET);
    }

    pub fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) {
        match value {
            Some(value) => {
                self.buf.push(OP_STORE);
                put_varint(&mut self.buf, index_id);
                put_bytes(&mut self.buf, key);
                put_bytes(&mut self.buf, value);
            }
            None => {
                self.buf.push(OP_DELETE);
                put_varint(&mut self.buf, index_id);
                put_bytes(&mut self.buf, key);
            }
        }
    }

    pub fn store_no_lock(&mut self, index_id: u64, key: &[u8], value: &[u8]) {
        self.buf.push(OP_STORE_NO_LOCK);
        put_varint(&mut self.buf, index_id);
        put_bytes(&mut self.buf, key);
        put_bytes(&mut self.buf, value);
    }

    pub fn drop_index(&mut self, index_id: u64) {
        self.buf.push(OP_DROP_INDEX);
        put_varint(&mut self.buf, index_id);
    }

    pub fn rename_index(&mut self, index_id: u64, new_name: &[u8]) {
        self.buf.push(OP_RENAME_INDEX);
        put_varint(&mut self.buf, index_id);
        put_bytes(&mut self.buf, new_name);
    }

    pub fn txn_enter(&mut self, txn_id: u64) {
        self.buf.push(OP_TXN_ENTER);
        put_varint(&mut self.buf, txn_id);
    }

    pub fn txn_store(&mut self, txn_id: u64, index_id: u64, key: &[u8], value: Option<&[u8]>) {
        self.buf
            .push(if value.is_some() { OP_TXN_STORE } else { OP_TXN_DELETE });
        put_varint(&mut self.buf, txn_id);
        put_varint(&mut self.buf, index_id);
        put_bytes(&mut self.buf, key);
        if let Some(value) = value {
            put_bytes(&mut self.buf, value);
        }
    }

    pub fn txn_commit_final(&mut self, txn_id: u64) {
        self.buf.push(OP_TXN_COMMIT_FINAL);
        put_varint(&mut self.buf, txn_id);
    }

    pub fn txn_rollback_final(&mut self, txn_id: u64) {
        self.buf.push(OP_TXN_ROLLBACK_FINAL);
        put_varint(&mut self.buf, txn_id);
    }

    /// Drives a visitor over every record, stopping early when any method
    /// returns false. Returns the number of records visited.
    pub fn replay(&self, visitor: &mut dyn RedoVisitor) -> Result<usize> {
        fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
            let (v, n) = decode_varint(&buf[*pos..])?;
            *pos += n;
            Ok(v)
        }
        fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
            let (len, n) = decode_varint(&buf[*pos..])?;
            *pos += n;
            let out = &buf[*pos..*pos + len as usize];
            *pos += len as usize;
            Ok(out)
        }

        let mut pos = 0usize;
        let mut count = 0usize;
        let buf: &[u8] = &self.buf;

        while pos < buf.len() {
            let op = buf[pos];
            pos += 1;
            count += 1;
            let more = match op {
                OP_RESET => visitor.reset(),
                OP_TIMESTAMP => {
                    let t = read_varint(buf, &mut pos)?;
                    visitor.timestamp(t)
                }
                OP_SHUTDOWN => {
                    let t = read_varint(buf, &mut pos)?;
                    visitor.shutdown(t)
                }
                OP_CLOSE => {
                    let t = read_varint(buf, &mut pos)?;
                    visitor.close(t)
                }
                OP_END_FILE => {
                    let t = read_varint(buf, &mut pos)?;
                    visitor.end_file(t)
                }
                OP_STORE => {
                    let index_id = read_varint(buf, &mut pos)?;
                    let key = read_bytes(buf, &mut pos)?;
                    let vstart = pos;
                    let (len, n) = decode_varint(&buf[pos..])?;
                    pos += n + len as usize;
                    let value = &buf[vstart + n..pos];
                    visitor.store(index_id, key, Some(value))
                }
                OP_STORE_NO_LOCK => {
                    let index_id = read_varint(buf, &mut pos)?;
                    let key = read_bytes(buf, &mut pos)?;
                    let vstart = pos;
                    let (len, n) = decode_varint(&buf[pos..])?;
                    pos += n + len as usize;
                    let value = &buf[vstart + n..pos];
                    visitor.store_no_lock(index_id, key, Some(value))
                }
                OP_DELETE => {
                    let index_id = read_varint(buf, &mut pos)?;
                    let key = read_bytes(buf, &mut pos)?;
                    visitor.store(index_id, key, None)
                }
                OP_DROP_INDEX => {
                    let index_id = read_varint(buf, &mut pos)?;
                    visitor.drop_index(index_id)
                }
                OP_RENAME_INDEX => {
                    let index_id = read_varint(buf, &mut pos)?;
                    let name = read_bytes(buf, &mut pos)?;
                    visitor.rename_index(index_id, name)
                }
                OP_TXN_ENTER => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    visitor.txn_enter(txn_id)
                }
                OP_TXN_ROLLBACK => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    visitor.txn_rollback(txn_id)
                }
                OP_TXN_ROLLBACK_FINAL => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    visitor.txn_rollback_final(txn_id)
                }
                OP_TXN_COMMIT => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    visitor.txn_commit(txn_id)
                }
                OP_TXN_COMMIT_FINAL => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    visitor.txn_commit_final(txn_id)
                }
                OP_TXN_STORE | OP_TXN_STORE_COMMIT_FINAL => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    let index_id = read_varint(buf, &mut pos)?;
                    let key = read_bytes(buf, &mut pos)?;
                    let vstart = pos;
                    let (len, n) = decode_varint(&buf[pos..])?;
                    pos += n + len as usize;
                    let value = &buf[vstart + n..pos];
                    if op == OP_TXN_STORE {
                        visitor.txn_store(txn_id, index_id, key, Some(value))
                    } else {
                        visitor.txn_store_commit_final(txn_id, index_id, key, Some(value))
                    }
                }
                OP_TXN_DELETE => {
                    let txn_id = read_varint(buf, &mut pos)?;
                    let index_id = read_varint(buf, &mut pos)?;
                    let key = read_bytes(buf, &mut pos)?;
                    visitor.txn_store(txn_id, index_id, key, None)
                }
                other => eyre::bail!("unknown redo opcode: {}", other),
            };
            if !more {
                break;
            }
        }
        Ok(count)
    }
}

/// Visitor that applies a redo stream to a database. Indexes are resolved
/// by id and created on demand, so a log can be replayed onto an empty
/// store. Transactional stores are buffered per transaction and applied
/// only at the commit record; a rollback discards them, so replaying a
/// stream that includes aborted transactions reproduces exactly the
/// committed state.
pub struct RedoApplier {
    db: Arc<Database>,
    pending: hashbrown::HashMap<u64, Vec<(u64, Vec<u8>, Option<Vec<u8>>)>>,
}

impl RedoApplier {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pending: hashbrown::HashMap::new(),
        }
    }

    fn apply(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool {
        let tree = match self.db.open_or_create_tree(index_id) {
            Ok(tree) => tree,
            Err(e) => {
                log::warn!("redo apply: open tree {index_id} failed: {e}");
                return false;
            }
        };
        let result = match value {
            Some(v) => tree.store(None, key, v),
            None => tree.delete(None, key).map(|_| ()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::warn!("redo apply failed: {e}");
                false
            }
        }
    }
}

impl RedoVisitor for RedoApplier {
    fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool {
        self.apply(index_id, key, value)
    }

    fn txn_store(&mut self, txn_id: u64, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool {
        self.pending.entry(txn_id).or_default().push((
            index_id,
            key.to_vec(),
            value.map(|v| v.to_vec()),
        ));
        true
    }

    fn txn_commit_final(&mut self, txn_id: u64) -> bool {
        let Some(ops) = self.pending.remove(&txn_id) else {
            return true;
        };
        for (index_id, key, value) in ops {
            if !self.apply(index_id, &key, value.as_deref()) {
                return false;
            }
        }
        true
    }

    fn txn_rollback_final(&mut self, txn_id: u64) -> bool {
        self.pending.remove(&txn_id);
        true
    }
}

/// Shared handle the engine writes committed operations through when redo
/// capture is enabled.
pub(crate) type SharedRedoLog = Arc<Mutex<RedoLog>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        stores: Vec<(u64, Vec<u8>, Option<Vec<u8>>)>,
        commits: Vec<u64>,
        stop_after: Option<usize>,
    }

    impl RedoVisitor for Recorder {
        fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> bool {
            self.stores
                .push((index_id, key.to_vec(), value.map(|v| v.to_vec())));
            self.stop_after
                .map(|n| self.stores.len() < n)
                .unwrap_or(true)
        }

        fn txn_store(
            &mut self,
            _txn_id: u64,
            index_id: u64,
            key: &[u8],
            value: Option<&[u8]>,
        ) -> bool {
            self.store(index_id, key, value)
        }

        fn txn_commit_final(&mut self, txn_id: u64) -> bool {
            self.commits.push(txn_id);
            true
        }
    }

    #[test]
    fn records_roundtrip_through_replay() {
        let mut log = RedoLog::new();
        log.store(7, b"alpha", Some(b"1"));
        log.txn_enter(42);
        log.txn_store(42, 7, b"beta", Some(b"2"));
        log.txn_store(42, 7, b"alpha", None);
        log.txn_commit_final(42);

        let mut rec = Recorder::default();
        let count = log.replay(&mut rec).unwrap();
        assert_eq!(count, 5);
        assert_eq!(rec.commits, vec![42]);
        assert_eq!(rec.stores.len(), 3);
        assert_eq!(rec.stores[0], (7, b"alpha".to_vec(), Some(b"1".to_vec())));
        assert_eq!(rec.stores[2], (7, b"alpha".to_vec(), None));
    }

    #[test]
    fn visitor_false_stops_replay() {
        let mut log = RedoLog::new();
        for i in 0..10u8 {
            log.store(1, &[i], Some(&[i]));
        }
        let mut rec = Recorder {
            stop_after: Some(3),
            ..Default::default()
        };
        log.replay(&mut rec).unwrap();
        assert_eq!(rec.stores.len(), 3);
    }
}
