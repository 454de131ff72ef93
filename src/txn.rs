//! Transaction: the sole mutation path into a bucket, with rollback and
//! forward journals (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::bucket::Bucket;
use crate::config::IoFrequency;
use crate::entry::{Entry, IndexValueType};
use crate::error::{Error, Result};
use crate::index::SecondaryIndex;
use crate::log::{LogRecord, RecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

enum BucketHandle<'a> {
    Read(RwLockReadGuard<'a, Bucket>),
    Write(RwLockWriteGuard<'a, Bucket>),
}

impl<'a> BucketHandle<'a> {
    fn bucket(&self) -> &Bucket {
        match self {
            BucketHandle::Read(g) => g,
            BucketHandle::Write(g) => g,
        }
    }

    fn bucket_mut(&mut self) -> Result<&mut Bucket> {
        match self {
            BucketHandle::Write(g) => Ok(g),
            BucketHandle::Read(_) => Err(Error::InvalidTxMode("bucket is held read-only by this transaction".to_string())),
        }
    }
}

enum IndexJournalEntry {
    Created(String),
    Dropped(SecondaryIndex),
}

/// A committed index create/drop, reported back to [crate::db::Database] by
/// [Transaction::commit] so the manifest record can be appended at the same
/// point a bucket `CREATE`/`DROP` record is (§10.4).
#[derive(Debug, Clone)]
pub(crate) enum IndexOp {
    Create { path: String, vtype: IndexValueType },
    Drop { path: String },
}

/// A single transaction against one bucket. Exactly one of
/// [Transaction::commit] / [Transaction::rollback] may be called — both
/// consume `self`, so the type system refuses reuse after either (§4.4
/// state machine).
pub struct Transaction<'a> {
    mode: Mode,
    handle: BucketHandle<'a>,
    iterating: bool,
    write_freq: IoFrequency,
    sync_freq: IoFrequency,
    backward: HashMap<String, Option<Arc<Entry>>>,
    backward_index: Vec<IndexJournalEntry>,
    forward: HashMap<String, Option<Arc<Entry>>>,
    /// Keys in the order they were first touched this transaction, so
    /// `commit` can append log records in commit order (I4) instead of
    /// `forward`'s hash order.
    forward_order: Vec<String>,
    index_ops: Vec<IndexOp>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new_read(guard: RwLockReadGuard<'a, Bucket>) -> Transaction<'a> {
        Transaction {
            mode: Mode::Read,
            handle: BucketHandle::Read(guard),
            iterating: false,
            write_freq: IoFrequency::None,
            sync_freq: IoFrequency::None,
            backward: HashMap::new(),
            backward_index: Vec::new(),
            forward: HashMap::new(),
            forward_order: Vec::new(),
            index_ops: Vec::new(),
        }
    }

    pub(crate) fn new_write(
        guard: RwLockWriteGuard<'a, Bucket>,
        write_freq: IoFrequency,
        sync_freq: IoFrequency,
    ) -> Transaction<'a> {
        Transaction {
            mode: Mode::Write,
            handle: BucketHandle::Write(guard),
            iterating: false,
            write_freq,
            sync_freq,
            backward: HashMap::new(),
            backward_index: Vec::new(),
            forward: HashMap::new(),
            forward_order: Vec::new(),
            index_ops: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn check_mutable(&self) -> Result<()> {
        if self.iterating {
            return Err(Error::InvalidTxMode("set/delete disallowed while iterating".to_string()));
        }
        Ok(())
    }

    /// §4.4 `get`: `None` if the entry is absent, expired, or invalid.
    pub fn get(&self, e: &Entry) -> Option<Arc<Entry>> {
        self.handle.bucket().get(e.key()).filter(|found| found.is_live())
    }

    pub fn set(&mut self, e: Entry) -> Result<Option<Arc<Entry>>> {
        self.check_mutable()?;
        let key = e.key().to_string();
        let arc = Arc::new(e);
        let bucket = self.handle.bucket_mut()?;
        let prior = bucket.insert(arc.clone());
        self.backward.entry(key.clone()).or_insert_with(|| prior.clone());
        if !self.forward.contains_key(&key) {
            self.forward_order.push(key.clone());
        }
        self.forward.insert(key, Some(arc));
        Ok(prior)
    }

    pub fn delete(&mut self, e: &Entry) -> Result<Option<Arc<Entry>>> {
        self.check_mutable()?;
        let key = e.key().to_string();
        let bucket = self.handle.bucket_mut()?;
        let removed = bucket.delete(&key);
        if let Some(removed) = &removed {
            self.backward.entry(key.clone()).or_insert_with(|| Some(removed.clone()));
            if !self.forward.contains_key(&key) {
                self.forward_order.push(key.clone());
            }
            self.forward.insert(key, None);
        }
        Ok(removed)
    }

    pub fn has(&self, index: Option<&str>, e: &Entry) -> bool {
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.get(e).is_some(),
            None => bucket.get(e.key()).is_some(),
        }
    }

    pub fn size(&self, index: Option<&str>) -> usize {
        self.handle.bucket().size(index)
    }

    pub fn min(&self, index: Option<&str>) -> Option<Arc<Entry>> {
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.min(),
            None => bucket.primary().min().map(|(_, v)| v.clone()),
        }
    }

    pub fn max(&self, index: Option<&str>) -> Option<Arc<Entry>> {
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.max(),
            None => bucket.primary().max().map(|(_, v)| v.clone()),
        }
    }

    pub fn ascend<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, mut f: F) {
        self.iterating = true;
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.ascend(f),
            None => bucket.primary().ascend(|_, v| f(v)),
        }
        self.iterating = false;
    }

    pub fn descend<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, mut f: F) {
        self.iterating = true;
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.descend(f),
            None => bucket.primary().descend(|_, v| f(v)),
        }
        self.iterating = false;
    }

    pub fn ascend_ge<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, pivot: &str, f: F) -> Result<()> {
        self.iterating = true;
        let result = self.ascend_ge_inner(index, pivot, f);
        self.iterating = false;
        result
    }

    fn ascend_ge_inner<F: FnMut(&Arc<Entry>) -> bool>(&self, index: Option<&str>, pivot: &str, mut f: F) -> Result<()> {
        let bucket = self.handle.bucket();
        match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.ascend_ge(pivot, f),
            None => {
                bucket.primary().ascend_ge(&pivot.to_string(), |_, v| f(v));
                Ok(())
            }
        }
    }

    pub fn ascend_lt<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, pivot: &str, f: F) -> Result<()> {
        self.iterating = true;
        let bucket = self.handle.bucket();
        let result = match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.ascend_lt(pivot, f),
            None => {
                let mut f = f;
                bucket.primary().ascend_lt(&pivot.to_string(), |_, v| f(v));
                Ok(())
            }
        };
        self.iterating = false;
        result
    }

    pub fn ascend_range<F: FnMut(&Arc<Entry>) -> bool>(
        &mut self,
        index: Option<&str>,
        lo: &str,
        hi: &str,
        f: F,
    ) -> Result<()> {
        self.iterating = true;
        let bucket = self.handle.bucket();
        let result = match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.ascend_range(lo, hi, f),
            None => {
                let mut f = f;
                bucket.primary().ascend_range(&lo.to_string(), &hi.to_string(), |_, v| f(v));
                Ok(())
            }
        };
        self.iterating = false;
        result
    }

    pub fn descend_le<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, pivot: &str, f: F) -> Result<()> {
        self.iterating = true;
        let bucket = self.handle.bucket();
        let result = match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.descend_le(pivot, f),
            None => {
                let mut f = f;
                bucket.primary().descend_le(&pivot.to_string(), |_, v| f(v));
                Ok(())
            }
        };
        self.iterating = false;
        result
    }

    pub fn descend_gt<F: FnMut(&Arc<Entry>) -> bool>(&mut self, index: Option<&str>, pivot: &str, f: F) -> Result<()> {
        self.iterating = true;
        let bucket = self.handle.bucket();
        let result = match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.descend_gt(pivot, f),
            None => {
                let mut f = f;
                bucket.primary().descend_gt(&pivot.to_string(), |_, v| f(v));
                Ok(())
            }
        };
        self.iterating = false;
        result
    }

    pub fn descend_range<F: FnMut(&Arc<Entry>) -> bool>(
        &mut self,
        index: Option<&str>,
        lo: &str,
        hi: &str,
        f: F,
    ) -> Result<()> {
        self.iterating = true;
        let bucket = self.handle.bucket();
        let result = match index.and_then(|n| bucket.index(n)) {
            Some(idx) => idx.descend_range(lo, hi, f),
            None => {
                let mut f = f;
                bucket.primary().descend_range(&lo.to_string(), &hi.to_string(), |_, v| f(v));
                Ok(())
            }
        };
        self.iterating = false;
        result
    }

    pub fn create_index(&mut self, path: &str, vtype: IndexValueType) -> Result<()> {
        self.check_mutable()?;
        let bucket = self.handle.bucket_mut()?;
        bucket.create_index(path, vtype)?;
        self.backward_index.push(IndexJournalEntry::Created(path.to_string()));
        self.index_ops.push(IndexOp::Create { path: path.to_string(), vtype });
        Ok(())
    }

    pub fn drop_index(&mut self, path: &str) -> Result<()> {
        self.check_mutable()?;
        let bucket = self.handle.bucket_mut()?;
        let removed = bucket.drop_index(path)?;
        self.backward_index.push(IndexJournalEntry::Dropped(removed));
        self.index_ops.push(IndexOp::Drop { path: path.to_string() });
        Ok(())
    }

    pub fn indexes(&self) -> Vec<String> {
        self.handle.bucket().index_names()
    }

    pub fn search_intersect(&self, lo: &[f64], hi: &[f64]) -> Result<Vec<Arc<Entry>>> {
        let bucket = self.handle.bucket();
        bucket.require_spatial()?;
        Ok(bucket.spatial().expect("checked by require_spatial").search_intersect(lo, hi))
    }

    pub fn search_within_radius(&self, point: &[f64], radius: f64) -> Result<Vec<Arc<Entry>>> {
        let bucket = self.handle.bucket();
        bucket.require_spatial()?;
        let inclusive = bucket.options().georincl;
        Ok(bucket
            .spatial()
            .expect("checked by require_spatial")
            .search_within_radius(point, radius, inclusive))
    }

    pub fn nearest_neighbor(&self, point: &[f64]) -> Result<Option<Arc<Entry>>> {
        let bucket = self.handle.bucket();
        bucket.require_spatial()?;
        Ok(bucket.spatial().expect("checked by require_spatial").nearest_neighbor(point))
    }

    pub fn nearest_neighbors(&self, k: usize, point: &[f64]) -> Result<Vec<Arc<Entry>>> {
        let bucket = self.handle.bucket();
        bucket.require_spatial()?;
        Ok(bucket.spatial().expect("checked by require_spatial").nearest_neighbors(k, point))
    }

    /// Read-write only: append one log record per forward-journal entry (in
    /// commit order, I4), then flush/sync per policy (§4.4 "Commit"). On a
    /// log I/O failure, every tree mutation already applied by `set`/
    /// `delete`/`create_index`/`drop_index` this transaction is undone
    /// before the error is returned, so a failed commit leaves no
    /// in-memory trace (§7/§8).
    pub fn commit(mut self) -> Result<Vec<IndexOp>> {
        if self.mode != Mode::Write {
            return Err(Error::InvalidTxMode("commit on a read-only transaction".to_string()));
        }
        let order = std::mem::take(&mut self.forward_order);
        let forward = std::mem::take(&mut self.forward);
        let write_freq = self.write_freq;
        let sync_freq = self.sync_freq;
        let index_ops = std::mem::take(&mut self.index_ops);

        match self.write_log(&order, &forward, write_freq, sync_freq) {
            Ok(()) => Ok(index_ops),
            Err(e) => {
                self.undo();
                Err(e)
            }
        }
    }

    fn write_log(
        &mut self,
        order: &[String],
        forward: &HashMap<String, Option<Arc<Entry>>>,
        write_freq: IoFrequency,
        sync_freq: IoFrequency,
    ) -> Result<()> {
        let backward = &self.backward;
        let bucket = self.handle.bucket_mut()?;
        let Some(log) = bucket.log_mut() else {
            return Ok(());
        };
        for key in order {
            let record = match forward.get(key) {
                Some(Some(entry)) => LogRecord::from_entry(RecordKind::Insert, entry),
                _ => match backward.get(key).and_then(|pre| pre.clone()) {
                    Some(prior) => LogRecord::from_entry(RecordKind::Delete, &prior),
                    None => LogRecord {
                        kind: RecordKind::Delete,
                        key: key.clone(),
                        value: String::new(),
                        does_expire: false,
                        does_invalidate: false,
                        expires: 0,
                        invalidates: 0,
                        tolerance: 0.0,
                    },
                },
            };
            log.append(&record)?;
        }
        if write_freq == IoFrequency::EachCommit {
            log.flush()?;
        }
        if sync_freq == IoFrequency::EachCommit {
            log.sync()?;
        }
        Ok(())
    }

    /// Undo every tree mutation recorded in the journals, in reverse for
    /// the index journal (§4.4 "Rollback"; also used by [Transaction::commit]
    /// on a log I/O failure).
    fn undo(&mut self) {
        let backward = std::mem::take(&mut self.backward);
        let backward_index = std::mem::take(&mut self.backward_index);
        let Ok(bucket) = self.handle.bucket_mut() else {
            return;
        };
        for (key, pre) in backward {
            match pre {
                None => {
                    bucket.delete(&key);
                }
                Some(entry) => {
                    bucket.insert(entry);
                }
            }
        }
        for item in backward_index.into_iter().rev() {
            match item {
                IndexJournalEntry::Created(path) => {
                    let _ = bucket.drop_index(&path);
                }
                IndexJournalEntry::Dropped(idx) => {
                    bucket.restore_index(idx);
                }
            }
        }
    }

    /// Release the lock without committing, undoing every tree mutation
    /// recorded in the journals (§4.4 "Rollback").
    pub fn rollback(mut self) -> Result<()> {
        if self.mode == Mode::Write {
            self.undo();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;
    use crate::options::BucketOptions;
    use parking_lot::RwLock as PLock;

    fn new_bucket() -> PLock<Bucket> {
        PLock::new(Bucket::new("b", BucketOptions::new(), false, None).unwrap())
    }

    #[test]
    fn commit_reports_index_ops_in_order() {
        let lock = new_bucket();
        let mut tx = Transaction::new_write(lock.write(), IoFrequency::None, IoFrequency::None);
        tx.create_index("age", IndexValueType::Int).unwrap();
        tx.drop_index("age").unwrap();
        let ops = tx.commit().unwrap();
        assert!(matches!(ops[0], IndexOp::Create { .. }));
        assert!(matches!(ops[1], IndexOp::Drop { .. }));
    }

    #[test]
    fn commit_writes_log_records_in_first_touch_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("b.stitch");
        let log = crate::log::BucketLog::open(&log_path).unwrap();
        let lock = PLock::new(Bucket::new("b", BucketOptions::new(), true, Some(log)).unwrap());
        let mut tx = Transaction::new_write(lock.write(), IoFrequency::EachCommit, IoFrequency::None);
        for k in ["c", "a", "b"] {
            tx.set(Entry::new(k, "{}", EntryOptions::new())).unwrap();
        }
        tx.commit().unwrap();
        let keys: Vec<String> = crate::log::read_all(&log_path).unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["c".to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rollback_undoes_set_and_delete() {
        let lock = new_bucket();
        {
            let mut tx = Transaction::new_write(lock.write(), IoFrequency::None, IoFrequency::None);
            tx.set(Entry::new("a", "{}", EntryOptions::new())).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut tx = Transaction::new_write(lock.write(), IoFrequency::None, IoFrequency::None);
            tx.delete(&Entry::new("a", "{}", EntryOptions::new())).unwrap();
            tx.set(Entry::new("b", "{}", EntryOptions::new())).unwrap();
            tx.rollback().unwrap();
        }
        let tx = Transaction::new_read(lock.read());
        assert!(tx.get(&Entry::new("a", "{}", EntryOptions::new())).is_some());
        assert!(tx.get(&Entry::new("b", "{}", EntryOptions::new())).is_none());
    }
}
