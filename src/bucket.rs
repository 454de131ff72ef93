//! Bucket: the concurrent, multi-tree container behind a named collection
//! of entries (§3, §4.2, §4.5).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{info, warn};
use parking_lot::RwLock;

use crate::config::{Config, IoFrequency};
use crate::entry::{now_millis, Entry, IndexValueType, SortKey};
use crate::error::{Error, Result};
use crate::index::SecondaryIndex;
use crate::log::BucketLog;
use crate::options::BucketOptions;
use crate::spatial::SpatialTree;
use crate::tree::OrderedTree;

/// The concurrent state of one bucket. Every method here assumes the
/// caller already holds the bucket's lock in the appropriate mode (§4.2).
pub struct Bucket {
    name: String,
    opts: BucketOptions,
    persist: bool,
    primary: OrderedTree<String, Arc<Entry>>,
    expiration: OrderedTree<SortKey<i64>, Arc<Entry>>,
    invalidation: OrderedTree<SortKey<i64>, Arc<Entry>>,
    indexes: HashMap<String, SecondaryIndex>,
    spatial: Option<SpatialTree>,
    log: Option<BucketLog>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, opts: BucketOptions, persist: bool, log: Option<BucketLog>) -> Result<Bucket> {
        let spatial = if opts.geo { Some(SpatialTree::new(opts.dims)?) } else { None };
        Ok(Bucket {
            name: name.into(),
            opts,
            persist,
            primary: OrderedTree::new(),
            expiration: OrderedTree::new(),
            invalidation: OrderedTree::new(),
            indexes: HashMap::new(),
            spatial,
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BucketOptions {
        &self.opts
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.primary.values()
    }

    pub fn primary(&self) -> &OrderedTree<String, Arc<Entry>> {
        &self.primary
    }

    pub fn log(&self) -> Option<&BucketLog> {
        self.log.as_ref()
    }

    pub fn log_mut(&mut self) -> Option<&mut BucketLog> {
        self.log.as_mut()
    }

    pub fn spatial(&self) -> Option<&SpatialTree> {
        self.spatial.as_ref()
    }

    pub fn require_spatial(&self) -> Result<()> {
        if self.opts.geo {
            Ok(())
        } else {
            Err(Error::SpatialUnsupported(format!("bucket {:?} is not spatial", self.name)))
        }
    }

    pub fn index(&self, path: &str) -> Option<&SecondaryIndex> {
        self.indexes.get(path)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn size(&self, index: Option<&str>) -> usize {
        match index.and_then(|n| self.indexes.get(n)) {
            Some(idx) => idx.len(),
            None => self.primary.len(),
        }
    }

    /// §4.2 `get`: primary-tree lookup by key identity. Does not filter
    /// expiration/invalidation — that filtering is the transaction layer's
    /// job (§4.4).
    pub fn get(&self, key: &str) -> Option<Arc<Entry>> {
        self.primary.get(&key.to_string()).cloned()
    }

    /// §4.2 `insert`: replace-or-insert, keeping every auxiliary tree in
    /// sync (I1). Returns the prior entry, if any.
    pub fn insert(&mut self, entry: Arc<Entry>) -> Option<Arc<Entry>> {
        let prior = self.primary.insert(entry.key().to_string(), entry.clone());
        if let Some(prior) = &prior {
            self.remove_from_aux(prior);
        }
        self.add_to_aux(&entry);
        prior
    }

    /// §4.2 `delete`: remove by primary identity, symmetrically from every
    /// auxiliary structure.
    pub fn delete(&mut self, key: &str) -> Option<Arc<Entry>> {
        let removed = self.primary.remove(&key.to_string());
        if let Some(entry) = &removed {
            self.remove_from_aux(entry);
        }
        removed
    }

    fn add_to_aux(&mut self, entry: &Arc<Entry>) {
        let opts = entry.options();
        if let Some(exp) = opts.expires {
            self.expiration.insert(SortKey::new(exp, entry.key()), entry.clone());
        }
        if let Some(inv) = opts.invalidates {
            self.invalidation.insert(SortKey::new(inv, entry.key()), entry.clone());
        }
        for idx in self.indexes.values_mut() {
            idx.insert(entry);
        }
        if let Some(spatial) = &mut self.spatial {
            spatial.insert(entry.clone());
        }
    }

    fn remove_from_aux(&mut self, entry: &Arc<Entry>) {
        let opts = entry.options();
        if let Some(exp) = opts.expires {
            self.expiration.remove(&SortKey::new(exp, entry.key()));
        }
        if let Some(inv) = opts.invalidates {
            self.invalidation.remove(&SortKey::new(inv, entry.key()));
        }
        for idx in self.indexes.values_mut() {
            idx.delete(entry);
        }
        if let Some(spatial) = &mut self.spatial {
            spatial.remove(entry);
        }
    }

    /// §4.3 `createIndex`: fails on a duplicate path, otherwise builds the
    /// index by scanning the primary tree.
    pub fn create_index(&mut self, path: &str, vtype: IndexValueType) -> Result<()> {
        if self.indexes.contains_key(path) {
            return Err(Error::InvalidArgument(format!("index {:?} already exists", path)));
        }
        let mut idx = SecondaryIndex::new(path, path, vtype);
        idx.rebuild(self.primary.values());
        self.indexes.insert(path.to_string(), idx);
        Ok(())
    }

    /// §4.3 `dropIndex`: fails if absent; returns the removed definition so
    /// the transaction's rollback journal can restore it.
    pub fn drop_index(&mut self, path: &str) -> Result<SecondaryIndex> {
        self.indexes
            .remove(path)
            .ok_or_else(|| Error::InvalidArgument(format!("index {:?} does not exist", path)))
    }

    /// Reinstate a dropped-then-rolled-back index with its full prior tree
    /// contents, without rescanning — used only by `Transaction::rollback`.
    pub fn restore_index(&mut self, idx: SecondaryIndex) {
        self.indexes.insert(idx.path().to_string(), idx);
    }

    /// §4.5 step 3: delete every entry past its expire time.
    pub fn sweep_expired(&mut self) -> usize {
        let mut n = 0;
        loop {
            let key = match self.expiration.min() {
                Some((sk, _)) if now_millis() >= sk.primary => sk.key.clone(),
                _ => break,
            };
            self.delete(&key);
            n += 1;
        }
        n
    }

    /// §4.5 step 4: flag every entry past its invalidate time. Flagged
    /// entries are removed from the invalidation tree itself (there is
    /// nothing left to watch for) but stay in the primary tree and every
    /// other structure, per "do not delete".
    pub fn sweep_invalid(&mut self) -> usize {
        let mut n = 0;
        loop {
            let sk = match self.invalidation.min() {
                Some((sk, _)) if now_millis() >= sk.primary => sk.clone(),
                _ => break,
            };
            if let Some(entry) = self.invalidation.remove(&sk) {
                entry.set_invalidated();
                n += 1;
            }
        }
        n
    }

    /// One tick of the bucket manager (§4.5), run under the bucket's write
    /// lock by the thread spawned from [spawn_manager].
    pub fn manager_tick(&mut self, cfg: &Config) -> Result<()> {
        if self.persist {
            if let Some(log) = &mut self.log {
                if cfg.write_freq == IoFrequency::ManagerTick {
                    log.flush()?;
                }
                if cfg.sync_freq == IoFrequency::ManagerTick {
                    log.sync()?;
                }
                let threshold = (self.primary.len() as u64).saturating_mul(cfg.bucket_file_mult_limit);
                if log.record_count() > threshold {
                    log.compact(self.primary.values())?;
                }
            }
        }
        let expired = self.sweep_expired();
        let invalidated = self.sweep_invalid();
        if expired > 0 || invalidated > 0 {
            log::debug!(
                target: "bucket",
                "{:?} manager tick: swept {} expired, flagged {} invalid",
                self.name, expired, invalidated
            );
        }
        Ok(())
    }
}

/// Spawn the per-bucket manager thread (§4.5, §5 "Manager shutdown").
/// The returned sender's sibling is held by the database; dropping it
/// unblocks the manager's next `recv_timeout` and lets the thread exit.
pub fn spawn_manager(
    name: String,
    bucket: Arc<RwLock<Bucket>>,
    config: Arc<RwLock<Config>>,
) -> (thread::JoinHandle<()>, mpsc::Sender<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || loop {
        let tick = config.read().manage_frequency;
        match rx.recv_timeout(tick) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let cfg = config.read().clone();
        let mut b = bucket.write();
        if let Err(e) = b.manager_tick(&cfg) {
            warn!(target: "bucket", "manager tick failed for bucket {:?}: {}", name, e);
        }
    });
    info!(target: "bucket", "started manager thread");
    (handle, tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;
    use std::time::{Duration, SystemTime};

    fn entry(key: &str, value: &str) -> Arc<Entry> {
        Arc::new(Entry::new(key, value, EntryOptions::new()))
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        b.insert(entry("a", "{}"));
        assert!(b.get("a").is_some());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn replace_removes_prior_from_aux_trees() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        b.create_index("v", IndexValueType::Int).unwrap();
        b.insert(Arc::new(Entry::new("a", r#"{"v":1}"#, EntryOptions::new())));
        b.insert(Arc::new(Entry::new("a", r#"{"v":2}"#, EntryOptions::new())));
        assert_eq!(b.index("v").unwrap().len(), 1);
    }

    #[test]
    fn sweep_expired_removes_entry() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        let past = SystemTime::now() - Duration::from_secs(5);
        b.insert(Arc::new(Entry::new("a", "{}", EntryOptions::new().expires_at(past))));
        assert_eq!(b.sweep_expired(), 1);
        assert!(b.get("a").is_none());
    }

    #[test]
    fn sweep_invalid_flags_but_keeps_entry() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        let past = SystemTime::now() - Duration::from_secs(5);
        b.insert(Arc::new(Entry::new("a", "{}", EntryOptions::new().invalidates_at(past))));
        assert_eq!(b.sweep_invalid(), 1);
        let e = b.get("a").unwrap();
        assert!(e.is_invalidated_flag());
    }

    #[test]
    fn create_index_rejects_duplicate() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        b.create_index("v", IndexValueType::Int).unwrap();
        assert!(b.create_index("v", IndexValueType::Int).is_err());
    }

    #[test]
    fn drop_index_rejects_missing() {
        let mut b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        assert!(b.drop_index("nope").is_err());
    }

    #[test]
    fn non_spatial_bucket_requires_spatial_fails() {
        let b = Bucket::new("b", BucketOptions::new(), false, None).unwrap();
        assert!(b.require_spatial().is_err());
    }
}
