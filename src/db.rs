//! Database: the root object owning every bucket, the manifest, and the
//! background managers (§3, §4.6, §6).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::bucket::{spawn_manager, Bucket};
use crate::config::Config;
use crate::entry::{Entry, IndexValueType};
use crate::error::{Error, Result};
use crate::log::{BucketLog, RecordKind};
use crate::manifest::{Manifest, ManifestRecord};
use crate::options::BucketOptions;
use crate::system::{SystemEntry, SystemPerformanceEntry};
use crate::txn::{IndexOp, Mode, Transaction};

const SYS_BUCKET: &str = "_sys";
const SYS_PERF_BUCKET: &str = "_sysperf";

fn is_reserved(name: &str) -> bool {
    name == SYS_BUCKET || name == SYS_PERF_BUCKET
}

type ManagerHandle = (thread::JoinHandle<()>, mpsc::Sender<()>);

/// The embedded store's root handle. Owns every bucket, the manifest, and
/// one background manager thread per bucket plus one for the database
/// itself (§4.5, §4.6).
pub struct Database {
    config: Arc<RwLock<Config>>,
    dir_path: PathBuf,
    buckets: Arc<RwLock<HashMap<String, Arc<RwLock<Bucket>>>>>,
    bucket_managers: RwLock<HashMap<String, ManagerHandle>>,
    manifest: Option<Arc<Mutex<Manifest>>>,
    db_manager: Option<ManagerHandle>,
}

fn open_bucket(
    dir_path: &Path,
    name: &str,
    opts: BucketOptions,
    persist: bool,
    index_defs: Option<&[(String, IndexValueType)]>,
) -> Result<Bucket> {
    let (log_handle, records) = if persist {
        let log_path = dir_path.join(format!("{}.stitch", name));
        let records = if log_path.exists() { crate::log::read_all(&log_path)? } else { Vec::new() };
        (Some(BucketLog::open(&log_path)?), records)
    } else {
        (None, Vec::new())
    };
    let mut bucket = Bucket::new(name, opts, persist, log_handle)?;
    for record in records {
        match record.kind {
            RecordKind::Insert => {
                bucket.insert(Arc::new(record.to_entry()));
            }
            RecordKind::Delete => {
                bucket.delete(&record.key);
            }
        }
    }
    if let Some(defs) = index_defs {
        for (path, vtype) in defs {
            bucket.create_index(path, *vtype)?;
        }
    }
    Ok(bucket)
}

impl Database {
    /// §6 `Open`: fails cleanly with no partial state — no buckets opened,
    /// no managers started — if recovery hits a parse error.
    pub fn open(config: Config) -> Result<Database> {
        let start = Instant::now();
        let dir_path = PathBuf::from(&config.dir_path);
        if config.persist {
            fs::create_dir_all(&dir_path).map_err(|e| Error::io(format!("create db dir {:?}", dir_path), e))?;
        }

        let manifest = if config.persist {
            Some(Manifest::open(dir_path.join("sbkt.conf"))?)
        } else {
            None
        };

        let mut buckets_map: HashMap<String, Arc<RwLock<Bucket>>> = HashMap::new();

        if let Some(manifest) = &manifest {
            let (bucket_defs, index_defs) = replay_manifest(&manifest.read_all()?);
            for (name, opts) in &bucket_defs {
                let defs = index_defs.get(name).map(|v| v.as_slice());
                let bucket = open_bucket(&dir_path, name, *opts, true, defs)?;
                buckets_map.insert(name.clone(), Arc::new(RwLock::new(bucket)));
            }
        }
        let manifest = manifest.map(|m| Arc::new(Mutex::new(m)));

        let sys_opts = BucketOptions::new().set_system(true);
        buckets_map.insert(
            SYS_BUCKET.to_string(),
            Arc::new(RwLock::new(open_bucket(&dir_path, SYS_BUCKET, sys_opts, config.persist, None)?)),
        );
        buckets_map.insert(
            SYS_PERF_BUCKET.to_string(),
            Arc::new(RwLock::new(open_bucket(&dir_path, SYS_PERF_BUCKET, sys_opts, config.persist, None)?)),
        );

        let config = Arc::new(RwLock::new(config));
        let buckets = Arc::new(RwLock::new(buckets_map));

        let mut bucket_managers = HashMap::new();
        for (name, bucket) in buckets.read().iter() {
            let (handle, tx) = spawn_manager(name.clone(), bucket.clone(), config.clone());
            bucket_managers.insert(name.clone(), (handle, tx));
        }

        let db_manager = Some(spawn_db_manager(buckets.clone(), config.clone(), manifest.clone()));

        let db = Database {
            config: config.clone(),
            dir_path,
            buckets,
            bucket_managers: RwLock::new(bucket_managers),
            manifest,
            db_manager,
        };

        let cfg = db.config.read();
        if cfg.developer {
            let names: Vec<String> = db.buckets.read().keys().cloned().collect();
            let entry = SystemEntry {
                loaded_at: crate::entry::now_millis(),
                startup_duration: start.elapsed(),
                bucket_count: names.len(),
                bucket_names: names,
                manage_frequency: cfg.manage_frequency,
                version: env!("CARGO_PKG_VERSION").to_string(),
            }
            .into_entry();
            drop(cfg);
            db.write_internal_entry(SYS_BUCKET, entry);
        }

        info!(target: "db", "opened database at {:?} in {:?}", db.dir_path, start.elapsed());
        Ok(db)
    }

    pub fn get_config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write() = config;
    }

    /// §6 `CreateBucket`.
    pub fn create_bucket(&self, name: &str, opts: BucketOptions) -> Result<()> {
        if is_reserved(name) {
            return Err(Error::InvalidArgument(format!("bucket name {:?} is reserved", name)));
        }
        if self.buckets.read().contains_key(name) {
            return Err(Error::InvalidArgument(format!("bucket {:?} already exists", name)));
        }
        let persist = self.config.read().persist;
        let bucket = open_bucket(&self.dir_path, name, opts, persist, None)?;
        let arc = Arc::new(RwLock::new(bucket));
        self.buckets.write().insert(name.to_string(), arc.clone());

        let (handle, tx) = spawn_manager(name.to_string(), arc, self.config.clone());
        self.bucket_managers.write().insert(name.to_string(), (handle, tx));

        if let Some(manifest) = &self.manifest {
            manifest.lock().append(&ManifestRecord::Create {
                name: name.to_string(),
                opts,
            })?;
        }
        info!(target: "db", "created bucket {:?}", name);
        Ok(())
    }

    /// §6 `DropBucket`.
    pub fn drop_bucket(&self, name: &str) -> Result<()> {
        if is_reserved(name) {
            return Err(Error::InvalidArgument(format!("bucket name {:?} is reserved", name)));
        }
        if self.buckets.write().remove(name).is_none() {
            return Err(Error::InvalidArgument(format!("bucket {:?} does not exist", name)));
        }
        if let Some((handle, tx)) = self.bucket_managers.write().remove(name) {
            drop(tx);
            let _ = handle.join();
        }
        if let Some(manifest) = &self.manifest {
            manifest.lock().append(&ManifestRecord::Drop { name: name.to_string() })?;
            let log_path = self.dir_path.join(format!("{}.stitch", name));
            if log_path.exists() {
                if let Err(e) = fs::remove_file(&log_path) {
                    warn!(target: "db", "failed to remove log for dropped bucket {:?}: {}", name, e);
                }
            }
        }
        info!(target: "db", "dropped bucket {:?}", name);
        Ok(())
    }

    fn lookup_bucket(&self, name: &str) -> Result<Arc<RwLock<Bucket>>> {
        self.buckets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("bucket {:?} does not exist", name)))
    }

    /// §4.4 / §6 `View`: read-only transaction.
    ///
    /// `f` is universally quantified over the transaction's lifetime: the
    /// lock guard backing it is created inside this call and never escapes,
    /// so no caller-visible lifetime can name it directly.
    pub fn view<T>(&self, name: &str, f: impl for<'a> FnOnce(&mut Transaction<'a>) -> Result<T>) -> Result<T> {
        let bucket = self.lookup_bucket(name)?;
        let guard = bucket.read();
        let mut tx = Transaction::new_read(guard);
        let start = Instant::now();
        let outcome = f(&mut tx);
        tx.rollback()?;
        self.maybe_record_perf(name, Mode::Read, outcome.is_ok(), start.elapsed());
        outcome
    }

    /// §4.4 / §6 `Update`: read-write transaction.
    pub fn update<T>(&self, name: &str, f: impl for<'a> FnOnce(&mut Transaction<'a>) -> Result<T>) -> Result<T> {
        let bucket = self.lookup_bucket(name)?;
        let guard = bucket.write();
        let (write_freq, sync_freq) = {
            let cfg = self.config.read();
            (cfg.write_freq, cfg.sync_freq)
        };
        let mut tx = Transaction::new_write(guard, write_freq, sync_freq);
        let start = Instant::now();
        let outcome = f(&mut tx);
        let should_commit = outcome.is_ok();
        let commit_result = if should_commit { tx.commit() } else { tx.rollback().map(|()| Vec::new()) };
        let committed = should_commit && commit_result.is_ok();
        if committed {
            if let Ok(ops) = &commit_result {
                self.persist_index_ops(name, ops);
            }
        }
        self.maybe_record_perf(name, Mode::Write, committed, start.elapsed());
        commit_result?;
        outcome
    }

    /// §10.4: append a `CREATE_INDEX`/`DROP_INDEX` manifest record for every
    /// index operation a just-committed transaction made, at the same point
    /// a bucket `CREATE`/`DROP` record is appended.
    fn persist_index_ops(&self, bucket: &str, ops: &[IndexOp]) {
        let Some(manifest) = &self.manifest else {
            return;
        };
        let mut manifest = manifest.lock();
        for op in ops {
            let record = match op {
                IndexOp::Create { path, vtype } => ManifestRecord::CreateIndex {
                    bucket: bucket.to_string(),
                    path: path.clone(),
                    vtype: *vtype,
                },
                IndexOp::Drop { path } => ManifestRecord::DropIndex {
                    bucket: bucket.to_string(),
                    path: path.clone(),
                },
            };
            if let Err(e) = manifest.append(&record) {
                warn!(target: "db", "failed to persist index record for bucket {:?}: {}", bucket, e);
            }
        }
    }

    fn maybe_record_perf(&self, bucket: &str, mode: Mode, committed: bool, duration: Duration) {
        if is_reserved(bucket) || !self.config.read().performance_monitor {
            return;
        }
        let entry = SystemPerformanceEntry {
            mode,
            bucket: bucket.to_string(),
            committed,
            duration,
            synced: false,
            sync_duration: Duration::ZERO,
        }
        .into_entry();
        self.write_internal_entry(SYS_PERF_BUCKET, entry);
    }

    /// Bootstrap writes into `_sys` / `_sysperf` bypass the transaction
    /// journal machinery (they are not user rollback-able) but still go
    /// through [Bucket::insert] and, when persisted, the bucket's log.
    fn write_internal_entry(&self, bucket_name: &str, entry: Entry) {
        let Some(bucket) = self.buckets.read().get(bucket_name).cloned() else {
            return;
        };
        let mut b = bucket.write();
        b.insert(Arc::new(entry.clone()));
        if let Some(log) = b.log_mut() {
            let record = crate::log::LogRecord::from_entry(RecordKind::Insert, &entry);
            if let Err(e) = log.append(&record).and_then(|_| log.flush()) {
                warn!(target: "db", "failed to log internal entry into {:?}: {}", bucket_name, e);
            }
        }
    }

    /// §6 `Close`: best-effort, surfaces the first error but still
    /// attempts every remaining step.
    pub fn close(self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        for (name, (handle, tx)) in self.bucket_managers.into_inner() {
            drop(tx);
            if handle.join().is_err() {
                warn!(target: "db", "manager thread for bucket {:?} panicked", name);
                first_err.get_or_insert(Error::InvalidState(format!("manager for {:?} panicked", name)));
            }
        }
        if let Some((handle, tx)) = self.db_manager {
            drop(tx);
            if handle.join().is_err() {
                warn!(target: "db", "database manager thread panicked");
                first_err.get_or_insert(Error::InvalidState("database manager panicked".to_string()));
            }
        }

        for bucket in self.buckets.read().values() {
            let mut b = bucket.write();
            if let Some(log) = b.log_mut() {
                if let Err(e) = log.sync() {
                    warn!(target: "db", "failed to sync bucket {:?} on close: {}", b.name(), e);
                    first_err.get_or_insert(e);
                }
            }
        }

        info!(target: "db", "closed database at {:?}", self.dir_path);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn replay_manifest(records: &[ManifestRecord]) -> (HashMap<String, BucketOptions>, HashMap<String, Vec<(String, IndexValueType)>>) {
    let mut bucket_defs: HashMap<String, BucketOptions> = HashMap::new();
    let mut index_defs: HashMap<String, Vec<(String, IndexValueType)>> = HashMap::new();
    for record in records {
        match record {
            ManifestRecord::Create { name, opts } => {
                bucket_defs.insert(name.clone(), *opts);
            }
            ManifestRecord::Drop { name } => {
                bucket_defs.remove(name);
                index_defs.remove(name);
            }
            ManifestRecord::CreateIndex { bucket, path, vtype } => {
                index_defs.entry(bucket.clone()).or_default().push((path.clone(), *vtype));
            }
            ManifestRecord::DropIndex { bucket, path } => {
                if let Some(defs) = index_defs.get_mut(bucket) {
                    defs.retain(|(p, _)| p != path);
                }
            }
        }
    }
    (bucket_defs, index_defs)
}

/// §4.6 database manager: truncate and rewrite the manifest once it has
/// grown past `bucket count * compaction factor` records, replacing the
/// full CREATE/DROP/CREATE_INDEX/DROP_INDEX history with one CREATE (and
/// any surviving CREATE_INDEX) record per currently-live bucket.
fn spawn_db_manager(
    buckets: Arc<RwLock<HashMap<String, Arc<RwLock<Bucket>>>>>,
    config: Arc<RwLock<Config>>,
    manifest: Option<Arc<Mutex<Manifest>>>,
) -> ManagerHandle {
    let (tx, rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || loop {
        let tick = config.read().manage_frequency;
        match rx.recv_timeout(tick) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let Some(manifest) = manifest.as_ref() else {
            continue;
        };
        let limit = config.read().bucket_file_mult_limit;
        let bucket_count = buckets.read().len() as u64;
        let threshold = bucket_count.saturating_mul(limit);
        if manifest.lock().record_count() <= threshold {
            continue;
        }
        let mut records = Vec::new();
        for (name, bucket) in buckets.read().iter() {
            if is_reserved(name) {
                continue;
            }
            let b = bucket.read();
            records.push(ManifestRecord::Create {
                name: name.clone(),
                opts: *b.options(),
            });
            for path in b.index_names() {
                if let Some(idx) = b.index(&path) {
                    records.push(ManifestRecord::CreateIndex {
                        bucket: name.clone(),
                        path: idx.path().to_string(),
                        vtype: idx.value_type(),
                    });
                }
            }
        }
        if let Err(e) = manifest.lock().rewrite(&records) {
            warn!(target: "db", "manifest compaction failed: {}", e);
        }
    });
    (handle, tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;
    use tempfile::tempdir;

    #[test]
    fn create_view_and_update_round_trip() {
        let cfg = Config::new();
        let db = Database::open(cfg).unwrap();
        db.create_bucket("b", BucketOptions::new()).unwrap();
        db.update("b", |tx| {
            tx.set(Entry::new("a", "{}", EntryOptions::new()))?;
            Ok(())
        })
        .unwrap();
        let found = db.view("b", |tx| Ok(tx.get(&Entry::new("a", "{}", EntryOptions::new())))).unwrap();
        assert!(found.is_some());
        db.close().unwrap();
    }

    #[test]
    fn reserved_names_rejected() {
        let db = Database::open(Config::new()).unwrap();
        assert!(db.create_bucket("_sys", BucketOptions::new()).is_err());
        assert!(db.drop_bucket("_sysperf").is_err());
        db.close().unwrap();
    }

    #[test]
    fn view_on_missing_bucket_errors() {
        let db = Database::open(Config::new()).unwrap();
        let result = db.view("nope", |_tx| Ok(()));
        assert!(result.is_err());
        db.close().unwrap();
    }

    #[test]
    fn rollback_on_callback_error_leaves_no_trace() {
        let db = Database::open(Config::new()).unwrap();
        db.create_bucket("b", BucketOptions::new()).unwrap();
        db.update("b", |tx| {
            tx.set(Entry::new("a", "{}", EntryOptions::new()))?;
            Ok(())
        })
        .unwrap();
        let err = db.update("b", |tx| {
            tx.delete(&Entry::new("a", "{}", EntryOptions::new()))?;
            Err::<(), Error>(Error::InvalidArgument("boom".to_string()))
        });
        assert!(err.is_err());
        let found = db.view("b", |tx| Ok(tx.get(&Entry::new("a", "{}", EntryOptions::new())))).unwrap();
        assert!(found.is_some());
        db.close().unwrap();
    }

    #[test]
    fn persisted_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::new();
        cfg.set_persist(true).set_dir_path(dir.path().to_str().unwrap().to_string());
        let db = Database::open(cfg.clone()).unwrap();
        db.create_bucket("x", BucketOptions::new()).unwrap();
        db.update("x", |tx| {
            tx.set(Entry::new("k1", r#"{"v":1}"#, EntryOptions::new()))?;
            Ok(())
        })
        .unwrap();
        db.update("x", |tx| {
            tx.delete(&Entry::new("k1", "{}", EntryOptions::new()))?;
            tx.set(Entry::new("k2", r#"{"v":2}"#, EntryOptions::new()))?;
            Ok(())
        })
        .unwrap();
        db.close().unwrap();

        let db2 = Database::open(cfg).unwrap();
        let size = db2.view("x", |tx| Ok(tx.size(None))).unwrap();
        assert_eq!(size, 1);
        let k2 = db2.view("x", |tx| Ok(tx.get(&Entry::new("k2", "{}", EntryOptions::new())))).unwrap();
        assert!(k2.is_some());
        let k1 = db2.view("x", |tx| Ok(tx.get(&Entry::new("k1", "{}", EntryOptions::new())))).unwrap();
        assert!(k1.is_none());
        db2.close().unwrap();
    }

    #[test]
    fn index_created_in_transaction_survives_reopen() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::new();
        cfg.set_persist(true).set_dir_path(dir.path().to_str().unwrap().to_string());
        let db = Database::open(cfg.clone()).unwrap();
        db.create_bucket("x", BucketOptions::new()).unwrap();
        db.update("x", |tx| {
            tx.set(Entry::new("k1", r#"{"age":30}"#, EntryOptions::new()))?;
            tx.create_index("age", crate::entry::IndexValueType::Int)?;
            Ok(())
        })
        .unwrap();
        db.close().unwrap();

        let db2 = Database::open(cfg).unwrap();
        let indexes = db2.view("x", |tx| Ok(tx.indexes())).unwrap();
        assert_eq!(indexes, vec!["age".to_string()]);
        let found = db2
            .view("x", |tx| Ok(tx.has(Some("age"), &Entry::new("k1", r#"{"age":30}"#, EntryOptions::new()))))
            .unwrap();
        assert!(found);
        db2.close().unwrap();
    }

    #[test]
    fn dropped_index_does_not_reappear_after_reopen() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::new();
        cfg.set_persist(true).set_dir_path(dir.path().to_str().unwrap().to_string());
        let db = Database::open(cfg.clone()).unwrap();
        db.create_bucket("x", BucketOptions::new()).unwrap();
        db.update("x", |tx| tx.create_index("age", crate::entry::IndexValueType::Int)).unwrap();
        db.update("x", |tx| tx.drop_index("age")).unwrap();
        db.close().unwrap();

        let db2 = Database::open(cfg).unwrap();
        let indexes = db2.view("x", |tx| Ok(tx.indexes())).unwrap();
        assert!(indexes.is_empty());
        db2.close().unwrap();
    }
}
