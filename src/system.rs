//! System telemetry entries written into the reserved `_sys` / `_sysperf`
//! buckets (§6 "Reserved bucket names", §10.6).
//!
//! Both are ordinary [Entry] values inserted through [crate::bucket::Bucket::insert];
//! no separate subsystem is needed to store or query them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::entry::{now_millis, Entry, EntryOptions, EpochMillis};
use crate::txn::Mode;

static PERF_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Written once into `_sys` on [crate::db::Database::open] when `developer`
/// is set.
pub struct SystemEntry {
    pub loaded_at: EpochMillis,
    pub startup_duration: Duration,
    pub bucket_count: usize,
    pub bucket_names: Vec<String>,
    pub manage_frequency: Duration,
    pub version: String,
}

impl SystemEntry {
    pub fn into_entry(self) -> Entry {
        let names = self
            .bucket_names
            .iter()
            .map(|n| format!("{:?}", n))
            .collect::<Vec<_>>()
            .join(",");
        let value = format!(
            r#"{{"loadedAt":{},"startupDurationMs":{},"bucketCount":{},"bucketNames":[{}],"manageFrequencyMs":{},"version":{:?}}}"#,
            self.loaded_at,
            self.startup_duration.as_millis(),
            self.bucket_count,
            names,
            self.manage_frequency.as_millis(),
            self.version,
        );
        Entry::new("_startup", value, EntryOptions::new())
    }
}

/// Written into `_sysperf` on every transaction commit/rollback when
/// `performanceMonitor` is set.
pub struct SystemPerformanceEntry {
    pub mode: Mode,
    pub bucket: String,
    pub committed: bool,
    pub duration: Duration,
    pub synced: bool,
    pub sync_duration: Duration,
}

impl SystemPerformanceEntry {
    pub fn into_entry(self) -> Entry {
        let mode = match self.mode {
            Mode::Read => "read",
            Mode::Write => "write",
        };
        let key = format!("{}-{}-{}", self.bucket, now_millis(), PERF_COUNTER.fetch_add(1, Ordering::Relaxed));
        let value = format!(
            r#"{{"mode":{:?},"bucket":{:?},"committed":{},"durationUs":{},"synced":{},"syncDurationUs":{}}}"#,
            mode,
            self.bucket,
            self.committed,
            self.duration.as_micros(),
            self.synced,
            self.sync_duration.as_micros(),
        );
        Entry::new(key, value, EntryOptions::new())
    }
}
