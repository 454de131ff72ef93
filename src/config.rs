//! Database-wide configuration.
//!
//! Follows the functional-options shape used throughout the corpus this
//! crate is descended from (see `wral::Config`): a plain struct with a
//! `new()` constructor and `set_*` builder methods returning `&mut Self`.

use std::time::Duration;

/// Cadence at which an I/O side-effect (sync or write) happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFrequency {
    /// Perform the effect on every commit.
    EachCommit,
    /// Defer the effect to the periodic manager tick.
    ManagerTick,
    /// Never perform the effect explicitly (rely on the OS).
    None,
}

/// Database-wide configuration, recognized fields per the manifest/API spec.
#[derive(Debug, Clone)]
pub struct Config {
    pub persist: bool,
    pub dir_path: String,
    pub sync_freq: IoFrequency,
    pub write_freq: IoFrequency,
    pub manage_frequency: Duration,
    pub developer: bool,
    pub performance_monitor: bool,
    pub bucket_file_mult_limit: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            persist: false,
            dir_path: "sbkt.db".to_string(),
            sync_freq: IoFrequency::EachCommit,
            write_freq: IoFrequency::EachCommit,
            manage_frequency: Duration::from_secs(1),
            developer: false,
            performance_monitor: false,
            bucket_file_mult_limit: 10,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn set_persist(&mut self, persist: bool) -> &mut Self {
        self.persist = persist;
        self
    }

    pub fn set_dir_path(&mut self, dir_path: impl Into<String>) -> &mut Self {
        self.dir_path = dir_path.into();
        self
    }

    pub fn set_sync_freq(&mut self, freq: IoFrequency) -> &mut Self {
        self.sync_freq = freq;
        self
    }

    pub fn set_write_freq(&mut self, freq: IoFrequency) -> &mut Self {
        self.write_freq = freq;
        self
    }

    pub fn set_manage_frequency(&mut self, frequency: Duration) -> &mut Self {
        self.manage_frequency = frequency;
        self
    }

    pub fn set_developer(&mut self, developer: bool) -> &mut Self {
        self.developer = developer;
        self
    }

    pub fn set_performance_monitor(&mut self, enabled: bool) -> &mut Self {
        self.performance_monitor = enabled;
        self
    }

    pub fn set_bucket_file_mult_limit(&mut self, limit: u64) -> &mut Self {
        self.bucket_file_mult_limit = limit.max(1);
        self
    }
}
