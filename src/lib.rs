//! `sbkt` is an embedded, single-process, multi-bucket key-value store for
//! JSON documents.
//!
//! A [Database] owns a set of named buckets. Each bucket is a primary tree
//! keyed by a string, with optional secondary indexes over JSON
//! field-paths, optional spatial indexing over a `coords` field, and
//! per-entry expiration/invalidation. All mutation happens inside a
//! [Transaction] opened through [Database::view] (read-only) or
//! [Database::update] (read-write); a transaction's effects are durable
//! only once [Transaction::commit] returns, and any error rolls every
//! tree mutation back.
//!
//! When [Config::persist] is set, every bucket keeps an append-only log of
//! its mutations and the database keeps a manifest of bucket and index
//! definitions, both replayed on the next [Database::open].

mod bucket;
mod config;
mod db;
mod entry;
mod error;
mod index;
mod log;
mod manifest;
mod options;
mod spatial;
mod system;
mod tree;
mod txn;

pub use crate::config::{Config, IoFrequency};
pub use crate::db::Database;
pub use crate::entry::{Entry, EntryOptions, IndexValue, IndexValueType};
pub use crate::error::{Error, Result};
pub use crate::options::BucketOptions;
pub use crate::txn::{Mode, Transaction};
