//! Entry type and the ordering machinery used by every tree in a bucket.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Declared value type for a secondary index's comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexValueType {
    Str,
    Uint,
    Int,
    Float,
}

impl IndexValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexValueType::Str => "string",
            IndexValueType::Uint => "uint",
            IndexValueType::Int => "int",
            IndexValueType::Float => "float",
        }
    }

    pub fn parse(s: &str) -> Result<IndexValueType> {
        match s {
            "string" => Ok(IndexValueType::Str),
            "uint" => Ok(IndexValueType::Uint),
            "int" => Ok(IndexValueType::Int),
            "float" => Ok(IndexValueType::Float),
            other => Err(Error::Parse(format!("unknown index value type {:?}", other))),
        }
    }
}

/// A typed value extracted from an entry's JSON at a secondary index's
/// field-path, ordered per [IndexValueType]. Unknown/unrecognized types
/// fall back to string comparison (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Str(String),
    Uint(u64),
    Int(i64),
    Float(f64),
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Str(a), IndexValue::Str(b)) => a.cmp(b),
            (IndexValue::Uint(a), IndexValue::Uint(b)) => a.cmp(b),
            (IndexValue::Int(a), IndexValue::Int(b)) => a.cmp(b),
            (IndexValue::Float(a), IndexValue::Float(b)) => a.total_cmp(b),
            // Mixed variants should never be compared within the same
            // index tree (every value in a tree was extracted with the
            // same IndexValueType), but fall back to string comparison
            // rather than panic.
            (a, b) => a.to_sort_string().cmp(&b.to_sort_string()),
        }
    }
}

impl IndexValue {
    fn to_sort_string(&self) -> String {
        match self {
            IndexValue::Str(s) => s.clone(),
            IndexValue::Uint(v) => v.to_string(),
            IndexValue::Int(v) => v.to_string(),
            IndexValue::Float(v) => v.to_string(),
        }
    }

    /// Zero value of the type, used only for the comparator's definedness;
    /// never actually inserted (§4.1: entries missing the field are not
    /// indexed at all).
    pub fn zero(vtype: IndexValueType) -> IndexValue {
        match vtype {
            IndexValueType::Str => IndexValue::Str(String::new()),
            IndexValueType::Uint => IndexValue::Uint(0),
            IndexValueType::Int => IndexValue::Int(0),
            IndexValueType::Float => IndexValue::Float(0.0),
        }
    }

    pub fn parse_pivot(vtype: IndexValueType, pivot: &str) -> Result<IndexValue> {
        let bad = || Error::InvalidArgument(format!("pivot {:?} does not match index type", pivot));
        Ok(match vtype {
            IndexValueType::Str => IndexValue::Str(pivot.to_string()),
            IndexValueType::Uint => IndexValue::Uint(pivot.parse().map_err(|_| bad())?),
            IndexValueType::Int => IndexValue::Int(pivot.parse().map_err(|_| bad())?),
            IndexValueType::Float => IndexValue::Float(pivot.parse().map_err(|_| bad())?),
        })
    }
}

/// Sort key for a non-primary tree: an ordering dimension plus the primary
/// key as a tie-breaker. I3: "ties break on insertion identity" — the
/// primary key is a stable, unique stand-in for insertion identity since
/// keys are unique within a bucket (I2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey<T: Ord + Clone> {
    pub primary: T,
    pub key: String,
}

impl<T: Ord + Clone> SortKey<T> {
    pub fn new(primary: T, key: impl Into<String>) -> SortKey<T> {
        SortKey {
            primary,
            key: key.into(),
        }
    }
}

impl<T: Ord + Clone> PartialOrd for SortKey<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord + Clone> Ord for SortKey<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.primary.cmp(&other.primary).then_with(|| self.key.cmp(&other.key))
    }
}

/// Unix-epoch time, to the millisecond, used as the ordering dimension for
/// the expiration and invalidation trees.
pub type EpochMillis = i64;

pub fn to_epoch_millis(t: SystemTime) -> EpochMillis {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as EpochMillis,
        Err(e) => -(e.duration().as_millis() as EpochMillis),
    }
}

pub fn from_epoch_millis(ms: EpochMillis) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis((-ms) as u64)
    }
}

pub fn now_millis() -> EpochMillis {
    to_epoch_millis(SystemTime::now())
}

/// Per-entry expiration/invalidation/spatial options (§3, EntryOptions).
#[derive(Debug, Clone, PartialEq)]
pub struct EntryOptions {
    pub expires: Option<EpochMillis>,
    pub invalidates: Option<EpochMillis>,
    /// Spatial half-extent used to expand a point into a bounding rectangle.
    pub tolerance: f64,
}

impl Default for EntryOptions {
    fn default() -> EntryOptions {
        EntryOptions {
            expires: None,
            invalidates: None,
            tolerance: 0.0,
        }
    }
}

impl EntryOptions {
    pub fn new() -> EntryOptions {
        EntryOptions::default()
    }

    pub fn expires_at(mut self, when: SystemTime) -> Self {
        self.expires = Some(to_epoch_millis(when));
        self
    }

    pub fn invalidates_at(mut self, when: SystemTime) -> Self {
        self.invalidates = Some(to_epoch_millis(when));
        self
    }

    pub fn tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn does_expire(&self) -> bool {
        self.expires.is_some()
    }

    pub fn does_invalidate(&self) -> bool {
        self.invalidates.is_some()
    }
}

/// A stored record: primary key, raw JSON value, options, the invalidated
/// flag, and lazily-derived spatial coordinates.
///
/// `invalidated` is an [AtomicBool] rather than a plain `bool` so that an
/// [Entry] can live, shared, inside several trees (primary, spatial,
/// secondary indexes) behind an `Arc` while still letting the sweeper flip
/// it under the bucket write lock (§5, "Shared resources").
#[derive(Debug)]
pub struct Entry {
    key: String,
    value: String,
    opts: EntryOptions,
    invalidated: AtomicBool,
    coords: Option<Vec<f64>>,
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        Entry {
            key: self.key.clone(),
            value: self.value.clone(),
            opts: self.opts.clone(),
            invalidated: AtomicBool::new(self.invalidated.load(AtomicOrdering::SeqCst)),
            coords: self.coords.clone(),
        }
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.opts == other.opts
            && self.invalidated.load(AtomicOrdering::SeqCst) == other.invalidated.load(AtomicOrdering::SeqCst)
            && self.coords == other.coords
    }
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, opts: EntryOptions) -> Entry {
        let value = value.into();
        let coords = extract_coords(&value);
        Entry {
            key: key.into(),
            value,
            opts,
            invalidated: AtomicBool::new(false),
            coords,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn options(&self) -> &EntryOptions {
        &self.opts
    }

    pub fn coords(&self) -> Option<&[f64]> {
        self.coords.as_deref()
    }

    pub fn set_invalidated(&self) {
        self.invalidated.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_invalidated_flag(&self) -> bool {
        self.invalidated.load(AtomicOrdering::SeqCst)
    }

    /// Expired iff `now >= expire_time`. The historical implementation this
    /// crate descends from inverted this test (`expTime.After(now)`); that
    /// inversion is a documented bug, not a behavior to reproduce.
    pub fn is_expired(&self) -> bool {
        match self.opts.expires {
            Some(exp) => now_millis() >= exp,
            None => false,
        }
    }

    /// Invalid iff the flag is set, or `now >= invalidate_time`. Same
    /// correction as [Entry::is_expired].
    pub fn is_invalid(&self) -> bool {
        if self.is_invalidated_flag() {
            return true;
        }
        match self.opts.invalidates {
            Some(inv) => now_millis() >= inv,
            None => false,
        }
    }

    /// `get` should never observe an expired or invalidated entry (§4.4).
    pub fn is_live(&self) -> bool {
        !self.is_expired() && !self.is_invalid()
    }

    /// Extract the typed value at `path` per the declared index type.
    /// Returns `None` if the path does not exist in the entry's JSON.
    pub fn index_value(&self, path: &str, vtype: IndexValueType) -> Option<IndexValue> {
        let v = gjson::get(&self.value, path);
        if !v.exists() {
            return None;
        }
        Some(match vtype {
            IndexValueType::Str => IndexValue::Str(v.str().to_string()),
            IndexValueType::Uint => IndexValue::Uint(v.u64()),
            IndexValueType::Int => IndexValue::Int(v.i64()),
            IndexValueType::Float => IndexValue::Float(v.f64()),
        })
    }
}

/// Pull the `coords` JSON array out of a raw value, if any (§4.1).
fn extract_coords(value: &str) -> Option<Vec<f64>> {
    let v = gjson::get(value, "coords");
    if !v.exists() {
        return None;
    }
    let mut out = Vec::new();
    v.each(|_, value| {
        out.push(value.f64());
        true
    });
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expired_is_correct_not_inverted() {
        let past = SystemTime::now() - Duration::from_secs(1);
        let e = Entry::new("k", "{}", EntryOptions::new().expires_at(past));
        assert!(e.is_expired());

        let future = SystemTime::now() + Duration::from_secs(60);
        let e = Entry::new("k", "{}", EntryOptions::new().expires_at(future));
        assert!(!e.is_expired());
    }

    #[test]
    fn invalid_is_correct_not_inverted() {
        let past = SystemTime::now() - Duration::from_secs(1);
        let e = Entry::new("k", "{}", EntryOptions::new().invalidates_at(past));
        assert!(e.is_invalid());

        let future = SystemTime::now() + Duration::from_secs(60);
        let e = Entry::new("k", "{}", EntryOptions::new().invalidates_at(future));
        assert!(!e.is_invalid());
    }

    #[test]
    fn coords_extracted_from_json() {
        let e = Entry::new("k", r#"{"coords":[1.0, 2.5]}"#, EntryOptions::new());
        assert_eq!(e.coords(), Some(&[1.0, 2.5][..]));
    }

    #[test]
    fn missing_coords_is_none() {
        let e = Entry::new("k", r#"{"v":1}"#, EntryOptions::new());
        assert_eq!(e.coords(), None);
    }

    #[test]
    fn index_value_missing_field_is_none() {
        let e = Entry::new("k", r#"{"v":1}"#, EntryOptions::new());
        assert!(e.index_value("nope", IndexValueType::Int).is_none());
    }

    #[test]
    fn string_index_compares_as_string_not_float() {
        let zero = IndexValue::Str("10".to_string());
        let one = IndexValue::Str("9".to_string());
        // lexicographic: "10" < "9"
        assert!(zero < one);
    }
}
