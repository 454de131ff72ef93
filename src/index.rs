//! Secondary indexes: an [OrderedTree] keyed by a field's typed, extracted
//! value, plus the primary key as a tie-breaker (§4.3).

use std::sync::Arc;

use crate::entry::{Entry, IndexValue, IndexValueType, SortKey};
use crate::error::Result;
use crate::tree::OrderedTree;

/// A single secondary index over one JSON field-path.
pub struct SecondaryIndex {
    name: String,
    path: String,
    vtype: IndexValueType,
    tree: OrderedTree<SortKey<IndexValue>, Arc<Entry>>,
}

impl SecondaryIndex {
    pub fn new(name: impl Into<String>, path: impl Into<String>, vtype: IndexValueType) -> SecondaryIndex {
        SecondaryIndex {
            name: name.into(),
            path: path.into(),
            vtype,
            tree: OrderedTree::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value_type(&self) -> IndexValueType {
        self.vtype
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    fn sort_key_for(&self, entry: &Entry) -> Option<SortKey<IndexValue>> {
        entry
            .index_value(&self.path, self.vtype)
            .map(|v| SortKey::new(v, entry.key()))
    }

    /// Index `entry` if it carries the indexed field; a missing field is
    /// silently skipped, not an error (§4.3).
    pub fn insert(&mut self, entry: &Arc<Entry>) {
        if let Some(sk) = self.sort_key_for(entry) {
            self.tree.insert(sk, entry.clone());
        }
    }

    pub fn delete(&mut self, entry: &Entry) {
        if let Some(sk) = self.sort_key_for(entry) {
            self.tree.remove(&sk);
        }
    }

    /// Drop and re-populate the index from the full entry set, e.g. after
    /// `CreateIndex` on a bucket with existing data.
    pub fn rebuild<'a>(&mut self, entries: impl Iterator<Item = &'a Arc<Entry>>) {
        self.tree = OrderedTree::new();
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn ascend<F: FnMut(&Arc<Entry>) -> bool>(&self, mut f: F) {
        self.tree.ascend(|_, v| f(v));
    }

    pub fn descend<F: FnMut(&Arc<Entry>) -> bool>(&self, mut f: F) {
        self.tree.descend(|_, v| f(v));
    }

    pub fn min(&self) -> Option<Arc<Entry>> {
        self.tree.min().map(|(_, v)| v.clone())
    }

    pub fn max(&self) -> Option<Arc<Entry>> {
        self.tree.max().map(|(_, v)| v.clone())
    }

    /// §4.3 `get`: any entry whose indexed field equals `probe`'s indexed
    /// field. `None` if `probe` does not expose the field or no entry
    /// matches.
    pub fn get(&self, probe: &Entry) -> Option<Arc<Entry>> {
        let v = probe.index_value(&self.path, self.vtype)?;
        let mut found = None;
        self.tree.ascend_ge(&SortKey::new(v.clone(), String::new()), |k, val| {
            if k.primary == v {
                found = Some(val.clone());
            }
            false
        });
        found
    }

    fn pivot_key(&self, pivot: &str) -> Result<SortKey<IndexValue>> {
        Ok(SortKey::new(IndexValue::parse_pivot(self.vtype, pivot)?, ""))
    }

    pub fn ascend_ge<F: FnMut(&Arc<Entry>) -> bool>(&self, pivot: &str, mut f: F) -> Result<()> {
        let pk = self.pivot_key(pivot)?;
        self.tree.ascend_ge(&pk, |_, v| f(v));
        Ok(())
    }

    pub fn ascend_lt<F: FnMut(&Arc<Entry>) -> bool>(&self, pivot: &str, mut f: F) -> Result<()> {
        let pk = self.pivot_key(pivot)?;
        self.tree.ascend_lt(&pk, |_, v| f(v));
        Ok(())
    }

    pub fn ascend_range<F: FnMut(&Arc<Entry>) -> bool>(&self, lo: &str, hi: &str, mut f: F) -> Result<()> {
        let lo = self.pivot_key(lo)?;
        let hi = self.pivot_key(hi)?;
        self.tree.ascend_range(&lo, &hi, |_, v| f(v));
        Ok(())
    }

    pub fn descend_le<F: FnMut(&Arc<Entry>) -> bool>(&self, pivot: &str, mut f: F) -> Result<()> {
        let pk = self.pivot_key(pivot)?;
        self.tree.descend_le(&pk, |_, v| f(v));
        Ok(())
    }

    pub fn descend_gt<F: FnMut(&Arc<Entry>) -> bool>(&self, pivot: &str, mut f: F) -> Result<()> {
        let pk = self.pivot_key(pivot)?;
        self.tree.descend_gt(&pk, |_, v| f(v));
        Ok(())
    }

    pub fn descend_range<F: FnMut(&Arc<Entry>) -> bool>(&self, lo: &str, hi: &str, mut f: F) -> Result<()> {
        let lo = self.pivot_key(lo)?;
        let hi = self.pivot_key(hi)?;
        self.tree.descend_range(&lo, &hi, |_, v| f(v));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;

    fn entry(key: &str, age: i64) -> Arc<Entry> {
        Arc::new(Entry::new(key, format!(r#"{{"age":{}}}"#, age), EntryOptions::new()))
    }

    #[test]
    fn ascend_ge_respects_pivot() {
        let mut idx = SecondaryIndex::new("by_age", "age", IndexValueType::Int);
        for (k, age) in [("a", 10), ("b", 20), ("c", 30)] {
            idx.insert(&entry(k, age));
        }
        let mut seen = vec![];
        idx.ascend_ge("20", |e| {
            seen.push(e.key().to_string());
            true
        })
        .unwrap();
        assert_eq!(seen, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn missing_field_is_not_indexed() {
        let mut idx = SecondaryIndex::new("by_age", "age", IndexValueType::Int);
        let e = Arc::new(Entry::new("x", "{}", EntryOptions::new()));
        idx.insert(&e);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn delete_removes_entry() {
        let mut idx = SecondaryIndex::new("by_age", "age", IndexValueType::Int);
        let e = entry("a", 10);
        idx.insert(&e);
        assert_eq!(idx.len(), 1);
        idx.delete(&e);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn rebuild_repopulates_from_entries() {
        let mut idx = SecondaryIndex::new("by_age", "age", IndexValueType::Int);
        let entries = vec![entry("a", 1), entry("b", 2)];
        idx.rebuild(entries.iter());
        assert_eq!(idx.len(), 2);
    }
}
