//! Spatial tree facade over the `rstar` crate, standing in for the
//! "multi-dimensional R-tree" third-party contract (§6a).
//!
//! `rstar::Point` requires a compile-time dimension count, while a bucket's
//! dimensionality (§3, `BucketOptions.dims`) is a runtime value. This module
//! bridges the two by zero-padding every point out to [MAX_DIMS]: padding
//! dimensions are identical (zero) across every object in a tree, so they
//! contribute nothing to relative distances or envelope overlap, and a
//! bucket only ever declares `dims <= MAX_DIMS`.

use std::sync::Arc;

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Upper bound on a spatial bucket's declared dimensionality.
pub const MAX_DIMS: usize = 8;

pub type SpatialPoint = [f64; MAX_DIMS];

fn pad(point: &[f64]) -> SpatialPoint {
    let mut p = [0.0; MAX_DIMS];
    for (slot, v) in p.iter_mut().zip(point.iter()) {
        *slot = *v;
    }
    p
}

#[derive(Clone)]
struct SpatialObject {
    entry: Arc<Entry>,
    envelope: AABB<SpatialPoint>,
    point: SpatialPoint,
}

impl SpatialObject {
    fn new(entry: Arc<Entry>, coords: &[f64]) -> SpatialObject {
        let point = pad(coords);
        let tol = entry.options().tolerance;
        let mut lower = point;
        let mut upper = point;
        if tol > 0.0 {
            for i in 0..coords.len().min(MAX_DIMS) {
                lower[i] -= tol;
                upper[i] += tol;
            }
        }
        SpatialObject {
            entry,
            envelope: AABB::from_corners(lower, upper),
            point,
        }
    }
}

impl PartialEq for SpatialObject {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key()
    }
}

impl RTreeObject for SpatialObject {
    type Envelope = AABB<SpatialPoint>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl PointDistance for SpatialObject {
    fn distance_2(&self, point: &SpatialPoint) -> f64 {
        self.point
            .iter()
            .zip(point.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Owns the R-tree for a spatial bucket.
pub struct SpatialTree {
    rtree: RTree<SpatialObject>,
    dims: usize,
}

impl SpatialTree {
    pub fn new(dims: usize) -> Result<SpatialTree> {
        if dims == 0 || dims > MAX_DIMS {
            return Err(Error::Option(format!(
                "spatial dims must be in 1..={}, got {}",
                MAX_DIMS, dims
            )));
        }
        Ok(SpatialTree {
            rtree: RTree::new(),
            dims,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.rtree.size()
    }

    /// Insert `entry` if it carries a `coords` array (I1); no-op otherwise.
    pub fn insert(&mut self, entry: Arc<Entry>) {
        if let Some(coords) = entry.coords() {
            self.rtree.insert(SpatialObject::new(entry, coords));
        }
    }

    /// Remove the object backing `entry`, if present. `entry` must be the
    /// same (coords, tolerance) as was inserted, which holds for entries
    /// since they are immutable after construction.
    pub fn remove(&mut self, entry: &Arc<Entry>) -> bool {
        match entry.coords() {
            Some(coords) => {
                let probe = SpatialObject::new(entry.clone(), coords);
                self.rtree.remove(&probe).is_some()
            }
            None => false,
        }
    }

    pub fn nearest_neighbor(&self, point: &[f64]) -> Option<Arc<Entry>> {
        let p = pad(point);
        self.rtree.nearest_neighbor(&p).map(|o| o.entry.clone())
    }

    pub fn nearest_neighbors(&self, k: usize, point: &[f64]) -> Vec<Arc<Entry>> {
        let p = pad(point);
        self.rtree
            .nearest_neighbor_iter(&p)
            .take(k)
            .map(|o| o.entry.clone())
            .collect()
    }

    /// Radius semantics per §4.4: `d < r` always matches, `d == r` matches
    /// iff `inclusive`, `d > r` never matches.
    pub fn search_within_radius(&self, point: &[f64], radius: f64, inclusive: bool) -> Vec<Arc<Entry>> {
        let p = pad(point);
        let r2 = radius * radius;
        self.rtree
            .locate_within_distance(p, r2)
            .filter(|o| {
                let d2 = o.distance_2(&p);
                if inclusive {
                    d2 <= r2
                } else {
                    d2 < r2
                }
            })
            .map(|o| o.entry.clone())
            .collect()
    }

    pub fn search_intersect(&self, lo: &[f64], hi: &[f64]) -> Vec<Arc<Entry>> {
        let aabb = AABB::from_corners(pad(lo), pad(hi));
        self.rtree
            .locate_in_envelope_intersecting(&aabb)
            .map(|o| o.entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;

    fn entry_at(key: &str, coords: &[f64]) -> Arc<Entry> {
        let v = format!(r#"{{"coords":[{}]}}"#, coords.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(","));
        Arc::new(Entry::new(key, v, EntryOptions::new()))
    }

    #[test]
    fn nearest_neighbor_finds_closest() {
        let mut t = SpatialTree::new(2).unwrap();
        t.insert(entry_at("origin", &[0.0, 0.0]));
        t.insert(entry_at("far", &[100.0, 100.0]));
        let nn = t.nearest_neighbor(&[1.0, 1.0]).unwrap();
        assert_eq!(nn.key(), "origin");
    }

    #[test]
    fn radius_inclusive_vs_exclusive() {
        let mut t = SpatialTree::new(2).unwrap();
        t.insert(entry_at("edge", &[10.0, 0.0]));
        assert!(t.search_within_radius(&[0.0, 0.0], 10.0, false).is_empty());
        assert_eq!(t.search_within_radius(&[0.0, 0.0], 10.0, true).len(), 1);
    }

    #[test]
    fn remove_drops_entry() {
        let mut t = SpatialTree::new(2).unwrap();
        let e = entry_at("k", &[1.0, 1.0]);
        t.insert(e.clone());
        assert_eq!(t.len(), 1);
        assert!(t.remove(&e));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn entry_without_coords_is_not_inserted() {
        let mut t = SpatialTree::new(2).unwrap();
        let e = Arc::new(Entry::new("k", "{}", EntryOptions::new()));
        t.insert(e);
        assert_eq!(t.len(), 0);
    }
}
