//! terrasect-core — point-cloud data model and shared geometry types.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};

/// A single (x, y, z) coordinate triple.
pub type Point3 = [f32; 3];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("cannot compute a bounding box of an empty cloud")]
    EmptyCloud,
    #[error("index {idx} out of range for cloud of {len} points")]
    IndexOutOfRange { idx: usize, len: usize },
    #[error("mask length {mask} does not match cloud length {len}")]
    MaskLength { mask: usize, len: usize },
}

/// Structure-of-Arrays point cloud.
/// Keep hot columns (x,y,z) tight; put optional columns in a name→column map.
///
/// Positions `0..len()` double as stable point identifiers for one pipeline run.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Cloud {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,

    /// Optional attributes (same length as x/y/z).
    /// Common keys: "intensity","r","g","b","class".
    pub attrs_f32: HashMap<String, Vec<f32>>,
}

impl Cloud {
    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }
    pub fn push(&mut self, px: f32, py: f32, pz: f32) {
        self.x.push(px); self.y.push(py); self.z.push(pz);
    }
    pub fn reserve(&mut self, n: usize) {
        self.x.reserve(n); self.y.reserve(n); self.z.reserve(n);
        for v in self.attrs_f32.values_mut() { v.reserve(n); }
    }

    pub fn point(&self, i: usize) -> Point3 { [self.x[i], self.y[i], self.z[i]] }

    pub fn points(&self) -> impl Iterator<Item = Point3> + '_ {
        (0..self.len()).map(move |i| self.point(i))
    }

    pub fn from_points<I: IntoIterator<Item = Point3>>(pts: I) -> Self {
        let mut c = Cloud::default();
        for p in pts { c.push(p[0], p[1], p[2]); }
        c
    }

    /// Attribute keys whose column is aligned with x/y/z.
    pub fn aligned_attr_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .attrs_f32
            .iter()
            .filter_map(|(k, v)| if v.len() == self.len() { Some(k.clone()) } else { None })
            .collect();
        keys.sort();
        keys
    }

    /// Rebuild a sub-cloud from point identifiers, in the given order.
    /// Aligned attribute columns travel with their points; misaligned ones are dropped.
    pub fn select(&self, indices: &[usize]) -> Result<Cloud, CoreError> {
        let n = self.len();
        if let Some(&idx) = indices.iter().find(|&&i| i >= n) {
            return Err(CoreError::IndexOutOfRange { idx, len: n });
        }
        Ok(self.gather(indices.iter().copied()))
    }

    /// Partition into (mask == true, mask == false), preserving relative order.
    pub fn split(&self, mask: &[bool]) -> Result<(Cloud, Cloud), CoreError> {
        if mask.len() != self.len() {
            return Err(CoreError::MaskLength { mask: mask.len(), len: self.len() });
        }
        Ok(self.partition(|i| mask[i]))
    }

    /// Partition by a per-identifier predicate, preserving relative order.
    pub fn partition<F: FnMut(usize) -> bool>(&self, mut keep: F) -> (Cloud, Cloud) {
        let (yes, no): (Vec<usize>, Vec<usize>) = (0..self.len()).partition(|&i| keep(i));
        (self.gather(yes.into_iter()), self.gather(no.into_iter()))
    }

    // callers guarantee every index is < len()
    fn gather<I: ExactSizeIterator<Item = usize>>(&self, indices: I) -> Cloud {
        let keys = self.aligned_attr_keys();
        let mut out = Cloud::default();
        for k in &keys { out.attrs_f32.insert(k.clone(), Vec::with_capacity(indices.len())); }
        out.reserve(indices.len());
        for i in indices {
            out.push(self.x[i], self.y[i], self.z[i]);
            for k in &keys {
                if let (Some(dst), Some(src)) = (out.attrs_f32.get_mut(k), self.attrs_f32.get(k)) {
                    dst.push(src[i]);
                }
            }
        }
        out
    }
}

/// Zero-copy view into a Cloud (slice-of-SoA).
#[derive(Copy, Clone)]
pub struct CloudView<'a> {
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub z: &'a [f32],
}

impl<'a> CloudView<'a> {
    pub fn len(&self) -> usize { self.x.len() }
    pub fn is_empty(&self) -> bool { self.x.is_empty() }
    pub fn point(&self, i: usize) -> Point3 { [self.x[i], self.y[i], self.z[i]] }
}

impl<'a> From<&'a Cloud> for CloudView<'a> {
    fn from(c: &'a Cloud) -> Self { Self { x: &c.x, y: &c.y, z: &c.z } }
}

/// Axis-aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb { pub min: [f32;3], pub max: [f32;3] }

impl Aabb {
    pub fn new(min: [f32;3], max: [f32;3]) -> Self { Self { min, max } }

    /// Inclusive on every face.
    pub fn contains(&self, p: [f32;3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
    pub fn extent(&self) -> [f32;3] {
        [self.max[0] - self.min[0], self.max[1] - self.min[1], self.max[2] - self.min[2]]
    }
    pub fn center(&self) -> [f32;3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }
    /// min <= max on every axis.
    pub fn is_valid(&self) -> bool { (0..3).all(|i| self.min[i] <= self.max[i]) }
}

/// Per-axis min/max over the view in one linear pass.
///
/// An empty view has no box; it is rejected with [`CoreError::EmptyCloud`].
pub fn bounding_box(view: CloudView<'_>) -> Result<Aabb, CoreError> {
    if view.is_empty() { return Err(CoreError::EmptyCloud); }
    let first = view.point(0);
    let mut b = Aabb { min: first, max: first };
    for i in 1..view.len() {
        let p = view.point(i);
        for a in 0..3 {
            b.min[a] = b.min[a].min(p[a]);
            b.max[a] = b.max[a].max(p[a]);
        }
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Cloud {
        let mut c = Cloud::from_points([[0.0, 0.0, 0.0], [1.0, -2.0, 3.0], [-1.0, 4.0, 0.5]]);
        c.attrs_f32.insert("intensity".into(), vec![0.1, 0.2, 0.3]);
        c.attrs_f32.insert("stale".into(), vec![1.0]);
        c
    }

    #[test]
    fn bounding_box_covers_all_points() {
        let c = sample();
        let b = bounding_box((&c).into()).unwrap();
        assert_eq!(b.min, [-1.0, -2.0, 0.0]);
        assert_eq!(b.max, [1.0, 4.0, 3.0]);
        for p in c.points() { assert!(b.contains(p)); }
    }

    #[test]
    fn bounding_box_single_point_is_degenerate_but_valid() {
        let c = Cloud::from_points([[2.0, 2.0, 2.0]]);
        let b = bounding_box((&c).into()).unwrap();
        assert_eq!(b.min, b.max);
        assert_eq!(b.extent(), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn bounding_box_rejects_empty() {
        let c = Cloud::default();
        assert_eq!(bounding_box((&c).into()), Err(CoreError::EmptyCloud));
    }

    #[test]
    fn select_carries_aligned_attributes_only() {
        let c = sample();
        let s = c.select(&[2, 0]).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.point(0), [-1.0, 4.0, 0.5]);
        assert_eq!(s.attrs_f32["intensity"], vec![0.3, 0.1]);
        assert!(!s.attrs_f32.contains_key("stale"));
    }

    #[test]
    fn select_out_of_range() {
        let c = sample();
        assert_eq!(c.select(&[3]).unwrap_err(), CoreError::IndexOutOfRange { idx: 3, len: 3 });
    }

    #[test]
    fn split_preserves_order() {
        let c = sample();
        let (a, b) = c.split(&[true, false, true]).unwrap();
        assert_eq!(a.x, vec![0.0, -1.0]);
        assert_eq!(b.x, vec![1.0]);
        assert!(c.split(&[true]).is_err());
    }

    #[test]
    fn aabb_center_and_extent() {
        let b = Aabb::new([-1.0, 0.0, 2.0], [3.0, 1.0, 2.5]);
        assert_relative_eq!(b.center()[0], 1.0);
        assert_relative_eq!(b.extent()[2], 0.5);
        assert!(b.is_valid());
        assert!(!Aabb::new([1.0, 0.0, 0.0], [0.0, 1.0, 1.0]).is_valid());
    }
}
