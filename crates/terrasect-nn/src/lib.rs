//! terrasect-nn — neighbor indices for 3D (unbalanced k-d tree, radius queries).

use log::debug;
use smallvec::SmallVec;
use terrasect_core::{CloudView, Point3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Neighbor { pub idx: usize, pub dist2: f32 }

/// Trait for geometry-first neighborhood queries.
pub trait NeighborIndex3 {
    /// Every identifier whose point lies within Euclidean distance `r` of `target`, inclusive.
    fn radius(&self, target: Point3, r: f32) -> SmallVec<[Neighbor; 64]>;
}

#[derive(Debug)]
struct Node {
    point: Point3,
    id: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn leaf(point: Point3, id: usize) -> Box<Self> {
        Box::new(Self { point, id, left: None, right: None })
    }
}

/// 3-D tree split on axis `depth % 3`.
///
/// Left subtree holds `coord[axis] < node[axis]`, right subtree `>=`.
/// No rebalancing: insertion order fixes the shape, so sorted input degrades
/// to a list. Every walk (insert, search, depth, drop) is iterative.
#[derive(Debug, Default)]
pub struct KdTree {
    root: Option<Box<Node>>,
    len: usize,
}

impl KdTree {
    pub fn new() -> Self { Self::default() }

    /// Insert every point of the view with its position as identifier.
    pub fn build(pts: CloudView<'_>) -> Self {
        let mut tree = Self::new();
        for i in 0..pts.len() {
            tree.insert(pts.point(i), i);
        }
        debug!("kd-tree built: {} points, depth {}", tree.len(), tree.depth());
        tree
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.root.is_none() }

    /// Always succeeds; duplicates are stored as separate nodes.
    pub fn insert(&mut self, point: Point3, id: usize) {
        let mut slot = &mut self.root;
        let mut depth = 0usize;
        while let Some(node) = slot {
            let axis = depth % 3;
            slot = if point[axis] < node.point[axis] { &mut node.left } else { &mut node.right };
            depth += 1;
        }
        *slot = Some(Node::leaf(point, id));
        self.len += 1;
    }

    /// Identifiers within `tol` of `target`.
    ///
    /// Each visited node is first tested against the cube of half-width `tol`
    /// around `target`; only cube hits pay for the exact distance. Both
    /// children may be descended, the two boundary tests are independent.
    pub fn search(&self, target: Point3, tol: f32) -> SmallVec<[Neighbor; 64]> {
        let mut out = SmallVec::new();
        let mut stack: Vec<(&Node, usize)> = Vec::new();
        if let Some(root) = self.root.as_deref() {
            stack.push((root, 0));
        }
        while let Some((node, depth)) = stack.pop() {
            let p = node.point;
            if (0..3).all(|a| p[a] >= target[a] - tol && p[a] <= target[a] + tol) {
                let d2 = (p[0] - target[0]).powi(2)
                    + (p[1] - target[1]).powi(2)
                    + (p[2] - target[2]).powi(2);
                if d2.sqrt() <= tol {
                    out.push(Neighbor { idx: node.id, dist2: d2 });
                }
            }

            let axis = depth % 3;
            // right pushed first so the left subtree is visited first
            if target[axis] + tol >= p[axis] {
                if let Some(r) = node.right.as_deref() { stack.push((r, depth + 1)); }
            }
            if target[axis] - tol < p[axis] {
                if let Some(l) = node.left.as_deref() { stack.push((l, depth + 1)); }
            }
        }
        out
    }

    /// Number of levels on the longest root-to-leaf path (0 when empty).
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack: Vec<(&Node, usize)> = Vec::new();
        if let Some(root) = self.root.as_deref() {
            stack.push((root, 1));
        }
        while let Some((node, d)) = stack.pop() {
            max = max.max(d);
            for child in [node.left.as_deref(), node.right.as_deref()].into_iter().flatten() {
                stack.push((child, d + 1));
            }
        }
        max
    }
}

impl NeighborIndex3 for KdTree {
    fn radius(&self, target: Point3, r: f32) -> SmallVec<[Neighbor; 64]> {
        self.search(target, r)
    }
}

impl Drop for KdTree {
    fn drop(&mut self) {
        // detach children before each node drops so teardown never recurses
        let mut stack: Vec<Box<Node>> = self.root.take().into_iter().collect();
        while let Some(mut node) = stack.pop() {
            stack.extend(node.left.take());
            stack.extend(node.right.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use terrasect_core::Cloud;

    fn ids(mut hits: SmallVec<[Neighbor; 64]>) -> Vec<usize> {
        hits.sort_by_key(|n| n.idx);
        hits.into_iter().map(|n| n.idx).collect()
    }

    fn brute(points: &[Point3], target: Point3, tol: f32) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                let d2 = (p[0] - target[0]).powi(2) + (p[1] - target[1]).powi(2) + (p[2] - target[2]).powi(2);
                d2.sqrt() <= tol
            })
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let tree = KdTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 0);
        assert!(tree.search([0.0, 0.0, 0.0], 100.0).is_empty());
    }

    #[test]
    fn first_insert_creates_root() {
        let mut tree = KdTree::new();
        tree.insert([2.0, 2.0, 2.0], 7);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.depth(), 1);
        assert_eq!(ids(tree.search([2.0, 2.0, 2.0], 0.0)), vec![7]);
    }

    #[test]
    fn splits_cycle_through_axes() {
        let mut tree = KdTree::new();
        tree.insert([0.0, 0.0, 0.0], 0);
        tree.insert([1.0, -1.0, 0.0], 1); // x >= 0 -> right
        tree.insert([2.0, -2.0, 0.0], 2); // right, then y < -1 -> left of 1
        tree.insert([-1.0, 5.0, 5.0], 3); // x < 0 -> left
        let root = tree.root.as_ref().unwrap();
        assert_eq!(root.left.as_ref().unwrap().id, 3);
        let right = root.right.as_ref().unwrap();
        assert_eq!(right.id, 1);
        assert_eq!(right.left.as_ref().unwrap().id, 2);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn boundary_distance_is_inclusive() {
        let mut tree = KdTree::new();
        tree.insert([0.0, 0.0, 0.0], 0);
        tree.insert([1.0, 0.0, 0.0], 1);
        tree.insert([0.0, 2.0, 0.0], 2);
        assert_eq!(ids(tree.search([0.0, 0.0, 0.0], 1.0)), vec![0, 1]);
    }

    #[test]
    fn cube_corner_is_rejected_by_exact_check() {
        let mut tree = KdTree::new();
        tree.insert([0.9, 0.9, 0.9], 0);
        // inside the cube of half-width 1, outside the unit sphere
        assert!(tree.search([0.0, 0.0, 0.0], 1.0).is_empty());
    }

    #[test]
    fn duplicates_are_all_returned() {
        let mut tree = KdTree::new();
        for id in 0..4 {
            tree.insert([1.0, 1.0, 1.0], id);
        }
        assert_eq!(ids(tree.search([1.0, 1.0, 1.2], 0.5)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn search_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        let points: Vec<Point3> = (0..800)
            .map(|_| [rng.random_range(-5.0..5.0), rng.random_range(-5.0..5.0), rng.random_range(-1.0..1.0)])
            .collect();
        let cloud = Cloud::from_points(points.iter().copied());
        let tree = KdTree::build((&cloud).into());
        assert_eq!(tree.len(), points.len());

        for _ in 0..200 {
            let target = [rng.random_range(-6.0..6.0), rng.random_range(-6.0..6.0), rng.random_range(-2.0..2.0)];
            let tol = rng.random_range(0.05..2.5);
            assert_eq!(ids(tree.search(target, tol)), brute(&points, target, tol));
        }
        // querying at stored points always finds at least the point itself
        for (i, p) in points.iter().enumerate().step_by(37) {
            assert!(ids(tree.search(*p, 0.01)).contains(&i));
        }
    }

    #[test]
    fn reported_dist2_is_squared_distance() {
        let mut tree = KdTree::new();
        tree.insert([3.0, 4.0, 0.0], 0);
        let hits = tree.search([0.0, 0.0, 0.0], 5.0);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].dist2 - 25.0).abs() < 1e-4);
    }

    #[test]
    fn sorted_insertion_degrades_without_overflow() {
        let n = 10_000;
        let mut tree = KdTree::new();
        for i in 0..n {
            let v = i as f32;
            tree.insert([v, v, v], i);
        }
        assert_eq!(tree.depth(), n);
        assert_eq!(ids(tree.search([5000.0, 5000.0, 5000.0], 1.0)), vec![5000]);
        drop(tree);
    }
}
