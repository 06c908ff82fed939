//! RANSAC plane fitting.
//!
//! Each iteration draws three distinct points, forms the plane through them
//! and counts points within `distance_tolerance`. The hypothesis with the
//! strictly largest count wins, so among equal scores the earliest one is
//! kept. Collinear or repeated samples give a zero normal and are skipped
//! without scoring.
//!
//! ```rust,ignore
//! let ransac = RansacPlane { max_iterations: 100, distance_tolerance: 0.2, seed: Some(1) };
//! let (ground, obstacles) = ransac.segment(&cloud);
//! ```

use std::time::Instant;

use log::{debug, trace, warn};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use terrasect_core::{Cloud, CloudView, Point3};

/// Normals shorter than this are treated as zero (collinear / duplicate sample).
pub const MIN_NORMAL_NORM: f32 = f32::EPSILON;

/// Plane `a*x + b*y + c*z + d = 0`; `(a, b, c)` is not normalised.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaneModel {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl PlaneModel {
    /// Plane through three points, `None` when they do not span one.
    pub fn from_points(p0: Point3, p1: Point3, p2: Point3) -> Option<Self> {
        let v0 = Vector3::from(p0);
        let n = (Vector3::from(p1) - v0).cross(&(Vector3::from(p2) - v0));
        if n.norm() <= MIN_NORMAL_NORM {
            return None;
        }
        Some(Self { a: n.x, b: n.y, c: n.z, d: -n.dot(&v0) })
    }

    pub fn normal(&self) -> Vector3<f32> { Vector3::new(self.a, self.b, self.c) }

    /// Unsigned point-to-plane distance.
    #[inline]
    pub fn distance(&self, p: Point3) -> f32 {
        (self.a * p[0] + self.b * p[1] + self.c * p[2] + self.d).abs() / self.normal().norm()
    }
}

/// Winning hypothesis and the identifiers of its inliers (ascending).
#[derive(Clone, Debug)]
pub struct PlaneFit {
    pub model: PlaneModel,
    pub inliers: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacPlane {
    /// Hypotheses drawn; caller keeps this > 0.
    pub max_iterations: usize,
    /// Inlier threshold in cloud units (inclusive).
    pub distance_tolerance: f32,
    /// Fixed seed for reproducible runs; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for RansacPlane {
    fn default() -> Self { Self { max_iterations: 100, distance_tolerance: 0.2, seed: None } }
}

impl RansacPlane {
    pub fn new(max_iterations: usize, distance_tolerance: f32) -> Self {
        Self { max_iterations, distance_tolerance, seed: None }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Best plane over `max_iterations` hypotheses.
    ///
    /// `None` when no hypothesis could be scored: fewer than three points, or
    /// every sample degenerate.
    pub fn fit(&self, pts: CloudView<'_>) -> Option<PlaneFit> {
        debug_assert!(self.max_iterations > 0, "max_iterations must be positive");
        let n = pts.len();
        if n < 3 {
            if n > 0 {
                warn!("ransac: {} points cannot define a plane", n);
            }
            return None;
        }

        let mut rng = match self.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };

        let mut best: Option<(PlaneModel, usize)> = None;
        let mut degenerate = 0usize;
        for it in 0..self.max_iterations {
            let sample = index::sample(&mut rng, n, 3);
            let Some(model) = PlaneModel::from_points(
                pts.point(sample.index(0)),
                pts.point(sample.index(1)),
                pts.point(sample.index(2)),
            ) else {
                degenerate += 1;
                trace!("ransac iter {it}: degenerate sample");
                continue;
            };

            let count = self.count_inliers(pts, &model);
            trace!("ransac iter {it}: {count} inliers");
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((model, count));
            }
        }

        let Some((model, count)) = best else {
            warn!("ransac: all {} samples degenerate, no plane", self.max_iterations);
            return None;
        };
        debug!("ransac: best plane {count}/{n} inliers, {degenerate} degenerate samples");

        let tol = self.distance_tolerance;
        let inliers: Vec<usize> = (0..n)
            .into_par_iter()
            .filter(|&i| model.distance(pts.point(i)) <= tol)
            .collect();
        Some(PlaneFit { model, inliers })
    }

    /// Split into (plane, everything else).
    ///
    /// With no scorable hypothesis the plane cloud is empty and the second
    /// cloud is the input unchanged.
    pub fn segment(&self, cloud: &Cloud) -> (Cloud, Cloud) {
        let t = Instant::now();
        let out = match self.fit(cloud.into()) {
            Some(fit) => {
                let mut mask = vec![false; cloud.len()];
                for &i in &fit.inliers { mask[i] = true; }
                cloud.partition(|i| mask[i])
            }
            None => (Cloud::default(), cloud.clone()),
        };
        debug!(
            "plane segmentation: {} -> {} plane / {} other in {:.1} ms",
            cloud.len(), out.0.len(), out.1.len(), t.elapsed().as_secs_f64() * 1000.0
        );
        out
    }

    fn count_inliers(&self, pts: CloudView<'_>, model: &PlaneModel) -> usize {
        let tol = self.distance_tolerance;
        (0..pts.len())
            .into_par_iter()
            .filter(|&i| model.distance(pts.point(i)) <= tol)
            .count()
    }
}

/// One-shot RANSAC split with an OS-seeded generator.
pub fn segment_plane(cloud: &Cloud, max_iterations: usize, distance_tolerance: f32) -> (Cloud, Cloud) {
    RansacPlane::new(max_iterations, distance_tolerance).segment(cloud)
}
