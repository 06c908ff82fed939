//! Euclidean clustering: connected components of the graph linking points
//! closer than `tolerance`, expanded through radius queries on a
//! [`NeighborIndex3`].

use std::time::Instant;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use terrasect_core::{Cloud, CloudView, CoreError};
use terrasect_nn::{KdTree, NeighborIndex3};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Linking distance (inclusive), > 0.
    pub tolerance: f32,
    /// Smallest emitted cluster.
    pub min_size: usize,
    /// Largest emitted cluster; >= `min_size`.
    pub max_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self { Self { tolerance: 0.5, min_size: 10, max_size: 500 } }
}

/// Group point identifiers into clusters.
///
/// Seeds are taken in ascending identifier order and each component is
/// expanded from an explicit work-list, so component size never grows the
/// call stack. Components outside `[min_size, max_size]` are dropped and
/// their points stay claimed: the output is not a partition of the input.
/// Identifiers inside a cluster are sorted ascending.
///
/// `index` must hold the points of `pts` under their positions as identifiers.
pub fn euclidean_cluster<I>(
    pts: CloudView<'_>,
    index: &I,
    tolerance: f32,
    min_size: usize,
    max_size: usize,
) -> Vec<Vec<usize>>
where
    I: NeighborIndex3 + ?Sized,
{
    debug_assert!(tolerance > 0.0, "cluster tolerance must be positive");
    debug_assert!(min_size <= max_size, "min_size must not exceed max_size");

    let n = pts.len();
    let mut processed = vec![false; n];
    let mut clusters = Vec::new();
    let mut frontier: Vec<usize> = Vec::new();
    let mut dropped = 0usize;

    for seed in 0..n {
        if processed[seed] { continue; }
        processed[seed] = true;
        frontier.push(seed);

        let mut cluster = Vec::new();
        while let Some(id) = frontier.pop() {
            cluster.push(id);
            for nb in index.radius(pts.point(id), tolerance) {
                if nb.idx < n && !processed[nb.idx] {
                    processed[nb.idx] = true;
                    frontier.push(nb.idx);
                }
            }
        }

        if (min_size..=max_size).contains(&cluster.len()) {
            cluster.sort_unstable();
            clusters.push(cluster);
        } else {
            trace!("cluster seeded at {seed} dropped: {} points", cluster.len());
            dropped += 1;
        }
    }
    debug!("euclidean clustering: {} clusters kept, {} dropped", clusters.len(), dropped);
    clusters
}

/// Index, cluster and rebuild one sub-cloud per cluster.
pub fn cluster_cloud(cloud: &Cloud, cfg: &ClusterConfig) -> Result<Vec<Cloud>, CoreError> {
    let t = Instant::now();
    let view: CloudView<'_> = cloud.into();
    let tree = KdTree::build(view);
    let ids = euclidean_cluster(view, &tree, cfg.tolerance, cfg.min_size, cfg.max_size);
    let clusters = ids.iter().map(|c| cloud.select(c)).collect::<Result<Vec<_>, _>>()?;
    debug!(
        "clustering took {:.1} ms, found {} clusters",
        t.elapsed().as_secs_f64() * 1000.0,
        clusters.len()
    );
    Ok(clusters)
}
