//! terrasect-bridge — one-shot obstacle detection over a single LIDAR frame.
//!
//! filter → ground-plane RANSAC → k-d tree over the obstacle points →
//! Euclidean clustering → one bounding box per cluster.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use terrasect_core::{bounding_box, Aabb, Cloud, CloudView};
use terrasect_nn::KdTree;
use terrasect_segment::{euclidean_cluster, ClusterConfig, RansacPlane};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f32 },
    #[error("plane.max_iterations must be at least 1")]
    NoIterations,
    #[error("cluster.min_size ({min}) exceeds cluster.max_size ({max})")]
    SizeBounds { min: usize, max: usize },
    #[error("{0} box has min > max on some axis")]
    InvertedBox(&'static str),
    #[error("read config {path}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("parse config")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Voxel leaf size (meters).
    pub voxel: f32,
    /// Region of interest kept after downsampling.
    pub roi: Aabb,
    /// Returns inside this box (the sensor vehicle's roof) are dropped.
    pub roof: Option<Aabb>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            voxel: 0.3,
            roi: Aabb::new([-10.0, -5.0, -2.0], [30.0, 8.0, 1.0]),
            roof: Some(Aabb::new([-1.5, -1.7, -1.0], [2.6, 1.7, -0.4])),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// `None` feeds the raw cloud straight into segmentation.
    pub filter: Option<FilterConfig>,
    pub plane: RansacPlane,
    pub cluster: ClusterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: Some(FilterConfig::default()),
            plane: RansacPlane { max_iterations: 100, distance_tolerance: 0.2, seed: None },
            cluster: ClusterConfig { tolerance: 0.5, min_size: 10, max_size: 500 },
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_yaml_str(&s)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject parameters the algorithms assume but do not check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
            // written so NaN fails too
            if value > 0.0 { Ok(()) } else { Err(ConfigError::NotPositive { field, value }) }
        }
        if let Some(f) = &self.filter {
            positive("filter.voxel", f.voxel)?;
            if !f.roi.is_valid() { return Err(ConfigError::InvertedBox("filter.roi")); }
            if f.roof.is_some_and(|r| !r.is_valid()) { return Err(ConfigError::InvertedBox("filter.roof")); }
        }
        if self.plane.max_iterations == 0 { return Err(ConfigError::NoIterations); }
        positive("plane.distance_tolerance", self.plane.distance_tolerance)?;
        positive("cluster.tolerance", self.cluster.tolerance)?;
        if self.cluster.min_size > self.cluster.max_size {
            return Err(ConfigError::SizeBounds { min: self.cluster.min_size, max: self.cluster.max_size });
        }
        Ok(())
    }
}

/// Wall time per stage, microseconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub filter_us: u64,
    pub segment_us: u64,
    pub index_us: u64,
    pub cluster_us: u64,
    pub boxes_us: u64,
    pub total_us: u64,
}

/// Everything one frame produced.
#[derive(Clone, Debug)]
pub struct Frame {
    pub input_points: usize,
    pub filtered_points: usize,
    pub ground: Cloud,
    pub obstacles: Cloud,
    /// One sub-cloud of `obstacles` per cluster, in discovery order.
    pub clusters: Vec<Cloud>,
    /// `boxes[i]` bounds `clusters[i]`.
    pub boxes: Vec<Aabb>,
    pub timings: StageTimings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObstacleBox {
    pub points: usize,
    #[serde(flatten)]
    pub aabb: Aabb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameReport {
    pub input_points: usize,
    pub filtered_points: usize,
    pub ground_points: usize,
    pub obstacle_points: usize,
    pub obstacles: Vec<ObstacleBox>,
    pub timings: StageTimings,
}

impl Frame {
    pub fn report(&self) -> FrameReport {
        FrameReport {
            input_points: self.input_points,
            filtered_points: self.filtered_points,
            ground_points: self.ground.len(),
            obstacle_points: self.obstacles.len(),
            obstacles: self
                .clusters
                .iter()
                .zip(&self.boxes)
                .map(|(c, b)| ObstacleBox { points: c.len(), aabb: *b })
                .collect(),
            timings: self.timings.clone(),
        }
    }
}

fn micros(t: Instant) -> u64 { t.elapsed().as_micros() as u64 }

/// Run the whole pipeline on one cloud.
pub fn process_frame(cloud: &Cloud, cfg: &PipelineConfig) -> Result<Frame> {
    cfg.validate()?;
    let mut timings = StageTimings::default();
    let t_total = Instant::now();

    let t = Instant::now();
    let filtered = match &cfg.filter {
        Some(f) => terrasect_filters::filter_cloud(cloud, f.voxel, &f.roi, f.roof.as_ref())?,
        None => cloud.clone(),
    };
    timings.filter_us = micros(t);

    let t = Instant::now();
    let (ground, obstacles) = cfg.plane.segment(&filtered);
    timings.segment_us = micros(t);

    let t = Instant::now();
    let view: CloudView<'_> = (&obstacles).into();
    let tree = KdTree::build(view);
    timings.index_us = micros(t);

    let t = Instant::now();
    let c = &cfg.cluster;
    let ids = euclidean_cluster(view, &tree, c.tolerance, c.min_size, c.max_size);
    let clusters = ids.iter().map(|ids| obstacles.select(ids)).collect::<Result<Vec<_>, _>>()?;
    timings.cluster_us = micros(t);

    let t = Instant::now();
    let boxes = clusters
        .par_iter()
        .map(|c| bounding_box(c.into()))
        .collect::<Result<Vec<_>, _>>()?;
    timings.boxes_us = micros(t);
    timings.total_us = micros(t_total);

    debug!(
        "frame: {} in, {} filtered, {} ground, {} obstacle points, {} clusters, {} us",
        cloud.len(), filtered.len(), ground.len(), obstacles.len(), clusters.len(), timings.total_us
    );
    Ok(Frame {
        input_points: cloud.len(),
        filtered_points: filtered.len(),
        ground,
        obstacles,
        clusters,
        boxes,
        timings,
    })
}
