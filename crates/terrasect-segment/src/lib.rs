//! terrasect-segment — ground-plane RANSAC and Euclidean clustering.

pub mod cluster;
pub mod plane;

pub use cluster::{cluster_cloud, euclidean_cluster, ClusterConfig};
pub use plane::{segment_plane, PlaneFit, PlaneModel, RansacPlane};
