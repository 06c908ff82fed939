use approx::assert_relative_eq;
use terrasect_bridge::{process_frame, ConfigError, FilterConfig, PipelineConfig};
use terrasect_core::{Aabb, Cloud};
use terrasect_segment::{ClusterConfig, RansacPlane};

/// Flat ground at z = -1.5, two 6x6x6 lattice "cars" above it and a
/// three-point speck too small to count as an obstacle.
fn street() -> Cloud {
    let mut c = Cloud::default();
    for i in 0..40 {
        for j in 0..40 {
            c.push(-5.0 + i as f32 * 0.25, -5.0 + j as f32 * 0.25, -1.5);
        }
    }
    for origin in [[2.0f32, 1.0, -1.2], [-3.0, -3.0, -1.2]] {
        for i in 0..6 {
            for j in 0..6 {
                for k in 0..6 {
                    c.push(
                        origin[0] + i as f32 * 0.2,
                        origin[1] + j as f32 * 0.2,
                        origin[2] + k as f32 * 0.2,
                    );
                }
            }
        }
    }
    for k in 0..3 {
        c.push(4.0 + k as f32 * 0.1, 4.0, 0.0);
    }
    c
}

fn unfiltered() -> PipelineConfig {
    PipelineConfig {
        filter: None,
        plane: RansacPlane { max_iterations: 100, distance_tolerance: 0.2, seed: Some(11) },
        cluster: ClusterConfig { tolerance: 0.3, min_size: 10, max_size: 500 },
    }
}

fn assert_box(b: &Aabb, min: [f32; 3], max: [f32; 3]) {
    for a in 0..3 {
        assert_relative_eq!(b.min[a], min[a], epsilon = 1e-4);
        assert_relative_eq!(b.max[a], max[a], epsilon = 1e-4);
    }
}

#[test]
fn finds_two_obstacles_above_the_ground() {
    let cloud = street();
    let frame = process_frame(&cloud, &unfiltered()).unwrap();

    assert_eq!(frame.input_points, cloud.len());
    assert_eq!(frame.filtered_points, cloud.len());
    assert_eq!(frame.ground.len(), 1600);
    assert!(frame.ground.z.iter().all(|&z| z == -1.5));
    assert_eq!(frame.obstacles.len(), 216 * 2 + 3);

    assert_eq!(frame.clusters.len(), 2);
    assert_eq!(frame.boxes.len(), 2);
    assert!(frame.clusters.iter().all(|c| c.len() == 216));
    assert_box(&frame.boxes[0], [2.0, 1.0, -1.2], [3.0, 2.0, -0.2]);
    assert_box(&frame.boxes[1], [-3.0, -3.0, -1.2], [-2.0, -2.0, -0.2]);
}

#[test]
fn roof_box_hides_an_obstacle() {
    let cloud = street();
    let cfg = PipelineConfig {
        filter: Some(FilterConfig {
            voxel: 0.05,
            roi: Aabb::new([-10.0, -10.0, -2.0], [10.0, 10.0, 1.0]),
            roof: Some(Aabb::new([-3.5, -3.5, -1.3], [-1.5, -1.5, 0.0])),
        }),
        ..unfiltered()
    };
    let frame = process_frame(&cloud, &cfg).unwrap();
    assert_eq!(frame.filtered_points, cloud.len() - 216);
    assert_eq!(frame.clusters.len(), 1);
    assert_box(&frame.boxes[0], [2.0, 1.0, -1.2], [3.0, 2.0, -0.2]);
}

#[test]
fn report_pairs_boxes_with_cluster_sizes() {
    let frame = process_frame(&street(), &unfiltered()).unwrap();
    let report = frame.report();
    assert_eq!(report.ground_points, 1600);
    assert_eq!(report.obstacles.len(), 2);
    assert_eq!(report.obstacles[0].points, 216);
    assert_eq!(report.obstacles[1].aabb, frame.boxes[1]);
    assert!(report.timings.total_us >= report.timings.cluster_us);
}

#[test]
fn invalid_config_is_rejected_before_any_work() {
    let mut cfg = unfiltered();
    cfg.cluster.max_size = 1;
    assert!(process_frame(&street(), &cfg).is_err());
}

#[test]
fn loads_config_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.yaml");
    std::fs::write(
        &path,
        "filter: null\nplane:\n  max_iterations: 100\n  distance_tolerance: 0.2\n  seed: 11\ncluster:\n  tolerance: 0.3\n",
    )
    .unwrap();
    let cfg = PipelineConfig::from_yaml_file(&path).unwrap();
    assert_eq!(cfg.cluster.min_size, 10);
    let frame = process_frame(&street(), &cfg).unwrap();
    assert_eq!(frame.clusters.len(), 2);

    let missing = PipelineConfig::from_yaml_file(dir.path().join("nope.yaml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }));
}
