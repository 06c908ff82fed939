//! terrasect-filters — voxel grid, region-of-interest crop, box removal.

use std::time::Instant;

use anyhow::{ensure, Result};
use hashbrown::HashMap;
use log::debug;
use terrasect_core::{Aabb, Cloud};

/// Voxel grid downsample (centroid). Grid size in same units as input.
///
/// Aligned attribute columns are averaged per voxel alongside the position.
/// Output order follows the first point seen in each voxel.
pub fn voxel_downsample(input: &Cloud, voxel: f32) -> Result<Cloud> {
    ensure!(voxel > 0.0, "voxel size must be positive, got {voxel}");
    let inv = 1.0 / voxel;

    let keys = input.aligned_attr_keys();
    let cols: Vec<&Vec<f32>> = keys.iter().filter_map(|k| input.attrs_f32.get(k)).collect();

    // full-width cell key: distant voxels never alias
    let mut slots: HashMap<[i32; 3], usize> = HashMap::new();
    let mut sums: Vec<(f64,f64,f64,u32)> = Vec::new();
    let mut attr_sums: Vec<Vec<f64>> = Vec::new();
    for i in 0..input.len() {
        let ix = (input.x[i]*inv).floor() as i32;
        let iy = (input.y[i]*inv).floor() as i32;
        let iz = (input.z[i]*inv).floor() as i32;
        let slot = *slots.entry([ix, iy, iz]).or_insert_with(|| {
            sums.push((0.0,0.0,0.0,0));
            attr_sums.push(vec![0.0; cols.len()]);
            sums.len() - 1
        });
        let e = &mut sums[slot];
        e.0 += input.x[i] as f64;
        e.1 += input.y[i] as f64;
        e.2 += input.z[i] as f64;
        e.3 += 1;
        for (acc, col) in attr_sums[slot].iter_mut().zip(&cols) {
            *acc += col[i] as f64;
        }
    }

    let mut out = Cloud::default();
    out.reserve(sums.len());
    let mut attrs_out: Vec<Vec<f32>> = vec![Vec::with_capacity(sums.len()); cols.len()];
    for ((sx,sy,sz,cnt), attrs) in sums.into_iter().zip(attr_sums) {
        let invc = 1.0 / (cnt as f64);
        out.push((sx*invc) as f32, (sy*invc) as f32, (sz*invc) as f32);
        for (col, s) in attrs_out.iter_mut().zip(attrs) {
            col.push((s*invc) as f32);
        }
    }
    out.attrs_f32 = keys.into_iter().zip(attrs_out).collect();
    Ok(out)
}

/// Keep points inside `roi` (faces inclusive).
pub fn crop_box(input: &Cloud, roi: &Aabb) -> Cloud {
    input.partition(|i| roi.contains(input.point(i))).0
}

/// Drop points inside `region` (faces inclusive), e.g. returns off the sensor vehicle's roof.
pub fn remove_box(input: &Cloud, region: &Aabb) -> Cloud {
    input.partition(|i| region.contains(input.point(i))).1
}

/// Downsample, crop to the region of interest, then cut out the roof box.
pub fn filter_cloud(input: &Cloud, voxel: f32, roi: &Aabb, roof: Option<&Aabb>) -> Result<Cloud> {
    ensure!(roi.is_valid(), "region of interest has min > max: {roi:?}");
    let t = Instant::now();
    let down = voxel_downsample(input, voxel)?;
    let mut out = crop_box(&down, roi);
    if let Some(roof) = roof {
        out = remove_box(&out, roof);
    }
    debug!(
        "filtering: {} -> {} (voxel) -> {} points in {:.1} ms",
        input.len(), down.len(), out.len(), t.elapsed().as_secs_f64() * 1000.0
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn voxel_merges_points_into_centroids() {
        let mut c = Cloud::from_points([
            [0.1, 0.1, 0.1],
            [0.3, 0.3, 0.3],
            [1.5, 0.2, 0.2],
            [-0.2, 0.1, 0.1],
        ]);
        c.attrs_f32.insert("intensity".into(), vec![1.0, 3.0, 5.0, 7.0]);
        let out = voxel_downsample(&c, 1.0).unwrap();
        assert_eq!(out.len(), 3);
        assert_relative_eq!(out.x[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(out.attrs_f32["intensity"][0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(out.x[1], 1.5);
        assert_relative_eq!(out.x[2], -0.2);
        assert_eq!(out.attrs_f32["intensity"].len(), 3);
    }

    #[test]
    fn far_apart_voxels_stay_separate() {
        // cells 0 and 2^21 on x
        let c = Cloud::from_points([[0.5, 0.5, 0.5], [2_097_152.5, 0.5, 0.5]]);
        let out = voxel_downsample(&c, 1.0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.x, vec![0.5, 2_097_152.5]);
    }

    #[test]
    fn voxel_rejects_non_positive_size() {
        assert!(voxel_downsample(&Cloud::default(), 0.0).is_err());
        assert!(voxel_downsample(&Cloud::default(), -1.0).is_err());
    }

    #[test]
    fn voxel_of_empty_is_empty() {
        assert!(voxel_downsample(&Cloud::default(), 0.5).unwrap().is_empty());
    }

    #[test]
    fn crop_and_remove_are_complementary() {
        let c = Cloud::from_points((0..10).map(|i| [i as f32, 0.0, 0.0]));
        let b = Aabb::new([2.0, -1.0, -1.0], [5.0, 1.0, 1.0]);
        let inside = crop_box(&c, &b);
        let outside = remove_box(&c, &b);
        assert_eq!(inside.x, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(outside.len() + inside.len(), c.len());
    }

    #[test]
    fn filter_cloud_applies_every_stage() {
        let mut c = Cloud::default();
        for i in 0..40 {
            c.push(i as f32 * 0.5 - 10.0, 0.0, -1.0);
        }
        let roi = Aabb::new([-5.0, -5.0, -2.0], [5.0, 5.0, 1.0]);
        let roof = Aabb::new([-1.0, -1.0, -2.0], [1.0, 1.0, 0.0]);
        let out = filter_cloud(&c, 0.1, &roi, Some(&roof)).unwrap();
        assert!(out.points().all(|p| roi.contains(p) && !roof.contains(p)));
        assert_eq!(out.len(), 21 - 5);
    }

    #[test]
    fn filter_cloud_rejects_inverted_roi() {
        let roi = Aabb::new([1.0, 0.0, 0.0], [0.0, 1.0, 1.0]);
        assert!(filter_cloud(&Cloud::default(), 0.1, &roi, None).is_err());
    }
}
