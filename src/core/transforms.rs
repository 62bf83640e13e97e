//! Point cloud preprocessing ahead of clustering.
//!
//! Range cropping and reproducible subsampling. Both return new clouds;
//! the input is never modified.

use rayon::prelude::*;

use super::loaders::PointCloud;
use crate::config::PreprocessingConfig;

/// Counts reported by [`preprocess`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessStats {
    pub input_points: usize,
    pub out_of_range: usize,
    pub subsample_stride: usize,
    pub output_points: usize,
}

/// Keep points whose distance from the sensor origin lies in `[min_range, max_range]`.
pub fn crop_range(cloud: &PointCloud, min_range: f32, max_range: f32) -> PointCloud {
    let min_sq = min_range * min_range;
    let max_sq = max_range * max_range;

    let keep: Vec<usize> = (0..cloud.len())
        .into_par_iter()
        .filter(|&i| {
            let d = cloud.x[i] * cloud.x[i] + cloud.y[i] * cloud.y[i] + cloud.z[i] * cloud.z[i];
            d >= min_sq && d <= max_sq
        })
        .collect();

    cloud.select(&keep)
}

/// Randomly subsample a point cloud to at most `max_points` points.
///
/// Uses a seeded partial Fisher-Yates shuffle, so the same input always
/// yields the same subset. Surviving points keep their original order.
///
/// # Returns
///
/// Tuple of (subsampled cloud, approximate stride factor).
pub fn subsample_cloud(cloud: &PointCloud, max_points: usize) -> (PointCloud, usize) {
    let n = cloud.len();

    if n <= max_points || max_points == 0 {
        return (cloud.clone(), 1);
    }

    let stride_factor = (n + max_points - 1) / max_points;

    let mut indices: Vec<usize> = (0..n).collect();

    // Partial Fisher-Yates with a fixed LCG seed
    let mut state: u64 = 12345;
    for i in 0..max_points {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = i + ((state as usize) % (n - i));
        indices.swap(i, j);
    }

    indices.truncate(max_points);
    indices.sort_unstable();

    (cloud.select(&indices), stride_factor)
}

/// Apply the configured range crop and subsampling.
pub fn preprocess(cloud: &PointCloud, config: &PreprocessingConfig) -> (PointCloud, PreprocessStats) {
    let cropped = crop_range(cloud, config.min_range, config.max_range);
    let out_of_range = cloud.len() - cropped.len();
    let (sampled, stride) = subsample_cloud(&cropped, config.max_points);

    let stats = PreprocessStats {
        input_points: cloud.len(),
        out_of_range,
        subsample_stride: stride,
        output_points: sampled.len(),
    };
    (sampled, stats)
}
