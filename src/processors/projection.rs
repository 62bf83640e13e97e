//! Sensor-frame points into camera pixels.
//!
//! Extrinsic first (sensor to camera), then optional lens distortion on the
//! normalized coordinates, then the intrinsic. Points closer to the image
//! plane than `min_depth` are excluded and counted.

use rayon::prelude::*;
use serde::Serialize;

use super::clustering::PointCluster;
use crate::config::ProjectionConfig;
use crate::core::calibration::CalibrationTransform;
use crate::core::loaders::PointCloud;

/// A cluster together with its footprint in the image and the camera frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedCluster {
    pub cluster: PointCluster,
    /// Pixel bound `[x_min, y_min, x_max, y_max]` over visible members
    pub bbox: [f64; 4],
    pub centroid_px: [f64; 2],
    pub camera_centroid: [f64; 3],
    pub camera_min: [f64; 3],
    pub camera_max: [f64; 3],
    /// Euclidean norm of the camera-frame centroid
    pub distance: f64,
    pub visible_points: usize,
    pub excluded_points: usize,
}

impl ProjectedCluster {
    /// Camera-frame extent as `[x_min, y_min, z_min, x_max, y_max, z_max]`.
    pub fn bbox3d(&self) -> [f64; 6] {
        let (lo, hi) = (self.camera_min, self.camera_max);
        [lo[0], lo[1], lo[2], hi[0], hi[1], hi[2]]
    }
}

/// Project a camera-frame point to pixels, or `None` when it is too close
/// to (or behind) the image plane.
pub fn project_camera_point(
    calib: &CalibrationTransform,
    p: [f64; 3],
    config: &ProjectionConfig,
) -> Option<[f64; 2]> {
    let [x, y, z] = p;
    if !(z >= config.min_depth) {
        return None;
    }

    let (mut xn, mut yn) = (x / z, y / z);
    if config.apply_distortion {
        if let Some(d) = calib.distortion.as_ref().filter(|d| !d.is_zero()) {
            (xn, yn) = d.apply(xn, yn);
        }
    }

    let k = &calib.intrinsic;
    let u = k[(0, 0)] * xn + k[(0, 1)] * yn + k[(0, 2)];
    let v = k[(1, 0)] * xn + k[(1, 1)] * yn + k[(1, 2)];
    let w = k[(2, 0)] * xn + k[(2, 1)] * yn + k[(2, 2)];
    if w == 0.0 {
        return None;
    }
    Some([u / w, v / w])
}

/// Project a sensor-frame point to pixels.
pub fn project_point(
    calib: &CalibrationTransform,
    p: [f64; 3],
    config: &ProjectionConfig,
) -> Option<[f64; 2]> {
    let cam = calib.to_camera(p);
    project_camera_point(calib, [cam.x, cam.y, cam.z], config)
}

/// Project one cluster. Returns `None` when no member point is visible.
pub fn project_cluster(
    cloud: &PointCloud,
    cluster: &PointCluster,
    calib: &CalibrationTransform,
    config: &ProjectionConfig,
) -> Option<ProjectedCluster> {
    let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    let mut camera_min = [f64::INFINITY; 3];
    let mut camera_max = [f64::NEG_INFINITY; 3];
    let mut visible = 0usize;

    for &i in &cluster.indices {
        let cam = calib.to_camera(cloud.point(i).coords_f64());
        let cam = [cam.x, cam.y, cam.z];
        for axis in 0..3 {
            camera_min[axis] = camera_min[axis].min(cam[axis]);
            camera_max[axis] = camera_max[axis].max(cam[axis]);
        }

        if let Some([u, v]) = project_camera_point(calib, cam, config) {
            visible += 1;
            bbox[0] = bbox[0].min(u);
            bbox[1] = bbox[1].min(v);
            bbox[2] = bbox[2].max(u);
            bbox[3] = bbox[3].max(v);
        }
    }

    if visible == 0 {
        return None;
    }

    let centroid = calib.to_camera(cluster.centroid);
    let camera_centroid = [centroid.x, centroid.y, centroid.z];
    // A partially visible cluster can have its centroid behind the camera
    let centroid_px = project_camera_point(calib, camera_centroid, config)
        .unwrap_or([(bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0]);

    Some(ProjectedCluster {
        cluster: cluster.clone(),
        bbox,
        centroid_px,
        camera_centroid,
        camera_min,
        camera_max,
        distance: centroid.norm(),
        visible_points: visible,
        excluded_points: cluster.len() - visible,
    })
}

/// Project all clusters in parallel, dropping those with no visible points.
pub fn project_clusters(
    cloud: &PointCloud,
    clusters: &[PointCluster],
    calib: &CalibrationTransform,
    config: &ProjectionConfig,
) -> Vec<ProjectedCluster> {
    let projected: Vec<ProjectedCluster> = clusters
        .par_iter()
        .filter_map(|cluster| project_cluster(cloud, cluster, calib, config))
        .collect();

    let dropped = clusters.len() - projected.len();
    if dropped > 0 {
        log::debug!("{} of {} clusters not visible to the camera", dropped, clusters.len());
    }
    projected
}
