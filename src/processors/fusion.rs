//! Matching projected clusters against 2D detections.
//!
//! Two passes. First every cluster picks the detection it overlaps most
//! (at least `min_overlap`); ties go to the more confident detection, then
//! the lower detection index. Then every detection keeps the best of the
//! clusters that picked it: highest overlap, then more points, then nearer,
//! then lower cluster id. The result is injective in both directions.

use std::cmp::Ordering;

use serde::Serialize;

use super::detector::Detection2D;
use super::projection::ProjectedCluster;
use crate::config::{FusionConfig, OverlapMetric};

/// A detection confirmed by a LIDAR cluster, positioned in the camera frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedObject {
    pub bbox2d: [f64; 4],
    /// `[x_min, y_min, z_min, x_max, y_max, z_max]`
    pub bbox3d: [f64; 6],
    pub category: String,
    pub confidence: f64,
    pub distance: f64,
    pub position: [f64; 3],
    pub cluster_id: usize,
    pub num_points: usize,
}

fn area(b: &[f64; 4]) -> f64 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

fn intersection(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let w = a[2].min(b[2]) - a[0].max(b[0]);
    let h = a[3].min(b[3]) - a[1].max(b[1]);
    w.max(0.0) * h.max(0.0)
}

fn contains(b: &[f64; 4], p: [f64; 2]) -> bool {
    p[0] >= b[0] && p[0] <= b[2] && p[1] >= b[1] && p[1] <= b[3]
}

/// Intersection over union of two pixel boxes.
pub fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let inter = intersection(a, b);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Fraction of `inner`'s area lying inside `outer`.
pub fn containment(inner: &[f64; 4], outer: &[f64; 4]) -> f64 {
    let a = area(inner);
    if a <= 0.0 {
        0.0
    } else {
        intersection(inner, outer) / a
    }
}

/// Overlap score of a projected cluster against a detection box.
///
/// A cluster whose pixel bound has no area (a single visible point, or
/// points on one image row) scores 1 or 0 by whether its projected centroid
/// falls inside the detection.
pub fn overlap(cluster: &ProjectedCluster, detection: &Detection2D, metric: OverlapMetric) -> f64 {
    if area(&cluster.bbox) <= 0.0 {
        return if contains(&detection.bbox, cluster.centroid_px) {
            1.0
        } else {
            0.0
        };
    }
    match metric {
        OverlapMetric::Containment => containment(&cluster.bbox, &detection.bbox),
        OverlapMetric::Iou => iou(&cluster.bbox, &detection.bbox),
    }
}

/// Detector confidence clamped to `[0, 1]`; NaN and infinities count as 0.
fn confidence(det: &Detection2D) -> f64 {
    if det.confidence.is_finite() {
        det.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Assignment {
    cluster: usize,
    detection: usize,
    overlap: f64,
}

/// Step 1: each cluster's preferred detection, if any clears the threshold.
fn assign_clusters(
    detections: &[Detection2D],
    clusters: &[ProjectedCluster],
    config: &FusionConfig,
) -> Vec<Assignment> {
    clusters
        .iter()
        .enumerate()
        .filter_map(|(ci, cluster)| {
            let mut best: Option<Assignment> = None;
            for (di, det) in detections.iter().enumerate() {
                let score = overlap(cluster, det, config.metric);
                if !(score >= config.min_overlap) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => {
                        score > b.overlap
                            || (score == b.overlap
                                && confidence(det) > confidence(&detections[b.detection]))
                    }
                };
                if better {
                    best = Some(Assignment {
                        cluster: ci,
                        detection: di,
                        overlap: score,
                    });
                }
            }
            best
        })
        .collect()
}

/// Ordering where `Less` means `a` is the stronger claim on its detection.
fn compare_claims(a: &Assignment, b: &Assignment, clusters: &[ProjectedCluster]) -> Ordering {
    let (ca, cb) = (&clusters[a.cluster], &clusters[b.cluster]);
    b.overlap
        .total_cmp(&a.overlap)
        .then_with(|| cb.cluster.len().cmp(&ca.cluster.len()))
        .then_with(|| ca.distance.total_cmp(&cb.distance))
        .then_with(|| ca.cluster.id.cmp(&cb.cluster.id))
}

/// Fuse detections with projected clusters.
///
/// Output is ordered by detection index. Detections no cluster claims are
/// dropped, as are clusters that lose their detection to a stronger one.
pub fn fuse(
    detections: &[Detection2D],
    clusters: &[ProjectedCluster],
    config: &FusionConfig,
) -> Vec<FusedObject> {
    if detections.is_empty() || clusters.is_empty() {
        return Vec::new();
    }

    let assignments = assign_clusters(detections, clusters, config);

    let mut winners: Vec<Option<Assignment>> = vec![None; detections.len()];
    for a in assignments {
        let slot = &mut winners[a.detection];
        match slot {
            Some(current) if compare_claims(current, &a, clusters) != Ordering::Greater => {}
            _ => *slot = Some(a),
        }
    }

    winners
        .into_iter()
        .flatten()
        .map(|a| {
            let det = &detections[a.detection];
            let cluster = &clusters[a.cluster];
            FusedObject {
                bbox2d: det.bbox,
                bbox3d: cluster.bbox3d(),
                category: det
                    .label
                    .clone()
                    .unwrap_or_else(|| config.class_name(det.class_id)),
                confidence: confidence(det),
                distance: cluster.distance,
                position: cluster.camera_centroid,
                cluster_id: cluster.cluster.id,
                num_points: cluster.cluster.len(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::clustering::PointCluster;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn projected(id: usize, bbox: [f64; 4], points: usize, centroid: [f64; 3]) -> ProjectedCluster {
        let centroid_px = [(bbox[0] + bbox[2]) / 2.0, (bbox[1] + bbox[3]) / 2.0];
        ProjectedCluster {
            cluster: PointCluster {
                id,
                indices: (0..points).collect(),
                centroid,
                min: centroid,
                max: centroid,
            },
            bbox,
            centroid_px,
            camera_centroid: centroid,
            camera_min: centroid,
            camera_max: centroid,
            distance: (centroid[0].powi(2) + centroid[1].powi(2) + centroid[2].powi(2)).sqrt(),
            visible_points: points,
            excluded_points: 0,
        }
    }

    fn detection(bbox: [f64; 4], confidence: f64) -> Detection2D {
        Detection2D {
            bbox,
            class_id: 0,
            label: None,
            confidence,
        }
    }

    #[test]
    fn test_overlap_metrics() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 15.0, 10.0];
        assert_relative_eq!(iou(&a, &b), 50.0 / 150.0);
        assert_relative_eq!(containment(&a, &b), 0.5);
        assert_relative_eq!(containment(&[6.0, 1.0, 8.0, 2.0], &b), 1.0);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    }

    #[test]
    fn test_degenerate_bound_uses_centroid() {
        let det = detection([90.0, 190.0, 310.0, 410.0], 0.9);
        let inside = projected(0, [150.0, 300.0, 250.0, 300.0], 2, [1.0, 2.0, 5.0]);
        let outside = projected(1, [400.0, 300.0, 420.0, 300.0], 2, [1.0, 2.0, 5.0]);
        assert_eq!(overlap(&inside, &det, OverlapMetric::Containment), 1.0);
        assert_eq!(overlap(&outside, &det, OverlapMetric::Iou), 0.0);
    }

    #[test]
    fn test_fuse_single_pair() {
        let config = FusionConfig {
            class_names: vec!["car".into()],
            ..FusionConfig::default()
        };
        let det = detection([90.0, 190.0, 310.0, 410.0], 0.9);
        let cluster = projected(0, [190.0, 290.0, 210.0, 310.0], 2, [1.0, 2.0, 5.0]);

        let fused = fuse(&[det], &[cluster], &config);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].category, "car");
        assert_eq!(fused[0].confidence, 0.9);
        assert_eq!(fused[0].position, [1.0, 2.0, 5.0]);
        assert_relative_eq!(fused[0].distance, 5.477, epsilon = 1e-3);
        assert_eq!(fused[0].bbox2d, [90.0, 190.0, 310.0, 410.0]);
    }

    #[test]
    fn test_non_finite_confidence_reported_as_zero() {
        let cluster = projected(0, [190.0, 290.0, 210.0, 310.0], 2, [1.0, 2.0, 5.0]);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let det = detection([90.0, 190.0, 310.0, 410.0], bad);
            let fused = fuse(&[det], &[cluster.clone()], &FusionConfig::default());
            assert_eq!(fused.len(), 1);
            assert_eq!(fused[0].confidence, 0.0);
            let json = serde_json::to_value(&fused[0]).unwrap();
            assert_eq!(json["confidence"], 0.0);
        }

        // A NaN-confidence twin does not win the tie
        let dets = [
            detection([90.0, 190.0, 310.0, 410.0], f64::NAN),
            detection([90.0, 190.0, 310.0, 410.0], 0.4),
        ];
        let fused = fuse(&dets, &[cluster], &FusionConfig::default());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].confidence, 0.4);
    }

    #[test]
    fn test_fuse_empty_inputs() {
        let config = FusionConfig::default();
        let cluster = projected(0, [0.0, 0.0, 10.0, 10.0], 3, [0.0, 0.0, 5.0]);
        assert!(fuse(&[], &[cluster], &config).is_empty());
        assert!(fuse(&[detection([0.0, 0.0, 1.0, 1.0], 0.5)], &[], &config).is_empty());
    }

    #[test]
    fn test_fuse_below_threshold() {
        let det = detection([0.0, 0.0, 10.0, 10.0], 0.8);
        let cluster = projected(0, [8.0, 0.0, 18.0, 10.0], 3, [0.0, 0.0, 5.0]);
        assert!(fuse(&[det], &[cluster], &FusionConfig::default()).is_empty());
    }

    #[test]
    fn test_cluster_tie_goes_to_confident_detection() {
        let cluster = projected(0, [10.0, 10.0, 20.0, 20.0], 3, [0.0, 0.0, 5.0]);
        let low = detection([0.0, 0.0, 30.0, 30.0], 0.4);
        let high = detection([5.0, 5.0, 25.0, 25.0], 0.8);

        let fused = fuse(&[low, high], &[cluster], &FusionConfig::default());
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].confidence, 0.8);
    }

    #[test]
    fn test_detection_keeps_strongest_cluster() {
        let det = detection([0.0, 0.0, 100.0, 100.0], 0.7);
        let far_big = projected(0, [10.0, 10.0, 20.0, 20.0], 10, [0.0, 0.0, 30.0]);
        let near_small = projected(1, [30.0, 30.0, 40.0, 40.0], 4, [0.0, 0.0, 8.0]);
        let near_big = projected(2, [50.0, 50.0, 60.0, 60.0], 10, [0.0, 0.0, 8.0]);

        let fused = fuse(&[det], &[far_big, near_small, near_big], &FusionConfig::default());
        assert_eq!(fused.len(), 1);
        // Equal overlap and size: nearer wins
        assert_eq!(fused[0].cluster_id, 2);
        assert_eq!(fused[0].num_points, 10);
    }

    #[test]
    fn test_iou_metric_is_stricter() {
        let det = detection([0.0, 0.0, 100.0, 100.0], 0.7);
        let cluster = projected(0, [10.0, 10.0, 20.0, 20.0], 5, [0.0, 0.0, 8.0]);
        let config = FusionConfig {
            metric: OverlapMetric::Iou,
            ..FusionConfig::default()
        };
        assert!(fuse(&[det.clone()], &[cluster.clone()], &config).is_empty());
        assert_eq!(fuse(&[det], &[cluster], &FusionConfig::default()).len(), 1);
    }

    fn arb_box() -> impl Strategy<Value = [f64; 4]> {
        (0.0f64..200.0, 0.0f64..200.0, 0.0f64..60.0, 0.0f64..60.0)
            .prop_map(|(x, y, w, h)| [x, y, x + w, y + h])
    }

    proptest! {
        #[test]
        fn prop_fusion_is_injective(
            det_boxes in prop::collection::vec((arb_box(), 0.0f64..1.0), 0..8),
            cluster_boxes in prop::collection::vec((arb_box(), 1usize..20, 1.0f64..50.0), 0..12),
            min_overlap in 0.05f64..1.0,
        ) {
            let detections: Vec<Detection2D> = det_boxes
                .into_iter()
                .map(|(b, c)| detection(b, c))
                .collect();
            let clusters: Vec<ProjectedCluster> = cluster_boxes
                .into_iter()
                .enumerate()
                .map(|(id, (b, n, z))| projected(id, b, n, [0.0, 0.0, z]))
                .collect();
            let config = FusionConfig { min_overlap, ..FusionConfig::default() };

            let fused = fuse(&detections, &clusters, &config);
            prop_assert!(fused.len() <= detections.len().min(clusters.len()));

            let mut ids: Vec<usize> = fused.iter().map(|f| f.cluster_id).collect();
            ids.sort_unstable();
            ids.dedup();
            prop_assert_eq!(ids.len(), fused.len());

            for f in &fused {
                prop_assert!((0.0..=1.0).contains(&f.confidence));
                prop_assert!(f.distance >= 0.0);
            }
        }
    }
}
