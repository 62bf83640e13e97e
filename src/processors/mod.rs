//! Clustering, projection, detection and fusion stages.

pub mod clustering;
pub mod detector;
pub mod evaluation;
pub mod fusion;
pub mod projection;

// Re-export key types for convenience
pub use clustering::{cluster_point_cloud, dbscan, Clustering, ClusteringError, PointCluster};
pub use detector::{
    DetectRequest, Detection2D, Detector, DetectorError, DetectorOutput, GroundTruthDetector,
    StaticDetector,
};
pub use evaluation::{evaluate, EvaluationReport};
pub use fusion::{fuse, FusedObject};
pub use projection::{project_clusters, project_point, ProjectedCluster};
