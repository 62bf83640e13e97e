//! LIDAR and camera object fusion.
//!
//! This crate provides tools for:
//! - Loading point clouds (PCD, PLY, KITTI `.bin`, CSV), calibration and KITTI labels
//! - Parallel DBSCAN clustering of LIDAR points
//! - Projecting clusters into the camera image through the calibration
//! - Fusing projected clusters with 2D detections into 3D objects
//! - Serving the whole pipeline over HTTP (`POST /process`)
//!
//! # Example
//!
//! ```no_run
//! use fusion_pipeline::{core::loaders::load_point_cloud, processors::clustering::cluster_point_cloud};
//! use fusion_pipeline::ClusteringConfig;
//!
//! let cloud = load_point_cloud("scan.pcd").unwrap();
//! let clustering = cluster_point_cloud(&cloud, &ClusteringConfig::default()).unwrap();
//! println!("{} clusters", clustering.clusters.len());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod pipeline;
pub mod processors;
pub mod server;
pub mod visualization;

pub use config::{ClusteringConfig, FusionConfig, PipelineConfig};
pub use core::calibration::CalibrationTransform;
pub use core::loaders::{Point3D, PointCloud};
pub use pipeline::{Pipeline, PipelineError, PipelineInputs, PipelineOutput};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
