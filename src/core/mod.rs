//! Core data types and input parsing.

pub mod calibration;
pub mod labels;
pub mod loaders;
pub mod transforms;
pub mod writers;

pub use calibration::{CalibrationError, CalibrationTransform, Distortion};
pub use labels::{Label, LabelError};
pub use loaders::{LoaderError, Point3D, PointCloud};
pub use writers::{write_json, write_labels_csv, WriteError};
