//! Configuration types for the fusion pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Point filtering applied before clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Points closer than this to the sensor origin are dropped
    #[serde(default)]
    pub min_range: f32,

    /// Points farther than this from the sensor origin are dropped
    #[serde(default = "default_max_range")]
    pub max_range: f32,

    /// Reproducible subsample target for the clusterer
    #[serde(default = "default_max_points")]
    pub max_points: usize,
}

fn default_max_range() -> f32 {
    120.0
}

fn default_max_points() -> usize {
    200_000
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            min_range: 0.0,
            max_range: default_max_range(),
            max_points: default_max_points(),
        }
    }
}

/// Configuration for DBSCAN clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Neighborhood radius in meters
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// Minimum neighbors (including the point itself) for a core point
    #[serde(default = "default_min_points")]
    pub min_points: usize,
}

fn default_eps() -> f32 {
    0.5
}

fn default_min_points() -> usize {
    5
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_points: default_min_points(),
        }
    }
}

/// Configuration for projecting camera-frame points into pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Points with camera-frame depth below this are treated as behind the camera
    #[serde(default = "default_min_depth")]
    pub min_depth: f64,

    /// Apply lens distortion when the calibration carries coefficients
    #[serde(default = "default_true")]
    pub apply_distortion: bool,
}

fn default_min_depth() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            min_depth: default_min_depth(),
            apply_distortion: true,
        }
    }
}

/// How a projected cluster bound is scored against a detection box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapMetric {
    /// Fraction of the cluster bound area lying inside the detection box
    #[default]
    Containment,
    /// Intersection over union of the two boxes
    Iou,
}

/// Configuration for the fusion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Minimum overlap for a cluster to be assigned to a detection
    #[serde(default = "default_min_overlap")]
    pub min_overlap: f64,

    #[serde(default)]
    pub metric: OverlapMetric,

    /// Class names indexed by detector class id
    #[serde(default)]
    pub class_names: Vec<String>,
}

fn default_min_overlap() -> f64 {
    0.5
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_overlap: default_min_overlap(),
            metric: OverlapMetric::default(),
            class_names: Vec::new(),
        }
    }
}

impl FusionConfig {
    /// Resolve a category name for a detector class id.
    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// Detector call policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra attempts after a timeout or unavailable response
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retry n is n * retry_backoff_ms
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Model service URL; when unset the labels are projected instead
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            endpoint: None,
        }
    }
}

/// Ground-truth evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Maximum center distance for a fused object to count as a label match
    #[serde(default = "default_match_radius")]
    pub match_radius: f64,
}

fn default_match_radius() -> f64 {
    2.0
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            match_radius: default_match_radius(),
        }
    }
}

/// Calibration file interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Projection matrix key used as the intrinsic when no `K` entry exists
    #[serde(default = "default_camera")]
    pub camera: String,
}

fn default_camera() -> String {
    "P2".to_string()
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            camera: default_camera(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Upper bound on a whole multipart request body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_max_upload_bytes() -> usize {
    256 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub projection: ProjectionConfig,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no request could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pre = &self.preprocessing;
        if !(pre.min_range >= 0.0) || !(pre.max_range > pre.min_range) {
            return Err(invalid(
                "preprocessing",
                format!("need 0 <= min_range < max_range, got {}..{}", pre.min_range, pre.max_range),
            ));
        }
        if pre.max_points == 0 {
            return Err(invalid("preprocessing.max_points", "must be positive"));
        }
        if !(self.clustering.eps.is_finite() && self.clustering.eps > 0.0) {
            return Err(invalid("clustering.eps", "must be a positive number"));
        }
        if self.clustering.min_points < 1 {
            return Err(invalid("clustering.min_points", "must be at least 1"));
        }
        if !(self.projection.min_depth > 0.0) {
            return Err(invalid("projection.min_depth", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.fusion.min_overlap) {
            return Err(invalid("fusion.min_overlap", "must lie in [0, 1]"));
        }
        if self.detector.timeout_ms == 0 {
            return Err(invalid("detector.timeout_ms", "must be positive"));
        }
        if let Some(endpoint) = &self.detector.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid("detector.endpoint", format!("'{}' is not an http(s) URL", endpoint)));
            }
        }
        if !(self.evaluation.match_radius > 0.0) {
            return Err(invalid("evaluation.match_radius", "must be positive"));
        }
        Ok(())
    }
}
