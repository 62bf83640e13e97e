//! Per-request orchestration.
//!
//! A request moves through
//! `Received → Parsing → Clustering → Detecting → Projecting → Fusing → Completed`,
//! or drops to `Failed` carrying the stage it failed in. CPU-bound stages run
//! on the blocking pool; the detector call is the only await point and the
//! only step that is retried.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::core::calibration::{read_calibration, CalibrationError, CalibrationTransform};
use crate::core::labels::{read_labels, Label, LabelError};
use crate::core::loaders::{read_point_cloud, LoaderError, PointCloud};
use crate::core::transforms::{preprocess, PreprocessStats};
use crate::processors::clustering::{cluster_point_cloud, Clustering, ClusteringError};
use crate::processors::detector::{
    DetectRequest, Detection2D, Detector, DetectorError, DetectorOutput,
};
use crate::processors::evaluation::{evaluate, EvaluationReport};
use crate::processors::fusion::{fuse, FusedObject};
use crate::processors::projection::{project_clusters, ProjectedCluster};
use crate::visualization::{annotate, decode_image, encode_png_base64, AnnotateError};

/// Request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Parsing,
    Clustering,
    Detecting,
    Projecting,
    Fusing,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Parsing => "parsing",
            Stage::Clustering => "clustering",
            Stage::Detecting => "detecting",
            Stage::Projecting => "projecting",
            Stage::Fusing => "fusing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error classes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Parse,
    Processing,
    DetectorTimeout,
    DetectorUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "InputError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Processing => "ProcessingError",
            ErrorKind::DetectorTimeout => "DetectorTimeout",
            ErrorKind::DetectorUnavailable => "DetectorUnavailable",
        }
    }

    /// HTTP status code for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Input => 400,
            ErrorKind::Parse => 422,
            ErrorKind::Processing => 500,
            ErrorKind::DetectorUnavailable => 503,
            ErrorKind::DetectorTimeout => 504,
        }
    }
}

/// Any failure of a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' supplied more than once")]
    DuplicateField(&'static str),

    #[error("malformed upload: {0}")]
    Upload(String),

    #[error("{field}: {source}")]
    Image {
        field: &'static str,
        #[source]
        source: AnnotateError,
    },

    #[error("calibration: {0}")]
    Calibration(#[source] CalibrationError),

    #[error("pcd: {0}")]
    PointCloud(#[source] LoaderError),

    #[error("labels: {0}")]
    Labels(#[source] LabelError),

    #[error("clustering: {0}")]
    Clustering(#[from] ClusteringError),

    #[error("{source} (after {attempts} attempts)")]
    Detector {
        #[source]
        source: DetectorError,
        attempts: u32,
    },

    #[error("could not render result image: {0}")]
    Render(#[source] AnnotateError),

    #[error("worker task failed during {stage}: {reason}")]
    Worker { stage: Stage, reason: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingField(_)
            | Self::DuplicateField(_)
            | Self::Upload(_)
            | Self::Image { .. } => ErrorKind::Input,
            Self::PointCloud(LoaderError::EmptyFile(_)) => ErrorKind::Input,
            Self::Calibration(_) | Self::PointCloud(_) | Self::Labels(_) => ErrorKind::Parse,
            Self::Clustering(_) | Self::Render(_) | Self::Worker { .. } => ErrorKind::Processing,
            Self::Detector { source, .. } => match source {
                DetectorError::Timeout { .. } => ErrorKind::DetectorTimeout,
                DetectorError::Unavailable(_) | DetectorError::InvalidResponse(_) => {
                    ErrorKind::DetectorUnavailable
                }
                DetectorError::InvalidImage(_) => ErrorKind::Input,
            },
        }
    }

    /// The stage the request was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::MissingField(_) | Self::DuplicateField(_) | Self::Upload(_) => Stage::Received,
            Self::Image { .. } | Self::Calibration(_) | Self::PointCloud(_) | Self::Labels(_) => {
                Stage::Parsing
            }
            Self::Clustering(_) => Stage::Clustering,
            Self::Detector { .. } => Stage::Detecting,
            Self::Render(_) => Stage::Fusing,
            Self::Worker { stage, .. } => *stage,
        }
    }

    /// Error body returned to clients.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "error": self.to_string(),
            "kind": self.kind().as_str(),
            "stage": self.stage().as_str(),
        })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One uploaded file.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(file_name: Option<String>, bytes: Vec<u8>) -> Self {
        Self { file_name, bytes }
    }
}

/// The four files a request must supply.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub pcd: Upload,
    pub image: Upload,
    pub calibration: Upload,
    pub labels: Upload,
}

/// Collects named uploads, enforcing that each field arrives exactly once.
#[derive(Debug, Default)]
pub struct InputsBuilder {
    pcd: Option<Upload>,
    image: Option<Upload>,
    calibration: Option<Upload>,
    labels: Option<Upload>,
}

impl InputsBuilder {
    /// Canonical field name for a form field, accepting the short aliases.
    pub fn canonical_field(name: &str) -> Option<&'static str> {
        match name {
            "pcd" => Some("pcd"),
            "image" => Some("image"),
            "calibration" | "calib" => Some("calibration"),
            "labels" | "label" => Some("labels"),
            _ => None,
        }
    }

    /// Add a field. Returns `Ok(false)` for fields the pipeline does not use.
    pub fn insert(&mut self, name: &str, upload: Upload) -> Result<bool> {
        let Some(field) = Self::canonical_field(name) else {
            return Ok(false);
        };
        let slot = match field {
            "pcd" => &mut self.pcd,
            "image" => &mut self.image,
            "calibration" => &mut self.calibration,
            _ => &mut self.labels,
        };
        if slot.is_some() {
            return Err(PipelineError::DuplicateField(field));
        }
        *slot = Some(upload);
        Ok(true)
    }

    pub fn build(self) -> Result<PipelineInputs> {
        Ok(PipelineInputs {
            pcd: self.pcd.ok_or(PipelineError::MissingField("pcd"))?,
            image: self.image.ok_or(PipelineError::MissingField("image"))?,
            calibration: self
                .calibration
                .ok_or(PipelineError::MissingField("calibration"))?,
            labels: self.labels.ok_or(PipelineError::MissingField("labels"))?,
        })
    }
}

/// Counts describing one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub points_received: usize,
    pub points_clustered: usize,
    pub clusters: usize,
    pub noise_points: usize,
    pub visible_clusters: usize,
    pub detections: usize,
    pub fused_objects: usize,
    pub detector: String,
    pub detector_attempts: u32,
    pub elapsed_ms: u64,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Annotated image, base64 PNG
    pub processed_image: String,
    pub fused_objects: Vec<FusedObject>,
    pub detections: Vec<Detection2D>,
    pub summary: ProcessSummary,
    pub evaluation: EvaluationReport,
}

impl PipelineOutput {
    /// Success body returned to clients.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "processed_image": self.processed_image,
            "fused_objects": self.fused_objects,
            "summary": self.summary,
            "evaluation": self.evaluation,
        })
    }
}

struct ParsedInputs {
    calibration: CalibrationTransform,
    cloud: PointCloud,
    labels: Vec<Label>,
    image: RgbImage,
}

struct ClusteredCloud {
    cloud: PointCloud,
    clustering: Clustering,
    stats: PreprocessStats,
}

/// Run a CPU-bound stage on the blocking pool.
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Worker {
            stage,
            reason: e.to_string(),
        })?
}

fn parse_inputs(inputs: PipelineInputs, camera_key: &str) -> Result<ParsedInputs> {
    let calibration = read_calibration(&inputs.calibration.bytes, camera_key)
        .map_err(PipelineError::Calibration)?;
    let cloud = read_point_cloud(&inputs.pcd.bytes, inputs.pcd.file_name.as_deref())
        .map_err(PipelineError::PointCloud)?;
    let labels = read_labels(&inputs.labels.bytes).map_err(PipelineError::Labels)?;
    let image = decode_image(&inputs.image.bytes).map_err(|source| PipelineError::Image {
        field: "image",
        source,
    })?;
    Ok(ParsedInputs {
        calibration,
        cloud,
        labels,
        image,
    })
}

/// Sequences parsing, clustering, detection, projection and fusion.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    detector: Arc<dyn Detector>,
    next_request: AtomicU64,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, detector: Arc<dyn Detector>) -> Self {
        Self {
            config: Arc::new(config),
            detector,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one request end to end.
    pub async fn run(&self, inputs: PipelineInputs) -> Result<PipelineOutput> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        debug!("request {}: {}", id, Stage::Received);

        match self.execute(id, inputs, started).await {
            Ok(output) => {
                debug!("request {}: {}", id, Stage::Completed);
                info!(
                    "request {}: {} points, {} clusters, {} detections, {} fused in {} ms",
                    id,
                    output.summary.points_received,
                    output.summary.clusters,
                    output.summary.detections,
                    output.summary.fused_objects,
                    output.summary.elapsed_ms
                );
                Ok(output)
            }
            Err(e) => {
                debug!(
                    "request {}: {} -> {} ({})",
                    id,
                    e.stage(),
                    Stage::Failed,
                    e.kind().as_str()
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, id: u64, inputs: PipelineInputs, started: Instant) -> Result<PipelineOutput> {
        let config = Arc::clone(&self.config);

        debug!("request {}: {}", id, Stage::Parsing);
        let camera_key = config.calibration.camera.clone();
        let parsed = blocking(Stage::Parsing, move || parse_inputs(inputs, &camera_key)).await?;
        let ParsedInputs {
            calibration,
            cloud,
            labels,
            image,
        } = parsed;
        let points_received = cloud.len();

        debug!("request {}: {}", id, Stage::Clustering);
        let cfg = Arc::clone(&config);
        let clustered = blocking(Stage::Clustering, move || {
            let (cloud, stats) = preprocess(&cloud, &cfg.preprocessing);
            let clustering = cluster_point_cloud(&cloud, &cfg.clustering)?;
            Ok(ClusteredCloud {
                cloud,
                clustering,
                stats,
            })
        })
        .await?;
        debug!(
            "request {}: kept {} of {} points ({} out of range)",
            id, clustered.stats.output_points, clustered.stats.input_points, clustered.stats.out_of_range
        );

        debug!("request {}: {}", id, Stage::Detecting);
        let request = DetectRequest {
            image,
            labels,
            calibration,
        };
        let (output, attempts) = self.detect_with_retry(id, &request).await?;
        let DetectRequest {
            image,
            labels,
            calibration,
        } = request;

        debug!("request {}: {}", id, Stage::Projecting);
        let cfg = Arc::clone(&config);
        let ClusteredCloud {
            cloud, clustering, ..
        } = clustered;
        let cluster_count = clustering.clusters.len();
        let noise_points = clustering.noise.len();
        let points_clustered = cloud.len();
        let projected: Vec<ProjectedCluster> = blocking(Stage::Projecting, move || {
            Ok(project_clusters(
                &cloud,
                &clustering.clusters,
                &calibration,
                &cfg.projection,
            ))
        })
        .await?;

        debug!("request {}: {}", id, Stage::Fusing);
        let cfg = Arc::clone(&config);
        let DetectorOutput {
            detections,
            annotated_image,
        } = output;
        let visible_clusters = projected.len();
        let (fused_objects, detections, evaluation, processed_image) =
            blocking(Stage::Fusing, move || {
                let fused = fuse(&detections, &projected, &cfg.fusion);
                let evaluation = evaluate(&labels, &fused, cfg.evaluation.match_radius);
                // A detector-rendered image already shows the detections
                let rendered = match &annotated_image {
                    Some(base) => annotate(base, &[], &fused),
                    None => annotate(&image, &detections, &fused),
                };
                let encoded = encode_png_base64(&rendered).map_err(PipelineError::Render)?;
                Ok((fused, detections, evaluation, encoded))
            })
            .await?;

        let summary = ProcessSummary {
            points_received,
            points_clustered,
            clusters: cluster_count,
            noise_points,
            visible_clusters,
            detections: detections.len(),
            fused_objects: fused_objects.len(),
            detector: self.detector.name().to_string(),
            detector_attempts: attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        Ok(PipelineOutput {
            processed_image,
            fused_objects,
            detections,
            summary,
            evaluation,
        })
    }

    /// Call the detector under a per-attempt timeout, retrying timeouts and
    /// outages with linear backoff.
    async fn detect_with_retry(&self, id: u64, request: &DetectRequest) -> Result<(DetectorOutput, u32)> {
        let policy = &self.config.detector;
        let timeout = Duration::from_millis(policy.timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(timeout, self.detector.detect(request)).await {
                Ok(result) => result,
                Err(_) => Err(DetectorError::Timeout {
                    ms: policy.timeout_ms,
                }),
            };

            match result {
                Ok(output) => return Ok((output, attempt)),
                Err(e) if e.is_retryable() && attempt <= policy.max_retries => {
                    warn!(
                        "request {}: detector '{}' attempt {} failed: {}",
                        id,
                        self.detector.name(),
                        attempt,
                        e
                    );
                    let backoff = policy.retry_backoff_ms.saturating_mul(attempt as u64);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    return Err(PipelineError::Detector {
                        source: e,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::detector::StaticDetector;
    use crate::visualization::encode_png;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    const CALIB: &str = "K: 100 0 200 0 100 200 0 0 1\n";

    fn blank_png(w: u32, h: u32) -> Vec<u8> {
        encode_png(&RgbImage::new(w, h)).unwrap()
    }

    fn cloud_csv(points: &[[f32; 3]]) -> Vec<u8> {
        let mut text = String::from("x,y,z\n");
        for p in points {
            text.push_str(&format!("{},{},{}\n", p[0], p[1], p[2]));
        }
        text.into_bytes()
    }

    fn inputs(calib: &str, points: &[[f32; 3]]) -> PipelineInputs {
        PipelineInputs {
            pcd: Upload::new(Some("cloud.csv".into()), cloud_csv(points)),
            image: Upload::new(Some("img.png".into()), blank_png(400, 400)),
            calibration: Upload::new(None, calib.as_bytes().to_vec()),
            labels: Upload::default(),
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.clustering.min_points = 2;
        config.fusion.class_names = vec!["car".into()];
        config.detector.retry_backoff_ms = 1;
        config
    }

    fn car_detection() -> Detection2D {
        Detection2D {
            bbox: [90.0, 190.0, 310.0, 410.0],
            class_id: 0,
            label: None,
            confidence: 0.9,
        }
    }

    /// Fails with the given error a fixed number of times, then succeeds.
    struct FlakyDetector {
        failures: u32,
        error: DetectorError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Detector for FlakyDetector {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn detect(&self, _request: &DetectRequest) -> crate::processors::detector::Result<DetectorOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(DetectorOutput {
                detections: vec![car_detection()],
                annotated_image: None,
            })
        }
    }

    struct SlowDetector;

    #[async_trait]
    impl Detector for SlowDetector {
        fn name(&self) -> &str {
            "slow"
        }

        async fn detect(&self, _request: &DetectRequest) -> crate::processors::detector::Result<DetectorOutput> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(DetectorOutput::default())
        }
    }

    #[tokio::test]
    async fn test_run_fuses_single_object() {
        let pipeline = Pipeline::new(config(), Arc::new(StaticDetector::new(vec![car_detection()])));
        let out = pipeline
            .run(inputs(CALIB, &[[0.9, 2.0, 5.0], [1.1, 2.0, 5.0]]))
            .await
            .unwrap();

        assert_eq!(out.fused_objects.len(), 1);
        let obj = &out.fused_objects[0];
        assert_eq!(obj.category, "car");
        assert!((obj.distance - 5.477).abs() < 1e-3);
        assert!((obj.position[0] - 1.0).abs() < 1e-6);
        assert_eq!(out.summary.clusters, 1);
        assert_eq!(out.summary.detector_attempts, 1);

        let body = out.to_json();
        assert_eq!(body["status"], "success");
        assert_eq!(body["fused_objects"][0]["bbox3d"].as_array().unwrap().len(), 6);
        assert!(!body["processed_image"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_without_detections_succeeds_empty() {
        let pipeline = Pipeline::new(config(), Arc::new(StaticDetector::default()));
        let out = pipeline
            .run(inputs(CALIB, &[[0.9, 2.0, 5.0], [1.1, 2.0, 5.0]]))
            .await
            .unwrap();
        assert!(out.fused_objects.is_empty());
        assert_eq!(out.summary.clusters, 1);
        assert_eq!(out.to_json()["status"], "success");
    }

    #[tokio::test]
    async fn test_missing_intrinsic_is_parse_error() {
        let pipeline = Pipeline::new(config(), Arc::new(StaticDetector::default()));
        let err = pipeline
            .run(inputs("R: 1 0 0 0 1 0 0 0 1\nT: 0 0 0\n", &[[0.0, 0.0, 5.0]]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert_eq!(err.stage(), Stage::Parsing);

        let body = err.to_json();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "ParseError");
        assert_eq!(body["stage"], "parsing");
    }

    #[tokio::test]
    async fn test_undecodable_image_is_input_error() {
        let pipeline = Pipeline::new(config(), Arc::new(StaticDetector::default()));
        let mut req = inputs(CALIB, &[[0.0, 0.0, 5.0]]);
        req.image.bytes = b"definitely not a png".to_vec();
        let err = pipeline.run(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(err.kind().status_code(), 400);
    }

    #[tokio::test]
    async fn test_detector_retried_until_success() {
        let detector = Arc::new(FlakyDetector {
            failures: 2,
            error: DetectorError::Unavailable("warming up".into()),
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(config(), detector.clone());
        let out = pipeline
            .run(inputs(CALIB, &[[0.9, 2.0, 5.0], [1.1, 2.0, 5.0]]))
            .await
            .unwrap();
        assert_eq!(out.summary.detector_attempts, 3);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.fused_objects.len(), 1);
    }

    #[tokio::test]
    async fn test_detector_retries_exhausted() {
        let detector = Arc::new(FlakyDetector {
            failures: 10,
            error: DetectorError::Unavailable("down".into()),
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(config(), detector.clone());
        let err = pipeline
            .run(inputs(CALIB, &[[0.0, 0.0, 5.0]]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DetectorUnavailable);
        assert_eq!(err.stage(), Stage::Detecting);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_image_not_retried() {
        let detector = Arc::new(FlakyDetector {
            failures: 10,
            error: DetectorError::InvalidImage("too small".into()),
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::new(config(), detector.clone());
        let err = pipeline
            .run(inputs(CALIB, &[[0.0, 0.0, 5.0]]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detector_timeout() {
        let mut cfg = config();
        cfg.detector.timeout_ms = 20;
        cfg.detector.max_retries = 1;
        let pipeline = Pipeline::new(cfg, Arc::new(SlowDetector));
        let err = pipeline
            .run(inputs(CALIB, &[[0.0, 0.0, 5.0]]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DetectorTimeout);
        assert_eq!(err.kind().status_code(), 504);
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[test]
    fn test_inputs_builder() {
        let mut builder = InputsBuilder::default();
        assert!(builder.insert("pcd", Upload::default()).unwrap());
        assert!(builder.insert("calib", Upload::default()).unwrap());
        assert!(builder.insert("label", Upload::default()).unwrap());
        assert!(!builder.insert("extra", Upload::default()).unwrap());
        assert!(matches!(
            builder.insert("calibration", Upload::default()),
            Err(PipelineError::DuplicateField("calibration"))
        ));
        assert!(matches!(
            builder.build(),
            Err(PipelineError::MissingField("image"))
        ));
    }
}
