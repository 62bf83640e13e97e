//! 2D object detection boundary.
//!
//! The pipeline only sees the [`Detector`] trait. Three implementations ship
//! with the crate:
//! - [`HttpDetector`] posts the image to a model service (YOLO or similar)
//! - [`GroundTruthDetector`] projects the request's KITTI labels into the image
//! - [`StaticDetector`] replays a fixed detection list (CLI `--detections`, tests)
//!
//! # Model service protocol
//!
//! `POST <endpoint>` with a multipart form holding one `image` field (PNG).
//! A `200` answer is JSON:
//!
//! ```json
//! {"detections": [{"bbox": [x1, y1, x2, y2], "class_id": 2, "label": "car", "confidence": 0.87}],
//!  "annotated_image": "<optional base64 PNG>"}
//! ```
//!
//! `5xx` and `429` answers and connection failures count as the service being
//! unavailable. Other `4xx` answers reject the image.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::projection::project_camera_point;
use crate::config::ProjectionConfig;
use crate::core::calibration::CalibrationTransform;
use crate::core::labels::Label;
use crate::visualization::{decode_image, draw_boxes, encode_png, DETECTION_COLOR};

/// Corners nearer than this to the image plane disqualify a label box.
const LABEL_MIN_DEPTH: f64 = 0.1;

/// Errors reported by a detector backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("detector rejected image: {0}")]
    InvalidImage(String),

    #[error("detector sent an unusable response: {0}")]
    InvalidResponse(String),
}

impl DetectorError {
    /// Timeouts and outages are worth another attempt; bad input is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, DetectorError>;

/// One 2D detection in pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection2D {
    /// `[x_min, y_min, x_max, y_max]`
    pub bbox: [f64; 4],
    pub class_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub confidence: f64,
}

/// Everything a detector may look at for one request.
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub image: RgbImage,
    pub labels: Vec<Label>,
    pub calibration: CalibrationTransform,
}

/// Detections plus the detector's own rendering of them, if it makes one.
#[derive(Debug, Clone, Default)]
pub struct DetectorOutput {
    pub detections: Vec<Detection2D>,
    pub annotated_image: Option<RgbImage>,
}

/// A 2D object detector.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn detect(&self, request: &DetectRequest) -> Result<DetectorOutput>;
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    detections: Vec<Detection2D>,
    #[serde(default)]
    annotated_image: Option<String>,
}

/// Client for a remote model service speaking the protocol above.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DetectorError::Unavailable(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn parse_response(body: &[u8]) -> Result<DetectorOutput> {
        let response: ServiceResponse = serde_json::from_slice(body)
            .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

        let annotated_image = match response.annotated_image {
            Some(encoded) => {
                let png = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| DetectorError::InvalidResponse(format!("annotated_image: {}", e)))?;
                let img = decode_image(&png)
                    .map_err(|e| DetectorError::InvalidResponse(format!("annotated_image: {}", e)))?;
                Some(img)
            }
            None => None,
        };

        Ok(DetectorOutput {
            detections: response.detections,
            annotated_image,
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, request: &DetectRequest) -> Result<DetectorOutput> {
        let png = encode_png(&request.image).map_err(|e| DetectorError::InvalidImage(e.to_string()))?;
        let part = Part::bytes(png)
            .file_name("frame.png")
            .mime_str("image/png")
            .map_err(|e| DetectorError::InvalidImage(e.to_string()))?;
        let form = Form::new().part("image", part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DetectorError::Unavailable(format!("{}: {}", self.endpoint, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DetectorError::Unavailable(format!("{}: {}", self.endpoint, e)))?;

        if status.is_success() {
            let output = Self::parse_response(&body)?;
            log::debug!("{} returned {} detections", self.endpoint, output.detections.len());
            return Ok(output);
        }

        let reason = format!("{} answered {}: {}", self.endpoint, status, String::from_utf8_lossy(&body).trim());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(DetectorError::Unavailable(reason))
        } else {
            Err(DetectorError::InvalidImage(reason))
        }
    }
}

/// Detects exactly the labelled objects by projecting their 3D boxes.
#[derive(Debug, Clone, Default)]
pub struct GroundTruthDetector {
    class_names: Vec<String>,
}

impl GroundTruthDetector {
    pub fn new(class_names: Vec<String>) -> Self {
        Self { class_names }
    }

    fn class_id(&self, category: &str) -> u32 {
        self.class_names
            .iter()
            .position(|name| name == category)
            .unwrap_or(self.class_names.len()) as u32
    }

    /// Project one label to a pixel box, or `None` when any corner is
    /// behind the camera or the box misses the image.
    pub fn label_box(
        label: &Label,
        calib: &CalibrationTransform,
        width: u32,
        height: u32,
    ) -> Option<[f64; 4]> {
        let config = ProjectionConfig {
            min_depth: LABEL_MIN_DEPTH,
            apply_distortion: true,
        };

        let mut bbox = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        for corner in label.corners() {
            let [u, v] = project_camera_point(calib, [corner.x, corner.y, corner.z], &config)?;
            bbox[0] = bbox[0].min(u);
            bbox[1] = bbox[1].min(v);
            bbox[2] = bbox[2].max(u);
            bbox[3] = bbox[3].max(v);
        }

        bbox[0] = bbox[0].max(0.0);
        bbox[1] = bbox[1].max(0.0);
        if bbox[2] <= bbox[0]
            || bbox[3] <= bbox[1]
            || bbox[0] >= width as f64
            || bbox[1] >= height as f64
        {
            return None;
        }
        Some(bbox)
    }
}

#[async_trait]
impl Detector for GroundTruthDetector {
    fn name(&self) -> &str {
        "ground-truth"
    }

    async fn detect(&self, request: &DetectRequest) -> Result<DetectorOutput> {
        let (width, height) = request.image.dimensions();

        let detections: Vec<Detection2D> = request
            .labels
            .iter()
            .filter_map(|label| {
                let bbox = Self::label_box(label, &request.calibration, width, height);
                if bbox.is_none() {
                    log::debug!("{} label not visible in image, skipped", label.category);
                }
                bbox.map(|bbox| Detection2D {
                    bbox,
                    class_id: self.class_id(&label.category),
                    label: Some(label.category.clone()),
                    confidence: 1.0,
                })
            })
            .collect();

        let mut annotated = request.image.clone();
        draw_boxes(
            &mut annotated,
            detections.iter().map(|d| d.bbox),
            DETECTION_COLOR,
        );

        Ok(DetectorOutput {
            detections,
            annotated_image: Some(annotated),
        })
    }
}

/// Returns the same detections for every image.
#[derive(Debug, Clone, Default)]
pub struct StaticDetector {
    detections: Vec<Detection2D>,
}

impl StaticDetector {
    pub fn new(detections: Vec<Detection2D>) -> Self {
        Self { detections }
    }

    /// Parse a JSON array of detections.
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(text)?))
    }
}

#[async_trait]
impl Detector for StaticDetector {
    fn name(&self) -> &str {
        "static"
    }

    async fn detect(&self, _request: &DetectRequest) -> Result<DetectorOutput> {
        Ok(DetectorOutput {
            detections: self.detections.clone(),
            annotated_image: None,
        })
    }
}
