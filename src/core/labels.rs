//! KITTI object label files.
//!
//! Each line describes one ground-truth object in camera coordinates:
//!
//! ```text
//! type truncated occluded alpha x1 y1 x2 y2 h w l x y z ry [score]
//! ```
//!
//! `DontCare` regions are skipped.

use nalgebra::{Matrix3, Vector3};
use serde::Serialize;
use thiserror::Error;

/// Errors raised while parsing a label file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LabelError {
    #[error("label file is not valid UTF-8")]
    Encoding,

    #[error("line {line}: expected 15 or 16 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: invalid number '{value}'")]
    InvalidNumber { line: usize, value: String },
}

pub type Result<T> = std::result::Result<T, LabelError>;

/// One ground-truth object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub category: String,
    pub truncated: f64,
    pub occluded: i32,
    pub alpha: f64,
    /// Annotated 2D box `[x_min, y_min, x_max, y_max]`
    pub bbox2d: [f64; 4],
    /// `[height, width, length]` in meters
    pub dimensions: [f64; 3],
    /// Bottom-center of the box in camera coordinates
    pub location: [f64; 3],
    /// Yaw around the camera Y axis, `[-pi, pi]`
    pub rotation_y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Label {
    /// Geometric center of the 3D box (camera Y points down).
    pub fn center(&self) -> [f64; 3] {
        let [x, y, z] = self.location;
        [x, y - self.dimensions[0] / 2.0, z]
    }

    /// The eight box corners in camera coordinates: bottom face first, then top.
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        let [h, w, l] = self.dimensions;
        let (s, c) = self.rotation_y.sin_cos();
        let rot = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
        let t = Vector3::new(self.location[0], self.location[1], self.location[2]);

        let xs = [l / 2.0, l / 2.0, -l / 2.0, -l / 2.0, l / 2.0, l / 2.0, -l / 2.0, -l / 2.0];
        let ys = [0.0, 0.0, 0.0, 0.0, -h, -h, -h, -h];
        let zs = [w / 2.0, -w / 2.0, -w / 2.0, w / 2.0, w / 2.0, -w / 2.0, -w / 2.0, w / 2.0];

        let mut out = [Vector3::zeros(); 8];
        for i in 0..8 {
            out[i] = rot * Vector3::new(xs[i], ys[i], zs[i]) + t;
        }
        out
    }
}

/// Parse label text into ground-truth objects.
pub fn parse_labels(text: &str) -> Result<Vec<Label>> {
    let mut labels = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields[0] == "DontCare" {
            continue;
        }
        if fields.len() != 15 && fields.len() != 16 {
            return Err(LabelError::FieldCount {
                line: line_no,
                found: fields.len(),
            });
        }

        let num = |i: usize| -> Result<f64> {
            fields[i].parse::<f64>().map_err(|_| LabelError::InvalidNumber {
                line: line_no,
                value: fields[i].to_string(),
            })
        };

        labels.push(Label {
            category: fields[0].to_string(),
            truncated: num(1)?,
            occluded: num(2)? as i32,
            alpha: num(3)?,
            bbox2d: [num(4)?, num(5)?, num(6)?, num(7)?],
            dimensions: [num(8)?, num(9)?, num(10)?],
            location: [num(11)?, num(12)?, num(13)?],
            rotation_y: num(14)?,
            score: if fields.len() == 16 { Some(num(15)?) } else { None },
        });
    }

    Ok(labels)
}

/// Parse an uploaded label buffer.
pub fn read_labels(bytes: &[u8]) -> Result<Vec<Label>> {
    let text = std::str::from_utf8(bytes).map_err(|_| LabelError::Encoding)?;
    parse_labels(text)
}
