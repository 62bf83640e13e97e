//! Camera/LIDAR calibration loading.
//!
//! Calibration files are `key: v0 v1 ...` lines. KITTI files (`P0`..`P3`,
//! `R0_rect`, `Tr_velo_to_cam`) and the explicit `K`/`R`/`T`/`D` form written
//! by [`CalibrationTransform::to_calib_text`] are both accepted. Either way
//! the result is reduced to one pinhole intrinsic plus one rigid
//! sensor-to-camera transform.

use std::collections::HashMap;
use std::sync::OnceLock;

use nalgebra::{Matrix3, Vector3};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Largest Frobenius deviation of `RᵀR` from identity accepted before the
/// rotation is rejected instead of re-orthonormalized.
const ORTHONORMAL_TOLERANCE: f64 = 1e-2;

/// Errors produced while loading a calibration file.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration file is not valid UTF-8")]
    Encoding,

    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("missing required matrix: {0}")]
    MissingMatrix(String),

    #[error("{key}: expected {expected} values, found {found}")]
    Dimension {
        key: String,
        expected: String,
        found: usize,
    },

    #[error("{key}: contains non-finite values")]
    NonFinite { key: String },

    #[error("intrinsic matrix is singular (fx={fx}, fy={fy})")]
    DegenerateIntrinsic { fx: f64, fy: f64 },

    #[error("extrinsic rotation is not a proper rotation: {0}")]
    InvalidRotation(String),
}

/// Whether a calibration failure is grammatical or numerical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationErrorKind {
    Parse,
    Value,
}

impl CalibrationError {
    pub fn kind(&self) -> CalibrationErrorKind {
        match self {
            Self::Encoding | Self::Syntax { .. } | Self::MissingMatrix(_) | Self::Dimension { .. } => {
                CalibrationErrorKind::Parse
            }
            Self::NonFinite { .. } | Self::DegenerateIntrinsic { .. } | Self::InvalidRotation(_) => {
                CalibrationErrorKind::Value
            }
        }
    }
}

/// Result type for calibration operations.
pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Brown–Conrady lens distortion coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    /// Build from `k1 k2 p1 p2 [k3]`.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [k1, k2, p1, p2] => Some(Self {
                k1: *k1,
                k2: *k2,
                p1: *p1,
                p2: *p2,
                k3: 0.0,
            }),
            [k1, k2, p1, p2, k3] => Some(Self {
                k1: *k1,
                k2: *k2,
                p1: *p1,
                p2: *p2,
                k3: *k3,
            }),
            _ => None,
        }
    }

    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients().iter().all(|c| *c == 0.0)
    }

    /// Distort normalized image coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }
}

/// Validated projection from the sensor frame into camera pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTransform {
    /// Pinhole intrinsic `K`.
    pub intrinsic: Matrix3<f64>,
    /// Sensor-to-camera rotation, orthonormal with determinant +1.
    pub rotation: Matrix3<f64>,
    /// Sensor-to-camera translation.
    pub translation: Vector3<f64>,
    pub distortion: Option<Distortion>,
}

impl CalibrationTransform {
    /// Intrinsic-only calibration: the sensor frame is the camera frame.
    pub fn from_intrinsic(intrinsic: Matrix3<f64>) -> Result<Self> {
        let calib = Self {
            intrinsic,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            distortion: None,
        };
        calib.check_intrinsic()?;
        Ok(calib)
    }

    /// Pinhole camera with focal lengths and principal point.
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self> {
        Self::from_intrinsic(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
    }

    pub fn with_extrinsic(mut self, rotation: Matrix3<f64>, translation: Vector3<f64>) -> Result<Self> {
        self.rotation = orthonormalize(rotation)?;
        self.translation = translation;
        Ok(self)
    }

    pub fn fx(&self) -> f64 {
        self.intrinsic[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.intrinsic[(1, 1)]
    }

    /// Transform a sensor-frame point into the camera frame.
    #[inline]
    pub fn to_camera(&self, p: [f64; 3]) -> Vector3<f64> {
        self.rotation * Vector3::new(p[0], p[1], p[2]) + self.translation
    }

    fn check_intrinsic(&self) -> Result<()> {
        if self.intrinsic.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFinite {
                key: "intrinsic".to_string(),
            });
        }
        let (fx, fy) = (self.fx(), self.fy());
        if fx == 0.0 || fy == 0.0 || self.intrinsic[(2, 2)] == 0.0 {
            return Err(CalibrationError::DegenerateIntrinsic { fx, fy });
        }
        Ok(())
    }

    /// Serialize in the `K`/`R`/`T`/`D` grammar accepted by [`parse_calibration`].
    pub fn to_calib_text(&self) -> String {
        fn row_major(m: &Matrix3<f64>) -> String {
            (0..3)
                .flat_map(|r| (0..3).map(move |c| m[(r, c)]))
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }

        let mut out = String::new();
        out.push_str(&format!("K: {}\n", row_major(&self.intrinsic)));
        out.push_str(&format!("R: {}\n", row_major(&self.rotation)));
        out.push_str(&format!(
            "T: {} {} {}\n",
            self.translation.x, self.translation.y, self.translation.z
        ));
        // All-zero coefficients parse back as no distortion
        if let Some(d) = self.distortion.as_ref().filter(|d| !d.is_zero()) {
            let coeffs: Vec<String> = d.coefficients().iter().map(|v| v.to_string()).collect();
            out.push_str(&format!("D: {}\n", coeffs.join(" ")));
        }
        out
    }
}

/// Snap a near-orthonormal matrix to the closest rotation.
fn orthonormalize(r: Matrix3<f64>) -> Result<Matrix3<f64>> {
    if r.iter().any(|v| !v.is_finite()) {
        return Err(CalibrationError::NonFinite {
            key: "rotation".to_string(),
        });
    }
    let det = r.determinant();
    if det <= 0.0 {
        return Err(CalibrationError::InvalidRotation(format!("determinant {:.6}", det)));
    }
    let deviation = (r.transpose() * r - Matrix3::identity()).norm();
    if deviation > ORTHONORMAL_TOLERANCE {
        return Err(CalibrationError::InvalidRotation(format!(
            "|RᵀR - I| = {:.6}",
            deviation
        )));
    }
    if deviation < 1e-12 {
        return Ok(r);
    }

    let svd = r.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            log::debug!("re-orthonormalized extrinsic rotation (deviation {:.3e})", deviation);
            Ok(u * v_t)
        }
        _ => Err(CalibrationError::InvalidRotation("SVD did not converge".to_string())),
    }
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)\s*:\s*(.*)$").expect("calibration line pattern is valid")
    })
}

const KNOWN_KEYS: &[&str] = &[
    "P0", "P1", "P2", "P3", "K", "R", "T", "D", "R0_rect", "Tr_velo_to_cam",
];

/// Tokenize the file into numeric entries for the keys we understand.
fn parse_entries(text: &str, camera_key: &str) -> Result<HashMap<String, Vec<f64>>> {
    let mut entries = HashMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let caps = line_pattern().captures(line).ok_or_else(|| CalibrationError::Syntax {
            line: idx + 1,
            reason: "expected 'key: values'".to_string(),
        })?;
        let key = &caps[1];
        if !KNOWN_KEYS.contains(&key) && key != camera_key {
            continue;
        }

        let values = caps[2]
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|_| CalibrationError::Syntax {
                    line: idx + 1,
                    reason: format!("{}: '{}' is not a number", key, tok),
                })
            })
            .collect::<Result<Vec<f64>>>()?;

        if values.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFinite { key: key.to_string() });
        }
        entries.insert(key.to_string(), values);
    }

    Ok(entries)
}

fn take_exact<'a>(
    entries: &'a HashMap<String, Vec<f64>>,
    key: &str,
    expected: usize,
) -> Result<Option<&'a [f64]>> {
    match entries.get(key) {
        None => Ok(None),
        Some(v) if v.len() == expected => Ok(Some(v.as_slice())),
        Some(v) => Err(CalibrationError::Dimension {
            key: key.to_string(),
            expected: expected.to_string(),
            found: v.len(),
        }),
    }
}

/// Split a row-major 3×4 matrix into its 3×3 block and last column.
fn split_3x4(v: &[f64]) -> (Matrix3<f64>, Vector3<f64>) {
    let m = Matrix3::new(v[0], v[1], v[2], v[4], v[5], v[6], v[8], v[9], v[10]);
    (m, Vector3::new(v[3], v[7], v[11]))
}

/// Parse calibration text into a validated transform.
///
/// `camera_key` names the KITTI projection matrix (e.g. `P2`) used when the
/// file carries no explicit `K`.
pub fn parse_calibration(text: &str, camera_key: &str) -> Result<CalibrationTransform> {
    let entries = parse_entries(text, camera_key)?;

    // Intrinsic, plus the camera offset folded into a KITTI projection matrix.
    let (intrinsic, camera_offset) = if let Some(k) = take_exact(&entries, "K", 9)? {
        (Matrix3::from_row_slice(k), Vector3::zeros())
    } else if let Some(p) = take_exact(&entries, camera_key, 12)? {
        let (k, p4) = split_3x4(p);
        let checked = CalibrationTransform::from_intrinsic(k)?;
        let k_inv = checked.intrinsic.try_inverse().ok_or(CalibrationError::DegenerateIntrinsic {
            fx: checked.fx(),
            fy: checked.fy(),
        })?;
        (k, k_inv * p4)
    } else {
        return Err(CalibrationError::MissingMatrix(format!("K or {}", camera_key)));
    };

    let mut calib = CalibrationTransform::from_intrinsic(intrinsic)?;

    let r = take_exact(&entries, "R", 9)?;
    let t = take_exact(&entries, "T", 3)?;
    let (rotation, translation) = match (r, t) {
        (Some(r), Some(t)) => (Matrix3::from_row_slice(r), Vector3::from_row_slice(t)),
        (Some(_), None) => return Err(CalibrationError::MissingMatrix("T".to_string())),
        (None, Some(_)) => return Err(CalibrationError::MissingMatrix("R".to_string())),
        (None, None) => match take_exact(&entries, "Tr_velo_to_cam", 12)? {
            Some(tr) => split_3x4(tr),
            None => {
                log::warn!("calibration has no extrinsic; treating points as camera-frame");
                (Matrix3::identity(), Vector3::zeros())
            }
        },
    };

    let (rotation, translation) = match take_exact(&entries, "R0_rect", 9)? {
        Some(r0) => {
            let r0 = Matrix3::from_row_slice(r0);
            (r0 * rotation, r0 * translation)
        }
        None => (rotation, translation),
    };

    calib = calib.with_extrinsic(rotation, translation + camera_offset)?;

    if let Some(d) = entries.get("D") {
        let distortion = Distortion::from_slice(d).ok_or_else(|| CalibrationError::Dimension {
            key: "D".to_string(),
            expected: "4 or 5".to_string(),
            found: d.len(),
        })?;
        if !distortion.is_zero() {
            calib.distortion = Some(distortion);
        }
    }

    Ok(calib)
}

/// Parse an uploaded calibration buffer.
pub fn read_calibration(bytes: &[u8], camera_key: &str) -> Result<CalibrationTransform> {
    let text = std::str::from_utf8(bytes).map_err(|_| CalibrationError::Encoding)?;
    parse_calibration(text, camera_key)
}
