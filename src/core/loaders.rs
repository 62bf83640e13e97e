//! Point cloud readers.
//!
//! Uploaded clouds arrive as raw bytes. This module detects the encoding and
//! parses it into a fully materialized [`PointCloud`]:
//! - PCD files with `DATA ascii` or `DATA binary` payloads
//! - ASCII PLY files with x, y, z and optional intensity properties
//! - KITTI velodyne `.bin` scans (packed little-endian `f32` x, y, z, intensity)
//! - CSV files with an `x,y,z[,intensity]` header
//!
//! Every format that declares a point count is checked against it: truncated
//! or over-long payloads are errors, never partial reads.

use std::collections::HashMap;
use std::path::Path;

use csv::ReaderBuilder;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while reading a point cloud.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(String),

    #[error("Unrecognised point cloud format: {0}")]
    UnknownFormat(String),

    #[error("Invalid PCD header: {0}")]
    InvalidPcd(String),

    #[error("Invalid PLY file: {0}")]
    InvalidPly(String),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Record count mismatch: header declares {expected} points, found {found}")]
    CountMismatch { expected: usize, found: usize },

    #[error("Record length mismatch: {0}")]
    RecordLength(String),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Point cloud encodings understood by [`read_point_cloud`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFormat {
    Pcd,
    Ply,
    KittiBin,
    Csv,
}

/// A single LIDAR return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point3D {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f32>,
}

impl Point3D {
    /// Coordinates widened for projection math.
    #[inline]
    pub fn coords_f64(&self) -> [f64; 3] {
        [self.x as f64, self.y as f64, self.z as f64]
    }
}

/// Container for 3D point cloud data.
#[derive(Debug, Clone)]
pub struct PointCloud {
    /// X coordinates of all points.
    pub x: Vec<f32>,
    /// Y coordinates of all points.
    pub y: Vec<f32>,
    /// Z coordinates of all points.
    pub z: Vec<f32>,
    /// Optional per-point intensity / reflectance.
    pub intensity: Option<Vec<f32>>,
}

impl PointCloud {
    /// Creates a new empty point cloud.
    pub fn new() -> Self {
        Self {
            x: Vec::new(),
            y: Vec::new(),
            z: Vec::new(),
            intensity: None,
        }
    }

    /// Creates a new point cloud from coordinate vectors.
    pub fn from_xyz(x: Vec<f32>, y: Vec<f32>, z: Vec<f32>) -> Self {
        Self {
            x,
            y,
            z,
            intensity: None,
        }
    }

    /// Creates a point cloud from `[x, y, z]` triples.
    pub fn from_coords(coords: &[[f32; 3]]) -> Self {
        let mut cloud = Self::with_capacity(coords.len());
        for c in coords {
            cloud.push(c[0], c[1], c[2]);
        }
        cloud
    }

    /// Creates a new point cloud with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
            intensity: None,
        }
    }

    /// Returns the number of points in the cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Returns point `i`.
    #[inline]
    pub fn point(&self, i: usize) -> Point3D {
        Point3D {
            x: self.x[i],
            y: self.y[i],
            z: self.z[i],
            intensity: self.intensity.as_ref().map(|v| v[i]),
        }
    }

    /// Iterates over all points in order.
    pub fn points(&self) -> impl Iterator<Item = Point3D> + '_ {
        (0..self.len()).map(move |i| self.point(i))
    }

    /// Converts point cloud to a vector of [x, y, z] coordinate arrays.
    pub fn to_coords(&self) -> Vec<[f32; 3]> {
        (0..self.len())
            .map(|i| [self.x[i], self.y[i], self.z[i]])
            .collect()
    }

    /// Adds a point to the cloud.
    #[inline]
    pub fn push(&mut self, x: f32, y: f32, z: f32) {
        self.x.push(x);
        self.y.push(y);
        self.z.push(z);
    }

    /// Adds a point with intensity to the cloud.
    pub fn push_with_intensity(&mut self, x: f32, y: f32, z: f32, intensity: f32) {
        self.push(x, y, z);
        self.intensity
            .get_or_insert_with(|| Vec::with_capacity(self.x.capacity()))
            .push(intensity);
    }

    /// Copies the points at `indices`, in the given order.
    pub fn select(&self, indices: &[usize]) -> PointCloud {
        PointCloud {
            x: indices.iter().map(|&i| self.x[i]).collect(),
            y: indices.iter().map(|&i| self.y[i]).collect(),
            z: indices.iter().map(|&i| self.z[i]).collect(),
            intensity: self
                .intensity
                .as_ref()
                .map(|v| indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Drops points with NaN or infinite coordinates, returning how many were removed.
    pub fn retain_finite(&mut self) -> usize {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| self.x[i].is_finite() && self.y[i].is_finite() && self.z[i].is_finite())
            .collect();
        let dropped = self.len() - keep.len();
        if dropped > 0 {
            *self = self.select(&keep);
        }
        dropped
    }
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn extension_of(file_name: Option<&str>) -> Option<String> {
    file_name
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Detect the encoding of a point cloud buffer.
///
/// Magic bytes win over the file extension; the extension is only consulted
/// for headerless formats.
pub fn detect_format(bytes: &[u8], file_name: Option<&str>) -> Result<CloudFormat> {
    let name = file_name.unwrap_or("<upload>");
    if bytes.is_empty() {
        return Err(LoaderError::EmptyFile(name.to_string()));
    }

    let head = &bytes[..bytes.len().min(64)];
    if head.starts_with(b"ply") {
        return Ok(CloudFormat::Ply);
    }
    if head.starts_with(b"# .PCD") || head.starts_with(b"VERSION") || head.starts_with(b"FIELDS") {
        return Ok(CloudFormat::Pcd);
    }

    match extension_of(file_name).as_deref() {
        Some("pcd") => return Ok(CloudFormat::Pcd),
        Some("ply") => return Ok(CloudFormat::Ply),
        Some("bin") => return Ok(CloudFormat::KittiBin),
        Some("csv") | Some("txt") | Some("xyz") => return Ok(CloudFormat::Csv),
        _ => {}
    }

    let sniff = &bytes[..bytes.len().min(1024)];
    if let Ok(text) = std::str::from_utf8(sniff) {
        if text.lines().next().map_or(false, |l| l.contains(',')) {
            return Ok(CloudFormat::Csv);
        }
    }
    if bytes.len() % KITTI_RECORD_BYTES == 0 {
        return Ok(CloudFormat::KittiBin);
    }

    Err(LoaderError::UnknownFormat(name.to_string()))
}

/// Parse a point cloud from an in-memory buffer.
///
/// Non-finite points are dropped after parsing; the record count checks run
/// against the raw payload first.
pub fn read_point_cloud(bytes: &[u8], file_name: Option<&str>) -> Result<PointCloud> {
    let format = detect_format(bytes, file_name)?;
    let mut cloud = match format {
        CloudFormat::Pcd => parse_pcd(bytes)?,
        CloudFormat::Ply => parse_ply(bytes)?,
        CloudFormat::KittiBin => parse_kitti_bin(bytes)?,
        CloudFormat::Csv => parse_csv(bytes)?,
    };

    let dropped = cloud.retain_finite();
    if dropped > 0 {
        log::debug!(
            "{}: dropped {} non-finite points",
            file_name.unwrap_or("<upload>"),
            dropped
        );
    }
    log::debug!(
        "{}: read {} points as {:?}",
        file_name.unwrap_or("<upload>"),
        cloud.len(),
        format
    );
    Ok(cloud)
}

/// Load a point cloud from disk.
pub fn load_point_cloud<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let name = path.file_name().and_then(|n| n.to_str());
    read_point_cloud(&bytes, name)
}

const KITTI_RECORD_BYTES: usize = 16;

/// Parse a KITTI velodyne scan: packed `f32` quadruples, no header.
pub fn parse_kitti_bin(bytes: &[u8]) -> Result<PointCloud> {
    if bytes.len() % KITTI_RECORD_BYTES != 0 {
        return Err(LoaderError::RecordLength(format!(
            "{} bytes is not a multiple of the {}-byte KITTI record",
            bytes.len(),
            KITTI_RECORD_BYTES
        )));
    }

    let n = bytes.len() / KITTI_RECORD_BYTES;
    let mut cloud = PointCloud::with_capacity(n);
    for record in bytes.chunks_exact(KITTI_RECORD_BYTES) {
        let f = |k: usize| {
            f32::from_le_bytes([record[k], record[k + 1], record[k + 2], record[k + 3]])
        };
        cloud.push_with_intensity(f(0), f(4), f(8), f(12));
    }
    Ok(cloud)
}

/// Scalar type of one PCD field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcdType {
    Float,
    Signed,
    Unsigned,
}

#[derive(Debug, Clone)]
struct PcdField {
    name: String,
    size: usize,
    kind: PcdType,
    count: usize,
    /// Byte offset within a binary record
    offset: usize,
    /// Token index within an ASCII record
    column: usize,
}

impl PcdField {
    fn read_binary(&self, record: &[u8]) -> f64 {
        let b = &record[self.offset..self.offset + self.size];
        match (self.kind, self.size) {
            (PcdType::Float, 4) => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            (PcdType::Float, _) => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            (PcdType::Unsigned, 1) => b[0] as f64,
            (PcdType::Unsigned, 2) => u16::from_le_bytes([b[0], b[1]]) as f64,
            (PcdType::Unsigned, 4) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            (PcdType::Unsigned, _) => {
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
            (PcdType::Signed, 1) => b[0] as i8 as f64,
            (PcdType::Signed, 2) => i16::from_le_bytes([b[0], b[1]]) as f64,
            (PcdType::Signed, 4) => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            (PcdType::Signed, _) => {
                i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcdData {
    Ascii,
    Binary,
}

struct PcdHeader {
    fields: Vec<PcdField>,
    points: usize,
    data: PcdData,
    /// Byte offset of the first payload byte
    payload_start: usize,
}

impl PcdHeader {
    fn record_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.size * f.count).sum()
    }

    fn record_tokens(&self) -> usize {
        self.fields.iter().map(|f| f.count).sum()
    }

    fn field(&self, names: &[&str]) -> Option<&PcdField> {
        self.fields.iter().find(|f| names.contains(&f.name.as_str()))
    }
}

fn parse_usize_list(values: &[&str], key: &str) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|v| {
            v.parse::<usize>()
                .map_err(|_| LoaderError::InvalidPcd(format!("{} value '{}' is not an integer", key, v)))
        })
        .collect()
}

fn parse_pcd_header(bytes: &[u8]) -> Result<PcdHeader> {
    let mut names: Option<Vec<String>> = None;
    let mut sizes: Option<Vec<usize>> = None;
    let mut types: Option<Vec<PcdType>> = None;
    let mut counts: Option<Vec<usize>> = None;
    let mut width: Option<usize> = None;
    let mut height: Option<usize> = None;
    let mut points: Option<usize> = None;

    let mut pos = 0usize;
    loop {
        if pos >= bytes.len() {
            return Err(LoaderError::InvalidPcd("missing DATA line".to_string()));
        }
        let end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |i| pos + i);
        let line = std::str::from_utf8(&bytes[pos..end])
            .map_err(|_| LoaderError::InvalidPcd("header is not valid UTF-8".to_string()))?
            .trim();
        pos = (end + 1).min(bytes.len());

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default();
        let values: Vec<&str> = parts.collect();

        match key {
            "VERSION" | "VIEWPOINT" => {}
            "FIELDS" => names = Some(values.iter().map(|s| s.to_string()).collect()),
            "SIZE" => sizes = Some(parse_usize_list(&values, key)?),
            "COUNT" => counts = Some(parse_usize_list(&values, key)?),
            "TYPE" => {
                let parsed = values
                    .iter()
                    .map(|v| match *v {
                        "F" => Ok(PcdType::Float),
                        "I" => Ok(PcdType::Signed),
                        "U" => Ok(PcdType::Unsigned),
                        other => Err(LoaderError::InvalidPcd(format!("unknown TYPE '{}'", other))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                types = Some(parsed);
            }
            "WIDTH" => width = parse_usize_list(&values, key)?.first().copied(),
            "HEIGHT" => height = parse_usize_list(&values, key)?.first().copied(),
            "POINTS" => points = parse_usize_list(&values, key)?.first().copied(),
            "DATA" => {
                let data = match values.first().copied() {
                    Some("ascii") => PcdData::Ascii,
                    Some("binary") => PcdData::Binary,
                    Some(other) => {
                        return Err(LoaderError::InvalidPcd(format!(
                            "unsupported DATA encoding '{}'",
                            other
                        )))
                    }
                    None => return Err(LoaderError::InvalidPcd("DATA without encoding".to_string())),
                };
                return build_pcd_header(names, sizes, types, counts, width, height, points, data, pos);
            }
            other => {
                return Err(LoaderError::InvalidPcd(format!("unexpected header line '{}'", other)));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_pcd_header(
    names: Option<Vec<String>>,
    sizes: Option<Vec<usize>>,
    types: Option<Vec<PcdType>>,
    counts: Option<Vec<usize>>,
    width: Option<usize>,
    height: Option<usize>,
    points: Option<usize>,
    data: PcdData,
    payload_start: usize,
) -> Result<PcdHeader> {
    let names = names.ok_or_else(|| LoaderError::InvalidPcd("missing FIELDS".to_string()))?;
    let n = names.len();
    let sizes = match sizes {
        Some(s) => s,
        None if data == PcdData::Ascii => vec![4; n],
        None => return Err(LoaderError::InvalidPcd("missing SIZE".to_string())),
    };
    let types = match types {
        Some(t) => t,
        None if data == PcdData::Ascii => vec![PcdType::Float; n],
        None => return Err(LoaderError::InvalidPcd("missing TYPE".to_string())),
    };
    let counts = counts.unwrap_or_else(|| vec![1; n]);

    if sizes.len() != n || types.len() != n || counts.len() != n {
        return Err(LoaderError::InvalidPcd(format!(
            "FIELDS has {} entries but SIZE/TYPE/COUNT have {}/{}/{}",
            n,
            sizes.len(),
            types.len(),
            counts.len()
        )));
    }

    let mut fields = Vec::with_capacity(n);
    let mut offset = 0;
    let mut column = 0;
    for i in 0..n {
        let valid_size = match types[i] {
            PcdType::Float => matches!(sizes[i], 4 | 8),
            _ => matches!(sizes[i], 1 | 2 | 4 | 8),
        };
        if !valid_size || counts[i] == 0 {
            return Err(LoaderError::InvalidPcd(format!(
                "field '{}' has unsupported SIZE {} / COUNT {}",
                names[i], sizes[i], counts[i]
            )));
        }
        fields.push(PcdField {
            name: names[i].clone(),
            size: sizes[i],
            kind: types[i],
            count: counts[i],
            offset,
            column,
        });
        offset = sizes[i]
            .checked_mul(counts[i])
            .and_then(|bytes| offset.checked_add(bytes))
            .ok_or_else(|| LoaderError::InvalidPcd(format!("field '{}' COUNT {} overflows", names[i], counts[i])))?;
        column = column
            .checked_add(counts[i])
            .ok_or_else(|| LoaderError::InvalidPcd(format!("field '{}' COUNT {} overflows", names[i], counts[i])))?;
    }

    let area = |w: usize, h: usize| {
        w.checked_mul(h)
            .ok_or_else(|| LoaderError::InvalidPcd(format!("WIDTH {} * HEIGHT {} overflows", w, h)))
    };
    let points = match (points, width, height) {
        (Some(p), Some(w), Some(h)) => {
            let wh = area(w, h)?;
            if p != wh {
                return Err(LoaderError::InvalidPcd(format!(
                    "POINTS {} disagrees with WIDTH*HEIGHT {}",
                    p, wh
                )));
            }
            p
        }
        (Some(p), _, _) => p,
        (None, Some(w), Some(h)) => area(w, h)?,
        (None, Some(w), None) => w,
        _ => return Err(LoaderError::InvalidPcd("missing POINTS".to_string())),
    };

    Ok(PcdHeader {
        fields,
        points,
        data,
        payload_start,
    })
}

/// Parse a PCD (Point Cloud Data) file.
pub fn parse_pcd(bytes: &[u8]) -> Result<PointCloud> {
    let header = parse_pcd_header(bytes)?;

    let x = header
        .field(&["x"])
        .ok_or_else(|| LoaderError::MissingColumns("x".to_string()))?;
    let y = header
        .field(&["y"])
        .ok_or_else(|| LoaderError::MissingColumns("y".to_string()))?;
    let z = header
        .field(&["z"])
        .ok_or_else(|| LoaderError::MissingColumns("z".to_string()))?;
    let intensity = header.field(&["intensity", "i", "reflectance"]);

    let payload = &bytes[header.payload_start..];

    // Declared counts are untrusted: allocate only once the payload backs them
    let cloud = match header.data {
        PcdData::Binary => {
            let record = header.record_bytes();
            let needed = record.checked_mul(header.points).ok_or_else(|| {
                LoaderError::InvalidPcd(format!(
                    "POINTS {} of {} bytes each overflows",
                    header.points, record
                ))
            })?;
            if payload.len() < needed {
                return Err(LoaderError::CountMismatch {
                    expected: header.points,
                    found: payload.len() / record,
                });
            }
            if payload.len() > needed {
                return Err(LoaderError::RecordLength(format!(
                    "{} payload bytes for {} records of {} bytes",
                    payload.len(),
                    header.points,
                    record
                )));
            }
            let mut cloud = PointCloud::with_capacity(header.points);
            for rec in payload.chunks_exact(record) {
                let (px, py, pz) = (
                    x.read_binary(rec) as f32,
                    y.read_binary(rec) as f32,
                    z.read_binary(rec) as f32,
                );
                match intensity {
                    Some(f) => cloud.push_with_intensity(px, py, pz, f.read_binary(rec) as f32),
                    None => cloud.push(px, py, pz),
                }
            }
            cloud
        }
        PcdData::Ascii => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| LoaderError::ParseError("ASCII payload is not valid UTF-8".to_string()))?;
            let tokens_per_record = header.record_tokens();
            let mut cloud = PointCloud::with_capacity(header.points.min(text.lines().count()));
            let mut found = 0usize;

            for (line_no, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                found += 1;
                if found > header.points {
                    continue;
                }
                let values: Vec<&str> = line.split_whitespace().collect();
                if values.len() != tokens_per_record {
                    return Err(LoaderError::RecordLength(format!(
                        "data line {} has {} values, expected {}",
                        line_no + 1,
                        values.len(),
                        tokens_per_record
                    )));
                }
                let value = |f: &PcdField| -> Result<f32> {
                    values[f.column].parse::<f32>().map_err(|_| {
                        LoaderError::ParseError(format!(
                            "invalid {} value '{}' on data line {}",
                            f.name,
                            values[f.column],
                            line_no + 1
                        ))
                    })
                };
                let (px, py, pz) = (value(x)?, value(y)?, value(z)?);
                match intensity {
                    Some(f) => cloud.push_with_intensity(px, py, pz, value(f)?),
                    None => cloud.push(px, py, pz),
                }
            }

            if found != header.points {
                return Err(LoaderError::CountMismatch {
                    expected: header.points,
                    found,
                });
            }
            cloud
        }
    };

    Ok(cloud)
}

/// Parse an ASCII PLY file.
///
/// Supports PLY files with vertex elements containing:
/// - Required: x, y, z properties
/// - Optional: intensity property
///
/// Elements declared after `vertex` (faces, edges) are ignored.
pub fn parse_ply(bytes: &[u8]) -> Result<PointCloud> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| LoaderError::InvalidPly("only ASCII PLY is supported".to_string()))?;
    let mut lines = text.lines();

    // Check PLY magic number
    let first_line = lines
        .next()
        .ok_or_else(|| LoaderError::InvalidPly("Empty file".to_string()))?;
    if !first_line.trim().starts_with("ply") {
        return Err(LoaderError::InvalidPly("missing 'ply' magic".to_string()));
    }

    // Parse header
    let mut num_vertices: Option<usize> = None;
    let mut prop_names: Vec<String> = Vec::new();
    let mut in_vertex_element = false;
    let mut elements_after_vertex = false;
    let mut header_done = false;

    for line in &mut lines {
        let stripped = line.trim();

        if stripped.starts_with("format") {
            if !stripped.contains("ascii") {
                return Err(LoaderError::InvalidPly(format!(
                    "unsupported encoding '{}'",
                    stripped
                )));
            }
        } else if stripped.starts_with("element") {
            let parts: Vec<&str> = stripped.split_whitespace().collect();
            in_vertex_element = parts.get(1) == Some(&"vertex");
            if in_vertex_element {
                let count = parts
                    .get(2)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| LoaderError::InvalidPly("bad vertex count".to_string()))?;
                num_vertices = Some(count);
            } else if num_vertices.is_some() {
                elements_after_vertex = true;
            }
        } else if stripped.starts_with("property") {
            if in_vertex_element {
                if let Some(name) = stripped.split_whitespace().last() {
                    prop_names.push(name.to_string());
                }
            }
        } else if stripped == "end_header" {
            header_done = true;
            break;
        }
    }

    let num_vertices = num_vertices
        .ok_or_else(|| LoaderError::InvalidPly("No vertex count in header".to_string()))?;

    if !header_done {
        return Err(LoaderError::InvalidPly("Missing end_header".to_string()));
    }

    // Build property index map
    let prop_idx: HashMap<&str, usize> = prop_names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let x_idx = prop_idx
        .get("x")
        .copied()
        .ok_or_else(|| LoaderError::MissingColumns("x".to_string()))?;
    let y_idx = prop_idx
        .get("y")
        .copied()
        .ok_or_else(|| LoaderError::MissingColumns("y".to_string()))?;
    let z_idx = prop_idx
        .get("z")
        .copied()
        .ok_or_else(|| LoaderError::MissingColumns("z".to_string()))?;
    let i_idx = prop_idx
        .get("intensity")
        .or_else(|| prop_idx.get("scalar_intensity"))
        .copied();

    let mut cloud = PointCloud::with_capacity(num_vertices.min(lines.clone().count()));
    let mut vertex_count = 0;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        if vertex_count >= num_vertices {
            if elements_after_vertex {
                break;
            }
            return Err(LoaderError::CountMismatch {
                expected: num_vertices,
                found: vertex_count + 1,
            });
        }

        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() != prop_names.len() {
            return Err(LoaderError::RecordLength(format!(
                "vertex {} has {} values, expected {}",
                vertex_count,
                values.len(),
                prop_names.len()
            )));
        }

        let parse = |idx: usize, axis: &str| -> Result<f32> {
            values[idx]
                .parse()
                .map_err(|_| LoaderError::ParseError(format!("Invalid {} value: {}", axis, values[idx])))
        };

        let (x, y, z) = (parse(x_idx, "x")?, parse(y_idx, "y")?, parse(z_idx, "z")?);
        match i_idx {
            Some(idx) => cloud.push_with_intensity(x, y, z, parse(idx, "intensity")?),
            None => cloud.push(x, y, z),
        }
        vertex_count += 1;
    }

    if vertex_count < num_vertices {
        return Err(LoaderError::CountMismatch {
            expected: num_vertices,
            found: vertex_count,
        });
    }

    Ok(cloud)
}

/// Parse a Cartesian point cloud from CSV with x, y, z columns.
///
/// Column names are matched case-insensitively; `intensity` (or `i`) is
/// picked up when present.
pub fn parse_csv(bytes: &[u8]) -> Result<PointCloud> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let col_map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.to_lowercase(), i))
        .collect();

    let column = |name: &str| {
        col_map
            .get(name)
            .copied()
            .ok_or_else(|| LoaderError::MissingColumns(name.to_string()))
    };
    let x_idx = column("x")?;
    let y_idx = column("y")?;
    let z_idx = column("z")?;
    let i_idx = col_map.get("intensity").or_else(|| col_map.get("i")).copied();

    let mut cloud = PointCloud::new();

    for (row, result) in reader.records().enumerate() {
        let record = result?;
        let value = |idx: usize| -> Result<f32> {
            let raw = record.get(idx).unwrap_or_default();
            raw.parse().map_err(|_| {
                LoaderError::ParseError(format!("row {}: invalid number '{}'", row + 1, raw))
            })
        };

        let (x, y, z) = (value(x_idx)?, value(y_idx)?, value(z_idx)?);
        match i_idx {
            Some(idx) => cloud.push_with_intensity(x, y, z, value(idx)?),
            None => cloud.push(x, y, z),
        }
    }

    Ok(cloud)
}
