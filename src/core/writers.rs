//! Result writers for the CLI.
//!
//! - CSV with labeled coordinates for clustering results
//! - Pretty-printed JSON for pipeline responses

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// JSON serialization error.
    #[error("JSON write error for '{path}': {source}")]
    JsonError {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Mismatched array lengths.
    #[error("array length mismatch: coords has {coords_len} elements, labels has {labels_len} elements")]
    LengthMismatch { coords_len: usize, labels_len: usize },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    ensure_parent_dirs(path)?;
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Write labeled coordinates to CSV.
///
/// Creates a CSV file with headers "x,y,z,label" containing coordinate data
/// with associated cluster labels (`-1` for noise).
///
/// # Errors
///
/// Returns an error if:
/// - `coords` and `labels` have different lengths
/// - Parent directories cannot be created
/// - File cannot be created or written to
pub fn write_labels_csv(path: &Path, coords: &[[f32; 3]], labels: &[i32]) -> Result<()> {
    if coords.len() != labels.len() {
        return Err(WriteError::LengthMismatch {
            coords_len: coords.len(),
            labels_len: labels.len(),
        });
    }

    let mut csv_writer = csv::Writer::from_writer(create_buffered_writer(path)?);
    let path_str = path.display().to_string();

    csv_writer
        .write_record(["x", "y", "z", "label"])
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for (coord, label) in coords.iter().zip(labels.iter()) {
        csv_writer
            .write_record(&[
                format!("{:.6}", coord[0]),
                format!("{:.6}", coord[1]),
                format!("{:.6}", coord[2]),
                label.to_string(),
            ])
            .map_err(|e| WriteError::CsvError {
                path: path_str.clone(),
                source: e,
            })?;
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// Write any serializable value as pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();

    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| WriteError::JsonError {
        path: path_str.clone(),
        source: e,
    })?;
    writeln!(writer)
        .and_then(|_| writer.flush())
        .map_err(|e| WriteError::WriteFile {
            path: path_str,
            source: e,
        })?;

    Ok(())
}

/// Write raw bytes (e.g. an encoded PNG).
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dirs(path)?;
    fs::write(path, bytes).map_err(|e| WriteError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}
