//! Parsing of the external engine's fixed-format text reports.

use std::fs;
use std::path::{Path, PathBuf};

use crate::schema::ReportField;

/// Report parsing errors.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Failed to read report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Marker {marker:?} (occurrence {occurrence}) not found in report")]
    MissingMarker { marker: String, occurrence: usize },
    #[error("Line for {marker:?} has no token {token}")]
    MissingToken { marker: String, token: usize },
    #[error("Token {value:?} for {marker:?} is not a number")]
    InvalidNumber { marker: String, value: String },
    #[error("Expected exactly one report in {dir}, found {found}")]
    ReportCount { dir: PathBuf, found: usize },
}

/// Extract one field from report text.
///
/// Trailing characters that cannot belong to a number (e.g. `]` or `,`)
/// are stripped before parsing.
pub fn extract_field(text: &str, field: &ReportField) -> Result<f64, ReportError> {
    let line = text
        .lines()
        .filter(|l| l.contains(&field.marker))
        .nth(field.occurrence)
        .ok_or_else(|| ReportError::MissingMarker {
            marker: field.marker.clone(),
            occurrence: field.occurrence,
        })?;

    let token = line
        .split_whitespace()
        .nth(field.token)
        .ok_or_else(|| ReportError::MissingToken {
            marker: field.marker.clone(),
            token: field.token,
        })?;

    let trimmed = token.trim_end_matches(|c: char| !(c.is_ascii_digit() || c == '.'));
    trimmed
        .parse::<f64>()
        .map_err(|_| ReportError::InvalidNumber {
            marker: field.marker.clone(),
            value: token.to_string(),
        })
}

/// Locate the single `*.data` report below `dir/Output/System_0`.
pub fn find_report(dir: &Path) -> Result<PathBuf, ReportError> {
    let system_dir = dir.join("Output").join("System_0");
    let entries = fs::read_dir(&system_dir).map_err(|source| ReportError::Io {
        path: system_dir.clone(),
        source,
    })?;

    let mut reports = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ReportError::Io {
            path: system_dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "data") {
            reports.push(path);
        }
    }

    if reports.len() != 1 {
        return Err(ReportError::ReportCount {
            dir: system_dir,
            found: reports.len(),
        });
    }
    Ok(reports.remove(0))
}

/// Read a report file and extract several fields from it.
pub fn parse_report(path: &Path, fields: &[&ReportField]) -> Result<Vec<f64>, ReportError> {
    let text = fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    fields.iter().map(|f| extract_field(&text, f)).collect()
}
