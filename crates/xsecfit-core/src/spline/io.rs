use super::cache::{CoefficientArena, CoefficientLayout};
use crate::domain::FitError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const COEFFICIENT_TABLE_FORMAT: &str = "xsecfit-coefficients/1";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoefficientTable {
    pub format: String,
    pub curves: Vec<CurveHeader>,
    pub rows: Vec<CoefficientRow>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CurveHeader {
    pub dial: u32,
    pub form: String,
    pub knots: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoefficientRow {
    pub event: usize,
    pub coefficients: Vec<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoefficientTableError {
    #[error("failed to read coefficient table '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write coefficient table '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse coefficient table '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("coefficient table '{}' does not match the active curves: {reason}", path.display())]
    HeaderMismatch { path: PathBuf, reason: String },
    #[error("coefficient table '{}' row for event {event} has {actual} values, expected {expected}", path.display())]
    RowLength {
        path: PathBuf,
        event: usize,
        expected: usize,
        actual: usize,
    },
}

impl From<CoefficientTableError> for FitError {
    fn from(error: CoefficientTableError) -> Self {
        match &error {
            CoefficientTableError::Read { .. } | CoefficientTableError::Write { .. } => {
                FitError::io_system("IO.SPLINE_CACHE", error.to_string())
            }
            CoefficientTableError::Parse { .. } => {
                FitError::io_system("IO.SPLINE_CACHE_FORMAT", error.to_string())
            }
            CoefficientTableError::HeaderMismatch { .. } => {
                FitError::config("CONFIG.SPLINE_CACHE_HEADER", error.to_string())
            }
            CoefficientTableError::RowLength { .. } => {
                FitError::dimension_mismatch("SPLINE.CACHE_ROW", error.to_string())
            }
        }
    }
}

pub fn table_header(layout: &CoefficientLayout) -> Vec<CurveHeader> {
    layout
        .curves()
        .iter()
        .map(|curve| CurveHeader {
            dial: curve.dial().as_enum(),
            form: curve.tag().to_string(),
            knots: curve.knots().to_vec(),
        })
        .collect()
}

pub fn write_coefficient_table(
    path: impl AsRef<Path>,
    layout: &CoefficientLayout,
    arena: &CoefficientArena,
) -> Result<usize, CoefficientTableError> {
    let path = path.as_ref();
    let table = CoefficientTable {
        format: COEFFICIENT_TABLE_FORMAT.to_string(),
        curves: table_header(layout),
        rows: arena
            .iter()
            .map(|(event, coefficients)| CoefficientRow {
                event,
                coefficients: coefficients.to_vec(),
            })
            .collect(),
    };

    let rendered =
        serde_json::to_string_pretty(&table).map_err(|source| CoefficientTableError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    fs::write(path, rendered).map_err(|source| CoefficientTableError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!(path = %path.display(), rows = table.rows.len(), "coefficient table written");
    Ok(table.rows.len())
}

pub fn read_coefficient_table(
    path: impl AsRef<Path>,
    layout: &CoefficientLayout,
) -> Result<CoefficientArena, CoefficientTableError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| CoefficientTableError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let table: CoefficientTable =
        serde_json::from_str(&content).map_err(|source| CoefficientTableError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mismatch = |reason: String| CoefficientTableError::HeaderMismatch {
        path: path.to_path_buf(),
        reason,
    };
    if table.format != COEFFICIENT_TABLE_FORMAT {
        return Err(mismatch(format!("unsupported format '{}'", table.format)));
    }
    let expected = table_header(layout);
    if table.curves.len() != expected.len() {
        return Err(mismatch(format!(
            "table has {} curves, layout has {}",
            table.curves.len(),
            expected.len()
        )));
    }
    if let Some(position) = table
        .curves
        .iter()
        .zip(&expected)
        .position(|(stored, active)| stored != active)
    {
        return Err(mismatch(format!(
            "curve {position} differs (dial {} '{}')",
            expected[position].dial, expected[position].form
        )));
    }

    let mut arena = CoefficientArena::new(layout);
    for row in &table.rows {
        if row.coefficients.len() != arena.stride() {
            return Err(CoefficientTableError::RowLength {
                path: path.to_path_buf(),
                event: row.event,
                expected: arena.stride(),
                actual: row.coefficients.len(),
            });
        }
        if let Err(error) = arena.insert(row.event, &row.coefficients) {
            return Err(mismatch(error.to_string()));
        }
    }

    tracing::info!(path = %path.display(), rows = arena.len(), "coefficient table loaded");
    Ok(arena)
}
