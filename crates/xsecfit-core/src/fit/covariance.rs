use crate::domain::FitError;
use crate::numerics::linalg::is_diagonal;
use crate::numerics::{quadratic_form, symmetric_inverse, DenseMatrix, LuError};

const SYMMETRY_RELATIVE_TOLERANCE: f64 = 1.0e-8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CovarianceError {
    #[error("covariance must be square and non-empty, got {rows}x{cols}")]
    Shape { rows: usize, cols: usize },
    #[error("expected {expected} per-bin errors, got {actual}")]
    ErrorCount { expected: usize, actual: usize },
    #[error("covariance entry ({row}, {col}) is not finite")]
    NonFinite { row: usize, col: usize },
    #[error("covariance is not symmetric at ({row}, {col})")]
    Asymmetric { row: usize, col: usize },
    #[error("covariance cannot be inverted: {0}")]
    Singular(#[from] LuError),
}

impl From<CovarianceError> for FitError {
    fn from(error: CovarianceError) -> Self {
        match &error {
            CovarianceError::Shape { .. } | CovarianceError::ErrorCount { .. } => {
                FitError::dimension_mismatch("COVARIANCE.SHAPE", error.to_string())
            }
            CovarianceError::NonFinite { .. } | CovarianceError::Asymmetric { .. } => {
                FitError::config("COVARIANCE.VALUES", error.to_string())
            }
            CovarianceError::Singular(_) => {
                FitError::degeneracy("COVARIANCE.SINGULAR", error.to_string())
            }
        }
    }
}

/// A covariance matrix together with its inverse, validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Covariance {
    matrix: DenseMatrix,
    inverse: DenseMatrix,
    diagonal: bool,
}

impl Covariance {
    pub fn from_matrix(matrix: DenseMatrix) -> Result<Self, CovarianceError> {
        let (rows, cols) = (matrix.nrows(), matrix.ncols());
        if rows == 0 || rows != cols {
            return Err(CovarianceError::Shape { rows, cols });
        }
        for row in 0..rows {
            for col in 0..cols {
                let value = matrix[(row, col)];
                if !value.is_finite() {
                    return Err(CovarianceError::NonFinite { row, col });
                }
                let mirrored = matrix[(col, row)];
                let scale = value.abs().max(mirrored.abs()).max(f64::MIN_POSITIVE);
                if (value - mirrored).abs() > SYMMETRY_RELATIVE_TOLERANCE * scale {
                    return Err(CovarianceError::Asymmetric { row, col });
                }
            }
        }

        let inverse = symmetric_inverse(&matrix)?;
        let diagonal = is_diagonal(&matrix);
        Ok(Self {
            matrix,
            inverse,
            diagonal,
        })
    }

    /// Diagonal covariance with variances `errors[i]^2`.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CovarianceError> {
        let mut matrix = DenseMatrix::zeros(errors.len(), errors.len());
        for (index, error) in errors.iter().enumerate() {
            matrix[(index, index)] = error * error;
        }
        Self::from_matrix(matrix)
    }

    /// `cov_ij = corr_ij * e_i * e_j`.
    pub fn from_correlation(
        correlation: &DenseMatrix,
        errors: &[f64],
    ) -> Result<Self, CovarianceError> {
        let (rows, cols) = (correlation.nrows(), correlation.ncols());
        if rows == 0 || rows != cols {
            return Err(CovarianceError::Shape { rows, cols });
        }
        if errors.len() != rows {
            return Err(CovarianceError::ErrorCount {
                expected: rows,
                actual: errors.len(),
            });
        }

        let mut matrix = DenseMatrix::zeros(rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                matrix[(row, col)] = correlation[(row, col)] * errors[row] * errors[col];
            }
        }
        Self::from_matrix(matrix)
    }

    /// Assembles one matrix with `blocks` on the diagonal and zeros elsewhere.
    pub fn block_diagonal(blocks: &[&Covariance]) -> Result<Self, CovarianceError> {
        let dimension: usize = blocks.iter().map(|block| block.dimension()).sum();
        let mut matrix = DenseMatrix::zeros(dimension, dimension);
        let mut offset = 0;
        for block in blocks {
            let size = block.dimension();
            for row in 0..size {
                for col in 0..size {
                    matrix[(offset + row, offset + col)] = block.matrix[(row, col)];
                }
            }
            offset += size;
        }
        Self::from_matrix(matrix)
    }

    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &DenseMatrix {
        &self.matrix
    }

    pub fn inverse(&self) -> &DenseMatrix {
        &self.inverse
    }

    pub fn is_diagonal(&self) -> bool {
        self.diagonal
    }

    pub fn variance(&self, index: usize) -> Option<f64> {
        (index < self.dimension()).then(|| self.matrix[(index, index)])
    }

    /// `r^T C^-1 r`; `None` when `residuals` has the wrong length.
    pub fn chi_square(&self, residuals: &[f64]) -> Option<f64> {
        quadratic_form(&self.inverse, residuals)
    }
}
