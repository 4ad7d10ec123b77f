pub mod interpolation;
pub mod linalg;

pub use interpolation::{
    fit_polynomial_least_squares, interpolate_linear, natural_cubic_coefficients,
    InterpolationError,
};
pub use linalg::{lu_factorize, lu_invert, lu_solve, symmetric_inverse, LuDecomposition, LuError};

use faer::Mat;

pub type DenseMatrix = Mat<f64>;

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;

    for &value in values {
        kahan_add(&mut sum, &mut correction, value);
    }

    sum
}

pub fn stable_weighted_sum(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.len() != weights.len() {
        return None;
    }

    let mut sum = 0.0;
    let mut correction = 0.0;
    for (&value, &weight) in values.iter().zip(weights) {
        kahan_add(&mut sum, &mut correction, value * weight);
    }

    Some(sum)
}

/// Quadratic form `r^T M r` accumulated row by row with compensated sums.
pub fn quadratic_form(matrix: &DenseMatrix, residuals: &[f64]) -> Option<f64> {
    let dimension = residuals.len();
    if matrix.nrows() != dimension || matrix.ncols() != dimension {
        return None;
    }

    let mut total = 0.0;
    let mut correction = 0.0;
    for row in 0..dimension {
        let mut row_sum = 0.0;
        let mut row_correction = 0.0;
        for col in 0..dimension {
            kahan_add(
                &mut row_sum,
                &mut row_correction,
                matrix[(row, col)] * residuals[col],
            );
        }
        kahan_add(&mut total, &mut correction, residuals[row] * row_sum);
    }

    Some(total)
}

pub fn linear_grid(start: f64, end: f64, count: usize) -> Option<Vec<f64>> {
    if count < 2 {
        return None;
    }

    let step = (end - start) / ((count - 1) as f64);
    let mut grid = Vec::with_capacity(count);
    for index in 0..count {
        grid.push(start + step * (index as f64));
    }

    if let Some(last) = grid.last_mut() {
        *last = end;
    }

    Some(grid)
}

pub fn dense_from_rows(rows: &[Vec<f64>]) -> Option<DenseMatrix> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if !rows.iter().all(|row| row.len() == ncols) {
        return None;
    }

    let mut matrix = DenseMatrix::zeros(nrows, ncols);
    for (row_index, row) in rows.iter().enumerate() {
        for (col_index, value) in row.iter().enumerate() {
            matrix[(row_index, col_index)] = *value;
        }
    }
    Some(matrix)
}

pub fn relative_difference(lhs: f64, rhs: f64, relative_floor: f64) -> f64 {
    let scale = lhs.abs().max(rhs.abs()).max(relative_floor);
    (lhs - rhs).abs() / scale
}

pub fn within_tolerance(
    lhs: f64,
    rhs: f64,
    abs_tol: f64,
    rel_tol: f64,
    relative_floor: f64,
) -> bool {
    let abs_diff = (lhs - rhs).abs();
    abs_diff <= abs_tol || relative_difference(lhs, rhs, relative_floor) <= rel_tol
}
