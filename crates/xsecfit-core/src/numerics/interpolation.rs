use super::linalg::{lu_solve, LuError};
use super::DenseMatrix;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpolationError {
    #[error("grid needs at least {required} points, got {actual}")]
    TooFewPoints { required: usize, actual: usize },
    #[error("grid has {grid} points but {values} values")]
    LengthMismatch { grid: usize, values: usize },
    #[error("grid must be strictly increasing (index {index})")]
    NonMonotonicGrid { index: usize },
    #[error("non-finite input {value} at index {index}")]
    NonFiniteInput { index: usize, value: f64 },
    #[error("least-squares system is degenerate: {0}")]
    Degenerate(#[from] LuError),
}

pub fn validate_grid(
    grid: &[f64],
    values: &[f64],
    required: usize,
) -> Result<(), InterpolationError> {
    if grid.len() != values.len() {
        return Err(InterpolationError::LengthMismatch {
            grid: grid.len(),
            values: values.len(),
        });
    }
    if grid.len() < required {
        return Err(InterpolationError::TooFewPoints {
            required,
            actual: grid.len(),
        });
    }
    for (index, &value) in grid.iter().chain(values).enumerate() {
        if !value.is_finite() {
            return Err(InterpolationError::NonFiniteInput {
                index: index % grid.len(),
                value,
            });
        }
    }
    if let Some(index) = grid.windows(2).position(|window| window[1] <= window[0]) {
        return Err(InterpolationError::NonMonotonicGrid { index: index + 1 });
    }
    Ok(())
}

/// Index of the knot opening the interval that contains `x`; the last knot
/// when `x` sits on or beyond the upper edge.
pub fn interval_index(grid: &[f64], x: f64) -> usize {
    let upper = grid.partition_point(|knot| *knot <= x);
    upper.saturating_sub(1).min(grid.len().saturating_sub(1))
}

/// Linear interpolation that returns the first/last value outside the grid.
pub fn interpolate_linear(x: f64, grid: &[f64], values: &[f64]) -> Result<f64, InterpolationError> {
    validate_grid(grid, values, 1)?;
    if !x.is_finite() {
        return Err(InterpolationError::NonFiniteInput { index: 0, value: x });
    }

    let last = grid.len() - 1;
    if x <= grid[0] {
        return Ok(values[0]);
    }
    if x >= grid[last] {
        return Ok(values[last]);
    }

    match grid.binary_search_by(|knot| knot.total_cmp(&x)) {
        Ok(index) => Ok(values[index]),
        Err(upper) => {
            let lower = upper - 1;
            let fraction = (x - grid[lower]) / (grid[upper] - grid[lower]);
            Ok(values[lower] + (values[upper] - values[lower]) * fraction)
        }
    }
}

/// Natural cubic spline through `(grid, values)`, one `[y, b, c, d]` block per
/// knot such that `y + dx*(b + dx*(c + dx*d))` reproduces the curve on the
/// interval opened by that knot.
pub fn natural_cubic_coefficients(
    grid: &[f64],
    values: &[f64],
) -> Result<Vec<[f64; 4]>, InterpolationError> {
    validate_grid(grid, values, 2)?;
    let count = grid.len();
    let widths: Vec<f64> = grid.windows(2).map(|window| window[1] - window[0]).collect();

    // Second derivatives with zero curvature at both ends (Thomas algorithm).
    let mut second = vec![0.0; count];
    if count > 2 {
        let interior = count - 2;
        let mut diagonal = vec![0.0; interior];
        let mut upper = vec![0.0; interior];
        let mut rhs = vec![0.0; interior];
        for row in 0..interior {
            let knot = row + 1;
            diagonal[row] = 2.0 * (widths[knot - 1] + widths[knot]);
            upper[row] = widths[knot];
            rhs[row] = 6.0
                * ((values[knot + 1] - values[knot]) / widths[knot]
                    - (values[knot] - values[knot - 1]) / widths[knot - 1]);
        }
        for row in 1..interior {
            let factor = widths[row] / diagonal[row - 1];
            diagonal[row] -= factor * upper[row - 1];
            rhs[row] -= factor * rhs[row - 1];
        }
        for row in (0..interior).rev() {
            let carry = if row + 1 < interior {
                upper[row] * second[row + 2]
            } else {
                0.0
            };
            second[row + 1] = (rhs[row] - carry) / diagonal[row];
        }
    }

    let mut blocks = Vec::with_capacity(count);
    for knot in 0..count - 1 {
        let width = widths[knot];
        let slope = (values[knot + 1] - values[knot]) / width
            - width * (2.0 * second[knot] + second[knot + 1]) / 6.0;
        blocks.push([
            values[knot],
            slope,
            second[knot] / 2.0,
            (second[knot + 1] - second[knot]) / (6.0 * width),
        ]);
    }

    let [_, b, c, d] = blocks[count - 2];
    let width = widths[count - 2];
    blocks.push([
        values[count - 1],
        b + width * (2.0 * c + 3.0 * d * width),
        second[count - 1] / 2.0,
        0.0,
    ]);
    Ok(blocks)
}

/// Least-squares coefficients `c_k` minimising `sum (y - sum_k c_k x^p_k)^2`
/// over the given monomial powers, solved through the normal equations.
pub fn fit_polynomial_least_squares(
    grid: &[f64],
    values: &[f64],
    powers: &[i32],
) -> Result<Vec<f64>, InterpolationError> {
    validate_grid(grid, values, powers.len().max(1))?;

    let dimension = powers.len();
    let mut normal = DenseMatrix::zeros(dimension, dimension);
    let mut rhs = vec![0.0; dimension];
    for (&x, &y) in grid.iter().zip(values) {
        let basis: Vec<f64> = powers.iter().map(|&power| x.powi(power)).collect();
        for row in 0..dimension {
            rhs[row] += basis[row] * y;
            for col in 0..dimension {
                normal[(row, col)] += basis[row] * basis[col];
            }
        }
    }

    Ok(lu_solve(&normal, &rhs)?)
}
