//! Parametric per-dial response curves and the per-event coefficient cache.
//!
//! A [`SplineCurve`] maps one dial value onto a multiplicative weight factor
//! from a small coefficient block. Curves are stacked multiplicatively per
//! event; their blocks live side by side in a [`cache::CoefficientArena`].

pub mod cache;
pub mod io;
mod parser;

pub use cache::{CoefficientArena, CoefficientLayout};
pub use io::{read_coefficient_table, write_coefficient_table, CoefficientTableError};
pub use parser::{parse_form, parse_scan};

use crate::domain::{DialId, FitError};
use crate::numerics::interpolation::interval_index;
use crate::numerics::{fit_polynomial_least_squares, natural_cubic_coefficients, InterpolationError};

/// Offset applied to the stored threshold coefficient of `1Dpol5C_LX`.
const THRESHOLD_OFFSET: f64 = 4.0;
const THRESHOLD_POLYNOMIAL_DEGREE: usize = 5;
const CUBIC_BLOCK: usize = 4;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SplineError {
    #[error("unrecognized functional form '{tag}'")]
    UnknownForm { tag: String },
    #[error("malformed scan definition '{definition}': {reason}")]
    MalformedScan { definition: String, reason: String },
    #[error("form '{tag}' needs at least {required} scan points, got {actual}")]
    TooFewPoints {
        tag: String,
        required: usize,
        actual: usize,
    },
    #[error("form '{tag}' expects {expected} values, got {actual}")]
    CoefficientCount {
        tag: String,
        expected: usize,
        actual: usize,
    },
    #[error("coefficient fit failed: {0}")]
    Fit(#[from] InterpolationError),
}

impl From<SplineError> for FitError {
    fn from(error: SplineError) -> Self {
        match &error {
            SplineError::UnknownForm { .. } => {
                FitError::config("CONFIG.SPLINE_FORM", error.to_string())
            }
            SplineError::MalformedScan { .. } | SplineError::TooFewPoints { .. } => {
                FitError::config("CONFIG.SCAN_DEFINITION", error.to_string())
            }
            SplineError::CoefficientCount { .. } => {
                FitError::dimension_mismatch("SPLINE.COEFFICIENT_COUNT", error.to_string())
            }
            SplineError::Fit(_) => FitError::degeneracy("SPLINE.FIT", error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplineForm {
    /// `1 + sum_{i=1..degree} c_i x^i`
    Polynomial { degree: u8 },
    /// `sum_{i=0..degree} c_i x^i`
    PolynomialWithConstant { degree: u8 },
    /// Fifth-order polynomial with constant, zero at or below a threshold knot.
    ThresholdPolynomial,
    /// Natural cubic spline, one `[y, b, c, d]` block per knot.
    CubicSpline,
}

impl SplineForm {
    pub fn parameter_count(self, knots: usize) -> usize {
        match self {
            Self::Polynomial { degree } => usize::from(degree),
            Self::PolynomialWithConstant { degree } => usize::from(degree) + 1,
            Self::ThresholdPolynomial => 7,
            Self::CubicSpline => CUBIC_BLOCK * knots,
        }
    }

    /// Knots needed to determine the block. Fitted polynomials need one knot
    /// per free coefficient; the threshold form lowers its degree instead.
    pub fn minimum_points(self) -> usize {
        match self {
            Self::Polynomial { degree } => usize::from(degree),
            Self::PolynomialWithConstant { degree } => usize::from(degree) + 1,
            Self::ThresholdPolynomial => 1,
            Self::CubicSpline => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplineCurve {
    dial: DialId,
    form: SplineForm,
    tag: String,
    knots: Vec<f64>,
}

impl SplineCurve {
    pub fn configure(
        dial: DialId,
        form_tag: &str,
        scan_definition: &str,
    ) -> Result<Self, SplineError> {
        let form = parse_form(form_tag)?;
        let knots = parse_scan(scan_definition)?;
        Self::from_knots(dial, form_tag.trim(), form, knots)
    }

    pub fn from_knots(
        dial: DialId,
        tag: &str,
        form: SplineForm,
        knots: Vec<f64>,
    ) -> Result<Self, SplineError> {
        if knots.len() < form.minimum_points() {
            return Err(SplineError::TooFewPoints {
                tag: tag.to_string(),
                required: form.minimum_points(),
                actual: knots.len(),
            });
        }
        Ok(Self {
            dial,
            form,
            tag: tag.to_string(),
            knots,
        })
    }

    pub fn dial(&self) -> DialId {
        self.dial
    }

    pub fn form(&self) -> SplineForm {
        self.form
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    pub fn domain(&self) -> (f64, f64) {
        let first = self.knots.first().copied().unwrap_or(0.0);
        let last = self.knots.last().copied().unwrap_or(first);
        (first, last)
    }

    pub fn parameter_count(&self) -> usize {
        self.form.parameter_count(self.knots.len())
    }

    /// Weight factor at `dial_value`, clamped into the scanned domain.
    ///
    /// Returns 0 while the block is unfilled; negative or NaN responses are
    /// reported as 0.
    pub fn evaluate(&self, dial_value: f64, coefficients: &[f64]) -> f64 {
        if coefficients.len() < self.parameter_count() || coefficients.is_empty() {
            return 0.0;
        }
        let (low, high) = self.domain();
        let x = if dial_value.is_nan() {
            low
        } else {
            dial_value.clamp(low, high)
        };

        let weight = match self.form {
            SplineForm::Polynomial { degree } => {
                1.0 + horner(&coefficients[..usize::from(degree)], x) * x
            }
            SplineForm::PolynomialWithConstant { degree } => {
                horner(&coefficients[..=usize::from(degree)], x)
            }
            SplineForm::ThresholdPolynomial => {
                if x > coefficients[6] - THRESHOLD_OFFSET {
                    horner(&coefficients[..6], x)
                } else {
                    0.0
                }
            }
            SplineForm::CubicSpline => self.evaluate_cubic(x, coefficients),
        };

        if weight.is_nan() || weight < 0.0 {
            0.0
        } else {
            weight
        }
    }

    fn evaluate_cubic(&self, x: f64, coefficients: &[f64]) -> f64 {
        let knot = interval_index(&self.knots, x);
        let block = &coefficients[knot * CUBIC_BLOCK..(knot + 1) * CUBIC_BLOCK];
        let neighbour = if knot + 1 < self.knots.len() {
            knot + 1
        } else {
            knot.saturating_sub(1)
        };
        let neighbour_block =
            &coefficients[neighbour * CUBIC_BLOCK..(neighbour + 1) * CUBIC_BLOCK];
        if is_zero_block(block) && is_zero_block(neighbour_block) {
            return 0.0;
        }

        let dx = x - self.knots[knot];
        block[0] + dx * (block[1] + dx * (block[2] + dx * block[3]))
    }

    /// Builds this curve's coefficient block from native weight ratios taken
    /// at each knot.
    pub fn fit_coefficients(&self, ratios: &[f64]) -> Result<Vec<f64>, SplineError> {
        if ratios.len() != self.knots.len() {
            return Err(SplineError::CoefficientCount {
                tag: self.tag.clone(),
                expected: self.knots.len(),
                actual: ratios.len(),
            });
        }

        match self.form {
            SplineForm::Polynomial { degree } => {
                let powers: Vec<i32> = (1..=i32::from(degree)).collect();
                let shifted: Vec<f64> = ratios.iter().map(|ratio| ratio - 1.0).collect();
                Ok(fit_polynomial_least_squares(&self.knots, &shifted, &powers)?)
            }
            SplineForm::PolynomialWithConstant { degree } => {
                let powers: Vec<i32> = (0..=i32::from(degree)).collect();
                Ok(fit_polynomial_least_squares(&self.knots, ratios, &powers)?)
            }
            SplineForm::ThresholdPolynomial => self.fit_threshold(ratios),
            SplineForm::CubicSpline => {
                let blocks = natural_cubic_coefficients(&self.knots, ratios)?;
                let mut coefficients = Vec::with_capacity(self.parameter_count());
                for (knot, block) in blocks.iter().enumerate() {
                    let suppressed = ratios[knot] <= 0.0
                        && knot + 1 < ratios.len()
                        && ratios[knot + 1] <= 0.0;
                    if suppressed {
                        coefficients.extend_from_slice(&[0.0; CUBIC_BLOCK]);
                    } else {
                        coefficients.extend_from_slice(block);
                    }
                }
                Ok(coefficients)
            }
        }
    }

    fn fit_threshold(&self, ratios: &[f64]) -> Result<Vec<f64>, SplineError> {
        let leading_zeros = ratios.iter().take_while(|ratio| **ratio <= 0.0).count();
        let threshold = match leading_zeros {
            0 => self.domain().0 - 1.0,
            count => self.knots[count - 1],
        };

        let (knots, values): (Vec<f64>, Vec<f64>) = self
            .knots
            .iter()
            .zip(ratios)
            .filter(|(knot, _)| **knot > threshold)
            .map(|(knot, ratio)| (*knot, *ratio))
            .unzip();
        let block = THRESHOLD_POLYNOMIAL_DEGREE + 1;
        if knots.is_empty() {
            // nothing populated: zero everywhere inside the domain
            let mut coefficients = vec![0.0; block];
            coefficients.push(self.domain().1 + THRESHOLD_OFFSET);
            return Ok(coefficients);
        }

        let degree = THRESHOLD_POLYNOMIAL_DEGREE.min(knots.len() - 1);
        let powers: Vec<i32> = (0..=degree as i32).collect();
        let mut coefficients = fit_polynomial_least_squares(&knots, &values, &powers)?;
        coefficients.resize(block, 0.0);
        coefficients.push(threshold + THRESHOLD_OFFSET);
        Ok(coefficients)
    }

    /// Accepts an externally produced block after checking its length.
    pub fn store_coefficients(&self, coefficients: Vec<f64>) -> Result<Vec<f64>, SplineError> {
        if coefficients.len() != self.parameter_count() {
            return Err(SplineError::CoefficientCount {
                tag: self.tag.clone(),
                expected: self.parameter_count(),
                actual: coefficients.len(),
            });
        }
        Ok(coefficients)
    }
}

fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .rev()
        .fold(0.0, |accumulator, coefficient| accumulator * x + coefficient)
}

fn is_zero_block(block: &[f64]) -> bool {
    block.iter().all(|value| *value == 0.0)
}

#[cfg(test)]
mod tests {
    use super::{SplineCurve, SplineError, SplineForm};
    use crate::domain::{DialId, DialNamespace};

    const DIAL: DialId = DialId::new(DialNamespace::Neut, 1);

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1.0e-10 * expected.abs().max(1.0),
            "{actual} != {expected}"
        );
    }

    #[test]
    fn degree_one_polynomial_clamps_to_domain() {
        let curve = SplineCurve::configure(DIAL, "1Dpol1", "SCAN:6,0,5").expect("curve");
        assert_eq!(curve.domain(), (0.0, 5.0));
        assert_close(curve.evaluate(2.0, &[0.1]), 1.2);
        assert_close(curve.evaluate(10.0, &[0.1]), 1.5);
        assert_close(curve.evaluate(-3.0, &[0.1]), 1.0);
    }

    #[test]
    fn unfilled_block_contributes_zero() {
        let curve = SplineCurve::configure(DIAL, "1Dpol2", "PNTS:-1,0,1").expect("curve");
        assert_eq!(curve.evaluate(0.5, &[]), 0.0);
        assert_eq!(curve.evaluate(0.5, &[0.1]), 0.0);
    }

    #[test]
    fn constant_forms_include_the_intercept() {
        let curve = SplineCurve::configure(DIAL, "1Dpol2C", "PNTS:-1,0,1").expect("curve");
        assert_eq!(curve.parameter_count(), 3);
        assert_close(curve.evaluate(0.5, &[0.9, 0.2, 0.4]), 0.9 + 0.1 + 0.1);
        let tenth = SplineCurve::configure(DIAL, "1Dpol10", "SCAN:12,-1,1").expect("curve");
        assert_eq!(tenth.parameter_count(), 10);
    }

    #[test]
    fn negative_responses_clamp_to_zero() {
        let curve = SplineCurve::configure(DIAL, "1Dpol1", "PNTS:-2,2").expect("curve");
        assert_eq!(curve.evaluate(-2.0, &[1.0]), 0.0);
    }

    #[test]
    fn cubic_spline_requires_two_points() {
        let error = SplineCurve::configure(DIAL, "1DTSpline3", "PNTS:0").expect_err("one point");
        assert!(matches!(error, SplineError::TooFewPoints { required: 2, .. }));
    }

    #[test]
    fn cubic_spline_reproduces_scanned_ratios() {
        let curve = SplineCurve::configure(DIAL, "1DTSpline3", "SCAN:5,-2,2").expect("curve");
        let ratios = [0.6, 0.8, 1.0, 1.3, 1.5];
        let coefficients = curve.fit_coefficients(&ratios).expect("fit");
        assert_eq!(coefficients.len(), 20);
        for (knot, ratio) in curve.knots().iter().zip(ratios) {
            assert_close(curve.evaluate(*knot, &coefficients), ratio);
        }
        assert_close(curve.evaluate(7.0, &coefficients), 1.5);
    }

    #[test]
    fn cubic_spline_suppresses_empty_intervals() {
        let curve = SplineCurve::configure(DIAL, "1DTSpline3", "PNTS:0,1,2,3").expect("curve");
        let coefficients = curve.fit_coefficients(&[0.0, 0.0, 1.0, 1.2]).expect("fit");
        assert!(coefficients[..4].iter().all(|value| *value == 0.0));
        assert_eq!(curve.evaluate(0.5, &coefficients), 0.0);
        assert_close(curve.evaluate(2.0, &coefficients), 1.0);
    }

    #[test]
    fn polynomial_fit_recovers_linear_response() {
        let curve = SplineCurve::configure(DIAL, "1Dpol1", "SCAN:5,-1,1").expect("curve");
        let ratios: Vec<f64> = curve.knots().iter().map(|x| 1.0 + 0.25 * x).collect();
        let coefficients = curve.fit_coefficients(&ratios).expect("fit");
        assert_eq!(coefficients.len(), 1);
        assert_close(coefficients[0], 0.25);
    }

    #[test]
    fn threshold_polynomial_is_zero_below_first_populated_knot() {
        let curve = SplineCurve::configure(DIAL, "1Dpol5C_LX", "SCAN:9,0,2").expect("curve");
        assert_eq!(curve.form(), SplineForm::ThresholdPolynomial);
        let ratios: Vec<f64> = curve
            .knots()
            .iter()
            .map(|x| if *x < 0.5 { 0.0 } else { 0.5 + 0.1 * x })
            .collect();
        let coefficients = curve.fit_coefficients(&ratios).expect("fit");
        assert_eq!(coefficients.len(), 7);
        assert_close(coefficients[6], 0.25 + 4.0);
        assert_eq!(curve.evaluate(0.1, &coefficients), 0.0);
        let inside = curve.evaluate(1.0, &coefficients);
        assert!((inside - 0.6).abs() < 1.0e-6, "{inside}");
    }

    #[test]
    fn threshold_polynomial_lowers_its_degree_near_the_top_of_the_scan() {
        let curve = SplineCurve::configure(DIAL, "1Dpol5C_LX", "SCAN:9,0,2").expect("curve");
        // only 1.75 and 2.0 are populated
        let ratios: Vec<f64> = curve
            .knots()
            .iter()
            .map(|x| if *x < 1.6 { 0.0 } else { 0.2 + 0.5 * x })
            .collect();
        let coefficients = curve.fit_coefficients(&ratios).expect("fit");
        assert_eq!(coefficients.len(), 7);
        assert_close(coefficients[0], 0.2);
        assert_close(coefficients[1], 0.5);
        assert!(coefficients[2..6].iter().all(|value| *value == 0.0));
        assert_close(coefficients[6], 1.5 + 4.0);
        assert_eq!(curve.evaluate(1.0, &coefficients), 0.0);
        assert_close(curve.evaluate(1.9, &coefficients), 1.15);
    }

    #[test]
    fn threshold_polynomial_without_populated_knots_is_zero() {
        let curve = SplineCurve::configure(DIAL, "1Dpol5C_LX", "SCAN:9,0,2").expect("curve");
        let coefficients = curve.fit_coefficients(&[0.0; 9]).expect("fit");
        assert_eq!(coefficients.len(), 7);
        assert!(coefficients[..6].iter().all(|value| *value == 0.0));
        assert_close(coefficients[6], 2.0 + 4.0);
        for x in [0.0, 1.0, 2.0, 5.0] {
            assert_eq!(curve.evaluate(x, &coefficients), 0.0);
        }
    }

    #[test]
    fn fitted_polynomials_need_a_knot_per_coefficient() {
        let error = SplineCurve::configure(DIAL, "1Dpol6", "PNTS:0").expect_err("one knot");
        assert_eq!(
            error,
            SplineError::TooFewPoints {
                tag: "1Dpol6".to_string(),
                required: 6,
                actual: 1
            }
        );
        let error = SplineCurve::configure(DIAL, "1Dpol2C", "PNTS:-1,1").expect_err("two knots");
        assert!(matches!(error, SplineError::TooFewPoints { required: 3, .. }));
        assert_eq!(
            crate::domain::FitError::from(error).placeholder(),
            "CONFIG.SCAN_DEFINITION"
        );
        assert!(SplineCurve::configure(DIAL, "1Dpol5C_LX", "PNTS:1").is_ok());
    }

    #[test]
    fn stored_blocks_must_match_parameter_count() {
        let curve = SplineCurve::configure(DIAL, "1Dpol3", "PNTS:-1,0,1").expect("curve");
        assert!(curve.store_coefficients(vec![0.1, 0.2, 0.3]).is_ok());
        assert!(matches!(
            curve.store_coefficients(vec![0.1]),
            Err(SplineError::CoefficientCount {
                expected: 3,
                actual: 1,
                ..
            })
        ));
    }
}
