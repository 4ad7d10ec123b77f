use super::{SplineError, SplineForm};
use crate::numerics::linear_grid;

const MAX_CONSTANT_DEGREE: u8 = 24;
const MAX_UNIT_DEGREE: u8 = 6;
/// `1DPol1`..`1DPol6` name polynomials with a free constant term.
const MAX_CAPITAL_DEGREE: u8 = 6;

pub fn parse_form(tag: &str) -> Result<SplineForm, SplineError> {
    let trimmed = tag.trim();
    let unknown = || SplineError::UnknownForm {
        tag: trimmed.to_string(),
    };

    match trimmed {
        "1DTSpline3" => return Ok(SplineForm::CubicSpline),
        "1Dpol5C_LX" => return Ok(SplineForm::ThresholdPolynomial),
        "1Dpol10" => return Ok(SplineForm::PolynomialWithConstant { degree: 9 }),
        "1Dpol25" => return Ok(SplineForm::PolynomialWithConstant { degree: 24 }),
        _ => {}
    }

    if let Some(digits) = trimmed.strip_prefix("1DPol") {
        return match parse_degree(digits) {
            Some(degree) if (1..=MAX_CAPITAL_DEGREE).contains(&degree) => {
                Ok(SplineForm::PolynomialWithConstant { degree })
            }
            _ => Err(unknown()),
        };
    }

    let body = trimmed.strip_prefix("1Dpol").ok_or_else(unknown)?;
    if let Some(digits) = body.strip_suffix('C') {
        let degree = parse_degree(digits).ok_or_else(unknown)?;
        if (1..=MAX_CONSTANT_DEGREE).contains(&degree) {
            return Ok(SplineForm::PolynomialWithConstant { degree });
        }
        return Err(unknown());
    }

    let degree = parse_degree(body).ok_or_else(unknown)?;
    if (1..=MAX_UNIT_DEGREE).contains(&degree) {
        return Ok(SplineForm::Polynomial { degree });
    }
    Err(unknown())
}

fn parse_degree(digits: &str) -> Option<u8> {
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Expands `PNTS:a,b,c` or `SCAN:n,lo,hi` into strictly increasing knots.
pub fn parse_scan(definition: &str) -> Result<Vec<f64>, SplineError> {
    let trimmed = definition.trim();
    let malformed = |reason: &str| SplineError::MalformedScan {
        definition: trimmed.to_string(),
        reason: reason.to_string(),
    };

    let (kind, body) = trimmed
        .split_once(':')
        .ok_or_else(|| malformed("expected 'PNTS:' or 'SCAN:' prefix"))?;
    let fields = body
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect::<Vec<_>>();

    let knots = match kind.trim().to_ascii_uppercase().as_str() {
        "PNTS" => fields
            .iter()
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|_| malformed(&format!("'{field}' is not a number")))
            })
            .collect::<Result<Vec<_>, _>>()?,
        "SCAN" => {
            let [count, low, high] = fields.as_slice() else {
                return Err(malformed("SCAN takes exactly three fields: n,lo,hi"));
            };
            let count = count
                .parse::<usize>()
                .map_err(|_| malformed(&format!("'{count}' is not a point count")))?;
            let low = low
                .parse::<f64>()
                .map_err(|_| malformed(&format!("'{low}' is not a number")))?;
            let high = high
                .parse::<f64>()
                .map_err(|_| malformed(&format!("'{high}' is not a number")))?;
            if count == 1 {
                vec![low]
            } else {
                linear_grid(low, high, count).ok_or_else(|| malformed("SCAN needs n >= 1"))?
            }
        }
        other => return Err(malformed(&format!("unknown scan kind '{other}'"))),
    };

    if knots.is_empty() {
        return Err(malformed("no scan points"));
    }
    if knots.iter().any(|knot| !knot.is_finite()) {
        return Err(malformed("scan points must be finite"));
    }
    if knots.windows(2).any(|window| window[1] <= window[0]) {
        return Err(malformed("scan points must be strictly increasing"));
    }
    Ok(knots)
}

#[cfg(test)]
mod tests {
    use super::{parse_form, parse_scan};
    use crate::spline::{SplineError, SplineForm};

    #[test]
    fn parses_every_polynomial_family() {
        assert_eq!(parse_form("1Dpol1"), Ok(SplineForm::Polynomial { degree: 1 }));
        assert_eq!(parse_form("1Dpol6"), Ok(SplineForm::Polynomial { degree: 6 }));
        assert_eq!(
            parse_form("1Dpol3C"),
            Ok(SplineForm::PolynomialWithConstant { degree: 3 })
        );
        assert_eq!(
            parse_form("1Dpol10"),
            Ok(SplineForm::PolynomialWithConstant { degree: 9 })
        );
        assert_eq!(
            parse_form("1Dpol25"),
            Ok(SplineForm::PolynomialWithConstant { degree: 24 })
        );
        assert_eq!(parse_form("1Dpol5C_LX"), Ok(SplineForm::ThresholdPolynomial));
        assert_eq!(parse_form(" 1DTSpline3 "), Ok(SplineForm::CubicSpline));
    }

    #[test]
    fn capitalized_tags_carry_a_constant_term() {
        assert_eq!(
            parse_form("1DPol1"),
            Ok(SplineForm::PolynomialWithConstant { degree: 1 })
        );
        assert_eq!(
            parse_form("1DPol6"),
            Ok(SplineForm::PolynomialWithConstant { degree: 6 })
        );
        assert_eq!(SplineForm::PolynomialWithConstant { degree: 3 }.parameter_count(4), 4);
        for tag in ["1DPol0", "1DPol7", "1DPol", "1DPol3C"] {
            assert!(
                matches!(parse_form(tag), Err(SplineError::UnknownForm { .. })),
                "{tag} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_unknown_or_out_of_range_tags() {
        for tag in ["1Dpol7", "1Dpol0", "1Dpol25C", "2Dpol6", "pol1", "1DpolC", "1Dpol-1"] {
            assert!(
                matches!(parse_form(tag), Err(SplineError::UnknownForm { .. })),
                "{tag} should be rejected"
            );
        }
    }

    #[test]
    fn expands_uniform_scans_inclusively() {
        let knots = parse_scan("SCAN:5,-1,1").expect("scan");
        assert_eq!(knots, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(parse_scan("SCAN:1,2.5,9").expect("single"), vec![2.5]);
    }

    #[test]
    fn reads_explicit_point_lists() {
        let knots = parse_scan("PNTS:-2, -1,0,1.5").expect("points");
        assert_eq!(knots, vec![-2.0, -1.0, 0.0, 1.5]);
    }

    #[test]
    fn rejects_malformed_scans() {
        for definition in [
            "0,1,2",
            "GRID:1,2",
            "PNTS:",
            "PNTS:1,a",
            "PNTS:1,1",
            "PNTS:2,1",
            "SCAN:3,0",
            "SCAN:0,0,1",
            "SCAN:x,0,1",
        ] {
            assert!(
                matches!(parse_scan(definition), Err(SplineError::MalformedScan { .. })),
                "{definition} should be rejected"
            );
        }
    }
}
