use super::covariance::Covariance;
use crate::domain::{DialId, FitError, FitResult};
use crate::weights::DialRegistry;

/// Gaussian prior on a group of dials: `(x - mu)^T C^-1 (x - mu)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterPull {
    name: String,
    dials: Vec<DialId>,
    central: Vec<f64>,
    covariance: Covariance,
}

impl ParameterPull {
    pub fn new(
        name: impl Into<String>,
        dials: Vec<DialId>,
        central: Vec<f64>,
        covariance: Covariance,
    ) -> FitResult<Self> {
        let name = name.into();
        if dials.is_empty() || dials.len() != central.len() || dials.len() != covariance.dimension()
        {
            return Err(FitError::dimension_mismatch(
                "PULL.DIMENSION",
                format!(
                    "pull '{name}' has {} dials, {} central values and a {}-dimensional covariance",
                    dials.len(),
                    central.len(),
                    covariance.dimension()
                ),
            ));
        }
        Ok(Self {
            name,
            dials,
            central,
            covariance,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dials(&self) -> &[DialId] {
        &self.dials
    }

    pub fn dimension(&self) -> usize {
        self.dials.len()
    }

    pub fn chi_square(&self, registry: &DialRegistry) -> FitResult<f64> {
        let mut residuals = Vec::with_capacity(self.dials.len());
        for (dial, central) in self.dials.iter().zip(&self.central) {
            residuals.push(registry.value(*dial)? - central);
        }
        self.covariance.chi_square(&residuals).ok_or_else(|| {
            FitError::internal(
                "PULL.DIMENSION",
                format!("pull '{}' residual length mismatch", self.name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ParameterPull;
    use crate::domain::{DialId, DialNamespace, FitErrorCategory};
    use crate::fit::covariance::Covariance;
    use crate::weights::{DialRegistry, DialSpec};

    #[test]
    fn pull_penalises_distance_from_prior() {
        let ma = DialId::new(DialNamespace::Neut, 1);
        let mut registry = DialRegistry::new();
        registry
            .register(DialSpec::new("MaCCQE", ma, 0.5))
            .expect("dial");
        let pull = ParameterPull::new(
            "ma_prior",
            vec![ma],
            vec![0.0],
            Covariance::from_errors(&[0.25]).expect("covariance"),
        )
        .expect("pull");
        assert!((pull.chi_square(&registry).expect("chi2") - 4.0).abs() < 1.0e-12);
    }

    #[test]
    fn unknown_dials_and_bad_shapes_are_rejected() {
        let missing = DialId::new(DialNamespace::Genie, 1);
        let pull = ParameterPull::new(
            "prior",
            vec![missing],
            vec![0.0],
            Covariance::from_errors(&[1.0]).expect("covariance"),
        )
        .expect("pull");
        let error = pull.chi_square(&DialRegistry::new()).expect_err("missing dial");
        assert_eq!(error.category(), FitErrorCategory::DialNotFoundError);

        let error = ParameterPull::new(
            "prior",
            vec![missing],
            vec![0.0, 1.0],
            Covariance::from_errors(&[1.0]).expect("covariance"),
        )
        .expect_err("shape");
        assert_eq!(error.category(), FitErrorCategory::DimensionMismatchError);
    }
}
