use super::covariance::Covariance;
use super::pulls::ParameterPull;
use super::sample::Sample;
use crate::domain::{EvalResult, EvaluationError, FitError, FitResult};
use crate::numerics::{stable_sum, DenseMatrix};
use crate::weights::DialRegistry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;

/// Breakdown entry holding the off-diagonal-block part of a joint statistic.
pub const CROSS_SAMPLE_ENTRY: &str = "cross_sample";

#[derive(Debug, Clone, PartialEq)]
pub enum JointCovariance {
    /// Each sample's own covariance on the diagonal, no cross terms.
    BlockDiagonal,
    /// A full matrix spanning every sample's bins in registration order.
    Explicit(DenseMatrix),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationMode {
    Independent,
    Joint(JointCovariance),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownEntry {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct StatisticBreakdown {
    pub total: f64,
    pub entries: Vec<BreakdownEntry>,
}

impl StatisticBreakdown {
    fn push(&mut self, name: impl Into<String>, value: f64) {
        self.entries.push(BreakdownEntry {
            name: name.into(),
            value,
        });
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value)
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.value))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct JointLayout {
    covariance: Covariance,
    blocks: Vec<Range<usize>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChiSquareAggregator {
    mode: AggregationMode,
    joint: Option<JointLayout>,
}

impl Default for ChiSquareAggregator {
    fn default() -> Self {
        Self::independent()
    }
}

impl ChiSquareAggregator {
    pub fn independent() -> Self {
        Self {
            mode: AggregationMode::Independent,
            joint: None,
        }
    }

    pub fn new(mode: AggregationMode) -> Self {
        Self { mode, joint: None }
    }

    pub fn mode(&self) -> &AggregationMode {
        &self.mode
    }

    /// Builds the global covariance for joint mode from the current samples.
    pub fn assemble(&mut self, samples: &[Box<dyn Sample>]) -> FitResult<()> {
        let AggregationMode::Joint(joint) = &self.mode else {
            self.joint = None;
            return Ok(());
        };
        if samples.is_empty() {
            self.joint = None;
            return Ok(());
        }

        let mut blocks = Vec::with_capacity(samples.len());
        let mut offset = 0;
        for sample in samples {
            blocks.push(offset..offset + sample.dimension());
            offset += sample.dimension();
        }

        let covariance = match joint {
            JointCovariance::BlockDiagonal => {
                let parts: Vec<&Covariance> =
                    samples.iter().map(|sample| sample.covariance()).collect();
                Covariance::block_diagonal(&parts)?
            }
            JointCovariance::Explicit(matrix) => {
                if matrix.nrows() != offset || matrix.ncols() != offset {
                    return Err(FitError::dimension_mismatch(
                        "JOINT.DIMENSION",
                        format!(
                            "joint covariance is {}x{} but the samples span {offset} bins",
                            matrix.nrows(),
                            matrix.ncols()
                        ),
                    ));
                }
                Covariance::from_matrix(matrix.clone())?
            }
        };

        tracing::info!(
            samples = samples.len(),
            bins = offset,
            "joint covariance assembled"
        );
        self.joint = Some(JointLayout { covariance, blocks });
        Ok(())
    }

    pub fn evaluate(
        &self,
        samples: &[Box<dyn Sample>],
        pulls: &[ParameterPull],
        registry: &DialRegistry,
    ) -> EvalResult<StatisticBreakdown> {
        let mut breakdown = match self.mode {
            AggregationMode::Independent => Self::independent_breakdown(samples)?,
            AggregationMode::Joint(_) => self.joint_breakdown(samples)?,
        };

        for pull in pulls {
            let value = pull.chi_square(registry)?;
            breakdown.push(pull.name(), value);
        }

        let values: Vec<f64> = breakdown.entries.iter().map(|entry| entry.value).collect();
        breakdown.total = stable_sum(&values);
        if !breakdown.total.is_finite() {
            return Err(EvaluationError::NonFiniteStatistic {
                entry: "total".to_string(),
                value: breakdown.total,
            });
        }
        Ok(breakdown)
    }

    fn independent_breakdown(samples: &[Box<dyn Sample>]) -> EvalResult<StatisticBreakdown> {
        let mut breakdown = StatisticBreakdown::default();
        for sample in samples {
            breakdown.push(sample.name(), sample.likelihood()?);
        }
        Ok(breakdown)
    }

    fn joint_breakdown(&self, samples: &[Box<dyn Sample>]) -> EvalResult<StatisticBreakdown> {
        let mut breakdown = StatisticBreakdown::default();
        let Some(layout) = &self.joint else {
            if samples.is_empty() {
                return Ok(breakdown);
            }
            return Err(FitError::internal(
                "JOINT.UNASSEMBLED",
                "joint covariance was not assembled for the registered samples",
            )
            .into());
        };

        let residuals: Vec<f64> = samples
            .iter()
            .flat_map(|sample| sample.binned_residuals())
            .collect();
        if residuals.len() != layout.covariance.dimension() || layout.blocks.len() != samples.len()
        {
            return Err(FitError::dimension_mismatch(
                "JOINT.DIMENSION",
                format!(
                    "joint residual vector has {} bins, covariance has {}",
                    residuals.len(),
                    layout.covariance.dimension()
                ),
            )
            .into());
        }

        let total = layout
            .covariance
            .chi_square(&residuals)
            .unwrap_or(f64::NAN);
        let mut diagonal_blocks = Vec::with_capacity(samples.len());
        for (sample, block) in samples.iter().zip(&layout.blocks) {
            let value = block_quadratic(layout.covariance.inverse(), block, &residuals);
            if !value.is_finite() {
                return Err(EvaluationError::NonFiniteStatistic {
                    entry: sample.name().to_string(),
                    value,
                });
            }
            diagonal_blocks.push(value);
            breakdown.push(sample.name(), value + sample.norm_penalty());
        }
        breakdown.push(CROSS_SAMPLE_ENTRY, total - stable_sum(&diagonal_blocks));
        Ok(breakdown)
    }
}

fn block_quadratic(inverse: &DenseMatrix, block: &Range<usize>, residuals: &[f64]) -> f64 {
    let terms: Vec<f64> = block
        .clone()
        .flat_map(|row| {
            block
                .clone()
                .map(move |col| residuals[row] * inverse[(row, col)] * residuals[col])
        })
        .collect();
    stable_sum(&terms)
}
