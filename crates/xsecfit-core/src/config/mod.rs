//! JSON fit cards: the declarative description of dials, curves, events,
//! samples and pulls that a fit run is assembled from.

use crate::domain::{
    DialId, DialNamespace, Event, EventSource, FitError, FitResult, TweakConvention,
};
use crate::fit::{
    AggregationMode, BinnedSample, Covariance, FitObjective, JointCovariance, LikelihoodKind,
    MinimizerConfig, ParameterPull, SignalDefinition,
};
use crate::numerics::{dense_from_rows, DenseMatrix};
use crate::weights::{DialSpec, ResponseTable, TabulatedResponseCalculator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FitCard {
    #[serde(default)]
    pub mode: CardMode,
    /// Full cross-sample covariance for joint mode; block-diagonal when absent.
    #[serde(default)]
    pub joint_covariance: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub dials: Vec<DialCard>,
    #[serde(default)]
    pub curves: Vec<CurveCard>,
    #[serde(default)]
    pub inputs: Vec<InputCard>,
    #[serde(default)]
    pub samples: Vec<SampleCard>,
    #[serde(default)]
    pub pulls: Vec<PullCard>,
    #[serde(default)]
    pub spline_cache: Option<PathBuf>,
    #[serde(default)]
    pub iteration_log: bool,
    #[serde(default)]
    pub consistency_check: bool,
    #[serde(default)]
    pub minimizer: MinimizerCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CardMode {
    #[default]
    Independent,
    Joint,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DialCard {
    pub name: String,
    pub namespace: DialNamespace,
    pub index: u32,
    #[serde(default)]
    pub initial: f64,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub convention: TweakConvention,
    #[serde(default)]
    pub nominal: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CurveCard {
    pub dial: String,
    pub form: String,
    pub scan: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InputCard {
    pub name: String,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub events: Vec<EventCard>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventCard {
    #[serde(default)]
    pub mode: i32,
    #[serde(default)]
    pub kinematics: Vec<f64>,
    #[serde(default = "unit_weight")]
    pub weight: f64,
    #[serde(default)]
    pub responses: Vec<ResponseCard>,
}

fn unit_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseCard {
    pub dial: String,
    pub values: Vec<f64>,
    pub ratios: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceCard {
    Matrix(Vec<Vec<f64>>),
    Errors(Vec<f64>),
    Correlation {
        matrix: Vec<Vec<f64>>,
        errors: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SampleCard {
    pub name: String,
    pub input: String,
    #[serde(default)]
    pub variable: usize,
    #[serde(default)]
    pub modes: Vec<i32>,
    pub edges: Vec<f64>,
    pub data: Vec<f64>,
    pub covariance: CovarianceCard,
    #[serde(default)]
    pub likelihood: LikelihoodKind,
    #[serde(default = "unit_weight")]
    pub scale_factor: f64,
    #[serde(default)]
    pub norm_error: Option<f64>,
    #[serde(default)]
    pub shape_only: bool,
    #[serde(default)]
    pub norm_dial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PullCard {
    pub name: String,
    pub dials: Vec<String>,
    pub central: Vec<f64>,
    pub covariance: CovarianceCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MinimizerCard {
    #[serde(default = "default_max_iter")]
    pub max_iter: u64,
    #[serde(default = "default_tolerance")]
    pub tol: f64,
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_max_iter() -> u64 {
    MinimizerConfig::default().max_iter
}

fn default_tolerance() -> f64 {
    MinimizerConfig::default().tol
}

fn default_history() -> usize {
    MinimizerConfig::default().m
}

impl Default for MinimizerCard {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tol: default_tolerance(),
            history: default_history(),
        }
    }
}

impl From<MinimizerCard> for MinimizerConfig {
    fn from(card: MinimizerCard) -> Self {
        Self {
            max_iter: card.max_iter,
            tol: card.tol,
            m: card.history,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FitCardError {
    #[error("failed to read fit card '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse fit card '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<FitCardError> for FitError {
    fn from(error: FitCardError) -> Self {
        match &error {
            FitCardError::Read { .. } => FitError::io_system("IO.FIT_CARD", error.to_string()),
            FitCardError::Parse { .. } => FitError::config("CONFIG.FIT_CARD", error.to_string()),
        }
    }
}

pub fn load_fit_card(card_path: impl AsRef<Path>) -> Result<FitCard, FitCardError> {
    let card_path = card_path.as_ref();
    let source = fs::read_to_string(card_path).map_err(|source| FitCardError::Read {
        path: card_path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&source).map_err(|source| FitCardError::Parse {
        path: card_path.to_path_buf(),
        source,
    })
}

/// A card turned into live objects, plus the events each input produced.
#[derive(Debug)]
pub struct FitSetup {
    pub objective: FitObjective,
    pub inputs: Vec<(String, Rc<[Event]>)>,
    pub minimizer: MinimizerConfig,
    pub spline_cache: Option<PathBuf>,
}

impl FitSetup {
    pub fn events(&self) -> impl Iterator<Item = &Event> + '_ {
        self.inputs.iter().flat_map(|(_, events)| events.iter())
    }
}

pub fn build_objective(card: &FitCard) -> FitResult<FitSetup> {
    let mut objective = FitObjective::new();
    objective.set_iteration_log(card.iteration_log);
    objective.set_consistency_check(card.consistency_check);

    for dial in &card.dials {
        let spec = DialSpec::new(
            dial.name.clone(),
            DialId::new(dial.namespace, dial.index),
            dial.initial,
        )
        .with_bounds(
            dial.lower.unwrap_or(f64::NEG_INFINITY),
            dial.upper.unwrap_or(f64::INFINITY),
        )
        .fixed(dial.fixed)
        .with_convention(dial.convention, dial.nominal);
        objective.register_dial(spec)?;
    }

    for curve in &card.curves {
        let handle = objective.registry().handle(&curve.dial)?;
        objective.add_response_curve(handle, &curve.form, &curve.scan)?;
    }

    let (inputs, calculators) = build_inputs(&objective, &card.inputs)?;
    for calculator in calculators {
        objective.add_native_calculator(Box::new(calculator));
    }

    for sample in &card.samples {
        let events = inputs
            .iter()
            .find(|(name, _)| *name == sample.input)
            .map(|(_, events)| Rc::clone(events))
            .ok_or_else(|| {
                FitError::config(
                    "CONFIG.SAMPLE_INPUT",
                    format!("sample '{}' reads unknown input '{}'", sample.name, sample.input),
                )
            })?;
        objective.add_sample(Box::new(build_sample(sample, events)?))?;
    }

    for pull in &card.pulls {
        let mut dials = Vec::with_capacity(pull.dials.len());
        for name in &pull.dials {
            let handle = objective.registry().handle(name)?;
            dials.push(objective.registry().dial(handle)?.id);
        }
        let covariance = build_covariance(&pull.covariance)?;
        objective.add_pull(ParameterPull::new(
            pull.name.clone(),
            dials,
            pull.central.clone(),
            covariance,
        )?)?;
    }

    if card.mode == CardMode::Joint {
        let joint = match &card.joint_covariance {
            Some(rows) => JointCovariance::Explicit(matrix_from_rows(rows)?),
            None => JointCovariance::BlockDiagonal,
        };
        objective.set_aggregation(AggregationMode::Joint(joint))?;
    }

    tracing::info!(
        dials = objective.registry().len(),
        samples = objective.samples().len(),
        pulls = objective.pulls().len(),
        events = inputs.iter().map(|(_, events)| events.len()).sum::<usize>(),
        "fit card assembled"
    );
    Ok(FitSetup {
        objective,
        inputs,
        minimizer: card.minimizer.into(),
        spline_cache: card.spline_cache.clone(),
    })
}

type BuiltInputs = (Vec<(String, Rc<[Event]>)>, Vec<TabulatedResponseCalculator>);

/// Numbers events globally across inputs and collects their tabulated
/// responses into one native calculator per dial namespace.
fn build_inputs(objective: &FitObjective, cards: &[InputCard]) -> FitResult<BuiltInputs> {
    let mut calculators: Vec<TabulatedResponseCalculator> = Vec::new();
    let mut by_namespace: HashMap<DialNamespace, usize> = HashMap::new();
    let mut inputs = Vec::with_capacity(cards.len());
    let mut next_index = 0;

    for input in cards {
        if inputs.iter().any(|(name, _): &(String, Rc<[Event]>)| *name == input.name) {
            return Err(FitError::config(
                "CONFIG.DUPLICATE_INPUT",
                format!("input '{}' is declared twice", input.name),
            ));
        }
        let mut events = Vec::with_capacity(input.events.len());
        for card in &input.events {
            let index = next_index;
            next_index += 1;
            for response in &card.responses {
                let handle = objective.registry().handle(&response.dial)?;
                let id = objective.registry().dial(handle)?.id;
                let slot = *by_namespace.entry(id.namespace()).or_insert_with(|| {
                    calculators.push(TabulatedResponseCalculator::new(
                        id.namespace().as_str(),
                        vec![id.namespace()],
                    ));
                    calculators.len() - 1
                });
                let table = ResponseTable::new(response.values.clone(), response.ratios.clone())?;
                calculators[slot].add_response(index, id, table)?;
            }
            events.push(
                Event::new(index, card.mode, card.kinematics.clone())
                    .with_input_weight(card.weight)
                    .with_source(input.source),
            );
        }
        inputs.push((input.name.clone(), Rc::from(events)));
    }
    Ok((inputs, calculators))
}

fn build_sample(card: &SampleCard, events: Rc<[Event]>) -> FitResult<BinnedSample> {
    let covariance = build_covariance(&card.covariance)?;
    let mut sample = BinnedSample::new(
        card.name.clone(),
        events,
        card.edges.clone(),
        card.data.clone(),
        covariance,
    )?
    .with_signal(SignalDefinition {
        modes: card.modes.clone(),
        variable: card.variable,
    })
    .with_likelihood(card.likelihood)
    .with_shape_only(card.shape_only)
    .with_scale_factor(card.scale_factor)?;
    if let Some(norm_error) = card.norm_error {
        sample = sample.with_norm_error(norm_error)?;
    }
    if let Some(norm_dial) = &card.norm_dial {
        sample = sample.with_norm_dial(norm_dial.clone());
    }
    Ok(sample)
}

fn matrix_from_rows(rows: &[Vec<f64>]) -> FitResult<DenseMatrix> {
    dense_from_rows(rows).ok_or_else(|| {
        FitError::dimension_mismatch(
            "COVARIANCE.SHAPE",
            "matrix rows must be non-empty and of equal length",
        )
    })
}

fn build_covariance(card: &CovarianceCard) -> FitResult<Covariance> {
    let covariance = match card {
        CovarianceCard::Matrix(rows) => Covariance::from_matrix(matrix_from_rows(rows)?),
        CovarianceCard::Errors(errors) => Covariance::from_errors(errors),
        CovarianceCard::Correlation { matrix, errors } => {
            Covariance::from_correlation(&matrix_from_rows(matrix)?, errors)
        }
    };
    Ok(covariance?)
}

#[cfg(test)]
mod tests {
    use super::{build_objective, load_fit_card, CardMode, CovarianceCard, FitCard, FitCardError};
    use crate::domain::{DialId, DialNamespace, FitError, FitErrorCategory};
    use crate::fit::AggregationMode;
    use std::fs;

    const CARD: &str = r#"{
        "mode": "joint",
        "dials": [
            {"name": "MaCCQE", "namespace": "neut", "index": 1, "lower": -1.0, "upper": 1.0},
            {"name": "ccqe_norm", "namespace": "norm", "index": 0, "initial": 1.0}
        ],
        "inputs": [{
            "name": "neut_numu",
            "events": [
                {"mode": 1, "kinematics": [0.5],
                 "responses": [{"dial": "MaCCQE", "values": [-1, 0, 1], "ratios": [0.5, 1, 1.5]}]},
                {"mode": 1, "kinematics": [1.5], "weight": 2.0}
            ]
        }],
        "samples": [
            {"name": "ccqe", "input": "neut_numu", "edges": [0, 1, 2],
             "data": [1.0, 2.0], "covariance": {"errors": [1.0, 1.0]}},
            {"name": "ccinc", "input": "neut_numu", "edges": [0, 2],
             "data": [3.0], "covariance": {"matrix": [[1.0]]}, "norm_error": 0.2}
        ],
        "pulls": [{"name": "ma_prior", "dials": ["MaCCQE"], "central": [0.0],
                   "covariance": {"errors": [0.5]}}]
    }"#;

    #[test]
    fn card_builds_a_complete_objective() {
        let card: FitCard = serde_json::from_str(CARD).expect("card");
        assert_eq!(card.mode, CardMode::Joint);
        assert_eq!(card.samples[0].covariance, CovarianceCard::Errors(vec![1.0, 1.0]));

        let mut setup = build_objective(&card).expect("objective");
        let objective = &mut setup.objective;
        assert!(matches!(objective.aggregation(), AggregationMode::Joint(_)));
        // the second sample gets its own norm dial
        let registry = objective.registry();
        assert_eq!(registry.len(), 3);
        let handle = registry.handle("ccinc_norm").expect("auto norm");
        assert_eq!(
            registry.dial(handle).expect("dial").id,
            DialId::new(DialNamespace::Norm, 1)
        );
        assert_eq!(objective.ndof(), 4);
        assert_eq!(setup.events().count(), 2);

        let statistic = setup
            .objective
            .propose_parameters(&[0.0, 1.0, 1.0])
            .expect("evaluate");
        // ccqe: [1, 2] vs [1, 2]; ccinc: 3 vs 3; no pull offset
        assert!(statistic.abs() < 1.0e-12, "{statistic}");
    }

    #[test]
    fn unknown_references_are_reported_by_category() {
        let mut card: FitCard = serde_json::from_str(CARD).expect("card");
        card.samples[0].input = "missing".to_string();
        let error = build_objective(&card).expect_err("unknown input");
        assert_eq!(error.category(), FitErrorCategory::ConfigError);

        let mut card: FitCard = serde_json::from_str(CARD).expect("card");
        card.pulls[0].dials = vec!["MaRES".to_string()];
        let error = build_objective(&card).expect_err("unknown dial");
        assert_eq!(error.category(), FitErrorCategory::DialNotFoundError);

        let mut card: FitCard = serde_json::from_str(CARD).expect("card");
        card.joint_covariance = Some(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let error = build_objective(&card).expect_err("joint dimension");
        assert_eq!(error.category(), FitErrorCategory::DimensionMismatchError);
    }

    #[test]
    fn loader_distinguishes_read_and_parse_failures() {
        let directory = tempfile::tempdir().expect("tempdir");
        let missing = directory.path().join("missing.json");
        let error = load_fit_card(&missing).expect_err("missing");
        assert!(matches!(error, FitCardError::Read { .. }));
        assert_eq!(
            FitError::from(error).category(),
            FitErrorCategory::IoSystemError
        );

        let broken = directory.path().join("broken.json");
        fs::write(&broken, "{\"dials\": [").expect("write");
        let error = load_fit_card(&broken).expect_err("broken");
        assert!(matches!(error, FitCardError::Parse { .. }));
        assert_eq!(FitError::from(error).category(), FitErrorCategory::ConfigError);

        let good = directory.path().join("card.json");
        fs::write(&good, CARD).expect("write");
        let card = load_fit_card(&good).expect("card");
        assert_eq!(card.dials.len(), 2);
    }
}
