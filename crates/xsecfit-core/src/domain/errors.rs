use std::error::Error;
use std::fmt::{Display, Formatter};

use super::DialId;

pub type FitResult<T> = Result<T, FitError>;
pub type EvalResult<T> = Result<T, EvaluationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FitErrorCategory {
    Success,
    ConfigError,
    DialNotFoundError,
    DimensionMismatchError,
    NumericalDegeneracyError,
    RuntimeNumericalError,
    IoSystemError,
    InternalError,
}

impl FitErrorCategory {
    pub const fn exit_mapping(self) -> ExitMapping {
        match self {
            Self::Success => ExitMapping {
                exit_code: 0,
                rust_category: "Success",
                stage: FailureStage::None,
            },
            Self::ConfigError => ExitMapping {
                exit_code: 2,
                rust_category: "ConfigError",
                stage: FailureStage::Setup,
            },
            Self::IoSystemError => ExitMapping {
                exit_code: 3,
                rust_category: "IoSystemError",
                stage: FailureStage::Setup,
            },
            Self::RuntimeNumericalError => ExitMapping {
                exit_code: 4,
                rust_category: "RuntimeNumericalError",
                stage: FailureStage::Evaluation,
            },
            Self::InternalError => ExitMapping {
                exit_code: 5,
                rust_category: "InternalError",
                stage: FailureStage::Evaluation,
            },
            Self::DimensionMismatchError => ExitMapping {
                exit_code: 6,
                rust_category: "DimensionMismatchError",
                stage: FailureStage::Setup,
            },
            Self::NumericalDegeneracyError => ExitMapping {
                exit_code: 7,
                rust_category: "NumericalDegeneracyError",
                stage: FailureStage::Setup,
            },
            Self::DialNotFoundError => ExitMapping {
                exit_code: 8,
                rust_category: "DialNotFoundError",
                stage: FailureStage::Setup,
            },
        }
    }

    pub const fn exit_code(self) -> i32 {
        self.exit_mapping().exit_code
    }

    pub const fn rust_category(self) -> &'static str {
        self.exit_mapping().rust_category
    }

    pub const fn stage(self) -> FailureStage {
        self.exit_mapping().stage
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    None,
    Setup,
    Evaluation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitMapping {
    pub exit_code: i32,
    pub rust_category: &'static str,
    pub stage: FailureStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitError {
    category: FitErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl FitError {
    pub fn new(
        category: FitErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn config(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::ConfigError, placeholder, message)
    }

    pub fn dial_not_found(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::DialNotFoundError, placeholder, message)
    }

    pub fn dimension_mismatch(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::DimensionMismatchError, placeholder, message)
    }

    pub fn degeneracy(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::NumericalDegeneracyError, placeholder, message)
    }

    pub fn runtime_numerical(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::RuntimeNumericalError, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(FitErrorCategory::InternalError, placeholder, message)
    }

    pub const fn category(&self) -> FitErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for FitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.rust_category(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for FitError {}

/// Failures raised while an objective evaluation is in flight.
///
/// Kept apart from [`FitError`] so setup-time and evaluation-time failures are
/// distinguishable by type; both abort the fit run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("calculator '{calculator}' returned non-finite weight {value} for event {event}")]
    NonFiniteWeight {
        calculator: String,
        event: usize,
        value: f64,
    },
    #[error("test statistic for '{entry}' is non-finite ({value})")]
    NonFiniteStatistic { entry: String, value: f64 },
    #[error("parameter vector has {actual} entries but {expected} dials are registered")]
    ParameterCount { expected: usize, actual: usize },
    #[error("dial {id} is not registered")]
    UnknownDial { id: DialId },
    #[error("coefficient generation for event {event} failed: {reason}")]
    CoefficientGeneration { event: usize, reason: String },
    #[error("fast refill disagrees with full refill: full={full}, fast={fast}")]
    InconsistentFastPath { full: f64, fast: f64 },
    #[error("{0}")]
    Setup(FitError),
}

impl EvaluationError {
    pub fn into_fit_error(self) -> FitError {
        match self {
            Self::Setup(error) => error,
            Self::UnknownDial { id } => {
                FitError::dial_not_found("RUN.DIAL_LOOKUP", format!("dial {id} is not registered"))
            }
            Self::ParameterCount { .. } => {
                FitError::dimension_mismatch("RUN.PARAMETER_COUNT", self.to_string())
            }
            other => FitError::runtime_numerical("RUN.NUMERICAL", other.to_string()),
        }
    }
}

impl From<FitError> for EvaluationError {
    fn from(error: FitError) -> Self {
        Self::Setup(error)
    }
}

impl From<EvaluationError> for FitError {
    fn from(error: EvaluationError) -> Self {
        error.into_fit_error()
    }
}

#[cfg(test)]
mod tests {
    use super::{EvaluationError, FailureStage, FitError, FitErrorCategory};
    use crate::domain::{DialId, DialNamespace};

    #[test]
    fn exit_mapping_is_stable() {
        let cases = [
            (FitErrorCategory::Success, 0, "Success", FailureStage::None),
            (FitErrorCategory::ConfigError, 2, "ConfigError", FailureStage::Setup),
            (FitErrorCategory::IoSystemError, 3, "IoSystemError", FailureStage::Setup),
            (
                FitErrorCategory::RuntimeNumericalError,
                4,
                "RuntimeNumericalError",
                FailureStage::Evaluation,
            ),
            (
                FitErrorCategory::DimensionMismatchError,
                6,
                "DimensionMismatchError",
                FailureStage::Setup,
            ),
            (
                FitErrorCategory::NumericalDegeneracyError,
                7,
                "NumericalDegeneracyError",
                FailureStage::Setup,
            ),
            (
                FitErrorCategory::DialNotFoundError,
                8,
                "DialNotFoundError",
                FailureStage::Setup,
            ),
        ];

        for (category, exit_code, rust_category, stage) in cases {
            let mapping = category.exit_mapping();
            assert_eq!(mapping.exit_code, exit_code);
            assert_eq!(mapping.rust_category, rust_category);
            assert_eq!(mapping.stage, stage);
        }
    }

    #[test]
    fn fatal_error_renders_diagnostic_lines() {
        let error = FitError::config("CONFIG.SPLINE_FORM", "unrecognized form '1Dfoo'");

        assert_eq!(error.exit_code(), 2);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [CONFIG.SPLINE_FORM] unrecognized form '1Dfoo'"
        );
        assert_eq!(
            error.fatal_exit_line().as_deref(),
            Some("FATAL EXIT CODE: 2")
        );
    }

    #[test]
    fn evaluation_errors_keep_their_category_when_escalated() {
        let weight = EvaluationError::NonFiniteWeight {
            calculator: "tabulated".to_string(),
            event: 7,
            value: f64::NAN,
        };
        assert_eq!(
            weight.into_fit_error().category(),
            FitErrorCategory::RuntimeNumericalError
        );

        let unknown = EvaluationError::UnknownDial {
            id: DialId::new(DialNamespace::Genie, 4),
        };
        assert_eq!(
            unknown.into_fit_error().category(),
            FitErrorCategory::DialNotFoundError
        );

        let setup = EvaluationError::from(FitError::degeneracy("COVARIANCE.SINGULAR", "x"));
        assert_eq!(
            setup.into_fit_error().category(),
            FitErrorCategory::NumericalDegeneracyError
        );
    }
}
