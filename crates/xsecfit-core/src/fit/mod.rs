pub mod chi2;
pub mod controller;
pub mod covariance;
pub mod minimizer;
pub mod objective;
pub mod pulls;
pub mod sample;

pub use chi2::{
    AggregationMode, BreakdownEntry, ChiSquareAggregator, JointCovariance, StatisticBreakdown,
    CROSS_SAMPLE_ENTRY,
};
pub use controller::{FitState, ReconfigurationController, ReconfigurePath};
pub use covariance::{Covariance, CovarianceError};
pub use minimizer::{minimize, MinimizationResult, MinimizerConfig};
pub use objective::{FitObjective, IterationRecord};
pub use pulls::ParameterPull;
pub use sample::{BinnedSample, LikelihoodKind, Sample, SignalDefinition};
