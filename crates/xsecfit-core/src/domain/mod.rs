pub mod errors;

pub use errors::{
    EvalResult, EvaluationError, ExitMapping, FailureStage, FitError, FitErrorCategory, FitResult,
};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Width of one namespace block in the integer dial enumeration.
pub const NAMESPACE_STRIDE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialNamespace {
    Neut,
    Niwg,
    Nuwro,
    Genie,
    T2k,
    Custom,
    Norm,
}

impl DialNamespace {
    pub const ALL: [Self; 7] = [
        Self::Neut,
        Self::Niwg,
        Self::Nuwro,
        Self::Genie,
        Self::T2k,
        Self::Custom,
        Self::Norm,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Neut => "neut",
            Self::Niwg => "niwg",
            Self::Nuwro => "nuwro",
            Self::Genie => "genie",
            Self::T2k => "t2k",
            Self::Custom => "custom",
            Self::Norm => "norm",
        }
    }

    pub const fn block(self) -> u32 {
        match self {
            Self::Neut => 0,
            Self::Niwg => 1,
            Self::Nuwro => 2,
            Self::Genie => 3,
            Self::T2k => 4,
            Self::Custom => 5,
            Self::Norm => 6,
        }
    }

    pub fn from_block(block: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|namespace| namespace.block() == block)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|namespace| namespace.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Normalization dials never change event shapes.
    pub const fn is_normalization(self) -> bool {
        matches!(self, Self::Norm)
    }
}

impl Display for DialNamespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Generator namespace × local index, encoded as `block * 1000 + local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialId {
    namespace: DialNamespace,
    local: u32,
}

impl DialId {
    pub const fn new(namespace: DialNamespace, local: u32) -> Self {
        Self { namespace, local }
    }

    pub fn from_enum(value: u32) -> Option<Self> {
        let namespace = DialNamespace::from_block(value / NAMESPACE_STRIDE)?;
        Some(Self::new(namespace, value % NAMESPACE_STRIDE))
    }

    pub const fn namespace(self) -> DialNamespace {
        self.namespace
    }

    pub const fn local(self) -> u32 {
        self.local
    }

    pub const fn as_enum(self) -> u32 {
        self.namespace.block() * NAMESPACE_STRIDE + self.local
    }
}

impl Display for DialId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.namespace, self.local, self.as_enum())
    }
}

/// How a raw dial value maps onto the physical parameter it tweaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TweakConvention {
    #[default]
    Absolute,
    Fractional,
}

impl TweakConvention {
    pub fn physical_value(self, raw: f64, nominal: f64) -> f64 {
        match self {
            Self::Absolute => raw,
            Self::Fractional => nominal * (1.0 + raw),
        }
    }
}

/// Which calculator family owns an event's weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    #[default]
    Native,
    Spline,
}

/// A generated interaction as seen by the reweighting core.
///
/// `index` is unique within one fit and keys the coefficient cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub index: usize,
    pub mode: i32,
    pub kinematics: Vec<f64>,
    pub input_weight: f64,
    pub source: EventSource,
}

impl Event {
    pub fn new(index: usize, mode: i32, kinematics: Vec<f64>) -> Self {
        Self {
            index,
            mode,
            kinematics,
            input_weight: 1.0,
            source: EventSource::Native,
        }
    }

    pub fn with_input_weight(mut self, input_weight: f64) -> Self {
        self.input_weight = input_weight;
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn kinematic(&self, variable: usize) -> Option<f64> {
        self.kinematics.get(variable).copied()
    }
}
