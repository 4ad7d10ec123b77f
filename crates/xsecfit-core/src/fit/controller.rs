use super::sample::Sample;
use crate::domain::EvalResult;
use crate::weights::{DialChange, EventWeigher};
use serde::Serialize;

/// Process-wide fit bookkeeping, passed explicitly into each evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitState {
    pub dial_values: Vec<f64>,
    pub dials_changed: bool,
    pub mc_filled: bool,
    pub iteration: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigurePath {
    FullRefill,
    FastRefill,
    RenormalizeOnly,
}

impl ReconfigurePath {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullRefill => "full_refill",
            Self::FastRefill => "fast_refill",
            Self::RenormalizeOnly => "renormalize_only",
        }
    }
}

/// Chooses and runs exactly one recomputation path per sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconfigurationController;

impl ReconfigurationController {
    pub fn new() -> Self {
        Self
    }

    /// Policy, first match wins: explicit full request, then a sample that
    /// was never filled, both take the full path; a shape-dial change takes
    /// the fast path; anything else only rescales, unless the sample's
    /// current norm is 0 and cannot be rescaled, which falls back to fast.
    pub fn classify(
        &self,
        state: &FitState,
        change: DialChange,
        force_full: bool,
        sample_filled: bool,
        current_norm: f64,
    ) -> ReconfigurePath {
        if force_full || !state.mc_filled || !sample_filled {
            return ReconfigurePath::FullRefill;
        }
        if change.shape {
            return ReconfigurePath::FastRefill;
        }
        if current_norm == 0.0 {
            return ReconfigurePath::FastRefill;
        }
        ReconfigurePath::RenormalizeOnly
    }

    pub fn dispatch(
        &self,
        state: &mut FitState,
        samples: &mut [Box<dyn Sample>],
        norms: &[f64],
        weigher: &mut dyn EventWeigher,
        change: DialChange,
        force_full: bool,
    ) -> EvalResult<Vec<ReconfigurePath>> {
        let mut paths = Vec::with_capacity(samples.len());
        for (sample, &norm) in samples.iter_mut().zip(norms) {
            let path = self.classify(
                state,
                change,
                force_full,
                sample.is_filled(),
                sample.current_norm(),
            );
            match path {
                ReconfigurePath::FullRefill => sample.reconfigure(weigher, norm)?,
                ReconfigurePath::FastRefill => sample.reconfigure_fast(weigher, norm)?,
                ReconfigurePath::RenormalizeOnly => sample.renormalise(norm),
            }
            tracing::debug!(
                iteration = state.iteration,
                sample = sample.name(),
                path = path.as_str(),
                norm,
                "sample reconfigured"
            );
            paths.push(path);
        }
        state.mc_filled = true;
        Ok(paths)
    }
}
