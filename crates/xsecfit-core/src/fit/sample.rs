use super::covariance::Covariance;
use crate::domain::{EvalResult, EvaluationError, Event, FitError, FitResult};
use crate::numerics::{stable_sum, stable_weighted_sum};
use crate::weights::EventWeigher;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::rc::Rc;

/// A binned measurement the fit compares against.
pub trait Sample: Debug {
    fn name(&self) -> &str;

    /// Name of the normalization dial that scales this sample's MC.
    fn norm_dial(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Normalization currently baked into the MC contents.
    fn current_norm(&self) -> f64;

    fn is_filled(&self) -> bool;

    /// Re-selects signal events and refills every bin from scratch.
    fn reconfigure(&mut self, weigher: &mut dyn EventWeigher, norm: f64) -> EvalResult<()>;

    /// Refills bins from the cached signal selection, recomputing weights only.
    fn reconfigure_fast(&mut self, weigher: &mut dyn EventWeigher, norm: f64) -> EvalResult<()>;

    /// Rescales existing bin contents to a new normalization.
    fn renormalise(&mut self, norm: f64);

    fn data(&self) -> &[f64];

    fn mc(&self) -> &[f64];

    /// `data - prediction`, one entry per bin.
    fn binned_residuals(&self) -> Vec<f64>;

    fn covariance(&self) -> &Covariance;

    fn likelihood(&self) -> EvalResult<f64>;

    fn norm_penalty(&self) -> f64 {
        0.0
    }

    fn ndof(&self) -> usize {
        self.dimension()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LikelihoodKind {
    #[default]
    Covariance,
    Diagonal,
    EventRate,
}

/// Which events count as signal and where they land.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalDefinition {
    /// Accepted interaction modes; empty accepts every mode.
    pub modes: Vec<i32>,
    /// Index into `Event::kinematics` used for binning.
    pub variable: usize,
}

impl SignalDefinition {
    pub fn accepts(&self, event: &Event) -> bool {
        self.modes.is_empty() || self.modes.contains(&event.mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignalEntry {
    event: usize,
    bin: usize,
}

#[derive(Debug, Clone)]
pub struct BinnedSample {
    name: String,
    norm_dial: String,
    events: Rc<[Event]>,
    selection: SignalDefinition,
    edges: Vec<f64>,
    data: Vec<f64>,
    mc: Vec<f64>,
    covariance: Covariance,
    kind: LikelihoodKind,
    scale_factor: f64,
    shape_only: bool,
    norm_error: Option<f64>,
    signal: Vec<SignalEntry>,
    norm: f64,
    filled: bool,
}

impl BinnedSample {
    pub fn new(
        name: impl Into<String>,
        events: Rc<[Event]>,
        edges: Vec<f64>,
        data: Vec<f64>,
        covariance: Covariance,
    ) -> FitResult<Self> {
        let name = name.into();
        if edges.len() != data.len() + 1 {
            return Err(FitError::dimension_mismatch(
                "SAMPLE.DIMENSION",
                format!(
                    "sample '{name}' has {} bin edges for {} data bins",
                    edges.len(),
                    data.len()
                ),
            ));
        }
        if covariance.dimension() != data.len() {
            return Err(FitError::dimension_mismatch(
                "SAMPLE.DIMENSION",
                format!(
                    "sample '{name}' has {} data bins but a {}x{} covariance",
                    data.len(),
                    covariance.dimension(),
                    covariance.dimension()
                ),
            ));
        }
        if edges.windows(2).any(|window| window[1] <= window[0])
            || edges.iter().any(|edge| !edge.is_finite())
        {
            return Err(FitError::config(
                "CONFIG.SAMPLE_BINNING",
                format!("sample '{name}' bin edges must be finite and strictly increasing"),
            ));
        }
        if data.iter().any(|value| !value.is_finite()) {
            return Err(FitError::config(
                "CONFIG.SAMPLE_DATA",
                format!("sample '{name}' has non-finite data"),
            ));
        }

        let bins = data.len();
        Ok(Self {
            norm_dial: format!("{name}_norm"),
            name,
            events,
            selection: SignalDefinition::default(),
            edges,
            data,
            mc: vec![0.0; bins],
            covariance,
            kind: LikelihoodKind::Covariance,
            scale_factor: 1.0,
            shape_only: false,
            norm_error: None,
            signal: Vec::new(),
            norm: 1.0,
            filled: false,
        })
    }

    pub fn with_signal(mut self, selection: SignalDefinition) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_likelihood(mut self, kind: LikelihoodKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_scale_factor(mut self, scale_factor: f64) -> FitResult<Self> {
        if !scale_factor.is_finite() {
            return Err(FitError::config(
                "CONFIG.SAMPLE_SCALE",
                format!("sample '{}' scale factor must be finite", self.name),
            ));
        }
        self.scale_factor = scale_factor;
        Ok(self)
    }

    pub fn with_shape_only(mut self, shape_only: bool) -> Self {
        self.shape_only = shape_only;
        self
    }

    pub fn with_norm_error(mut self, norm_error: f64) -> FitResult<Self> {
        if !(norm_error.is_finite() && norm_error > 0.0) {
            return Err(FitError::config(
                "CONFIG.SAMPLE_NORM_ERROR",
                format!("sample '{}' norm error must be positive", self.name),
            ));
        }
        self.norm_error = Some(norm_error);
        Ok(self)
    }

    pub fn with_norm_dial(mut self, norm_dial: impl Into<String>) -> Self {
        self.norm_dial = norm_dial.into();
        self
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    pub fn signal_count(&self) -> usize {
        self.signal.len()
    }

    fn bin_of(&self, value: f64) -> Option<usize> {
        let last = *self.edges.last()?;
        if !(value >= self.edges[0] && value < last) {
            return None;
        }
        Some(self.edges.partition_point(|edge| *edge <= value) - 1)
    }

    fn select_signal(&mut self) {
        let mut signal = Vec::new();
        for (position, event) in self.events.iter().enumerate() {
            if !self.selection.accepts(event) {
                continue;
            }
            let Some(value) = event.kinematic(self.selection.variable) else {
                continue;
            };
            if let Some(bin) = self.bin_of(value) {
                signal.push(SignalEntry {
                    event: position,
                    bin,
                });
            }
        }
        self.signal = signal;
    }

    fn fill_from_signal(&mut self, weigher: &mut dyn EventWeigher, norm: f64) -> EvalResult<()> {
        let mut raw = vec![0.0; self.data.len()];
        for entry in &self.signal {
            raw[entry.bin] += weigher.compute_event_weight(&self.events[entry.event])?;
        }
        for (bin, content) in raw.into_iter().enumerate() {
            self.mc[bin] = content * self.scale_factor * norm;
        }
        self.norm = norm;
        self.filled = true;
        Ok(())
    }

    fn widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|window| window[1] - window[0]).collect()
    }

    /// MC as compared against data; scaled to the data integral when the
    /// sample is shape-only.
    pub fn prediction(&self) -> Vec<f64> {
        if !self.shape_only {
            return self.mc.clone();
        }
        let widths = self.widths();
        let data_integral = stable_weighted_sum(&self.data, &widths).unwrap_or(0.0);
        let mc_integral = stable_weighted_sum(&self.mc, &widths).unwrap_or(0.0);
        if mc_integral <= 0.0 {
            return self.mc.clone();
        }
        let factor = data_integral / mc_integral;
        self.mc.iter().map(|value| value * factor).collect()
    }
}

impl Sample for BinnedSample {
    fn name(&self) -> &str {
        &self.name
    }

    fn norm_dial(&self) -> &str {
        &self.norm_dial
    }

    fn dimension(&self) -> usize {
        self.data.len()
    }

    fn current_norm(&self) -> f64 {
        self.norm
    }

    fn is_filled(&self) -> bool {
        self.filled
    }

    fn reconfigure(&mut self, weigher: &mut dyn EventWeigher, norm: f64) -> EvalResult<()> {
        self.select_signal();
        tracing::debug!(
            sample = %self.name,
            events = self.events.len(),
            signal = self.signal.len(),
            "full refill"
        );
        self.fill_from_signal(weigher, norm)
    }

    fn reconfigure_fast(&mut self, weigher: &mut dyn EventWeigher, norm: f64) -> EvalResult<()> {
        self.fill_from_signal(weigher, norm)
    }

    fn renormalise(&mut self, norm: f64) {
        if self.norm == norm || self.norm == 0.0 {
            return;
        }
        let ratio = norm / self.norm;
        for value in &mut self.mc {
            *value *= ratio;
        }
        self.norm = norm;
    }

    fn data(&self) -> &[f64] {
        &self.data
    }

    fn mc(&self) -> &[f64] {
        &self.mc
    }

    fn binned_residuals(&self) -> Vec<f64> {
        self.data
            .iter()
            .zip(self.prediction())
            .map(|(data, prediction)| data - prediction)
            .collect()
    }

    fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    fn likelihood(&self) -> EvalResult<f64> {
        let statistic = match self.kind {
            LikelihoodKind::Covariance => self
                .covariance
                .chi_square(&self.binned_residuals())
                .unwrap_or(f64::NAN),
            LikelihoodKind::Diagonal => {
                let terms: Vec<f64> = self
                    .binned_residuals()
                    .iter()
                    .enumerate()
                    .map(|(bin, residual)| {
                        let variance = self.covariance.variance(bin).unwrap_or(f64::NAN);
                        residual * residual / variance
                    })
                    .collect();
                stable_sum(&terms)
            }
            LikelihoodKind::EventRate => {
                let terms: Vec<f64> = self
                    .data
                    .iter()
                    .zip(self.prediction())
                    .filter(|(_, prediction)| *prediction > 0.0)
                    .map(|(&data, prediction)| {
                        if data <= 0.0 {
                            2.0 * (prediction - data)
                        } else {
                            2.0 * (prediction - data + data * (data / prediction).ln())
                        }
                    })
                    .collect();
                stable_sum(&terms)
            }
        } + self.norm_penalty();

        if !statistic.is_finite() {
            return Err(EvaluationError::NonFiniteStatistic {
                entry: self.name.clone(),
                value: statistic,
            });
        }
        Ok(statistic)
    }

    fn norm_penalty(&self) -> f64 {
        self.norm_error
            .map_or(0.0, |sigma| (1.0 - self.norm).powi(2) / (sigma * sigma))
    }
}

#[cfg(test)]
mod tests {
    use super::{BinnedSample, LikelihoodKind, Sample, SignalDefinition};
    use crate::domain::{EvalResult, Event, FitErrorCategory};
    use crate::fit::covariance::Covariance;
    use crate::weights::EventWeigher;
    use std::rc::Rc;

    #[derive(Debug)]
    struct UnitWeigher {
        calls: usize,
        scale: f64,
    }

    impl EventWeigher for UnitWeigher {
        fn compute_event_weight(&mut self, event: &Event) -> EvalResult<f64> {
            self.calls += 1;
            Ok(event.input_weight * self.scale)
        }
    }

    fn events() -> Rc<[Event]> {
        vec![
            Event::new(0, 1, vec![0.5]),
            Event::new(1, 1, vec![1.5]).with_input_weight(2.0),
            Event::new(2, 2, vec![1.5]),
            Event::new(3, 1, vec![2.5]),
            Event::new(4, 1, vec![3.0]),
            Event::new(5, 1, vec![]),
        ]
        .into()
    }

    fn sample(data: Vec<f64>, variances: &[f64]) -> BinnedSample {
        let errors: Vec<f64> = variances.iter().map(|value| value.sqrt()).collect();
        BinnedSample::new(
            "ccqe",
            events(),
            vec![0.0, 1.0, 2.0, 3.0],
            data,
            Covariance::from_errors(&errors).expect("covariance"),
        )
        .expect("sample")
        .with_signal(SignalDefinition {
            modes: vec![1],
            variable: 0,
        })
    }

    #[test]
    fn full_refill_selects_signal_and_bins_by_edges() {
        let mut sample = sample(vec![1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]);
        let mut weigher = UnitWeigher { calls: 0, scale: 1.0 };
        sample.reconfigure(&mut weigher, 1.0).expect("refill");
        // mode 2 is rejected, 3.0 sits on the upper edge, event 5 has no kinematics
        assert_eq!(sample.signal_count(), 3);
        assert_eq!(sample.mc(), &[1.0, 2.0, 1.0]);
        assert_eq!(weigher.calls, 3);
    }

    #[test]
    fn fast_refill_matches_full_refill_bitwise() {
        let mut full = sample(vec![1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]);
        let mut weigher = UnitWeigher { calls: 0, scale: 1.0 };
        full.reconfigure(&mut weigher, 1.0).expect("first fill");

        weigher.scale = 0.37;
        let mut fast = full.clone();
        full.reconfigure(&mut weigher, 1.3).expect("full");
        fast.reconfigure_fast(&mut weigher, 1.3).expect("fast");
        let full_bits: Vec<u64> = full.mc().iter().map(|value| value.to_bits()).collect();
        let fast_bits: Vec<u64> = fast.mc().iter().map(|value| value.to_bits()).collect();
        assert_eq!(full_bits, fast_bits);
    }

    #[test]
    fn renormalise_round_trip_restores_contents() {
        let mut sample = sample(vec![1.0, 1.0, 1.0], &[1.0, 1.0, 1.0]);
        let mut weigher = UnitWeigher { calls: 0, scale: 0.9 };
        sample.reconfigure(&mut weigher, 1.0).expect("fill");
        let original = sample.mc().to_vec();

        sample.renormalise(3.7);
        assert!((sample.mc()[1] - original[1] * 3.7).abs() < 1.0e-12);
        sample.renormalise(1.0);
        for (restored, expected) in sample.mc().iter().zip(&original) {
            assert!((restored - expected).abs() <= 1.0e-12 * expected.abs().max(1.0));
        }
        assert_eq!(sample.current_norm(), 1.0);
    }

    #[test]
    fn diagonal_chi_square_scenario() {
        let mut sample = BinnedSample::new(
            "scenario",
            Rc::from(Vec::<Event>::new()),
            vec![0.0, 1.0, 2.0, 3.0],
            vec![10.0, 20.0, 10.0],
            Covariance::from_errors(&[10.0_f64.sqrt(), 20.0_f64.sqrt(), 10.0_f64.sqrt()])
                .expect("covariance"),
        )
        .expect("sample");
        let mut weigher = UnitWeigher { calls: 0, scale: 1.0 };
        sample.reconfigure(&mut weigher, 1.0).expect("fill");
        // zero signal events: residual is the data itself
        assert_eq!(sample.binned_residuals(), vec![10.0, 20.0, 10.0]);
        let empty = sample.likelihood().expect("likelihood");
        assert!((empty - (10.0 + 20.0 + 10.0)).abs() < 1.0e-9);
    }

    #[test]
    fn event_rate_likelihood_skips_empty_prediction_bins() {
        let mut sample = sample(vec![2.0, 0.0, 5.0], &[1.0, 1.0, 1.0])
            .with_likelihood(LikelihoodKind::EventRate);
        let mut weigher = UnitWeigher { calls: 0, scale: 1.0 };
        sample.reconfigure(&mut weigher, 1.0).expect("fill");
        // mc = [1, 2, 1]
        let expected = 2.0 * (1.0 - 2.0 + 2.0 * 2.0_f64.ln())
            + 2.0 * (2.0 - 0.0)
            + 2.0 * (1.0 - 5.0 + 5.0 * 5.0_f64.ln());
        let actual = sample.likelihood().expect("likelihood");
        assert!((actual - expected).abs() < 1.0e-12);
    }

    #[test]
    fn shape_only_scales_prediction_to_data_integral() {
        let sample_with_norm = sample(vec![2.0, 4.0, 2.0], &[1.0, 1.0, 1.0])
            .with_shape_only(true)
            .with_norm_error(0.1)
            .expect("norm error");
        let mut sample = sample_with_norm;
        let mut weigher = UnitWeigher { calls: 0, scale: 1.0 };
        sample.reconfigure(&mut weigher, 1.0).expect("fill");
        assert_eq!(sample.prediction(), vec![2.0, 4.0, 2.0]);
        assert!(sample.likelihood().expect("likelihood").abs() < 1.0e-12);

        sample.renormalise(1.1);
        assert!((sample.norm_penalty() - 1.0).abs() < 1.0e-9);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let error = BinnedSample::new(
            "bad",
            events(),
            vec![0.0, 1.0, 2.0],
            vec![1.0, 1.0, 1.0],
            Covariance::from_errors(&[1.0, 1.0, 1.0]).expect("covariance"),
        )
        .expect_err("edges");
        assert_eq!(error.category(), FitErrorCategory::DimensionMismatchError);

        let error = BinnedSample::new(
            "bad",
            events(),
            vec![0.0, 1.0, 2.0, 3.0],
            vec![1.0, 1.0, 1.0],
            Covariance::from_errors(&[1.0, 1.0]).expect("covariance"),
        )
        .expect_err("covariance");
        assert_eq!(error.placeholder(), "SAMPLE.DIMENSION");
    }
}
