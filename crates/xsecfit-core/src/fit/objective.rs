use super::chi2::{AggregationMode, ChiSquareAggregator, StatisticBreakdown};
use super::controller::{FitState, ReconfigurationController, ReconfigurePath};
use super::pulls::ParameterPull;
use super::sample::Sample;
use crate::domain::{
    DialId, DialNamespace, EvalResult, EvaluationError, Event, EventSource, FitError, FitResult,
};
use crate::weights::{
    DialChange, DialHandle, DialRegistry, DialSpec, EventWeigher, WeightCalculator, WeightEngine,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One objective evaluation as recorded in the iteration log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: u64,
    pub statistic: f64,
    pub paths: Vec<ReconfigurePath>,
    pub entries: BTreeMap<String, f64>,
    pub dials: Vec<f64>,
}

/// The function the minimizer drives: dial vector in, test statistic out.
#[derive(Debug, Default)]
pub struct FitObjective {
    engine: WeightEngine,
    samples: Vec<Box<dyn Sample>>,
    norm_dials: Vec<DialId>,
    pulls: Vec<ParameterPull>,
    aggregator: ChiSquareAggregator,
    controller: ReconfigurationController,
    state: FitState,
    breakdown: StatisticBreakdown,
    last_paths: Vec<ReconfigurePath>,
    iteration_log: Option<Vec<IterationRecord>>,
    consistency_check: bool,
}

impl FitObjective {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: DialRegistry) -> Self {
        Self {
            engine: WeightEngine::new(registry),
            ..Self::default()
        }
    }

    pub fn register_dial(&mut self, spec: DialSpec) -> FitResult<DialHandle> {
        let handle = self.engine.registry_mut().register(spec)?;
        self.state.mc_filled = false;
        Ok(handle)
    }

    pub fn add_response_curve(
        &mut self,
        handle: DialHandle,
        form: &str,
        scan_definition: &str,
    ) -> FitResult<usize> {
        let position = self
            .engine
            .registry_mut()
            .add_response_curve(handle, form, scan_definition)?;
        self.state.mc_filled = false;
        Ok(position)
    }

    pub fn add_native_calculator(&mut self, calculator: Box<dyn WeightCalculator>) {
        self.engine.add_native(calculator);
        self.state.mc_filled = false;
    }

    /// Registers a sample, creating its normalization dial when the card did
    /// not declare one.
    pub fn add_sample(&mut self, sample: Box<dyn Sample>) -> FitResult<()> {
        if self.samples.iter().any(|existing| existing.name() == sample.name()) {
            return Err(FitError::config(
                "CONFIG.DUPLICATE_SAMPLE",
                format!("sample '{}' is already registered", sample.name()),
            ));
        }

        let norm_dial = match self.engine.registry().handle(sample.norm_dial()) {
            Ok(handle) => self.engine.registry().dial(handle)?.id,
            Err(_) => {
                let id = self.next_norm_id();
                self.register_dial(DialSpec::new(sample.norm_dial(), id, 1.0))?;
                id
            }
        };

        tracing::info!(
            sample = sample.name(),
            bins = sample.dimension(),
            norm_dial = sample.norm_dial(),
            "sample registered"
        );
        self.samples.push(sample);
        self.norm_dials.push(norm_dial);
        self.state.mc_filled = false;
        if let Err(error) = self.aggregator.assemble(&self.samples) {
            self.samples.pop();
            self.norm_dials.pop();
            return Err(error);
        }
        Ok(())
    }

    fn next_norm_id(&self) -> DialId {
        let registry = self.engine.registry();
        let mut local = 0;
        while registry.contains(DialId::new(DialNamespace::Norm, local)) {
            local += 1;
        }
        DialId::new(DialNamespace::Norm, local)
    }

    pub fn add_pull(&mut self, pull: ParameterPull) -> FitResult<()> {
        for dial in pull.dials() {
            self.engine.registry().handle_for(*dial)?;
        }
        tracing::info!(pull = pull.name(), dials = pull.dimension(), "parameter pull added");
        self.pulls.push(pull);
        Ok(())
    }

    pub fn set_aggregation(&mut self, mode: AggregationMode) -> FitResult<()> {
        let mut aggregator = ChiSquareAggregator::new(mode);
        aggregator.assemble(&self.samples)?;
        self.aggregator = aggregator;
        Ok(())
    }

    pub fn set_iteration_log(&mut self, enabled: bool) {
        self.iteration_log = enabled.then(Vec::new);
    }

    pub fn set_consistency_check(&mut self, enabled: bool) {
        self.consistency_check = enabled;
    }

    pub fn compute_event_weight(&mut self, event: &Event) -> EvalResult<f64> {
        self.engine.compute_event_weight(event)
    }

    /// Objective entry point: applies `values`, refreshes every sample along
    /// one recomputation path and returns the total statistic.
    pub fn propose_parameters(&mut self, values: &[f64]) -> EvalResult<f64> {
        let proposed = self.engine.update_from_vector(values)?;
        self.state.iteration += 1;
        let change = self.pending_change(proposed);
        if self.engine.registry().has_changed() {
            self.engine.reconfigure(true);
        }
        self.refresh(change, false)
    }

    /// Re-evaluates at `values` along the full path and logs the dial state.
    pub fn finalize(&mut self, values: &[f64]) -> EvalResult<f64> {
        let proposed = self.engine.update_from_vector(values)?;
        self.state.iteration += 1;
        let change = self.pending_change(proposed);
        self.engine.reconfigure(false);
        let statistic = self.refresh(change, true)?;
        tracing::info!(
            iteration = self.state.iteration,
            statistic,
            ndof = self.ndof(),
            "fit finalized"
        );
        Ok(statistic)
    }

    fn pending_change(&mut self, proposed: DialChange) -> DialChange {
        let registry = self.engine.registry();
        let change = DialChange {
            shape: proposed.shape || registry.has_shape_changed(),
            norm: proposed.norm || registry.has_changed(),
        };
        self.state.dials_changed = change.any();
        change
    }

    fn refresh(&mut self, change: DialChange, force_full: bool) -> EvalResult<f64> {
        let norms = self.current_norms()?;
        let paths = self.controller.dispatch(
            &mut self.state,
            &mut self.samples,
            &norms,
            &mut self.engine,
            change,
            force_full,
        )?;
        let breakdown =
            self.aggregator
                .evaluate(&self.samples, &self.pulls, self.engine.registry())?;

        if self.consistency_check && paths.contains(&ReconfigurePath::FullRefill) {
            self.check_fast_path(&norms, breakdown.total)?;
        }

        self.state.dial_values = self.engine.registry().values();
        tracing::debug!(
            iteration = self.state.iteration,
            statistic = breakdown.total,
            changed = self.state.dials_changed,
            "objective evaluated"
        );
        if let Some(log) = &mut self.iteration_log {
            log.push(IterationRecord {
                iteration: self.state.iteration,
                statistic: breakdown.total,
                paths: paths.clone(),
                entries: breakdown.to_map(),
                dials: self.state.dial_values.clone(),
            });
        }

        let total = breakdown.total;
        self.breakdown = breakdown;
        self.last_paths = paths;
        Ok(total)
    }

    fn current_norms(&self) -> EvalResult<Vec<f64>> {
        let registry = self.engine.registry();
        let mut norms = Vec::with_capacity(self.norm_dials.len());
        for id in &self.norm_dials {
            norms.push(registry.value(*id)?);
        }
        Ok(norms)
    }

    fn check_fast_path(&mut self, norms: &[f64], full: f64) -> EvalResult<()> {
        for (sample, &norm) in self.samples.iter_mut().zip(norms) {
            sample.reconfigure_fast(&mut self.engine, norm)?;
        }
        let fast = self
            .aggregator
            .evaluate(&self.samples, &self.pulls, self.engine.registry())?
            .total;
        if fast.to_bits() != full.to_bits() {
            return Err(EvaluationError::InconsistentFastPath { full, fast });
        }
        tracing::debug!(statistic = full, "fast refill agrees with full refill");
        Ok(())
    }

    pub fn breakdown(&self) -> &StatisticBreakdown {
        &self.breakdown
    }

    /// Per-entry statistic from the last evaluation: samples, pulls and, in
    /// joint mode, the cross-sample term.
    pub fn test_statistic_breakdown(&self) -> BTreeMap<String, f64> {
        self.breakdown.to_map()
    }

    pub fn last_paths(&self) -> &[ReconfigurePath] {
        &self.last_paths
    }

    pub fn ndof(&self) -> usize {
        let bins: usize = self.samples.iter().map(|sample| sample.ndof()).sum();
        let pulls: usize = self.pulls.iter().map(ParameterPull::dimension).sum();
        bins + pulls
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn registry(&self) -> &DialRegistry {
        self.engine.registry()
    }

    pub fn registry_mut(&mut self) -> &mut DialRegistry {
        self.engine.registry_mut()
    }

    pub fn samples(&self) -> &[Box<dyn Sample>] {
        &self.samples
    }

    pub fn pulls(&self) -> &[ParameterPull] {
        &self.pulls
    }

    pub fn aggregation(&self) -> &AggregationMode {
        self.aggregator.mode()
    }

    pub fn iteration_log(&self) -> Option<&[IterationRecord]> {
        self.iteration_log.as_deref()
    }

    pub fn write_iteration_log(&self, path: impl AsRef<Path>) -> FitResult<usize> {
        let path = path.as_ref();
        let records = self.iteration_log.as_deref().unwrap_or_default();
        let text = serde_json::to_string_pretty(records).map_err(|error| {
            FitError::internal("IO.ITERATION_LOG", format!("cannot encode log: {error}"))
        })?;
        fs::write(path, text).map_err(|error| {
            FitError::io_system(
                "IO.ITERATION_LOG",
                format!("cannot write '{}': {error}", path.display()),
            )
        })?;
        Ok(records.len())
    }

    pub fn load_coefficients(&mut self, path: impl AsRef<Path>) -> FitResult<usize> {
        let rows = self.engine.load_coefficients(path)?;
        self.state.mc_filled = false;
        Ok(rows)
    }

    pub fn save_coefficients(&self, path: impl AsRef<Path>) -> FitResult<usize> {
        self.engine.save_coefficients(path)
    }

    /// Generates coefficient rows for every spline-sourced event the samples
    /// hold, without evaluating the statistic.
    pub fn generate_coefficients(&mut self, events: &[Event]) -> EvalResult<usize> {
        let mut generated = 0;
        for event in events {
            if event.source == EventSource::Spline
                && !self.engine.registry().spline().has_coefficients(event.index)
            {
                self.engine.generate_coefficients(event)?;
                generated += 1;
            }
        }
        tracing::info!(
            generated,
            cached = self.engine.registry().spline().arena().len(),
            "spline coefficients generated"
        );
        Ok(generated)
    }
}
