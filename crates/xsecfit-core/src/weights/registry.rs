use super::WeightCalculator;
use super::spline_calc::SplineWeightCalculator;
use crate::domain::{
    DialId, EvalResult, EvaluationError, FitError, FitResult, NAMESPACE_STRIDE, TweakConvention,
};
use crate::numerics::within_tolerance;
use crate::spline::SplineCurve;
use std::collections::HashMap;

/// Moves smaller than this (absolute, or relative above 1) are not changes.
pub const DEFAULT_CHANGE_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialHandle(usize);

impl DialHandle {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Registration request for one dial.
#[derive(Debug, Clone, PartialEq)]
pub struct DialSpec {
    pub name: String,
    pub id: DialId,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
    pub fixed: bool,
    pub convention: TweakConvention,
    pub nominal: f64,
}

impl DialSpec {
    pub fn new(name: impl Into<String>, id: DialId, initial: f64) -> Self {
        Self {
            name: name.into(),
            id,
            initial,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            fixed: false,
            convention: TweakConvention::Absolute,
            nominal: 0.0,
        }
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn with_convention(mut self, convention: TweakConvention, nominal: f64) -> Self {
        self.convention = convention;
        self.nominal = nominal;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dial {
    pub id: DialId,
    pub name: String,
    pub value: f64,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
    pub fixed: bool,
    pub convention: TweakConvention,
    pub nominal: f64,
    changed: bool,
}

impl Dial {
    pub fn physical_value(&self) -> f64 {
        self.convention.physical_value(self.value, self.nominal)
    }

    pub fn is_normalization(&self) -> bool {
        self.id.namespace().is_normalization()
    }

    pub fn has_changed(&self) -> bool {
        self.changed
    }
}

/// Which kinds of dial moved in one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DialChange {
    pub shape: bool,
    pub norm: bool,
}

impl DialChange {
    pub const fn any(self) -> bool {
        self.shape || self.norm
    }
}

/// Current dial values, their calculator bindings, and change tracking.
#[derive(Debug)]
pub struct DialRegistry {
    dials: Vec<Dial>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<DialId, usize>,
    natives: Vec<Box<dyn WeightCalculator>>,
    spline: SplineWeightCalculator,
    tolerance: f64,
    reconfigurations: u64,
}

impl Default for DialRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DialRegistry {
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_CHANGE_TOLERANCE)
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            dials: Vec::new(),
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            natives: Vec::new(),
            spline: SplineWeightCalculator::new(),
            tolerance,
            reconfigurations: 0,
        }
    }

    pub fn register(&mut self, spec: DialSpec) -> FitResult<DialHandle> {
        if spec.name.trim().is_empty() {
            return Err(FitError::config("CONFIG.DIAL_NAME", "dial name is empty"));
        }
        if self.by_name.contains_key(&spec.name) {
            return Err(FitError::config(
                "CONFIG.DUPLICATE_DIAL",
                format!("dial '{}' is already registered", spec.name),
            ));
        }
        if spec.id.local() >= NAMESPACE_STRIDE {
            return Err(FitError::config(
                "CONFIG.DIAL_INDEX",
                format!(
                    "dial '{}' has index {} outside its {} block (limit {})",
                    spec.name,
                    spec.id.local(),
                    spec.id.namespace(),
                    NAMESPACE_STRIDE - 1
                ),
            ));
        }
        if let Some(existing) = self.by_id.get(&spec.id) {
            return Err(FitError::config(
                "CONFIG.DUPLICATE_DIAL",
                format!(
                    "dial id {} is already registered as '{}'",
                    spec.id, self.dials[*existing].name
                ),
            ));
        }
        if !spec.initial.is_finite() || spec.lower.is_nan() || spec.upper.is_nan() {
            return Err(FitError::config(
                "CONFIG.DIAL_VALUE",
                format!("dial '{}' has a non-finite initial value or bound", spec.name),
            ));
        }
        if spec.lower > spec.upper {
            return Err(FitError::config(
                "CONFIG.DIAL_BOUNDS",
                format!(
                    "dial '{}' has lower bound {} above upper bound {}",
                    spec.name, spec.lower, spec.upper
                ),
            ));
        }

        let index = self.dials.len();
        self.by_name.insert(spec.name.clone(), index);
        self.by_id.insert(spec.id, index);
        self.dials.push(Dial {
            id: spec.id,
            name: spec.name,
            value: spec.initial,
            initial: spec.initial,
            lower: spec.lower,
            upper: spec.upper,
            fixed: spec.fixed,
            convention: spec.convention,
            nominal: spec.nominal,
            changed: true,
        });
        self.write_through(index);

        let dial = &self.dials[index];
        tracing::info!(
            dial = %dial.name,
            id = dial.id.as_enum(),
            initial = dial.value,
            fixed = dial.fixed,
            "dial registered"
        );
        Ok(DialHandle(index))
    }

    pub fn add_native(&mut self, calculator: Box<dyn WeightCalculator>) {
        tracing::info!(calculator = calculator.name(), "native calculator bound");
        self.natives.push(calculator);
        let index = self.natives.len() - 1;
        for dial in &self.dials {
            if self.natives[index].handles(dial.id) {
                self.natives[index].set_dial_value(dial.id, dial.value);
            }
        }
        self.mark_all_changed();
    }

    pub fn add_response_curve(
        &mut self,
        handle: DialHandle,
        form: &str,
        scan_definition: &str,
    ) -> FitResult<usize> {
        let dial = self.dial(handle)?;
        if dial.is_normalization() {
            return Err(FitError::config(
                "CONFIG.NORM_CURVE",
                format!("normalization dial '{}' cannot carry a response curve", dial.name),
            ));
        }
        let (id, name, value) = (dial.id, dial.name.clone(), dial.value);

        let curve = SplineCurve::configure(id, form, scan_definition)?;
        let parameters = curve.parameter_count();
        let position = self.spline.add_curve(curve)?;
        self.spline.set_dial_value(id, value);
        self.dials[handle.0].changed = true;

        tracing::info!(dial = %name, form, scan = scan_definition, parameters, "response curve added");
        Ok(position)
    }

    pub fn handle(&self, name: &str) -> FitResult<DialHandle> {
        self.by_name.get(name).copied().map(DialHandle).ok_or_else(|| {
            FitError::dial_not_found("DIAL.LOOKUP", format!("no dial named '{name}'"))
        })
    }

    pub fn handle_for(&self, id: DialId) -> FitResult<DialHandle> {
        self.by_id
            .get(&id)
            .copied()
            .map(DialHandle)
            .ok_or_else(|| FitError::dial_not_found("DIAL.LOOKUP", format!("no dial with id {id}")))
    }

    pub fn contains(&self, id: DialId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn dial(&self, handle: DialHandle) -> FitResult<&Dial> {
        self.dials.get(handle.0).ok_or_else(|| {
            FitError::dial_not_found(
                "DIAL.LOOKUP",
                format!("dial handle {} is out of range", handle.0),
            )
        })
    }

    pub fn dials(&self) -> &[Dial] {
        &self.dials
    }

    pub fn len(&self) -> usize {
        self.dials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dials.is_empty()
    }

    pub fn value(&self, id: DialId) -> FitResult<f64> {
        let handle = self.handle_for(id)?;
        Ok(self.dials[handle.0].value)
    }

    pub fn values(&self) -> Vec<f64> {
        self.dials.iter().map(|dial| dial.value).collect()
    }

    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.dials.iter().map(|dial| (dial.lower, dial.upper)).collect()
    }

    /// Stores `value` and writes it through to every bound calculator.
    /// Returns whether the dial moved beyond the change tolerance.
    pub fn set_dial_value(&mut self, id: DialId, value: f64) -> FitResult<bool> {
        let handle = self.handle_for(id)?;
        Ok(self.set_value_at(handle.0, value))
    }

    fn set_value_at(&mut self, index: usize, value: f64) -> bool {
        let previous = self.dials[index].value;
        if within_tolerance(previous, value, self.tolerance, self.tolerance, 1.0) {
            return false;
        }
        let dial = &mut self.dials[index];
        dial.value = value;
        dial.changed = true;
        self.write_through(index);
        true
    }

    /// Applies a full proposal vector (one entry per registered dial, in
    /// registration order). Fixed dials keep their value.
    pub fn update_from_vector(&mut self, values: &[f64]) -> EvalResult<DialChange> {
        if values.len() != self.dials.len() {
            return Err(EvaluationError::ParameterCount {
                expected: self.dials.len(),
                actual: values.len(),
            });
        }

        let mut change = DialChange::default();
        for (index, &value) in values.iter().enumerate() {
            if self.dials[index].fixed {
                continue;
            }
            if self.set_value_at(index, value) {
                if self.dials[index].is_normalization() {
                    change.norm = true;
                } else {
                    change.shape = true;
                }
            }
        }
        Ok(change)
    }

    pub fn has_changed(&self) -> bool {
        self.dials.iter().any(|dial| dial.changed)
    }

    pub fn has_shape_changed(&self) -> bool {
        self.dials
            .iter()
            .any(|dial| dial.changed && !dial.is_normalization())
    }

    /// Pushes every current value into every calculator and clears the
    /// change flags. Repeating it without a new value is a no-op.
    pub fn reconfigure(&mut self, silent: bool) {
        for index in 0..self.dials.len() {
            self.write_through(index);
        }
        for calculator in &mut self.natives {
            calculator.reconfigure();
        }
        self.spline.reconfigure();
        for dial in &mut self.dials {
            dial.changed = false;
        }
        self.reconfigurations += 1;

        if silent {
            return;
        }
        tracing::info!(dials = self.dials.len(), "dial state");
        for dial in &self.dials {
            tracing::info!(
                dial = %dial.name,
                id = dial.id.as_enum(),
                value = dial.value,
                physical = dial.physical_value(),
                fixed = dial.fixed,
                "  dial"
            );
        }
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    pub fn spline(&self) -> &SplineWeightCalculator {
        &self.spline
    }

    pub fn spline_mut(&mut self) -> &mut SplineWeightCalculator {
        &mut self.spline
    }

    pub fn natives(&self) -> &[Box<dyn WeightCalculator>] {
        &self.natives
    }

    pub(crate) fn parts_mut(
        &mut self,
    ) -> (
        &[Dial],
        &mut [Box<dyn WeightCalculator>],
        &mut SplineWeightCalculator,
    ) {
        (&self.dials, &mut self.natives, &mut self.spline)
    }

    fn mark_all_changed(&mut self) {
        for dial in &mut self.dials {
            dial.changed = true;
        }
    }

    fn write_through(&mut self, index: usize) {
        let dial = &self.dials[index];
        for calculator in &mut self.natives {
            if calculator.handles(dial.id) {
                calculator.set_dial_value(dial.id, dial.value);
            }
        }
        if self.spline.handles(dial.id) {
            self.spline.set_dial_value(dial.id, dial.value);
        }
    }
}
