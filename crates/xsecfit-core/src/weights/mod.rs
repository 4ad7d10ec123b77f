pub mod native;
pub mod registry;
pub mod spline_calc;

pub use native::{ResponseTable, TabulatedResponseCalculator};
pub use registry::{Dial, DialChange, DialHandle, DialRegistry, DialSpec};
pub use spline_calc::SplineWeightCalculator;

use crate::domain::{DialId, EvalResult, EvaluationError, Event, EventSource, FitResult};
use crate::spline::{read_coefficient_table, write_coefficient_table};
use std::fmt::Debug;
use std::path::Path;

/// One source of per-event weights driven by dial values.
pub trait WeightCalculator: Debug {
    fn name(&self) -> &str;

    fn handles(&self, dial: DialId) -> bool;

    fn set_dial_value(&mut self, dial: DialId, value: f64);

    /// Makes values written since the last call visible to `calc_weight`.
    fn reconfigure(&mut self);

    /// Calculators with no response for `event` keep the unit default.
    fn calc_weight(&self, _event: &Event) -> f64 {
        1.0
    }

    fn required_dials(&self) -> Vec<DialId> {
        Vec::new()
    }
}

/// What a sample needs to refill itself.
pub trait EventWeigher {
    fn compute_event_weight(&mut self, event: &Event) -> EvalResult<f64>;
}

/// Routes events to the native or spline calculators and generates missing
/// spline coefficients on first use.
#[derive(Debug, Default)]
pub struct WeightEngine {
    registry: DialRegistry,
    dials_validated: bool,
}

impl WeightEngine {
    pub fn new(registry: DialRegistry) -> Self {
        Self {
            registry,
            dials_validated: false,
        }
    }

    pub fn registry(&self) -> &DialRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DialRegistry {
        self.dials_validated = false;
        &mut self.registry
    }

    pub fn add_native(&mut self, calculator: Box<dyn WeightCalculator>) {
        self.registry_mut().add_native(calculator);
    }

    /// Applies a minimizer proposal without invalidating the dial check.
    pub fn update_from_vector(&mut self, values: &[f64]) -> EvalResult<DialChange> {
        self.registry.update_from_vector(values)
    }

    pub fn reconfigure(&mut self, silent: bool) {
        self.registry.reconfigure(silent);
    }

    pub fn load_coefficients(&mut self, path: impl AsRef<Path>) -> FitResult<usize> {
        let arena = read_coefficient_table(path, self.registry.spline().layout())?;
        let rows = arena.len();
        self.registry.spline_mut().replace_arena(arena)?;
        Ok(rows)
    }

    pub fn save_coefficients(&self, path: impl AsRef<Path>) -> FitResult<usize> {
        let spline = self.registry.spline();
        Ok(write_coefficient_table(path, spline.layout(), spline.arena())?)
    }

    /// Fills the coefficient row of a spline-sourced event by scanning every
    /// curve's knots through the native calculators.
    ///
    /// The native calculators are evaluated with every dial at its initial
    /// value, then restored; registry change flags are left untouched.
    pub fn generate_coefficients(&mut self, event: &Event) -> EvalResult<()> {
        let (dials, natives, spline) = self.registry.parts_mut();
        if spline.has_coefficients(event.index) {
            return Ok(());
        }

        let baseline = |natives: &mut [Box<dyn WeightCalculator>], id: DialId, value: f64| {
            for calculator in natives.iter_mut() {
                if calculator.handles(id) {
                    calculator.set_dial_value(id, value);
                }
            }
        };
        let native_weight = |natives: &mut [Box<dyn WeightCalculator>]| -> EvalResult<f64> {
            let mut weight = event.input_weight;
            for calculator in natives.iter_mut() {
                calculator.reconfigure();
                let factor = calculator.calc_weight(event);
                if !factor.is_finite() {
                    return Err(EvaluationError::NonFiniteWeight {
                        calculator: calculator.name().to_string(),
                        event: event.index,
                        value: factor,
                    });
                }
                weight *= factor;
            }
            Ok(weight)
        };

        for dial in dials {
            baseline(natives, dial.id, dial.initial);
        }
        let outcome = (|| -> EvalResult<Vec<f64>> {
            let nominal = native_weight(natives)?;
            let mut row = Vec::with_capacity(spline.layout().stride());
            row.push(nominal);

            for curve in spline.layout().curves() {
                let initial = dials
                    .iter()
                    .find(|dial| dial.id == curve.dial())
                    .map_or(0.0, |dial| dial.initial);
                let mut ratios = Vec::with_capacity(curve.knots().len());
                for &knot in curve.knots() {
                    baseline(natives, curve.dial(), knot);
                    let weight = native_weight(natives)?;
                    ratios.push(if nominal == 0.0 { 1.0 } else { weight / nominal });
                }
                baseline(natives, curve.dial(), initial);

                let block = curve.fit_coefficients(&ratios).map_err(|error| {
                    EvaluationError::CoefficientGeneration {
                        event: event.index,
                        reason: format!("{} curve on dial {}: {error}", curve.tag(), curve.dial()),
                    }
                })?;
                row.extend(block);
            }
            Ok(row)
        })();

        for dial in dials {
            baseline(natives, dial.id, dial.value);
        }
        for calculator in natives.iter_mut() {
            calculator.reconfigure();
        }

        let row = outcome?;
        spline.store_row(event.index, &row)?;
        tracing::trace!(event = event.index, nominal = row[0], "spline coefficients generated");
        Ok(())
    }

    fn validate_required_dials(&mut self) -> EvalResult<()> {
        if self.dials_validated {
            return Ok(());
        }
        for calculator in self.registry.natives() {
            for id in calculator.required_dials() {
                if !self.registry.contains(id) {
                    return Err(EvaluationError::UnknownDial { id });
                }
            }
        }
        self.dials_validated = true;
        Ok(())
    }
}

impl EventWeigher for WeightEngine {
    fn compute_event_weight(&mut self, event: &Event) -> EvalResult<f64> {
        self.validate_required_dials()?;
        if self.registry.has_changed() {
            self.registry.reconfigure(true);
        }

        let (calculator, weight) = match event.source {
            EventSource::Native => {
                let mut weight = event.input_weight;
                for calculator in self.registry.natives() {
                    let factor = calculator.calc_weight(event);
                    if !factor.is_finite() {
                        return Err(EvaluationError::NonFiniteWeight {
                            calculator: calculator.name().to_string(),
                            event: event.index,
                            value: factor,
                        });
                    }
                    weight *= factor;
                }
                ("native", weight)
            }
            EventSource::Spline => {
                self.generate_coefficients(event)?;
                ("spline", self.registry.spline().calc_weight(event))
            }
        };

        if !weight.is_finite() {
            return Err(EvaluationError::NonFiniteWeight {
                calculator: calculator.to_string(),
                event: event.index,
                value: weight,
            });
        }
        tracing::trace!(event = event.index, calculator, weight, "event weight");
        Ok(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DialRegistry, DialSpec, EventWeigher, ResponseTable, TabulatedResponseCalculator,
        WeightEngine,
    };
    use crate::domain::{DialId, DialNamespace, EvaluationError, Event, EventSource};

    const MA: DialId = DialId::new(DialNamespace::Neut, 1);

    fn engine_with_table() -> WeightEngine {
        let mut registry = DialRegistry::new();
        let handle = registry
            .register(DialSpec::new("MaCCQE", MA, 0.0))
            .expect("dial");
        registry
            .add_response_curve(handle, "1DTSpline3", "SCAN:5,-2,2")
            .expect("curve");

        let mut native = TabulatedResponseCalculator::new("neut", vec![DialNamespace::Neut]);
        for event in 0..2 {
            native
                .add_response(
                    event,
                    MA,
                    ResponseTable::new(vec![-2.0, 0.0, 2.0], vec![0.6, 1.0, 1.8]).expect("table"),
                )
                .expect("response");
        }
        registry.add_native(Box::new(native));
        WeightEngine::new(registry)
    }

    #[test]
    fn native_events_multiply_input_weight_and_responses() {
        let mut engine = engine_with_table();
        engine
            .registry_mut()
            .set_dial_value(MA, 1.0)
            .expect("set");
        let event = Event::new(0, 1, vec![]).with_input_weight(2.0);
        let weight = engine.compute_event_weight(&event).expect("weight");
        assert!((weight - 2.0 * 1.4).abs() < 1.0e-12);
    }

    #[test]
    fn spline_events_generate_coefficients_lazily_and_match_native_at_knots() {
        let mut engine = engine_with_table();
        let event = Event::new(1, 1, vec![])
            .with_input_weight(3.0)
            .with_source(EventSource::Spline);
        assert!(!engine.registry().spline().has_coefficients(1));

        engine.registry_mut().reconfigure(true);
        engine
            .registry_mut()
            .set_dial_value(MA, 2.0)
            .expect("set");
        let weight = engine.compute_event_weight(&event).expect("weight");
        assert!(engine.registry().spline().has_coefficients(1));
        assert!((weight - 3.0 * 1.8).abs() < 1.0e-10, "{weight}");
        assert_eq!(engine.registry().spline().arena().nominal(1), Some(3.0));

        // generation restores the native calculators to the current value
        let native = Event::new(1, 1, vec![]);
        let weight = engine.compute_event_weight(&native).expect("native");
        assert!((weight - 1.8).abs() < 1.0e-12);
        assert!(!engine.registry().has_changed());
    }

    #[test]
    fn unregistered_native_dials_fail_at_first_use() {
        let mut registry = DialRegistry::new();
        let mut native = TabulatedResponseCalculator::new("genie", vec![DialNamespace::Genie]);
        let missing = DialId::new(DialNamespace::Genie, 12);
        native
            .add_response(0, missing, ResponseTable::new(vec![0.0], vec![1.0]).expect("table"))
            .expect("response");
        registry.add_native(Box::new(native));
        let mut engine = WeightEngine::new(registry);

        let error = engine
            .compute_event_weight(&Event::new(0, 1, vec![]))
            .expect_err("unknown dial");
        assert_eq!(error, EvaluationError::UnknownDial { id: missing });
    }

    #[test]
    fn non_finite_native_weights_abort() {
        let mut engine = engine_with_table();
        engine
            .registry_mut()
            .set_dial_value(MA, 0.5)
            .expect("set");
        let event = Event::new(0, 1, vec![]).with_input_weight(f64::INFINITY);
        let error = engine.compute_event_weight(&event).expect_err("non-finite");
        assert!(matches!(error, EvaluationError::NonFiniteWeight { event: 0, .. }));
    }
}
