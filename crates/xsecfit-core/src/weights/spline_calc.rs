use super::WeightCalculator;
use crate::domain::{DialId, Event, EventSource, FitError, FitResult};
use crate::spline::cache::NOMINAL_SLOT;
use crate::spline::{CoefficientArena, CoefficientLayout, SplineCurve};
use std::collections::HashMap;

/// Evaluates cached response curves: `nominal * prod_k curve_k(dial_k)`.
#[derive(Debug, Clone)]
pub struct SplineWeightCalculator {
    layout: CoefficientLayout,
    arena: CoefficientArena,
    pending: HashMap<DialId, f64>,
    active: HashMap<DialId, f64>,
}

impl Default for SplineWeightCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl SplineWeightCalculator {
    pub fn new() -> Self {
        let layout = CoefficientLayout::new();
        let arena = CoefficientArena::new(&layout);
        Self {
            layout,
            arena,
            pending: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn add_curve(&mut self, curve: SplineCurve) -> FitResult<usize> {
        let position = self.layout.push(curve)?;
        if self.arena.sync(&self.layout) {
            tracing::debug!(
                stride = self.layout.stride(),
                "curve set changed, coefficient cache invalidated"
            );
        }
        Ok(position)
    }

    pub fn layout(&self) -> &CoefficientLayout {
        &self.layout
    }

    pub fn arena(&self) -> &CoefficientArena {
        &self.arena
    }

    pub fn has_coefficients(&self, event: usize) -> bool {
        self.arena.contains(event)
    }

    pub fn store_row(&mut self, event: usize, row: &[f64]) -> FitResult<()> {
        self.arena.insert(event, row)?;
        Ok(())
    }

    /// Swaps in a previously persisted cache built for the same curve set.
    pub fn replace_arena(&mut self, arena: CoefficientArena) -> FitResult<()> {
        if !arena.matches(&self.layout) {
            return Err(FitError::config(
                "CONFIG.SPLINE_CACHE_HEADER",
                "coefficient cache was built for a different curve set",
            ));
        }
        self.arena = arena;
        Ok(())
    }

    pub fn active_value(&self, dial: DialId) -> f64 {
        self.active.get(&dial).copied().unwrap_or(0.0)
    }

    pub fn weight_from_row(&self, row: &[f64]) -> f64 {
        self.layout
            .curves_with_slots()
            .fold(row[NOMINAL_SLOT], |weight, (curve, slot)| {
                weight * curve.evaluate(self.active_value(curve.dial()), &row[slot])
            })
    }
}

impl WeightCalculator for SplineWeightCalculator {
    fn name(&self) -> &str {
        "spline"
    }

    fn handles(&self, dial: DialId) -> bool {
        self.layout.references(dial)
    }

    fn set_dial_value(&mut self, dial: DialId, value: f64) {
        self.pending.insert(dial, value);
    }

    fn reconfigure(&mut self) {
        self.active.clone_from(&self.pending);
    }

    fn calc_weight(&self, event: &Event) -> f64 {
        if event.source != EventSource::Spline {
            return 1.0;
        }
        match self.arena.row(event.index) {
            Some(row) => self.weight_from_row(row),
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SplineWeightCalculator;
    use crate::domain::{DialId, DialNamespace, Event, EventSource};
    use crate::spline::SplineCurve;
    use crate::weights::WeightCalculator;

    #[test]
    fn weight_is_nominal_times_every_curve() {
        let first = DialId::new(DialNamespace::Neut, 1);
        let second = DialId::new(DialNamespace::Genie, 2);
        let mut calculator = SplineWeightCalculator::new();
        calculator
            .add_curve(SplineCurve::configure(first, "1Dpol1", "PNTS:-1,1").expect("curve"))
            .expect("first");
        calculator
            .add_curve(SplineCurve::configure(second, "1Dpol2C", "PNTS:-1,0,1").expect("curve"))
            .expect("second");
        calculator
            .store_row(4, &[2.0, 0.5, 1.0, 0.2, 0.1])
            .expect("row");

        calculator.set_dial_value(first, 0.4);
        calculator.set_dial_value(second, -0.5);
        let event = Event::new(4, 1, vec![0.3]).with_source(EventSource::Spline);
        // pending values are not visible until reconfigure
        assert_eq!(calculator.calc_weight(&event), 2.0);

        calculator.reconfigure();
        let expected = 2.0 * (1.0 + 0.5 * 0.4) * (1.0 + 0.2 * -0.5 + 0.1 * 0.25);
        assert!((calculator.calc_weight(&event) - expected).abs() < 1.0e-12);
    }

    #[test]
    fn unfilled_and_foreign_events() {
        let dial = DialId::new(DialNamespace::Neut, 1);
        let mut calculator = SplineWeightCalculator::new();
        calculator
            .add_curve(SplineCurve::configure(dial, "1Dpol1", "PNTS:-1,1").expect("curve"))
            .expect("curve");
        let native = Event::new(1, 1, vec![]);
        assert_eq!(calculator.calc_weight(&native), 1.0);
        let unfilled = Event::new(1, 1, vec![]).with_source(EventSource::Spline);
        assert_eq!(calculator.calc_weight(&unfilled), 0.0);
    }
}
