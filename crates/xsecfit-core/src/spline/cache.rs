use super::{SplineCurve, SplineError, SplineForm};
use crate::domain::{DialId, FitError};
use std::collections::HashMap;
use std::ops::Range;

/// Slot 0 of every event row holds the nominal (dial-independent) weight.
pub const NOMINAL_SLOT: usize = 0;

/// Registered curves and the slice each one owns inside an event row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoefficientLayout {
    curves: Vec<SplineCurve>,
    slots: Vec<Range<usize>>,
    index: HashMap<(DialId, SplineForm), usize>,
    generation: u64,
}

impl CoefficientLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, curve: SplineCurve) -> Result<usize, FitError> {
        let key = (curve.dial(), curve.form());
        if self.index.contains_key(&key) {
            return Err(FitError::config(
                "CONFIG.DUPLICATE_CURVE",
                format!(
                    "dial {} already has a '{}' response curve",
                    curve.dial(),
                    curve.tag()
                ),
            ));
        }

        let start = self.stride();
        let slot = start..start + curve.parameter_count();
        let position = self.curves.len();
        self.index.insert(key, position);
        self.slots.push(slot);
        self.curves.push(curve);
        self.generation += 1;
        Ok(position)
    }

    pub fn curves(&self) -> &[SplineCurve] {
        &self.curves
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn slot(&self, position: usize) -> Option<Range<usize>> {
        self.slots.get(position).cloned()
    }

    pub fn slot_for(&self, dial: DialId, form: SplineForm) -> Option<Range<usize>> {
        self.index
            .get(&(dial, form))
            .and_then(|position| self.slot(*position))
    }

    pub fn references(&self, dial: DialId) -> bool {
        self.curves.iter().any(|curve| curve.dial() == dial)
    }

    /// Row length: one nominal slot plus every curve's parameter count.
    pub fn stride(&self) -> usize {
        self.slots.last().map_or(1, |slot| slot.end)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn curves_with_slots(&self) -> impl Iterator<Item = (&SplineCurve, Range<usize>)> + '_ {
        self.curves.iter().zip(self.slots.iter().cloned())
    }
}

/// Flat, fixed-stride storage of per-event coefficient rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientArena {
    stride: usize,
    generation: u64,
    values: Vec<f64>,
    rows: HashMap<usize, usize>,
    events: Vec<usize>,
}

impl CoefficientArena {
    pub fn new(layout: &CoefficientLayout) -> Self {
        Self {
            stride: layout.stride(),
            generation: layout.generation(),
            values: Vec::new(),
            rows: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn matches(&self, layout: &CoefficientLayout) -> bool {
        self.generation == layout.generation() && self.stride == layout.stride()
    }

    /// Drops every row when the curve set no longer matches `layout`.
    pub fn sync(&mut self, layout: &CoefficientLayout) -> bool {
        if self.matches(layout) {
            return false;
        }
        *self = Self::new(layout);
        true
    }

    pub fn contains(&self, event: usize) -> bool {
        self.rows.contains_key(&event)
    }

    pub fn row(&self, event: usize) -> Option<&[f64]> {
        let row = *self.rows.get(&event)?;
        let start = row * self.stride;
        Some(&self.values[start..start + self.stride])
    }

    pub fn nominal(&self, event: usize) -> Option<f64> {
        self.row(event).map(|row| row[NOMINAL_SLOT])
    }

    pub fn insert(&mut self, event: usize, coefficients: &[f64]) -> Result<(), SplineError> {
        if coefficients.len() != self.stride {
            return Err(SplineError::CoefficientCount {
                tag: format!("event {event} row"),
                expected: self.stride,
                actual: coefficients.len(),
            });
        }

        match self.rows.get(&event) {
            Some(&row) => {
                let start = row * self.stride;
                self.values[start..start + self.stride].copy_from_slice(coefficients);
            }
            None => {
                self.rows.insert(event, self.events.len());
                self.events.push(event);
                self.values.extend_from_slice(coefficients);
            }
        }
        Ok(())
    }

    /// Rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[f64])> + '_ {
        self.events
            .iter()
            .zip(self.values.chunks_exact(self.stride.max(1)))
            .map(|(event, row)| (*event, row))
    }
}

#[cfg(test)]
mod tests {
    use super::{CoefficientArena, CoefficientLayout};
    use crate::domain::{DialId, DialNamespace, FitErrorCategory};
    use crate::spline::{SplineCurve, SplineError, SplineForm};

    fn curve(local: u32, tag: &str, scan: &str) -> SplineCurve {
        SplineCurve::configure(DialId::new(DialNamespace::Neut, local), tag, scan).expect("curve")
    }

    #[test]
    fn layout_assigns_contiguous_slots_after_nominal() {
        let mut layout = CoefficientLayout::new();
        assert_eq!(layout.stride(), 1);
        layout.push(curve(1, "1Dpol2", "PNTS:-1,0,1")).expect("first");
        layout.push(curve(2, "1DTSpline3", "SCAN:3,-1,1")).expect("second");
        layout.push(curve(1, "1Dpol1C", "PNTS:-1,1")).expect("third");

        assert_eq!(layout.slot(0), Some(1..3));
        assert_eq!(layout.slot(1), Some(3..15));
        assert_eq!(layout.slot(2), Some(15..17));
        assert_eq!(layout.stride(), 17);
        assert_eq!(
            layout.slot_for(
                DialId::new(DialNamespace::Neut, 2),
                SplineForm::CubicSpline
            ),
            Some(3..15)
        );
        let stacked: usize = layout.curves().iter().map(SplineCurve::parameter_count).sum();
        assert_eq!(stacked + 1, layout.stride());
    }

    #[test]
    fn duplicate_curves_are_configuration_errors() {
        let mut layout = CoefficientLayout::new();
        layout.push(curve(1, "1Dpol2", "PNTS:-1,0,1")).expect("first");
        let error = layout
            .push(curve(1, "1Dpol2", "PNTS:-2,0,2"))
            .expect_err("duplicate");
        assert_eq!(error.category(), FitErrorCategory::ConfigError);
    }

    #[test]
    fn arena_rows_are_fixed_stride_and_invalidated_by_layout_changes() {
        let mut layout = CoefficientLayout::new();
        layout.push(curve(1, "1Dpol1", "PNTS:-1,1")).expect("curve");
        let mut arena = CoefficientArena::new(&layout);

        arena.insert(7, &[2.0, 0.1]).expect("row");
        arena.insert(3, &[1.0, -0.2]).expect("row");
        assert_eq!(arena.row(7), Some(&[2.0, 0.1][..]));
        assert_eq!(arena.nominal(3), Some(1.0));
        assert_eq!(arena.iter().map(|(event, _)| event).collect::<Vec<_>>(), vec![7, 3]);
        assert!(matches!(
            arena.insert(9, &[1.0]),
            Err(SplineError::CoefficientCount {
                expected: 2,
                actual: 1,
                ..
            })
        ));

        arena.insert(7, &[4.0, 0.3]).expect("overwrite");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.row(7), Some(&[4.0, 0.3][..]));

        assert!(!arena.sync(&layout));
        layout.push(curve(2, "1Dpol1", "PNTS:-1,1")).expect("curve");
        assert!(arena.sync(&layout));
        assert!(arena.is_empty());
        assert_eq!(arena.stride(), 3);
    }
}
