use super::WeightCalculator;
use crate::domain::{DialId, DialNamespace, Event, FitError, FitResult};
use crate::numerics::interpolate_linear;
use crate::numerics::interpolation::validate_grid;
use std::collections::{BTreeSet, HashMap};

/// Weight ratio as a piecewise-linear function of one dial value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTable {
    values: Vec<f64>,
    ratios: Vec<f64>,
}

impl ResponseTable {
    pub fn new(values: Vec<f64>, ratios: Vec<f64>) -> FitResult<Self> {
        validate_grid(&values, &ratios, 1)
            .map_err(|error| FitError::config("CONFIG.RESPONSE_TABLE", error.to_string()))?;
        Ok(Self { values, ratios })
    }

    /// Ratio at `value`; flat outside the tabulated range.
    pub fn ratio_at(&self, value: f64) -> f64 {
        interpolate_linear(value, &self.values, &self.ratios).unwrap_or(f64::NAN)
    }
}

/// Generator-native calculator backed by per-event tabulated responses.
///
/// Values written with `set_dial_value` only take effect after
/// `reconfigure`, like a generator reweighting library.
#[derive(Debug, Clone, Default)]
pub struct TabulatedResponseCalculator {
    name: String,
    namespaces: Vec<DialNamespace>,
    tables: HashMap<usize, Vec<(DialId, ResponseTable)>>,
    pending: HashMap<DialId, f64>,
    active: HashMap<DialId, f64>,
    reconfigurations: u64,
}

impl TabulatedResponseCalculator {
    pub fn new(name: impl Into<String>, namespaces: Vec<DialNamespace>) -> Self {
        Self {
            name: name.into(),
            namespaces,
            ..Self::default()
        }
    }

    pub fn add_response(
        &mut self,
        event: usize,
        dial: DialId,
        table: ResponseTable,
    ) -> FitResult<()> {
        if !self.handles(dial) {
            return Err(FitError::config(
                "CONFIG.RESPONSE_NAMESPACE",
                format!(
                    "calculator '{}' does not serve dial {dial} (namespaces: {:?})",
                    self.name, self.namespaces
                ),
            ));
        }
        let responses = self.tables.entry(event).or_default();
        if responses.iter().any(|(existing, _)| *existing == dial) {
            return Err(FitError::config(
                "CONFIG.RESPONSE_TABLE",
                format!("event {event} already has a response for dial {dial}"),
            ));
        }
        responses.push((dial, table));
        Ok(())
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }
}

impl WeightCalculator for TabulatedResponseCalculator {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, dial: DialId) -> bool {
        self.namespaces.contains(&dial.namespace())
    }

    fn set_dial_value(&mut self, dial: DialId, value: f64) {
        self.pending.insert(dial, value);
    }

    fn reconfigure(&mut self) {
        self.active.clone_from(&self.pending);
        self.reconfigurations += 1;
    }

    fn calc_weight(&self, event: &Event) -> f64 {
        let Some(responses) = self.tables.get(&event.index) else {
            return 1.0;
        };
        responses
            .iter()
            .filter_map(|(dial, table)| {
                self.active
                    .get(dial)
                    .map(|value| table.ratio_at(*value))
            })
            .product()
    }

    fn required_dials(&self) -> Vec<DialId> {
        self.tables
            .values()
            .flatten()
            .map(|(dial, _)| *dial)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{ResponseTable, TabulatedResponseCalculator};
    use crate::domain::{DialId, DialNamespace, Event, FitErrorCategory};
    use crate::weights::WeightCalculator;

    #[test]
    fn values_apply_only_after_reconfigure() {
        let dial = DialId::new(DialNamespace::Neut, 1);
        let mut calculator = TabulatedResponseCalculator::new("neut", vec![DialNamespace::Neut]);
        calculator
            .add_response(
                0,
                dial,
                ResponseTable::new(vec![-1.0, 0.0, 1.0], vec![0.5, 1.0, 2.0]).expect("table"),
            )
            .expect("response");
        let event = Event::new(0, 1, vec![]);

        calculator.set_dial_value(dial, 0.5);
        assert_eq!(calculator.calc_weight(&event), 1.0);
        calculator.reconfigure();
        assert!((calculator.calc_weight(&event) - 1.5).abs() < 1.0e-12);
        calculator.set_dial_value(dial, 4.0);
        calculator.reconfigure();
        assert_eq!(calculator.calc_weight(&event), 2.0);
        assert_eq!(calculator.reconfigurations(), 2);

        assert_eq!(calculator.calc_weight(&Event::new(5, 1, vec![])), 1.0);
        assert_eq!(calculator.required_dials(), vec![dial]);
    }

    #[test]
    fn rejects_foreign_namespaces_and_bad_tables() {
        let mut calculator = TabulatedResponseCalculator::new("neut", vec![DialNamespace::Neut]);
        let table = ResponseTable::new(vec![0.0], vec![1.0]).expect("table");
        let error = calculator
            .add_response(0, DialId::new(DialNamespace::Genie, 1), table)
            .expect_err("foreign namespace");
        assert_eq!(error.category(), FitErrorCategory::ConfigError);

        let error = ResponseTable::new(vec![1.0, 0.0], vec![1.0, 1.0]).expect_err("unsorted");
        assert_eq!(error.placeholder(), "CONFIG.RESPONSE_TABLE");
    }
}
