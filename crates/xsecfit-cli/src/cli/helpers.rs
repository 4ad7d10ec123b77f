use super::CliError;
use anyhow::Context;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use xsecfit_core::config::{FitSetup, build_objective, load_fit_card};
use xsecfit_core::domain::FitError;
use xsecfit_core::weights::DialRegistry;

#[derive(Debug, Serialize)]
pub(super) struct DialReport {
    pub(super) name: String,
    pub(super) id: u32,
    pub(super) value: f64,
    pub(super) physical: f64,
    pub(super) fixed: bool,
}

/// Loads and assembles a card; an existing spline cache next to it is
/// read before any evaluation.
pub(super) fn load_setup(card_path: &Path) -> Result<FitSetup, CliError> {
    let card = load_fit_card(card_path).map_err(FitError::from)?;
    let mut setup = build_objective(&card)?;
    if let Some(cache) = spline_cache_path(card_path, &setup) {
        if cache.exists() {
            let rows = setup.objective.load_coefficients(&cache)?;
            tracing::info!(path = %cache.display(), rows, "spline cache loaded");
        }
    }
    Ok(setup)
}

pub(super) fn spline_cache_path(card_path: &Path, setup: &FitSetup) -> Option<PathBuf> {
    setup
        .spline_cache
        .as_deref()
        .map(|cache| resolve_relative(card_path, cache))
}

pub(super) fn resolve_relative(card_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    card_path
        .parent()
        .map_or_else(|| path.to_path_buf(), |directory| directory.join(path))
}

/// Starts from the registered values, then applies a full vector and
/// `NAME=VALUE` overrides in that order.
pub(super) fn resolve_values(
    registry: &DialRegistry,
    values: &[f64],
    overrides: &[String],
) -> Result<Vec<f64>, CliError> {
    let mut resolved = if values.is_empty() {
        registry.values()
    } else {
        values.to_vec()
    };
    for assignment in overrides {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            CliError::Usage(format!("expected NAME=VALUE, got '{assignment}'"))
        })?;
        let value: f64 = value.trim().parse().map_err(|_| {
            CliError::Usage(format!("'{}' is not a number in '{assignment}'", value.trim()))
        })?;
        let handle = registry.handle(name.trim())?;
        match resolved.get_mut(handle.index()) {
            Some(slot) => *slot = value,
            None => {
                return Err(CliError::Compute(FitError::dimension_mismatch(
                    "RUN.PARAMETER_COUNT",
                    format!(
                        "parameter vector has {} entries but {} dials are registered",
                        resolved.len(),
                        registry.len()
                    ),
                )));
            }
        }
    }
    Ok(resolved)
}

pub(super) fn dial_reports(registry: &DialRegistry) -> Vec<DialReport> {
    registry
        .dials()
        .iter()
        .map(|dial| DialReport {
            name: dial.name.clone(),
            id: dial.id.as_enum(),
            value: dial.value,
            physical: dial.physical_value(),
            fixed: dial.fixed,
        })
        .collect()
}

/// Prints the report as JSON on stdout and optionally writes it to `output`.
pub(super) fn emit_report<T: Serialize>(report: &T, output: Option<&Path>) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(report).context("failed to encode report")?;
    if let Some(output) = output {
        if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        fs::write(output, &rendered)
            .with_context(|| format!("failed to write report '{}'", output.display()))?;
    }
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{resolve_relative, resolve_values};
    use super::CliError;
    use std::path::Path;
    use xsecfit_core::domain::{DialId, DialNamespace, FitErrorCategory};
    use xsecfit_core::weights::{DialRegistry, DialSpec};

    fn registry() -> DialRegistry {
        let mut registry = DialRegistry::new();
        registry
            .register(DialSpec::new("MaCCQE", DialId::new(DialNamespace::Neut, 1), 0.0))
            .expect("dial");
        registry
            .register(DialSpec::new("ccqe_norm", DialId::new(DialNamespace::Norm, 0), 1.0))
            .expect("dial");
        registry
    }

    #[test]
    fn overrides_apply_on_top_of_registered_values() {
        let registry = registry();
        let values = resolve_values(&registry, &[], &["ccqe_norm=1.25".to_string()])
            .expect("values");
        assert_eq!(values, vec![0.0, 1.25]);

        let values =
            resolve_values(&registry, &[0.5, 0.9], &["MaCCQE = -0.2".to_string()]).expect("values");
        assert_eq!(values, vec![-0.2, 0.9]);
    }

    #[test]
    fn bad_overrides_are_reported() {
        let registry = registry();
        assert!(matches!(
            resolve_values(&registry, &[], &["MaCCQE".to_string()]),
            Err(CliError::Usage(_))
        ));
        match resolve_values(&registry, &[], &["MaRES=1".to_string()]) {
            Err(CliError::Compute(error)) => {
                assert_eq!(error.category(), FitErrorCategory::DialNotFoundError)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn relative_paths_resolve_next_to_the_card() {
        let card = Path::new("/data/cards/fit.json");
        assert_eq!(
            resolve_relative(card, Path::new("cache.json")),
            Path::new("/data/cards/cache.json")
        );
        assert_eq!(
            resolve_relative(card, Path::new("/tmp/cache.json")),
            Path::new("/tmp/cache.json")
        );
    }
}
