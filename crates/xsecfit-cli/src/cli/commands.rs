use super::CliError;
use super::helpers::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use xsecfit_core::domain::Event;
use xsecfit_core::fit::{AggregationMode, MinimizationResult, ReconfigurePath, minimize};
use xsecfit_core::numerics::linear_grid;

#[derive(clap::Args)]
pub(super) struct EvalArgs {
    /// Fit card path
    #[arg(long)]
    card: PathBuf,

    /// Full dial vector in registration order
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    values: Vec<f64>,

    /// Override one dial, repeatable
    #[arg(long = "set", value_name = "NAME=VALUE", allow_hyphen_values = true)]
    sets: Vec<String>,

    /// Also write the JSON report here
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct ScanArgs {
    /// Fit card path
    #[arg(long)]
    card: PathBuf,

    /// Dial to scan
    #[arg(long)]
    dial: String,

    /// Number of scan points
    #[arg(long, default_value_t = 11)]
    points: usize,

    /// Lower end of the scan
    #[arg(long, allow_hyphen_values = true)]
    lower: f64,

    /// Upper end of the scan
    #[arg(long, allow_hyphen_values = true)]
    upper: f64,

    /// Override one of the other dials, repeatable
    #[arg(long = "set", value_name = "NAME=VALUE", allow_hyphen_values = true)]
    sets: Vec<String>,

    /// Also write the JSON report here
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct FitArgs {
    /// Fit card path
    #[arg(long)]
    card: PathBuf,

    /// Override the card's iteration limit
    #[arg(long)]
    max_iter: Option<u64>,

    /// Write the per-evaluation log as JSON
    #[arg(long)]
    iteration_log: Option<PathBuf>,

    /// Also write the JSON report here
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::Args)]
pub(super) struct SplinesArgs {
    /// Fit card path
    #[arg(long)]
    card: PathBuf,

    /// Coefficient table path; defaults to the card's spline cache
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct EvalReport {
    statistic: f64,
    ndof: usize,
    aggregation: &'static str,
    breakdown: BTreeMap<String, f64>,
    paths: Vec<ReconfigurePath>,
    dials: Vec<DialReport>,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct ScanPoint {
    value: f64,
    statistic: f64,
}

#[derive(Debug, Serialize)]
struct ScanReport {
    dial: String,
    points: Vec<ScanPoint>,
    minimum: ScanPoint,
}

#[derive(Debug, Serialize)]
struct FitReport {
    #[serde(flatten)]
    result: MinimizationResult,
    breakdown: BTreeMap<String, f64>,
    dials: Vec<DialReport>,
}

#[derive(Debug, Serialize)]
struct SplinesReport {
    generated: usize,
    rows: usize,
    path: PathBuf,
}

fn aggregation_name(mode: &AggregationMode) -> &'static str {
    match mode {
        AggregationMode::Independent => "independent",
        AggregationMode::Joint(_) => "joint",
    }
}

pub(super) fn run_eval_command(args: EvalArgs) -> Result<i32, CliError> {
    let mut setup = load_setup(&args.card)?;
    let objective = &mut setup.objective;
    let values = resolve_values(objective.registry(), &args.values, &args.sets)?;
    let statistic = objective.propose_parameters(&values)?;

    let report = EvalReport {
        statistic,
        ndof: objective.ndof(),
        aggregation: aggregation_name(objective.aggregation()),
        breakdown: objective.test_statistic_breakdown(),
        paths: objective.last_paths().to_vec(),
        dials: dial_reports(objective.registry()),
    };
    emit_report(&report, args.output.as_deref())?;
    Ok(0)
}

pub(super) fn run_scan_command(args: ScanArgs) -> Result<i32, CliError> {
    let mut setup = load_setup(&args.card)?;
    let objective = &mut setup.objective;
    let handle = objective.registry().handle(&args.dial)?;
    let mut values = resolve_values(objective.registry(), &[], &args.sets)?;
    let grid = linear_grid(args.lower, args.upper, args.points).ok_or_else(|| {
        CliError::Usage(format!(
            "cannot scan {} points between {} and {}",
            args.points, args.lower, args.upper
        ))
    })?;

    let mut points = Vec::with_capacity(grid.len());
    for value in grid {
        values[handle.index()] = value;
        let statistic = objective.propose_parameters(&values)?;
        tracing::info!(dial = %args.dial, value, statistic, "scan point");
        points.push(ScanPoint { value, statistic });
    }
    let minimum = points
        .iter()
        .copied()
        .min_by(|lhs, rhs| lhs.statistic.total_cmp(&rhs.statistic))
        .ok_or_else(|| CliError::Usage("scan needs at least one point".to_string()))?;

    let report = ScanReport {
        dial: args.dial,
        points,
        minimum,
    };
    emit_report(&report, args.output.as_deref())?;
    Ok(0)
}

pub(super) fn run_fit_command(args: FitArgs) -> Result<i32, CliError> {
    let mut setup = load_setup(&args.card)?;
    let mut config = setup.minimizer.clone();
    if let Some(max_iter) = args.max_iter {
        config.max_iter = max_iter;
    }
    let objective = &mut setup.objective;
    if args.iteration_log.is_some() {
        objective.set_iteration_log(true);
    }

    let result = minimize(objective, &config)?;
    if let Some(path) = &args.iteration_log {
        objective.write_iteration_log(path)?;
    }

    let converged = result.converged;
    let report = FitReport {
        result,
        breakdown: objective.test_statistic_breakdown(),
        dials: dial_reports(objective.registry()),
    };
    emit_report(&report, args.output.as_deref())?;
    if converged { Ok(0) } else { Ok(1) }
}

pub(super) fn run_splines_command(args: SplinesArgs) -> Result<i32, CliError> {
    let mut setup = load_setup(&args.card)?;
    let path = match args.output {
        Some(path) => path,
        None => spline_cache_path(&args.card, &setup).ok_or_else(|| {
            CliError::Usage(
                "no --output given and the card declares no spline_cache".to_string(),
            )
        })?,
    };

    let events: Vec<Event> = setup.events().cloned().collect();
    let generated = setup.objective.generate_coefficients(&events)?;
    let rows = setup.objective.save_coefficients(&path)?;

    let report = SplinesReport {
        generated,
        rows,
        path,
    };
    emit_report(&report, None)?;
    Ok(0)
}
