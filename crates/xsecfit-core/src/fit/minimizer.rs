use super::objective::FitObjective;
use crate::domain::{EvaluationError, FitError, FitResult};
use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use serde::Serialize;
use std::cell::{Cell, RefCell};

const BOUND_EPSILON: f64 = 1.0e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct MinimizerConfig {
    pub max_iter: u64,
    /// Gradient-norm tolerance.
    pub tol: f64,
    /// L-BFGS history length.
    pub m: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 500,
            tol: 1.0e-6,
            m: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinimizationResult {
    pub parameters: Vec<f64>,
    pub names: Vec<String>,
    pub statistic: f64,
    pub ndof: usize,
    pub iterations: u64,
    pub evaluations: usize,
    pub converged: bool,
    pub message: String,
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds)
        .map(|(&value, &(lower, upper))| value.clamp(lower, upper))
        .collect()
}

/// Bridges the `&self` argmin traits onto the mutable objective.
struct ObjectiveProblem<'a, 'o> {
    objective: &'a RefCell<&'o mut FitObjective>,
    bounds: &'a [(f64, f64)],
    fixed: &'a [bool],
    failure: &'a RefCell<Option<EvaluationError>>,
    evaluations: &'a Cell<usize>,
}

impl ObjectiveProblem<'_, '_> {
    fn eval(&self, params: &[f64]) -> Result<f64, argmin::core::Error> {
        self.evaluations.set(self.evaluations.get() + 1);
        let clamped = clamp_params(params, self.bounds);
        match self.objective.borrow_mut().propose_parameters(&clamped) {
            Ok(statistic) => Ok(statistic),
            Err(error) => {
                let message = error.to_string();
                self.failure.borrow_mut().get_or_insert(error);
                Err(argmin::core::Error::msg(message))
            }
        }
    }
}

impl CostFunction for ObjectiveProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.eval(params)
    }
}

impl Gradient for ObjectiveProblem<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let clamped = clamp_params(params, self.bounds);
        let mut gradient = vec![0.0; clamped.len()];
        for index in 0..clamped.len() {
            if self.fixed[index] {
                continue;
            }
            let step = 1.0e-8 * clamped[index].abs().max(1.0);
            let mut forward = clamped.clone();
            forward[index] += step;
            let mut backward = clamped.clone();
            backward[index] -= step;
            gradient[index] = (self.eval(&forward)? - self.eval(&backward)?) / (2.0 * step);
        }

        // zero components that would push further past a bound
        for (index, (&value, &(lower, upper))) in clamped.iter().zip(self.bounds).enumerate() {
            if value <= lower + BOUND_EPSILON && gradient[index] > 0.0 {
                gradient[index] = 0.0;
            }
            if value >= upper - BOUND_EPSILON && gradient[index] < 0.0 {
                gradient[index] = 0.0;
            }
        }
        Ok(gradient)
    }
}

/// Minimizes `objective` over its free dials with bounded L-BFGS, then
/// re-evaluates the best point along the full refill path.
pub fn minimize(
    objective: &mut FitObjective,
    config: &MinimizerConfig,
) -> FitResult<MinimizationResult> {
    let registry = objective.registry();
    let names: Vec<String> = registry.dials().iter().map(|dial| dial.name.clone()).collect();
    let fixed: Vec<bool> = registry.dials().iter().map(|dial| dial.fixed).collect();
    let bounds = registry.bounds();
    let initial = clamp_params(&registry.values(), &bounds);
    let free = fixed.iter().filter(|fixed| !**fixed).count();

    tracing::info!(
        dials = names.len(),
        free,
        max_iter = config.max_iter,
        "minimization started"
    );

    if free == 0 {
        let statistic = objective.finalize(&initial)?;
        return Ok(MinimizationResult {
            parameters: initial,
            names,
            statistic,
            ndof: objective.ndof(),
            iterations: 0,
            evaluations: 1,
            converged: true,
            message: "no free dials".to_string(),
        });
    }

    let tol_cost = if config.tol == 0.0 {
        0.0
    } else {
        (0.1 * config.tol).max(1.0e-12)
    };
    let solver = LBFGS::new(MoreThuenteLineSearch::new(), config.m)
        .with_tolerance_grad(config.tol)
        .and_then(|solver| solver.with_tolerance_cost(tol_cost))
        .map_err(|error| {
            FitError::config("CONFIG.MINIMIZER", format!("invalid tolerance: {error}"))
        })?;

    let cell = RefCell::new(objective);
    let failure = RefCell::new(None);
    let evaluations = Cell::new(0);
    let outcome = {
        let problem = ObjectiveProblem {
            objective: &cell,
            bounds: &bounds,
            fixed: &fixed,
            failure: &failure,
            evaluations: &evaluations,
        };
        Executor::new(problem, solver)
            .configure(|state| state.param(initial).max_iters(config.max_iter))
            .run()
            .map(|result| {
                let state = result.state();
                let termination = state.get_termination_status();
                let converged = matches!(
                    termination,
                    TerminationStatus::Terminated(TerminationReason::SolverConverged)
                        | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
                );
                (
                    state.get_best_param().cloned(),
                    state.get_iter(),
                    converged,
                    termination.to_string(),
                )
            })
    };

    // evaluation failures abort the fit with their own category
    if let Some(error) = failure.into_inner() {
        return Err(error.into());
    }
    let (best, iterations, converged, message) = outcome.map_err(|error| {
        FitError::runtime_numerical("FIT.MINIMIZER", format!("minimization failed: {error}"))
    })?;
    let best = best.ok_or_else(|| {
        FitError::internal("FIT.MINIMIZER", "minimizer returned no best parameters")
    })?;
    let parameters = clamp_params(&best, &bounds);
    let evaluations = evaluations.get() + 1;
    let objective = cell.into_inner();

    let statistic = objective.finalize(&parameters)?;
    tracing::info!(
        statistic,
        ndof = objective.ndof(),
        iterations,
        evaluations,
        converged,
        "minimization finished"
    );
    Ok(MinimizationResult {
        parameters,
        names,
        statistic,
        ndof: objective.ndof(),
        iterations,
        evaluations,
        converged,
        message,
    })
}
