mod commands;
mod helpers;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use xsecfit_core::domain::{EvaluationError, FitError};

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    match parse_and_dispatch(args) {
        Ok(code) => code,
        Err(error) => {
            let fit_error = error.as_fit_error();
            eprintln!("{}", fit_error.diagnostic_line());
            if let Some(summary_line) = fit_error.fatal_exit_line() {
                eprintln!("{}", summary_line);
            }
            fit_error.exit_code()
        }
    }
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => {
            init_logging(&cli.log_level);
            dispatch_parsed(cli.command)
        }
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

/// Logs go to stderr so stdout carries only the JSON report. `RUST_LOG`
/// overrides `--log-level` when set.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(name = "xsecfit", about = "Cross-section reweighting fit engine")]
struct Cli {
    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Evaluate the test statistic at one dial vector
    Eval(commands::EvalArgs),
    /// Evaluate the test statistic along one dial
    Scan(commands::ScanArgs),
    /// Minimize the test statistic over the free dials
    Fit(commands::FitArgs),
    /// Generate and store spline coefficients for every spline-sourced event
    Splines(commands::SplinesArgs),
}

fn dispatch_parsed(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Eval(args) => commands::run_eval_command(args),
        CliCommand::Scan(args) => commands::run_scan_command(args),
        CliCommand::Fit(args) => commands::run_fit_command(args),
        CliCommand::Splines(args) => commands::run_splines_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(FitError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<FitError> for CliError {
    fn from(error: FitError) -> Self {
        Self::Compute(error)
    }
}

impl From<EvaluationError> for CliError {
    fn from(error: EvaluationError) -> Self {
        Self::Compute(error.into_fit_error())
    }
}

impl CliError {
    fn as_fit_error(&self) -> FitError {
        match self {
            Self::Usage(message) => FitError::config("CONFIG.CLI_USAGE", message.clone()),
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => FitError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
