//! AEROSIM: flight dynamics, estimation and control-synthesis tool.
//!
//! Subcommands cover the offline workflow (airframe database, trim, linearization, LQR design)
//! and headless runs of the simulation engine (scripted simulation with CSV output, validation
//! snapshots and Monte Carlo consistency runs).
//!
//! A scripted run can be described entirely by a configuration file (TOML/JSON/YAML) passed with
//! `--config`; `aerosim config` writes a template.

mod common;

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use common::{emit_json, init_logger};
use log::{error, info, warn};

use aerosim::aircraft;
use aerosim::control::AutopilotMode;
use aerosim::linearize::Linearizer;
use aerosim::lqr::{LqrConfig, LqrWeights, solve_care};
use aerosim::sim::{SimulationConfig, SimulationSummary, run_with_engine, write_csv};
use aerosim::trim::TrimSolver;
use aerosim::validation::{MonteCarloConfig, ValidationConfig, ValidationEngine};

const LONG_ABOUT: &str = "AEROSIM: a six degree-of-freedom flight dynamics, estimation and control-synthesis tool.

Offline commands solve level-flight trim, linearize about it, classify the eigenvalues and design
LQR hold gains. The simulate command runs the fixed-step engine headless (truth model, GPS/IMU
sensors with fault injection, 19-state EKF, optional autopilot) and writes one CSV row per
physics step. The validate command flies the engine for a while and then reports the
observability of the estimator and its NEES/NIS consistency, optionally under attack.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Flight dynamics, estimation and control-synthesis tool.", long_about = LONG_ABOUT)]
struct Cli {
    /// Simulation configuration file (TOML/JSON/YAML) used by `simulate` and `validate`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "aircraft", about = "List or show built-in airframes")]
    Aircraft(AircraftArgs),

    #[command(name = "trim", about = "Solve level-flight trim")]
    Trim(ConditionArgs),

    #[command(
        name = "linearize",
        about = "Linearize about trim and classify stability",
        long_about = "Solve trim at the given flight condition, compute the state and input Jacobians by central differences and report the eigenvalues of A with their stability classification."
    )]
    Linearize(ConditionArgs),

    #[command(
        name = "lqr",
        about = "Design an LQR hold gain at trim",
        long_about = "Solve trim, linearize, and integrate the Riccati differential equation to obtain the state-feedback gain K. Non-convergence within the horizon is reported, not treated as an error."
    )]
    Lqr(LqrArgs),

    #[command(name = "simulate", about = "Run a headless simulation and write CSV")]
    Simulate(SimulateArgs),

    #[command(name = "validate", about = "Validation snapshot and Monte Carlo consistency run")]
    Validate(ValidateArgs),

    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct AircraftArgs {
    /// Airframe id to show; lists every id when omitted
    id: Option<String>,

    /// Write the full parameter set to this file (.json/.yaml/.toml)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// Flight condition shared by the offline commands
#[derive(Args, Clone, Debug)]
struct ConditionArgs {
    #[arg(short, long, default_value = aircraft::DEFAULT_AIRCRAFT_ID)]
    aircraft: String,

    /// True airspeed (m/s)
    #[arg(long, default_value_t = 60.0)]
    airspeed: f64,

    /// Altitude (m)
    #[arg(long, default_value_t = 1000.0)]
    altitude: f64,

    /// Write JSON here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct LqrArgs {
    #[command(flatten)]
    condition: ConditionArgs,

    /// Riccati integration horizon (s)
    #[arg(long, default_value_t = 10.0)]
    horizon: f64,

    /// Riccati integration step (s)
    #[arg(long, default_value_t = 0.01)]
    dt: f64,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV path
    #[arg(short, long)]
    output: PathBuf,

    /// Simulated time (s); overrides the configuration file
    #[arg(short, long)]
    duration: Option<f64>,

    /// Autopilot mode (off, pid_simple, lqr_hold); overrides the configuration file
    #[arg(long)]
    autopilot: Option<String>,

    /// Print an end-of-run summary as JSON
    #[arg(long)]
    summary: bool,
}

#[derive(Args, Clone, Debug)]
struct ValidateArgs {
    /// Seconds to fly before taking the snapshot
    #[arg(long, default_value_t = 5.0)]
    warmup: f64,

    /// Monte Carlo runs (0 skips the Monte Carlo stage)
    #[arg(long, default_value_t = 5)]
    runs: usize,

    /// Bias (m) injected along the least observable direction
    #[arg(long, default_value_t = 0.0)]
    attack_gain: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write JSON here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output file (.json/.yaml/.toml)
    #[arg(short, long, default_value = "aerosim.toml")]
    output: PathBuf,
}

#[derive(serde::Serialize)]
struct ValidationOutput {
    snapshot: aerosim::validation::ValidationSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    monte_carlo: Option<aerosim::validation::MonteCarloResult>,
}

fn parse_autopilot(mode: &str) -> Result<AutopilotMode, Box<dyn Error>> {
    serde_json::from_value(serde_json::Value::String(mode.to_string()))
        .map_err(|_| format!("unknown autopilot mode '{mode}' (off, pid_simple, lqr_hold)").into())
}

fn load_simulation_config(path: Option<&PathBuf>) -> Result<SimulationConfig, Box<dyn Error>> {
    match path {
        Some(p) => {
            info!("Loading configuration from {}", p.display());
            Ok(SimulationConfig::from_file(p)?)
        }
        None => Ok(SimulationConfig::default()),
    }
}

fn run_aircraft(args: &AircraftArgs) -> Result<(), Box<dyn Error>> {
    match &args.id {
        None => {
            for id in aircraft::list_ids() {
                println!("{id}");
            }
            Ok(())
        }
        Some(id) => {
            let config = aircraft::by_id(id)?;
            match &args.output {
                Some(path) => {
                    config.to_file(path)?;
                    info!("Wrote {} to {}", id, path.display());
                    Ok(())
                }
                None => emit_json(&config.summary(), None),
            }
        }
    }
}

fn run_trim(args: &ConditionArgs) -> Result<(), Box<dyn Error>> {
    let ac = aircraft::by_id(&args.aircraft)?;
    let trim = TrimSolver::with_defaults(&ac).solve(args.airspeed, args.altitude);
    if !trim.converged {
        warn!("Trim did not converge; reporting best effort");
    }
    emit_json(&trim, args.output.as_deref())
}

fn run_linearize(args: &ConditionArgs) -> Result<(), Box<dyn Error>> {
    let ac = aircraft::by_id(&args.aircraft)?;
    let trim = TrimSolver::with_defaults(&ac).solve(args.airspeed, args.altitude);
    let result = Linearizer::new(&ac).linearize_at_trim(&trim);
    info!(
        "{}: {:?} ({} eigenvalues)",
        trim.trim_id(),
        result.stability,
        result.eigenvalues.len()
    );
    emit_json(&result, args.output.as_deref())
}

fn run_lqr(args: &LqrArgs) -> Result<(), Box<dyn Error>> {
    let c = &args.condition;
    let ac = aircraft::by_id(&c.aircraft)?;
    let trim = TrimSolver::with_defaults(&ac).solve(c.airspeed, c.altitude);
    let model = Linearizer::new(&ac).linearize(&trim.trim_state(), &trim.trim_controls());
    let weights = LqrWeights::default();
    let config = LqrConfig {
        horizon: args.horizon,
        dt: args.dt,
        ..Default::default()
    };
    let solution =
        solve_care(&model.a, &model.b, &weights.q_matrix(), &weights.r_matrix(), &config)?;
    emit_json(&solution.to_report(), c.output.as_deref())
}

fn run_simulate(args: &SimulateArgs, config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let mut config = load_simulation_config(config_path)?;
    if let Some(duration) = args.duration {
        config.duration = duration;
    }
    if let Some(mode) = &args.autopilot {
        config.autopilot = parse_autopilot(mode)?;
    }
    let (records, engine) = run_with_engine(&config)?;
    common::ensure_parent_dir(&args.output)?;
    write_csv(&args.output, &records)?;
    info!("Wrote {} records to {}", records.len(), args.output.display());
    if args.summary {
        emit_json(&SimulationSummary::new(&records, engine.diagnostics()), None)?;
    }
    Ok(())
}

fn run_validate(args: &ValidateArgs, config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = SimulationConfig {
        duration: args.warmup,
        ..load_simulation_config(config_path)?
    };
    let (_, engine) = run_with_engine(&config)?;
    let validator = ValidationEngine::new(ValidationConfig {
        attack_gain: args.attack_gain,
        ..Default::default()
    });
    let snapshot = validator.snapshot(&engine)?;
    let monte_carlo = if args.runs > 0 {
        let mc = MonteCarloConfig {
            runs: args.runs,
            attack_gain: args.attack_gain,
            seed: args.seed,
            ..Default::default()
        };
        Some(validator.monte_carlo(&engine, &mc)?)
    } else {
        None
    };
    emit_json(
        &ValidationOutput {
            snapshot,
            monte_carlo,
        },
        args.output.as_deref(),
    )
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    common::ensure_parent_dir(&args.output)?;
    SimulationConfig::default().to_file(&args.output)?;
    println!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_deref())?;

    let result = match &cli.command {
        Some(Command::Aircraft(args)) => run_aircraft(args),
        Some(Command::Trim(args)) => run_trim(args),
        Some(Command::Linearize(args)) => run_linearize(args),
        Some(Command::Lqr(args)) => run_lqr(args),
        Some(Command::Simulate(args)) => run_simulate(args, cli.config.as_ref()),
        Some(Command::Validate(args)) => run_validate(args, cli.config.as_ref()),
        Some(Command::CreateConfig(args)) => create_config_file(args),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    };
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}
