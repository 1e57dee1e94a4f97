//! Headless scripted simulation and CSV output.
//!
//! This module provides:
//! - [`SimulationConfig`], a serde description of one scripted run: engine settings, optional trim,
//!   a fault schedule and an autopilot mode
//! - [`run`] and [`run_with_engine`], which drive a [`SimulationEngine`] one physics step at a time
//! - [`SimulationRecord`], one row of truth, estimate and error per physics step, with CSV
//!   import/export through the `csv` crate
//! - [`SimulationSummary`] for quick end-of-run statistics
use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::aircraft::{extension_of, unsupported_extension};
use crate::control::AutopilotMode;
use crate::engine::{EngineConfig, EngineDiagnostics, SimulationEngine};
use crate::error::{Result, SimError};
use crate::faults::FaultConfig;
use crate::lqr::{LqrConfig, LqrWeights};
use crate::trim::{TrimResult, TrimSolver};

/// A fault attached to a sensor, e.g.
/// `{"sensorId": "gps_pos", "type": "dropout", "startTime": 5.0, "duration": 2.0}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledFault {
    pub sensor_id: String,
    #[serde(flatten)]
    pub fault: FaultConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub engine: EngineConfig,
    /// Simulated time (s)
    pub duration: f64,
    /// Start from the trim solution at `airspeed` / `altitude` and hold the trim controls
    pub trim_first: bool,
    pub airspeed: f64,
    pub altitude: f64,
    pub faults: Vec<ScheduledFault>,
    pub autopilot: AutopilotMode,
    pub lqr_weights: LqrWeights,
    pub lqr: LqrConfig,
    /// Keep every n-th physics step in the output
    pub record_every: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            engine: EngineConfig::default(),
            duration: 60.0,
            trim_first: true,
            airspeed: 60.0,
            altitude: 1000.0,
            faults: Vec::new(),
            autopilot: AutopilotMode::Off,
            lqr_weights: LqrWeights::default(),
            lqr: LqrConfig::default(),
            record_every: 1,
        }
    }
}

impl SimulationConfig {
    /// Read a configuration, choosing JSON, YAML or TOML by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let text = fs::read_to_string(p)?;
        match extension_of(p).as_deref() {
            Some("json") => serde_json::from_str(&text).map_err(io::Error::other),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text).map_err(io::Error::other),
            Some("toml") => toml::from_str(&text).map_err(io::Error::other),
            _ => Err(unsupported_extension()),
        }
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        let text = match extension_of(p).as_deref() {
            Some("json") => serde_json::to_string_pretty(self).map_err(io::Error::other)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self).map_err(io::Error::other)?,
            Some("toml") => toml::to_string(self).map_err(io::Error::other)?,
            _ => return Err(unsupported_extension()),
        };
        fs::write(p, text)
    }
}

/// One row of a headless run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub time: f64,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    pub p: f64,
    pub q: f64,
    pub r: f64,
    pub phi: f64,
    pub theta: f64,
    pub psi: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub est_x: f64,
    pub est_y: f64,
    pub est_z: f64,
    pub est_u: f64,
    pub est_v: f64,
    pub est_w: f64,
    pub est_phi: f64,
    pub est_theta: f64,
    pub est_psi: f64,
    /// ‖p_est − p_true‖ (m)
    pub position_error: f64,
    pub covariance_trace: f64,
    pub throttle: f64,
    pub aileron: f64,
    pub elevator: f64,
    pub rudder: f64,
}

impl SimulationRecord {
    pub fn from_engine(engine: &SimulationEngine) -> Self {
        let truth = engine.truth();
        let estimate = engine.get_estimate();
        let est = estimate.state.to_rigid_body();
        let controls = engine.applied_controls();
        SimulationRecord {
            time: engine.time(),
            u: truth.u,
            v: truth.v,
            w: truth.w,
            p: truth.p,
            q: truth.q,
            r: truth.r,
            phi: truth.phi,
            theta: truth.theta,
            psi: truth.psi,
            x: truth.x,
            y: truth.y,
            z: truth.z,
            est_x: est.x,
            est_y: est.y,
            est_z: est.z,
            est_u: est.u,
            est_v: est.v,
            est_w: est.w,
            est_phi: est.phi,
            est_theta: est.theta,
            est_psi: est.psi,
            position_error: (est.position() - truth.position()).norm(),
            covariance_trace: estimate.covariance.trace(),
            throttle: controls.throttle,
            aileron: controls.aileron,
            elevator: controls.elevator,
            rudder: controls.rudder,
        }
    }

    /// Writes records to a CSV file with a header row.
    ///
    /// # Arguments
    /// * `records` - Records to write
    /// * `path` - Path where the CSV file will be saved
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Alias for [`SimulationRecord::to_csv`].
pub fn write_csv<P: AsRef<Path>>(path: P, records: &[SimulationRecord]) -> io::Result<()> {
    SimulationRecord::to_csv(records, path)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub samples: usize,
    pub duration: f64,
    pub final_position_error: f64,
    pub mean_position_error: f64,
    pub max_position_error: f64,
    pub final_altitude: f64,
    pub diagnostics: EngineDiagnostics,
}

impl SimulationSummary {
    pub fn new(records: &[SimulationRecord], diagnostics: EngineDiagnostics) -> Self {
        let n = records.len().max(1) as f64;
        SimulationSummary {
            samples: records.len(),
            duration: records.last().map_or(0.0, |r| r.time),
            final_position_error: records.last().map_or(0.0, |r| r.position_error),
            mean_position_error: records.iter().map(|r| r.position_error).sum::<f64>() / n,
            max_position_error: records
                .iter()
                .map(|r| r.position_error)
                .fold(0.0, f64::max),
            final_altitude: records.last().map_or(0.0, |r| -r.z),
            diagnostics,
        }
    }
}

fn solve_trim(config: &SimulationConfig, engine_config: &EngineConfig) -> Result<TrimResult> {
    let aircraft = engine_config.aircraft.resolve()?;
    let trim = TrimSolver::with_defaults(&aircraft).solve(config.airspeed, config.altitude);
    if !trim.converged {
        warn!(
            "Trim for {} did not converge (residual {:.2e}); using best effort",
            trim.trim_id(),
            trim.residual_norm
        );
    }
    Ok(trim)
}

/// Run a scripted simulation and hand back the engine for inspection.
pub fn run_with_engine(
    config: &SimulationConfig,
) -> Result<(Vec<SimulationRecord>, SimulationEngine)> {
    if !(config.duration > 0.0) {
        return Err(SimError::InvalidParameter(format!(
            "duration must be positive, got {}",
            config.duration
        )));
    }
    let mut engine_config = config.engine.clone();
    engine_config.autopilot = config.autopilot;
    let needs_trim = config.trim_first || config.autopilot == AutopilotMode::LqrHold;
    let trim = if needs_trim {
        Some(solve_trim(config, &engine_config)?)
    } else {
        None
    };
    let mut manual = engine_config.initial_controls;
    if let (true, Some(trim)) = (config.trim_first, trim.as_ref()) {
        engine_config.initial_state = trim.trim_state();
        engine_config.initial_controls = trim.trim_controls();
        manual = trim.trim_controls();
    }

    let mut engine = SimulationEngine::new(engine_config)?;
    for scheduled in &config.faults {
        engine
            .faults_mut()
            .add_fault(&scheduled.sensor_id, scheduled.fault.clone());
    }
    if let (AutopilotMode::LqrHold, Some(trim)) = (config.autopilot, trim.as_ref()) {
        let aircraft = engine.aircraft().clone();
        engine
            .autopilot_mut()
            .design_lqr(&aircraft, trim, &config.lqr_weights, &config.lqr)?;
    }

    let steps = (config.duration / engine.fixed_dt()).round() as usize;
    let every = config.record_every.max(1);
    let mut records = Vec::with_capacity(steps / every + 1);
    records.push(SimulationRecord::from_engine(&engine));
    for k in 1..=steps {
        engine.single_step(&manual);
        if k % every == 0 {
            records.push(SimulationRecord::from_engine(&engine));
        }
    }
    let diagnostics = engine.diagnostics();
    info!(
        "Simulated {:.1} s in {} steps ({} dropouts, {} gated, {} skipped updates)",
        engine.time(),
        diagnostics.steps,
        diagnostics.dropouts,
        diagnostics.gated_rejections,
        diagnostics.skipped_updates
    );
    Ok((records, engine))
}

pub fn run(config: &SimulationConfig) -> Result<Vec<SimulationRecord>> {
    run_with_engine(config).map(|(records, _)| records)
}
