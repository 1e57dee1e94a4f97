//! Fixed-step simulation engine.
//!
//! The host loop hands the engine variable wall-clock intervals; the engine accumulates them and
//! advances the truth model, sensors and estimator in fixed physics steps. Each physics step runs
//! in a fixed order:
//!
//! 1. autopilot output computed from the current estimate (manual controls when off),
//! 2. RK4 integration of the twelve-state truth model,
//! 3. time advance,
//! 4. loads sample (forces, moments, specific force, airflow angles) for the new truth,
//! 5. EKF predict,
//! 6. GPS sampling at its own rate (a dropout is counted and skips the update),
//! 7. IMU sampling, tagged with the airframe and controls for the accelerometer prediction,
//! 8. measurement updates through the gate and adaptive noise tuner,
//! 9. render buffer push.
//!
//! Numerical failures inside a step are logged and counted; the engine always keeps its last
//! valid state and carries on.
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::aerodynamics;
use crate::aircraft::{self, AircraftConfig, DEFAULT_AIRCRAFT_ID};
use crate::consistency::{
    AdaptiveRConfig, ConsistencyTracker, GatingConfig, compute_nees,
};
use crate::control::{Autopilot, AutopilotMode};
use crate::dynamics::aircraft_derivative;
use crate::error::{Result, SimError};
use crate::faults::FaultInjector;
use crate::integrator::rk4;
use crate::kalman::{
    AircraftProcessModel, EkfState, ExtendedKalmanFilter, StateVariances, UpdateReport, index,
};
use crate::math::{euler_to_quaternion, quaternion_to_euler};
use crate::measurements::{
    GPS_SENSOR_ID, GpsConfig, GpsSensor, ImuConfig, ImuSensor, Measurement, MeasurementKind,
    SpecificForceModel,
};
use crate::{ControlInput, NavigationFilter, RigidBodyState};

/// Number of truth samples kept for rendering.
pub const RENDER_BUFFER_SIZE: usize = 4;

/// Quaternion-attitude truth record with the loads that produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TruthState {
    /// NED position (m)
    pub position: Vector3<f64>,
    /// Body-frame velocity (m/s)
    pub velocity: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
    /// Body rates (rad/s)
    pub angular_rate: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
    /// Body-frame aerodynamic plus thrust force (N)
    pub force: Vector3<f64>,
    /// Body-frame moment (N·m)
    pub moment: Vector3<f64>,
    /// Force per unit mass, as an accelerometer senses it (N/kg)
    pub specific_force: Vector3<f64>,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for TruthState {
    fn default() -> Self {
        TruthState::from_rigid_body(&RigidBodyState::default())
    }
}

impl TruthState {
    /// Kinematic fields only. Loads are zero and the airflow angles come from the velocity.
    pub fn from_rigid_body(state: &RigidBodyState) -> Self {
        let air = aerodynamics::AirData::from_state(state, aircraft::SEA_LEVEL_DENSITY);
        TruthState {
            position: state.position(),
            velocity: state.velocity(),
            attitude: euler_to_quaternion(state.phi, state.theta, state.psi),
            angular_rate: state.rates(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            force: Vector3::zeros(),
            moment: Vector3::zeros(),
            specific_force: Vector3::zeros(),
            alpha: air.alpha,
            beta: air.beta,
        }
    }

    /// Full record with the aerodynamic loads evaluated for `controls`.
    pub fn with_loads(
        config: &AircraftConfig,
        state: &RigidBodyState,
        controls: &ControlInput,
    ) -> Self {
        let aero = aerodynamics::compute(config, state, controls);
        TruthState {
            force: aero.force,
            moment: aero.moment,
            specific_force: aero.force / config.mass.mass,
            alpha: aero.air_data.alpha,
            beta: aero.air_data.beta,
            ..TruthState::from_rigid_body(state)
        }
    }

    /// Same sample with constant sensor biases attached.
    pub fn with_biases(self, gyro_bias: &[f64; 3], accel_bias: &[f64; 3]) -> Self {
        TruthState {
            gyro_bias: Vector3::from(*gyro_bias),
            accel_bias: Vector3::from(*accel_bias),
            ..self
        }
    }

    pub fn to_rigid_body(&self) -> RigidBodyState {
        let (phi, theta, psi) = quaternion_to_euler(&self.attitude);
        RigidBodyState {
            u: self.velocity.x,
            v: self.velocity.y,
            w: self.velocity.z,
            p: self.angular_rate.x,
            q: self.angular_rate.y,
            r: self.angular_rate.z,
            phi,
            theta,
            psi,
            x: self.position.x,
            y: self.position.y,
            z: self.position.z,
        }
    }

    pub fn altitude(&self) -> f64 {
        -self.position.z
    }
}

/// Airframe selection: a built-in id or a full inline parameter set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AircraftSource {
    Id(String),
    Inline(Box<AircraftConfig>),
}

impl Default for AircraftSource {
    fn default() -> Self {
        AircraftSource::Id(DEFAULT_AIRCRAFT_ID.to_string())
    }
}

impl AircraftSource {
    pub fn resolve(&self) -> Result<AircraftConfig> {
        let config = match self {
            AircraftSource::Id(id) => aircraft::by_id(id)?,
            AircraftSource::Inline(config) => config.as_ref().clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub aircraft: AircraftSource,
    pub physics_rate_hz: f64,
    pub gps: GpsConfig,
    pub imu: ImuConfig,
    pub use_imu_updates: bool,
    /// Process noise density per second; Q is this times the physics step
    pub process_noise: StateVariances,
    /// Initial EKF covariance, block by block
    pub initial_covariance: StateVariances,
    pub initial_state: RigidBodyState,
    /// Constant gyro bias baked into the simulated IMU (rad/s)
    pub truth_gyro_bias: [f64; 3],
    /// Constant accelerometer bias baked into the simulated IMU (m/s²)
    pub truth_accel_bias: [f64; 3],
    pub initial_controls: ControlInput,
    pub gating: GatingConfig,
    pub adaptive_r: AdaptiveRConfig,
    pub autopilot: AutopilotMode,
    pub seed: u64,
    /// Physics steps allowed per call to [`SimulationEngine::step`]
    pub max_substeps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            aircraft: AircraftSource::default(),
            physics_rate_hz: 100.0,
            gps: GpsConfig::default(),
            imu: ImuConfig::default(),
            use_imu_updates: true,
            process_noise: StateVariances::PROCESS_DENSITY,
            initial_covariance: StateVariances::INITIAL,
            initial_state: RigidBodyState::level(60.0, 1000.0),
            truth_gyro_bias: [0.0; 3],
            truth_accel_bias: [0.0; 3],
            initial_controls: ControlInput::new(0.5, 0.0, 0.0, 0.0),
            gating: GatingConfig::default(),
            adaptive_r: AdaptiveRConfig::default(),
            autopilot: AutopilotMode::Off,
            seed: 42,
            max_substeps: 250,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.physics_rate_hz > 0.0) || !self.physics_rate_hz.is_finite() {
            return Err(SimError::InvalidParameter(format!(
                "physics rate must be positive, got {}",
                self.physics_rate_hz
            )));
        }
        self.process_noise.validate("process noise")?;
        self.initial_covariance.validate("initial covariance")?;
        let mut biases = self.truth_gyro_bias.iter().chain(&self.truth_accel_bias);
        if !biases.all(|b| b.is_finite()) {
            return Err(SimError::InvalidParameter("truth IMU biases must be finite".to_string()));
        }
        if self.max_substeps == 0 {
            return Err(SimError::InvalidParameter("max_substeps must be at least 1".to_string()));
        }
        if !self.initial_state.is_finite() {
            return Err(SimError::InvalidParameter("initial state is not finite".to_string()));
        }
        Ok(())
    }
}

/// Estimator output handed to callers.
#[derive(Clone, Debug, PartialEq)]
pub struct Estimate {
    pub state: EkfState,
    pub covariance: DMatrix<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineDiagnostics {
    pub steps: u64,
    pub dropouts: u64,
    pub skipped_updates: u64,
    pub gated_rejections: u64,
    /// Gated measurements forced through after a sensor lock-out
    pub gate_recoveries: u64,
    /// Truth steps discarded because integration produced non-finite values
    pub rejected_truth_steps: u64,
    /// Wall time (s) dropped by the substep guard
    pub dropped_time: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderSample {
    pub time: f64,
    pub state: TruthState,
}

pub type Ekf = ExtendedKalmanFilter<AircraftProcessModel>;

pub struct SimulationEngine {
    config: EngineConfig,
    aircraft: Arc<AircraftConfig>,
    truth: RigidBodyState,
    truth_sample: TruthState,
    time: f64,
    accumulator: f64,
    paused: bool,
    controls: ControlInput,
    applied_controls: ControlInput,
    ekf: Ekf,
    gps: GpsSensor,
    imu: ImuSensor,
    faults: FaultInjector,
    autopilot: Autopilot,
    render_buffer: VecDeque<RenderSample>,
    consistency: ConsistencyTracker,
    last_gps_report: Option<UpdateReport>,
    diagnostics: EngineDiagnostics,
}

fn build_filter(config: &EngineConfig, aircraft: &AircraftConfig) -> Result<Ekf> {
    let x0 = EkfState::from_rigid_body(&config.initial_state);
    let dt = 1.0 / config.physics_rate_hz;
    let ekf = ExtendedKalmanFilter::new(
        AircraftProcessModel::new(aircraft.clone()),
        x0,
        config.initial_covariance.covariance(&x0),
        config.process_noise.scaled(dt).covariance(&x0),
    )?
    .with_gating(config.gating)
    .with_adaptive_r(config.adaptive_r);
    Ok(ekf)
}

impl SimulationEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let aircraft = Arc::new(config.aircraft.resolve()?);
        let ekf = build_filter(&config, &aircraft)?;
        let gps = GpsSensor::new(config.gps, config.seed)?;
        let imu = ImuSensor::new(config.imu, config.seed.wrapping_add(1))?;
        let faults = FaultInjector::new(config.seed.wrapping_add(2));
        let truth = config.initial_state;
        let controls = config.initial_controls.clamped();
        let truth_sample = TruthState::with_loads(&aircraft, &truth, &controls)
            .with_biases(&config.truth_gyro_bias, &config.truth_accel_bias);
        let mut render_buffer = VecDeque::with_capacity(RENDER_BUFFER_SIZE);
        render_buffer.push_back(RenderSample {
            time: 0.0,
            state: truth_sample,
        });
        info!(
            "Engine ready: {} at {} Hz, GPS {} Hz, IMU updates {}",
            aircraft.id, config.physics_rate_hz, config.gps.rate_hz, config.use_imu_updates
        );
        Ok(SimulationEngine {
            autopilot: Autopilot::new(config.autopilot),
            consistency: ConsistencyTracker::new(3, 3),
            config,
            aircraft,
            truth,
            truth_sample,
            time: 0.0,
            accumulator: 0.0,
            paused: false,
            controls,
            applied_controls: controls,
            ekf,
            gps,
            imu,
            faults,
            render_buffer,
            last_gps_report: None,
            diagnostics: EngineDiagnostics::default(),
        })
    }

    /// Rebuild from the stored configuration. Faults, autopilot gains and statistics are cleared.
    pub fn reset(&mut self) -> Result<()> {
        *self = SimulationEngine::new(self.config.clone())?;
        Ok(())
    }

    /// Swap the airframe and reset.
    pub fn set_aircraft(&mut self, aircraft: AircraftConfig) -> Result<()> {
        aircraft.validate()?;
        self.config.aircraft = AircraftSource::Inline(Box::new(aircraft));
        self.reset()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn aircraft(&self) -> &AircraftConfig {
        &self.aircraft
    }

    pub fn fixed_dt(&self) -> f64 {
        1.0 / self.config.physics_rate_hz
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn truth(&self) -> &RigidBodyState {
        &self.truth
    }

    pub fn truth_state(&self) -> TruthState {
        self.truth_sample
    }

    pub fn controls(&self) -> ControlInput {
        self.controls
    }

    pub fn set_controls(&mut self, controls: ControlInput) {
        self.controls = controls.clamped();
    }

    /// Controls that drove the last physics step, after the autopilot.
    pub fn applied_controls(&self) -> ControlInput {
        self.applied_controls
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultInjector {
        &mut self.faults
    }

    pub fn autopilot(&self) -> &Autopilot {
        &self.autopilot
    }

    pub fn autopilot_mut(&mut self) -> &mut Autopilot {
        &mut self.autopilot
    }

    pub fn ekf(&self) -> &Ekf {
        &self.ekf
    }

    pub fn gps(&self) -> &GpsSensor {
        &self.gps
    }

    pub fn consistency(&self) -> &ConsistencyTracker {
        &self.consistency
    }

    pub fn last_gps_report(&self) -> Option<&UpdateReport> {
        self.last_gps_report.as_ref()
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        self.diagnostics
    }

    pub fn get_estimate(&self) -> Estimate {
        Estimate {
            state: self.ekf.state(),
            covariance: self.ekf.covariance().clone(),
        }
    }

    /// Latest buffered truth sample. `time` is accepted for host-loop interpolation but unused.
    pub fn get_render_state(&self, _time: f64) -> TruthState {
        self.render_buffer
            .back()
            .map_or(self.truth_sample, |s| s.state)
    }

    pub fn render_buffer(&self) -> impl Iterator<Item = &RenderSample> {
        self.render_buffer.iter()
    }

    /// Advance by a wall-clock interval. Returns the number of physics steps taken.
    ///
    /// A paused engine or a non-positive interval takes no steps. At most `max_substeps` steps
    /// run per call; the remaining backlog is dropped.
    pub fn step(&mut self, wall_dt: f64, controls: &ControlInput) -> usize {
        self.controls = controls.clamped();
        if self.paused || !(wall_dt > 0.0) || !wall_dt.is_finite() {
            return 0;
        }
        let dt = self.fixed_dt();
        self.accumulator += wall_dt;
        let mut steps = 0;
        while self.accumulator + 1e-9 * dt >= dt {
            if steps >= self.config.max_substeps {
                warn!(
                    "Dropping {:.3} s of simulation backlog after {} substeps",
                    self.accumulator, steps
                );
                self.diagnostics.dropped_time += self.accumulator;
                self.accumulator = 0.0;
                break;
            }
            self.physics_step();
            self.accumulator -= dt;
            steps += 1;
        }
        self.accumulator = self.accumulator.max(0.0);
        steps
    }

    /// Exactly one physics step, regardless of the pause state.
    pub fn single_step(&mut self, controls: &ControlInput) {
        self.controls = controls.clamped();
        self.physics_step();
    }

    /// Integrate a copy of `state` for `dt` under the last applied controls.
    pub fn predict_deterministic(&self, state: &TruthState, dt: f64) -> TruthState {
        self.predict_deterministic_with(state, &self.applied_controls, dt)
    }

    pub fn predict_deterministic_with(
        &self,
        state: &TruthState,
        controls: &ControlInput,
        dt: f64,
    ) -> TruthState {
        let x = state.to_rigid_body().to_vector();
        let next = rk4(0.0, &x, dt, aircraft_derivative(&self.aircraft, *controls));
        match RigidBodyState::from_vector(&next) {
            Ok(rb) if rb.is_finite() => TruthState {
                gyro_bias: state.gyro_bias,
                accel_bias: state.accel_bias,
                ..TruthState::with_loads(&self.aircraft, &rb, controls)
            },
            _ => *state,
        }
    }

    fn physics_step(&mut self) {
        let dt = self.fixed_dt();

        let estimate = self.ekf.state().to_rigid_body();
        let active = self
            .autopilot
            .update(dt, &estimate, &self.controls)
            .clamped();
        self.applied_controls = active;

        let next = rk4(
            self.time,
            &self.truth.to_vector(),
            dt,
            aircraft_derivative(&self.aircraft, active),
        );
        match RigidBodyState::from_vector(&next) {
            Ok(state) if state.is_finite() => self.truth = state,
            _ => {
                warn!("Truth integration diverged at t = {:.3}; keeping previous state", self.time);
                self.diagnostics.rejected_truth_steps += 1;
            }
        }
        self.time += dt;
        self.truth_sample = TruthState::with_loads(&self.aircraft, &self.truth, &active)
            .with_biases(&self.config.truth_gyro_bias, &self.config.truth_accel_bias);

        self.ekf.predict(&active, dt);

        let mut measurements: Vec<Measurement> = Vec::with_capacity(2);
        if self.gps.is_due(self.time) {
            match self.gps.measure(&self.truth_sample, self.time, &mut self.faults) {
                Some(m) => measurements.push(m),
                None => {
                    debug!("GPS dropout at t = {:.2}", self.time);
                    self.diagnostics.dropouts += 1;
                }
            }
        }
        if self.config.use_imu_updates {
            match self.imu.measure(&self.truth_sample, self.time, &mut self.faults) {
                Some(m) => {
                    let model = SpecificForceModel::new(Arc::clone(&self.aircraft), active);
                    measurements.push(m.with_kind(MeasurementKind::ImuWithAirframe(model)));
                }
                None => self.diagnostics.dropouts += 1,
            }
        }

        for m in &measurements {
            match self.ekf.update(m) {
                Ok(report) => {
                    if !report.accepted {
                        self.diagnostics.gated_rejections += 1;
                    }
                    if report.recovered {
                        self.diagnostics.gate_recoveries += 1;
                    }
                    if m.sensor_id == GPS_SENSOR_ID {
                        self.record_consistency(&report);
                        self.last_gps_report = Some(report);
                    }
                }
                Err(e) => {
                    warn!("{} update skipped at t = {:.2}: {e}", m.sensor_id, self.time);
                    self.diagnostics.skipped_updates += 1;
                }
            }
        }

        if self.render_buffer.len() == RENDER_BUFFER_SIZE {
            self.render_buffer.pop_front();
        }
        self.render_buffer.push_back(RenderSample {
            time: self.time,
            state: self.truth_sample,
        });
        self.diagnostics.steps += 1;
    }

    /// Position NEES against truth alongside the GPS NIS.
    fn record_consistency(&mut self, report: &UpdateReport) {
        let estimate = self.ekf.state().to_vector().rows(index::POSITION, 3).into_owned();
        let truth = DVector::from_column_slice(self.truth_sample.position.as_slice());
        let p = self
            .ekf
            .covariance()
            .view((index::POSITION, index::POSITION), (3, 3))
            .into_owned();
        match compute_nees(&truth, &estimate, &p) {
            Ok(nees) => self.consistency.record(self.time, nees, report.nis),
            Err(e) => debug!("Position NEES unavailable: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultConfig;
    use assert_approx_eq::assert_approx_eq;

    fn engine() -> SimulationEngine {
        SimulationEngine::new(EngineConfig::default()).unwrap()
    }

    fn cruise() -> ControlInput {
        ControlInput::new(0.5, 0.0, 0.0, 0.0)
    }

    #[test]
    fn truth_state_round_trip() {
        let rb = RigidBodyState {
            u: 55.0,
            v: 1.0,
            w: 2.0,
            p: 0.01,
            q: -0.02,
            r: 0.03,
            phi: 0.2,
            theta: 0.1,
            psi: -1.0,
            x: 10.0,
            y: 20.0,
            z: -900.0,
        };
        let t = TruthState::from_rigid_body(&rb);
        let back = t.to_rigid_body();
        assert_approx_eq!(back.phi, rb.phi, 1e-12);
        assert_approx_eq!(back.theta, rb.theta, 1e-12);
        assert_approx_eq!(back.psi, rb.psi, 1e-12);
        assert_approx_eq!(back.w, rb.w);
        assert_approx_eq!(t.altitude(), 900.0);
        assert_approx_eq!(t.alpha, (2.0f64).atan2(55.0), 1e-12);
    }

    #[test]
    fn loads_include_thrust_and_gravity_balance() {
        let ac = aircraft::cessna_172r();
        let t = TruthState::with_loads(&ac, &RigidBodyState::level(60.0, 1000.0), &cruise());
        assert!(t.force.norm() > 0.0);
        assert_approx_eq!(t.specific_force.x, t.force.x / ac.mass.mass, 1e-12);
    }

    #[test]
    fn accumulator_takes_whole_steps() {
        let mut e = engine();
        assert_eq!(e.step(0.005, &cruise()), 0);
        assert_eq!(e.step(0.005, &cruise()), 1);
        assert_eq!(e.step(0.1, &cruise()), 10);
        assert_approx_eq!(e.time(), 0.11, 1e-9);
        assert_eq!(e.diagnostics().steps, 11);
    }

    #[test]
    fn paused_engine_only_single_steps() {
        let mut e = engine();
        e.pause();
        assert!(e.is_paused());
        assert_eq!(e.step(1.0, &cruise()), 0);
        assert_approx_eq!(e.time(), 0.0);
        e.single_step(&cruise());
        assert_approx_eq!(e.time(), 0.01, 1e-12);
        e.resume();
        assert_eq!(e.step(0.02, &cruise()), 2);
    }

    #[test]
    fn substep_guard_drops_backlog() {
        let config = EngineConfig {
            max_substeps: 5,
            ..Default::default()
        };
        let mut e = SimulationEngine::new(config).unwrap();
        assert_eq!(e.step(1.0, &cruise()), 5);
        assert!(e.diagnostics().dropped_time > 0.9);
        assert_eq!(e.step(0.0, &cruise()), 0);
    }

    #[test]
    fn render_buffer_keeps_latest_four() {
        let mut e = engine();
        e.step(0.1, &cruise());
        assert_eq!(e.render_buffer().count(), RENDER_BUFFER_SIZE);
        let latest = e.get_render_state(e.time());
        assert_eq!(latest.position, e.truth().position());
    }

    #[test]
    fn estimate_tracks_truth() {
        let mut e = engine();
        for _ in 0..20 {
            e.step(0.1, &cruise());
        }
        let est = e.get_estimate();
        let err = (est.state.position - e.truth().position()).norm();
        assert!(err < 10.0, "position error {err}");
        assert_eq!(est.covariance.shape(), (19, 19));
        assert!(e.consistency().len() >= 9);
        assert!(e.last_gps_report().is_some());
    }

    #[test]
    fn untrimmed_start_stays_locked_on() {
        // Default controls are off trim, so the airframe pitches through a phugoid.
        let mut e = engine();
        for _ in 0..100 {
            e.step(0.1, &cruise());
            let err = (e.get_estimate().state.position - e.truth().position()).norm();
            assert!(err < 10.0, "t = {:.1}: position error {err}", e.time());
        }
        let est = e.get_estimate().state.to_rigid_body();
        let truth = e.truth();
        assert!((est.theta - truth.theta).abs() < 0.02);
        assert!((est.phi - truth.phi).abs() < 0.02);
        assert!((est.w - truth.w).abs() < 0.5);
        assert!(e.diagnostics().gated_rejections < 50);
        assert_eq!(e.diagnostics().gate_recoveries, 0);
        assert!(e.ekf().covariance().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn truth_biases_reach_the_imu_sample() {
        let config = EngineConfig {
            truth_gyro_bias: [0.01, 0.0, -0.02],
            truth_accel_bias: [0.0, 0.3, 0.0],
            ..Default::default()
        };
        let mut e = SimulationEngine::new(config).unwrap();
        assert_approx_eq!(e.truth_state().gyro_bias.z, -0.02);
        e.single_step(&cruise());
        assert_approx_eq!(e.truth_state().gyro_bias.x, 0.01);
        assert_approx_eq!(e.truth_state().accel_bias.y, 0.3);
    }

    #[test]
    fn dropouts_are_counted() {
        let mut e = engine();
        e.faults_mut()
            .add_fault(GPS_SENSOR_ID, FaultConfig::dropout(0.0, 10.0));
        e.step(1.0, &cruise());
        // First fix at t = 0.01, then every 0.2 s through t = 1.0.
        assert_eq!(e.diagnostics().dropouts, 6);
        assert!(e.last_gps_report().is_none());
    }

    #[test]
    fn predict_deterministic_is_pure() {
        let mut e = engine();
        e.step(0.05, &cruise());
        let start = e.truth_state();
        let a = e.predict_deterministic(&start, 0.01);
        let b = e.predict_deterministic(&start, 0.01);
        assert_eq!(a, b);
        assert_eq!(e.truth_state(), start);
        assert!(a.position.x > start.position.x);
    }

    #[test]
    fn reset_replays_identically() {
        let mut e = engine();
        e.step(0.5, &cruise());
        let first = *e.truth();
        let est = e.get_estimate().state.position;
        e.reset().unwrap();
        assert_approx_eq!(e.time(), 0.0);
        e.step(0.5, &cruise());
        assert_eq!(*e.truth(), first);
        assert_eq!(e.get_estimate().state.position, est);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let bad_rate = EngineConfig {
            physics_rate_hz: 0.0,
            ..Default::default()
        };
        assert!(SimulationEngine::new(bad_rate).is_err());
        let unknown = EngineConfig {
            aircraft: AircraftSource::Id("glider_x".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SimulationEngine::new(unknown),
            Err(SimError::UnknownAircraft(_))
        ));
        let negative = EngineConfig {
            initial_covariance: StateVariances::uniform(-1.0),
            ..Default::default()
        };
        assert!(SimulationEngine::new(negative).is_err());
        let nan_bias = EngineConfig {
            truth_accel_bias: [0.0, f64::NAN, 0.0],
            ..Default::default()
        };
        assert!(SimulationEngine::new(nan_bias).is_err());
    }

    #[test]
    fn filter_starts_from_block_covariance() {
        let e = engine();
        let p = e.ekf().covariance();
        let q = e.ekf().process_noise();
        let dt = e.fixed_dt();
        assert_approx_eq!(p[(0, 0)], StateVariances::INITIAL.position);
        assert_approx_eq!(
            p[(index::GYRO_BIAS, index::GYRO_BIAS)],
            StateVariances::INITIAL.gyro_bias
        );
        assert_approx_eq!(q[(index::VELOCITY, index::VELOCITY)], 1e-2 * dt, 1e-15);
        let attitude = p.view((index::ATTITUDE, index::ATTITUDE), (4, 4));
        assert!(attitude.amax() < 1e-4);
    }

    #[test]
    fn config_loads_partial_json() {
        let json = r#"{"physics_rate_hz": 50.0, "initial_state": {"u": 45.0, "z": -500.0}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_approx_eq!(config.physics_rate_hz, 50.0);
        assert_approx_eq!(config.initial_state.altitude(), 500.0);
        assert_eq!(config.aircraft, AircraftSource::Id(DEFAULT_AIRCRAFT_ID.to_string()));
        let e = SimulationEngine::new(config).unwrap();
        assert_approx_eq!(e.fixed_dt(), 0.02);
    }

    #[test]
    fn set_aircraft_swaps_airframe_and_resets() {
        let mut e = engine();
        e.single_step(&cruise());
        e.set_aircraft(aircraft::cessna_172r_relaxed()).unwrap();
        assert_eq!(e.aircraft().id, "cessna_172r_relaxed");
        assert_approx_eq!(e.time(), 0.0);
        assert_eq!(e.diagnostics().steps, 0);

        let mut broken = aircraft::cessna_172r();
        broken.mass.mass = 0.0;
        assert!(e.set_aircraft(broken).is_err());
        assert_eq!(e.aircraft().id, "cessna_172r_relaxed");
    }
}
