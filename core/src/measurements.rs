//! Measurement models and synthetic sensors.
//!
//! [`MeasurementModel`] is the interface the estimator consumes: a measurement vector `z`,
//! its noise covariance `R`, the expected measurement `h(x)` and its Jacobian `H(x)` over the
//! nineteen-state EKF vector. [`GpsSensor`] and [`ImuSensor`] turn a truth sample into a
//! noisy [`Measurement`], routing the raw vector through a [`FaultInjector`] first. A sensor
//! returns `None` when a dropout is active; that is not an error.
//!
//! The accelerometer senses aerodynamic and thrust force per unit mass. With an airframe at
//! hand ([`MeasurementKind::ImuWithAirframe`]) the filter predicts exactly that from its velocity
//! and rate estimates; without one ([`MeasurementKind::Imu`]) it falls back to the unaccelerated
//! approximation f = −g_b(q), which only holds in steady flight.

use std::any::Any;
use std::fmt::{self, Display};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::dynamics;
use crate::engine::TruthState;
use crate::error::{Result, SimError};
use crate::faults::FaultInjector;
use crate::kalman::index;
use crate::linearize::numerical_jacobian;
use crate::math::GRAVITY;
use crate::{ControlInput, RigidBodyState};

pub const GPS_SENSOR_ID: &str = "gps_pos";
pub const IMU_SENSOR_ID: &str = "imu";

/// Step used when a model falls back to a numerical measurement Jacobian.
pub const MEASUREMENT_JACOBIAN_EPS: f64 = 1e-6;

/// Generic measurement model trait for all types of measurements
pub trait MeasurementModel: Any {
    /// Downcast helper method to allow for type-safe downcasting
    fn as_any(&self) -> &dyn Any;
    /// Identifier of the producing sensor
    fn sensor_id(&self) -> &str;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise covariance
    fn get_noise(&self) -> DMatrix<f64>;
    /// Map a state vector into measurement space
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Measurement Jacobian H = ∂h/∂x. Defaults to central differences of `h`.
    fn get_jacobian(&self, state: &DVector<f64>) -> DMatrix<f64> {
        numerical_jacobian(
            |x| self.get_expected_measurement(x),
            state,
            MEASUREMENT_JACOBIAN_EPS,
        )
    }
    /// Simulation time at which the measurement was taken (s)
    fn timestamp(&self) -> f64;
}

/// Measurement function family.
#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementKind {
    /// z = p_ned
    GpsPosition,
    /// z = [ω + b_g, −g_b(q) + b_a]
    Imu,
    /// z = [ω + b_g, F(v, ω, u)/m + b_a]
    ImuWithAirframe(SpecificForceModel),
    /// z = H x for an arbitrary constant H
    Linear(DMatrix<f64>),
}

/// Airframe and held controls an accelerometer prediction is evaluated with.
#[derive(Clone, Debug, PartialEq)]
pub struct SpecificForceModel {
    pub aircraft: Arc<AircraftConfig>,
    pub controls: ControlInput,
}

impl SpecificForceModel {
    pub fn new(aircraft: Arc<AircraftConfig>, controls: ControlInput) -> Self {
        SpecificForceModel { aircraft, controls }
    }

    /// Aerodynamic plus thrust force per unit mass at the estimated body velocity and rates.
    pub fn specific_force(&self, state: &DVector<f64>) -> Vector3<f64> {
        let (v, w) = (index::VELOCITY, index::ANGULAR_RATE);
        let body = RigidBodyState {
            u: state[v],
            v: state[v + 1],
            w: state[v + 2],
            p: state[w],
            q: state[w + 1],
            r: state[w + 2],
            ..Default::default()
        };
        dynamics::specific_force(&self.aircraft, &body, &self.controls)
    }
}

/// A single sensor sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub sensor_id: String,
    pub z: DVector<f64>,
    pub r: DMatrix<f64>,
    pub kind: MeasurementKind,
    pub timestamp: f64,
}

impl Measurement {
    pub fn new(
        sensor_id: &str,
        z: DVector<f64>,
        r: DMatrix<f64>,
        kind: MeasurementKind,
        timestamp: f64,
    ) -> Result<Self> {
        let m = z.len();
        if r.shape() != (m, m) {
            return Err(SimError::dimension("measurement noise", m, r.nrows()));
        }
        if let MeasurementKind::Linear(h) = &kind {
            if h.nrows() != m {
                return Err(SimError::dimension("measurement matrix rows", m, h.nrows()));
            }
        }
        Ok(Measurement {
            sensor_id: sensor_id.to_string(),
            z,
            r,
            kind,
            timestamp,
        })
    }

    /// Same sample, interpreted through a different measurement function.
    pub fn with_kind(self, kind: MeasurementKind) -> Self {
        Measurement { kind, ..self }
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Measurement({} @ {:.3} s, z: {:?})",
            self.sensor_id,
            self.timestamp,
            self.z.as_slice()
        )
    }
}

/// Position selector H = [I₃ | 0].
pub fn gps_position_jacobian(state_dim: usize) -> DMatrix<f64> {
    let mut h = DMatrix::zeros(3, state_dim);
    for i in 0..3 {
        h[(i, index::POSITION + i)] = 1.0;
    }
    h
}

/// Gravity resolved in body axes from raw quaternion components (x, y, z, w).
///
/// Written out polynomially so it stays differentiable in every component.
fn gravity_body_from_components(x: f64, y: f64, z: f64, w: f64) -> Vector3<f64> {
    GRAVITY
        * Vector3::new(
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            w * w - x * x - y * y + z * z,
        )
}

/// Gyro rows ω + b_g over accelerometer rows f + b_a.
fn imu_rows(state: &DVector<f64>, specific_force: &Vector3<f64>) -> DVector<f64> {
    let mut h = DVector::zeros(6);
    for i in 0..3 {
        h[i] = state[index::ANGULAR_RATE + i] + state[index::GYRO_BIAS + i];
        h[3 + i] = specific_force[i] + state[index::ACCEL_BIAS + i];
    }
    h
}

fn imu_expected(state: &DVector<f64>) -> DVector<f64> {
    let q = index::ATTITUDE;
    let g = gravity_body_from_components(state[q], state[q + 1], state[q + 2], state[q + 3]);
    imu_rows(state, &-g)
}

fn airframe_imu_expected(model: &SpecificForceModel, state: &DVector<f64>) -> DVector<f64> {
    imu_rows(state, &model.specific_force(state))
}

impl MeasurementModel for Measurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }
    fn get_dimension(&self) -> usize {
        self.z.len()
    }
    fn get_vector(&self) -> DVector<f64> {
        self.z.clone()
    }
    fn get_noise(&self) -> DMatrix<f64> {
        self.r.clone()
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        match &self.kind {
            MeasurementKind::GpsPosition => state.rows(index::POSITION, 3).into_owned(),
            MeasurementKind::Imu => imu_expected(state),
            MeasurementKind::ImuWithAirframe(model) => airframe_imu_expected(model, state),
            MeasurementKind::Linear(h) => h * state,
        }
    }
    fn get_jacobian(&self, state: &DVector<f64>) -> DMatrix<f64> {
        match &self.kind {
            MeasurementKind::GpsPosition => gps_position_jacobian(state.len()),
            MeasurementKind::Imu => {
                numerical_jacobian(imu_expected, state, MEASUREMENT_JACOBIAN_EPS)
            }
            MeasurementKind::ImuWithAirframe(model) => numerical_jacobian(
                |x| airframe_imu_expected(model, x),
                state,
                MEASUREMENT_JACOBIAN_EPS,
            ),
            MeasurementKind::Linear(h) => h.clone(),
        }
    }
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

// ============= Sensors ==========================================================================

fn normal(sigma: f64, what: &str) -> Result<Normal<f64>> {
    Normal::new(0.0, sigma)
        .map_err(|e| SimError::InvalidParameter(format!("{what} noise sigma {sigma}: {e}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub rate_hz: f64,
    /// Horizontal 1σ (m)
    pub sigma: f64,
    /// Vertical σ = sigma · vertical_factor
    pub vertical_factor: f64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        GpsConfig {
            rate_hz: 5.0,
            sigma: 2.0,
            vertical_factor: 2.0,
        }
    }
}

/// GPS position receiver.
#[derive(Clone, Debug)]
pub struct GpsSensor {
    pub config: GpsConfig,
    horizontal: Normal<f64>,
    vertical: Normal<f64>,
    rng: StdRng,
    next_sample: f64,
}

impl GpsSensor {
    pub fn new(config: GpsConfig, seed: u64) -> Result<Self> {
        if !(config.rate_hz > 0.0) {
            return Err(SimError::InvalidParameter(format!(
                "GPS rate must be positive, got {}",
                config.rate_hz
            )));
        }
        Ok(GpsSensor {
            horizontal: normal(config.sigma, "GPS horizontal")?,
            vertical: normal(config.sigma * config.vertical_factor, "GPS vertical")?,
            config,
            rng: StdRng::seed_from_u64(seed),
            next_sample: 0.0,
        })
    }

    pub fn id(&self) -> &str {
        GPS_SENSOR_ID
    }

    pub fn period(&self) -> f64 {
        1.0 / self.config.rate_hz
    }

    /// True once per sample period; advances the internal schedule when it fires.
    pub fn is_due(&mut self, sim_time: f64) -> bool {
        if sim_time + 1e-9 >= self.next_sample {
            while self.next_sample <= sim_time + 1e-9 {
                self.next_sample += self.period();
            }
            true
        } else {
            false
        }
    }

    pub fn reset_schedule(&mut self) {
        self.next_sample = 0.0;
    }

    pub fn noise_covariance(&self) -> DMatrix<f64> {
        let h = self.config.sigma.powi(2);
        let v = (self.config.sigma * self.config.vertical_factor).powi(2);
        DMatrix::from_diagonal(&DVector::from_vec(vec![h, h, v]))
    }

    pub fn jacobian(&self) -> DMatrix<f64> {
        gps_position_jacobian(index::STATE_DIM)
    }

    /// Noisy, fault-filtered position fix, or `None` during a dropout.
    pub fn measure(
        &mut self,
        truth: &TruthState,
        sim_time: f64,
        injector: &mut FaultInjector,
    ) -> Option<Measurement> {
        let noise = Vector3::new(
            self.horizontal.sample(&mut self.rng),
            self.horizontal.sample(&mut self.rng),
            self.vertical.sample(&mut self.rng),
        );
        let raw = DVector::from_column_slice((truth.position + noise).as_slice());
        let z = injector.apply(GPS_SENSOR_ID, &raw, sim_time)?;
        Some(Measurement {
            sensor_id: GPS_SENSOR_ID.to_string(),
            z,
            r: self.noise_covariance(),
            kind: MeasurementKind::GpsPosition,
            timestamp: sim_time,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Gyroscope 1σ (rad/s)
    pub gyro_sigma: f64,
    /// Accelerometer σ = gyro_sigma · accel_factor (m/s²)
    pub accel_factor: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        ImuConfig {
            gyro_sigma: 0.02,
            accel_factor: 10.0,
        }
    }
}

/// Six-axis IMU: body rates then specific force, with the truth biases baked in.
#[derive(Clone, Debug)]
pub struct ImuSensor {
    pub config: ImuConfig,
    gyro: Normal<f64>,
    accel: Normal<f64>,
    rng: StdRng,
}

impl ImuSensor {
    pub fn new(config: ImuConfig, seed: u64) -> Result<Self> {
        Ok(ImuSensor {
            gyro: normal(config.gyro_sigma, "gyro")?,
            accel: normal(config.gyro_sigma * config.accel_factor, "accelerometer")?,
            config,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn id(&self) -> &str {
        IMU_SENSOR_ID
    }

    pub fn noise_covariance(&self) -> DMatrix<f64> {
        let g = self.config.gyro_sigma.powi(2);
        let a = (self.config.gyro_sigma * self.config.accel_factor).powi(2);
        DMatrix::from_diagonal(&DVector::from_vec(vec![g, g, g, a, a, a]))
    }

    pub fn measure(
        &mut self,
        truth: &TruthState,
        sim_time: f64,
        injector: &mut FaultInjector,
    ) -> Option<Measurement> {
        let mut raw = DVector::zeros(6);
        for i in 0..3 {
            raw[i] = truth.angular_rate[i] + truth.gyro_bias[i] + self.gyro.sample(&mut self.rng);
            raw[3 + i] =
                truth.specific_force[i] + truth.accel_bias[i] + self.accel.sample(&mut self.rng);
        }
        let z = injector.apply(IMU_SENSOR_ID, &raw, sim_time)?;
        Some(Measurement {
            sensor_id: IMU_SENSOR_ID.to_string(),
            z,
            r: self.noise_covariance(),
            kind: MeasurementKind::Imu,
            timestamp: sim_time,
        })
    }
}
