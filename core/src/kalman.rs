//! Extended Kalman Filter over a nineteen-state quaternion navigation vector.
//!
//! The estimator state is laid out as
//!
//! $$
//! x = [p_n, p_e, p_d,\; u, v, w,\; q_x, q_y, q_z, q_w,\; p, q, r,\; b_{g,x}, b_{g,y}, b_{g,z},\; b_{a,x}, b_{a,y}, b_{a,z}]
//! $$
//!
//! with NED position, body-frame velocity, the body-to-NED attitude quaternion, body rates and
//! constant gyro and accelerometer biases. The continuous dynamics come from a [`ProcessModel`];
//! the filter discretizes them with a first-order transition $\Phi = I + A\,dt$, where $A$ is a
//! central-difference Jacobian of the model evaluated at the pre-predict estimate.
//!
//! The quaternion carries four components for three rotational degrees of freedom. After every
//! renormalization the attitude block of P is mapped through the Jacobian of q ↦ q/|q|, which
//! keeps the covariance in the tangent space of the unit sphere; [`StateVariances`] builds P₀ and
//! Q the same way from a small-angle attitude variance.
//!
//! Measurements arrive through the crate's [`MeasurementModel`] trait and are fused with the
//! Joseph-form covariance update. An optional χ² innovation gate can veto an update, and an
//! optional per-sensor adaptive tuner scales the measurement covariance. A sensor locked out by
//! the gate for longer than its recovery window has its next measurement forced through after
//! the covariance is inflated along the measured directions.
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix4, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::consistency::{AdaptiveRConfig, AdaptiveRTuner, GatingConfig, InnovationGate};
use crate::dynamics::state_derivative;
use crate::error::{Result, SimError};
use crate::linalg::{invert, symmetrize};
use crate::linearize::numerical_jacobian;
use crate::math::{
    euler_to_quaternion, quaternion_derivative, quaternion_from_slice, quaternion_to_euler,
    quaternion_to_slice,
};
use crate::measurements::MeasurementModel;
use crate::{ControlInput, NavigationFilter, RigidBodyState};

/// Offsets of each block in the estimator state vector.
pub mod index {
    pub const POSITION: usize = 0;
    pub const VELOCITY: usize = 3;
    /// Quaternion stored as (x, y, z, w)
    pub const ATTITUDE: usize = 6;
    pub const ANGULAR_RATE: usize = 10;
    pub const GYRO_BIAS: usize = 13;
    pub const ACCEL_BIAS: usize = 16;
    pub const STATE_DIM: usize = 19;
}

/// Step for the process Jacobian.
pub const PROCESS_JACOBIAN_EPS: f64 = 1e-5;

const MIN_QUATERNION_NORM: f64 = 1e-12;

/// Named view of the estimator state vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EkfState {
    pub position: Vector3<f64>,
    /// Body-frame velocity (m/s)
    pub velocity: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
    pub angular_rate: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
}

impl Default for EkfState {
    fn default() -> Self {
        EkfState {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            angular_rate: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }
    }
}

impl EkfState {
    /// Truth-to-estimate boundary. Biases start at zero.
    pub fn from_rigid_body(state: &RigidBodyState) -> Self {
        EkfState {
            position: state.position(),
            velocity: state.velocity(),
            attitude: euler_to_quaternion(state.phi, state.theta, state.psi),
            angular_rate: state.rates(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
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

    pub fn to_vector(&self) -> DVector<f64> {
        let mut x = DVector::zeros(index::STATE_DIM);
        x.rows_mut(index::POSITION, 3).copy_from(&self.position);
        x.rows_mut(index::VELOCITY, 3).copy_from(&self.velocity);
        quaternion_to_slice(self.attitude.quaternion(), x.as_mut_slice(), index::ATTITUDE);
        x.rows_mut(index::ANGULAR_RATE, 3).copy_from(&self.angular_rate);
        x.rows_mut(index::GYRO_BIAS, 3).copy_from(&self.gyro_bias);
        x.rows_mut(index::ACCEL_BIAS, 3).copy_from(&self.accel_bias);
        x
    }

    /// Parse a state vector; the quaternion block is normalized on the way in.
    pub fn from_vector(x: &DVector<f64>) -> Result<Self> {
        if x.len() != index::STATE_DIM {
            return Err(SimError::dimension("EKF state", index::STATE_DIM, x.len()));
        }
        let block = |start: usize| Vector3::new(x[start], x[start + 1], x[start + 2]);
        Ok(EkfState {
            position: block(index::POSITION),
            velocity: block(index::VELOCITY),
            attitude: unit_attitude(x),
            angular_rate: block(index::ANGULAR_RATE),
            gyro_bias: block(index::GYRO_BIAS),
            accel_bias: block(index::ACCEL_BIAS),
        })
    }
}

/// Normalized attitude from the quaternion block, identity when degenerate.
fn unit_attitude(x: &DVector<f64>) -> UnitQuaternion<f64> {
    let raw = quaternion_from_slice(x.as_slice(), index::ATTITUDE);
    let n = raw.norm();
    if n.is_finite() && n > MIN_QUATERNION_NORM {
        UnitQuaternion::new_unchecked(raw / n)
    } else {
        UnitQuaternion::identity()
    }
}

/// Renormalize the quaternion block of a state vector in place and return its previous norm.
///
/// A degenerate block is replaced by the identity and reported with norm 1.
pub fn normalize_attitude(x: &mut DVector<f64>) -> f64 {
    let raw = quaternion_from_slice(x.as_slice(), index::ATTITUDE).norm();
    let q = unit_attitude(x);
    quaternion_to_slice(q.quaternion(), x.as_mut_slice(), index::ATTITUDE);
    if raw.is_finite() && raw > MIN_QUATERNION_NORM { raw } else { 1.0 }
}

/// Quaternion block of a state vector as (x, y, z, w).
fn attitude_components(x: &DVector<f64>) -> Vector4<f64> {
    x.fixed_rows::<4>(index::ATTITUDE).into_owned()
}

/// (I − q̂q̂ᵀ) for a unit quaternion.
fn tangent_projector(q: &Vector4<f64>) -> Matrix4<f64> {
    Matrix4::identity() - q * q.transpose()
}

/// Map P through the Jacobian of q ↦ q/|q| evaluated at the normalized quaternion.
///
/// $$
/// J = \frac{I - \hat q \hat q^T}{|q|}, \qquad P \leftarrow T P T^T, \quad T = \mathrm{blkdiag}(I, J, I)
/// $$
pub fn project_attitude_covariance(p: &DMatrix<f64>, x: &DVector<f64>, norm: f64) -> DMatrix<f64> {
    let n = p.nrows();
    let j = tangent_projector(&attitude_components(x)) / norm;
    let mut t = DMatrix::identity(n, n);
    t.view_mut((index::ATTITUDE, index::ATTITUDE), (4, 4))
        .copy_from(&j);
    symmetrize(&(&t * p * t.transpose()))
}

/// Per-block variances used to build an initial covariance or a process noise matrix.
///
/// `attitude` is a small-angle variance (rad²) shared by the three rotation axes. It enters the
/// quaternion block as σ²/4 · (I − q̂q̂ᵀ), the covariance of δq = ½ q ⊗ [0, δθ].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateVariances {
    pub position: f64,
    pub velocity: f64,
    pub attitude: f64,
    pub angular_rate: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
}

impl StateVariances {
    /// Initial uncertainty for a filter seeded from a known flight condition.
    pub const INITIAL: StateVariances = StateVariances {
        position: 4.0,
        velocity: 1.0,
        attitude: 1e-4,
        angular_rate: 1e-3,
        gyro_bias: 1e-4,
        accel_bias: 1e-2,
    };

    /// Process noise density per second of simulated time.
    pub const PROCESS_DENSITY: StateVariances = StateVariances {
        position: 1e-3,
        velocity: 1e-2,
        attitude: 1e-5,
        angular_rate: 1e-3,
        gyro_bias: 1e-8,
        accel_bias: 1e-6,
    };

    pub fn uniform(variance: f64) -> Self {
        StateVariances {
            position: variance,
            velocity: variance,
            attitude: variance,
            angular_rate: variance,
            gyro_bias: variance,
            accel_bias: variance,
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        StateVariances {
            position: self.position * factor,
            velocity: self.velocity * factor,
            attitude: self.attitude * factor,
            angular_rate: self.angular_rate * factor,
            gyro_bias: self.gyro_bias * factor,
            accel_bias: self.accel_bias * factor,
        }
    }

    /// Every block finite and non-negative.
    pub fn validate(&self, what: &str) -> Result<()> {
        let blocks = [
            self.position,
            self.velocity,
            self.attitude,
            self.angular_rate,
            self.gyro_bias,
            self.accel_bias,
        ];
        if blocks.iter().all(|v| v.is_finite() && *v >= 0.0) {
            Ok(())
        } else {
            Err(SimError::InvalidParameter(format!(
                "{what} variances must be finite and non-negative: {self:?}"
            )))
        }
    }

    /// Block-diagonal covariance about `state`.
    pub fn covariance(&self, state: &EkfState) -> DMatrix<f64> {
        let n = index::STATE_DIM;
        let mut p = DMatrix::zeros(n, n);
        for i in 0..3 {
            p[(index::POSITION + i, index::POSITION + i)] = self.position;
            p[(index::VELOCITY + i, index::VELOCITY + i)] = self.velocity;
            p[(index::ANGULAR_RATE + i, index::ANGULAR_RATE + i)] = self.angular_rate;
            p[(index::GYRO_BIAS + i, index::GYRO_BIAS + i)] = self.gyro_bias;
            p[(index::ACCEL_BIAS + i, index::ACCEL_BIAS + i)] = self.accel_bias;
        }
        let q = state.attitude.quaternion().coords;
        p.view_mut((index::ATTITUDE, index::ATTITUDE), (4, 4))
            .copy_from(&(tangent_projector(&q) * (self.attitude / 4.0)));
        p
    }
}

// ============= Process models ===================================================================

/// Continuous-time estimator dynamics ẋ = f(x, u).
pub trait ProcessModel {
    fn derivative(&self, x: &DVector<f64>, controls: &ControlInput) -> DVector<f64>;
}

/// Shared kinematic rows: ṗ = R(q) v and q̇ = ½ q ⊗ [0, ω].
fn kinematic_rows(x: &DVector<f64>, dx: &mut DVector<f64>) {
    let q_raw = quaternion_from_slice(x.as_slice(), index::ATTITUDE);
    let attitude = unit_attitude(x);
    let v = x.fixed_rows::<3>(index::VELOCITY).into_owned();
    let omega = x.fixed_rows::<3>(index::ANGULAR_RATE).into_owned();
    dx.rows_mut(index::POSITION, 3)
        .copy_from(&attitude.transform_vector(&v));
    let q_dot = quaternion_derivative(&q_raw, &omega);
    quaternion_to_slice(&q_dot, dx.as_mut_slice(), index::ATTITUDE);
}

/// Full aerodynamic model: the truth equations of motion evaluated on the estimate.
#[derive(Clone, Debug)]
pub struct AircraftProcessModel {
    pub aircraft: AircraftConfig,
}

impl AircraftProcessModel {
    pub fn new(aircraft: AircraftConfig) -> Self {
        AircraftProcessModel { aircraft }
    }
}

impl ProcessModel for AircraftProcessModel {
    fn derivative(&self, x: &DVector<f64>, controls: &ControlInput) -> DVector<f64> {
        let mut dx = DVector::zeros(index::STATE_DIM);
        if x.len() != index::STATE_DIM {
            warn!("Process model called with a {}-element state", x.len());
            return DVector::zeros(x.len());
        }
        kinematic_rows(x, &mut dx);
        let (phi, theta, psi) = quaternion_to_euler(&unit_attitude(x));
        let body = RigidBodyState {
            u: x[index::VELOCITY],
            v: x[index::VELOCITY + 1],
            w: x[index::VELOCITY + 2],
            p: x[index::ANGULAR_RATE],
            q: x[index::ANGULAR_RATE + 1],
            r: x[index::ANGULAR_RATE + 2],
            phi,
            theta,
            psi,
            x: x[index::POSITION],
            y: x[index::POSITION + 1],
            z: x[index::POSITION + 2],
        };
        let d = state_derivative(&self.aircraft, &body, controls);
        dx.rows_mut(index::VELOCITY, 3).copy_from(&d.velocity());
        dx.rows_mut(index::ANGULAR_RATE, 3).copy_from(&d.rates());
        dx
    }
}

/// Constant body velocity and rates.
#[derive(Clone, Copy, Debug, Default)]
pub struct KinematicProcessModel;

impl ProcessModel for KinematicProcessModel {
    fn derivative(&self, x: &DVector<f64>, _controls: &ControlInput) -> DVector<f64> {
        if x.len() != index::STATE_DIM {
            warn!("Process model called with a {}-element state", x.len());
            return DVector::zeros(x.len());
        }
        let mut dx = DVector::zeros(index::STATE_DIM);
        kinematic_rows(x, &mut dx);
        dx
    }
}

// ============= Filter ===========================================================================

/// Outcome of a single measurement update.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateReport {
    pub sensor_id: String,
    /// y = z − h(x̂)
    pub innovation: DVector<f64>,
    /// S = H P Hᵀ + R_eff
    pub innovation_covariance: DMatrix<f64>,
    pub nis: f64,
    /// False when the innovation gate vetoed the update
    pub accepted: bool,
    /// True when a gated measurement was forced through after a lock-out
    pub recovered: bool,
    pub r_multiplier: f64,
}

/// Extended Kalman Filter generic over its process model.
///
/// # Example
///
/// ```rust
/// use aerosim::kalman::{EkfState, ExtendedKalmanFilter, KinematicProcessModel, StateVariances};
/// use aerosim::measurements::{GPS_SENSOR_ID, Measurement, MeasurementKind};
/// use aerosim::{ControlInput, NavigationFilter, RigidBodyState};
/// use nalgebra::{DMatrix, DVector};
///
/// let x0 = EkfState::from_rigid_body(&RigidBodyState::level(50.0, 500.0));
/// let mut ekf = ExtendedKalmanFilter::new(
///     KinematicProcessModel,
///     x0,
///     StateVariances::INITIAL.covariance(&x0),
///     StateVariances::PROCESS_DENSITY.scaled(0.01).covariance(&x0),
/// )
/// .unwrap();
/// ekf.predict(&ControlInput::default(), 0.01);
/// let gps = Measurement::new(
///     GPS_SENSOR_ID,
///     DVector::from_vec(vec![0.5, 0.0, -500.0]),
///     DMatrix::identity(3, 3) * 4.0,
///     MeasurementKind::GpsPosition,
///     0.01,
/// )
/// .unwrap();
/// let report = ekf.update(&gps).unwrap();
/// assert!(report.accepted);
/// ```
#[derive(Clone)]
pub struct ExtendedKalmanFilter<P: ProcessModel> {
    model: P,
    mean_state: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    jacobian_epsilon: f64,
    gate: Option<InnovationGate>,
    adaptive: Option<AdaptiveRConfig>,
    tuners: HashMap<String, AdaptiveRTuner>,
    /// Timestamp of the last accepted update, per sensor
    last_accepted: HashMap<String, f64>,
    last_innovation: Option<DVector<f64>>,
}

impl<P: ProcessModel> Debug for ExtendedKalmanFilter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EKF")
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("gating", &self.gate.is_some())
            .field("adaptive_r", &self.adaptive.is_some())
            .finish()
    }
}

impl<P: ProcessModel> Display for ExtendedKalmanFilter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = EkfState::from_vector(&self.mean_state).unwrap_or_default();
        write!(
            f,
            "ExtendedKalmanFilter {{ position: [{:.2}, {:.2}, {:.2}], velocity: [{:.2}, {:.2}, {:.2}], trace(P): {:.4} }}",
            s.position.x,
            s.position.y,
            s.position.z,
            s.velocity.x,
            s.velocity.y,
            s.velocity.z,
            self.covariance.trace()
        )
    }
}

impl<P: ProcessModel> ExtendedKalmanFilter<P> {
    pub fn new(
        model: P,
        initial_state: EkfState,
        initial_covariance: DMatrix<f64>,
        process_noise: DMatrix<f64>,
    ) -> Result<Self> {
        let n = index::STATE_DIM;
        if initial_covariance.shape() != (n, n) {
            return Err(SimError::dimension(
                "EKF initial covariance",
                n,
                initial_covariance.nrows(),
            ));
        }
        if process_noise.shape() != (n, n) {
            return Err(SimError::dimension("EKF process noise", n, process_noise.nrows()));
        }
        Ok(ExtendedKalmanFilter {
            model,
            mean_state: initial_state.to_vector(),
            covariance: symmetrize(&initial_covariance),
            process_noise,
            jacobian_epsilon: PROCESS_JACOBIAN_EPS,
            gate: None,
            adaptive: None,
            tuners: HashMap::new(),
            last_accepted: HashMap::new(),
            last_innovation: None,
        })
    }

    pub fn with_gating(mut self, config: GatingConfig) -> Self {
        self.gate = config.enabled.then(|| InnovationGate::new(config));
        self
    }

    pub fn with_adaptive_r(mut self, config: AdaptiveRConfig) -> Self {
        self.adaptive = config.enabled.then_some(config);
        self
    }

    pub fn model(&self) -> &P {
        &self.model
    }

    pub fn state(&self) -> EkfState {
        EkfState::from_vector(&self.mean_state).unwrap_or_default()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }

    pub fn gate(&self) -> Option<&InnovationGate> {
        self.gate.as_ref()
    }

    pub fn r_multiplier(&self, sensor_id: &str) -> f64 {
        self.tuners.get(sensor_id).map_or(1.0, |t| t.multiplier())
    }

    pub fn last_innovation(&self) -> Option<&DVector<f64>> {
        self.last_innovation.as_ref()
    }

    /// Replace the estimate and covariance, clearing gate and tuner history.
    pub fn reset(&mut self, state: EkfState, covariance: DMatrix<f64>) -> Result<()> {
        let n = index::STATE_DIM;
        if covariance.shape() != (n, n) {
            return Err(SimError::dimension("EKF covariance", n, covariance.nrows()));
        }
        self.mean_state = state.to_vector();
        self.covariance = symmetrize(&covariance);
        self.last_innovation = None;
        self.tuners.clear();
        self.last_accepted.clear();
        if let Some(gate) = self.gate.as_mut() {
            gate.reset();
        }
        Ok(())
    }

    /// Continuous Jacobian A = ∂f/∂x at the current estimate.
    pub fn process_jacobian(&self, controls: &ControlInput) -> DMatrix<f64> {
        self.process_jacobian_at(&self.mean_state, controls)
    }

    /// Continuous Jacobian of the process model at an arbitrary state.
    pub fn process_jacobian_at(&self, x: &DVector<f64>, controls: &ControlInput) -> DMatrix<f64> {
        numerical_jacobian(
            |x| self.model.derivative(x, controls),
            x,
            self.jacobian_epsilon,
        )
    }

    /// Discrete transition Φ = I + A·dt at the current estimate.
    pub fn transition_matrix(&self, controls: &ControlInput, dt: f64) -> DMatrix<f64> {
        self.transition_matrix_at(&self.mean_state, controls, dt)
    }

    pub fn transition_matrix_at(
        &self,
        x: &DVector<f64>,
        controls: &ControlInput,
        dt: f64,
    ) -> DMatrix<f64> {
        let n = x.len();
        DMatrix::identity(n, n) + self.process_jacobian_at(x, controls) * dt
    }

    /// Seconds since `sensor_id` last had an update accepted. The first sighting starts the clock.
    fn silent_for(&mut self, sensor_id: &str, timestamp: f64) -> f64 {
        let since = *self
            .last_accepted
            .entry(sensor_id.to_string())
            .or_insert(timestamp);
        timestamp - since
    }

    /// P ← P + Hᵀ diag(y²) H: open the covariance along the directions the sensor observes.
    fn inflate_along(&mut self, h: &DMatrix<f64>, innovation: &DVector<f64>) {
        let weights = DMatrix::from_diagonal(&innovation.component_mul(innovation));
        self.covariance = symmetrize(&(&self.covariance + h.transpose() * weights * h));
    }

    fn noise_for(&self, sensor_id: &str, base: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
        match self.tuners.get(sensor_id) {
            Some(tuner) => (tuner.effective_noise(base), tuner.multiplier()),
            None => (base.clone(), 1.0),
        }
    }
}

impl<P: ProcessModel> NavigationFilter for ExtendedKalmanFilter<P> {
    /// Predict step
    ///
    /// $$
    /// \bar{x} = x + f(x, u)\,dt, \qquad \bar{P} = \Phi P \Phi^T + Q, \qquad \Phi = I + A\,dt
    /// $$
    ///
    /// followed by renormalization of the quaternion and projection of its covariance block.
    /// A non-finite result is discarded and the previous estimate kept.
    fn predict(&mut self, controls: &ControlInput, dt: f64) {
        let f = self.model.derivative(&self.mean_state, controls);
        let phi = self.transition_matrix(controls, dt);
        let mut next = &self.mean_state + f * dt;
        let norm = normalize_attitude(&mut next);
        let propagated = &phi * &self.covariance * phi.transpose() + &self.process_noise;
        let covariance = project_attitude_covariance(&propagated, &next, norm);
        if next.iter().all(|v| v.is_finite()) && covariance.iter().all(|v| v.is_finite()) {
            self.mean_state = next;
            self.covariance = covariance;
        } else {
            warn!("EKF predict produced non-finite values; keeping previous estimate");
        }
    }

    /// Measurement update with the Joseph-form covariance
    ///
    /// $$
    /// K = P H^T S^{-1}, \qquad P^+ = (I - KH) P (I - KH)^T + K R K^T
    /// $$
    ///
    /// A singular S or a rejected innovation leaves the filter untouched, unless the sensor has
    /// been locked out for the gate's recovery window.
    fn update<M: MeasurementModel + ?Sized>(&mut self, measurement: &M) -> Result<UpdateReport> {
        let n = self.mean_state.len();
        let m = measurement.get_dimension();
        let sensor_id = measurement.sensor_id().to_string();
        let h = measurement.get_jacobian(&self.mean_state);
        if h.shape() != (m, n) {
            return Err(SimError::dimension(
                format!("{sensor_id} measurement Jacobian columns"),
                n,
                h.ncols(),
            ));
        }
        let base_r = measurement.get_noise();
        if base_r.shape() != (m, m) {
            return Err(SimError::dimension(
                format!("{sensor_id} measurement noise"),
                m,
                base_r.nrows(),
            ));
        }
        if let Some(config) = self.adaptive {
            self.tuners
                .entry(sensor_id.clone())
                .or_insert_with(|| AdaptiveRTuner::new(config));
        }
        let (r, r_multiplier) = self.noise_for(&sensor_id, &base_r);

        let innovation =
            measurement.get_vector() - measurement.get_expected_measurement(&self.mean_state);
        let innovation_covariance = |p: &DMatrix<f64>| symmetrize(&(&h * p * h.transpose() + &r));
        let inverse = |s: &DMatrix<f64>| {
            invert(s, &format!("{sensor_id} innovation covariance")).inspect_err(|e| {
                warn!("Skipping {sensor_id} update: {e}");
            })
        };
        let mut s = innovation_covariance(&self.covariance);
        let mut s_inv = inverse(&s)?;
        let nis = innovation.dot(&(&s_inv * &innovation));
        self.last_innovation = Some(innovation.clone());

        let timestamp = measurement.timestamp();
        let silent_for = self.silent_for(&sensor_id, timestamp);
        let mut recovered = false;
        let accepted = match self.gate.as_mut() {
            Some(gate) => {
                let passed = gate.check(nis, m);
                if !passed && gate.recovery_due(silent_for) {
                    gate.record_recovery();
                    recovered = true;
                }
                passed || recovered
            }
            None => true,
        };
        if !accepted {
            debug!("Gated {sensor_id} measurement (NIS {nis:.2})");
            return Ok(UpdateReport {
                sensor_id,
                innovation,
                innovation_covariance: s,
                nis,
                accepted,
                recovered,
                r_multiplier,
            });
        }
        if recovered {
            warn!(
                "{sensor_id} gated for {silent_for:.1} s; \
                 inflating covariance and accepting (NIS {nis:.2})"
            );
            self.inflate_along(&h, &innovation);
            s = innovation_covariance(&self.covariance);
            s_inv = inverse(&s)?;
        }

        let k = &self.covariance * h.transpose() * &s_inv;
        let mut next = &self.mean_state + &k * &innovation;
        let norm = normalize_attitude(&mut next);
        let i_kh = DMatrix::identity(n, n) - &k * &h;
        let joseph = &i_kh * &self.covariance * i_kh.transpose() + &k * &r * k.transpose();
        let covariance = project_attitude_covariance(&joseph, &next, norm);
        if next.iter().any(|v| !v.is_finite()) || covariance.iter().any(|v| !v.is_finite()) {
            warn!("Skipping {sensor_id} update: non-finite posterior");
            return Err(SimError::singular(format!("{sensor_id} posterior")));
        }
        self.mean_state = next;
        self.covariance = covariance;
        self.last_accepted.insert(sensor_id.clone(), timestamp);
        if !recovered
            && let Some(tuner) = self.tuners.get_mut(&sensor_id)
        {
            tuner.update(&innovation, &s);
        }
        Ok(UpdateReport {
            sensor_id,
            innovation,
            innovation_covariance: s,
            nis,
            accepted,
            recovered,
            r_multiplier,
        })
    }

    fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }

    fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}
