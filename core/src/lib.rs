//! Six-degree-of-freedom flight dynamics, estimation, and control-synthesis toolbox
//!
//! This crate couples a deterministic rigid-body flight simulator with a nonlinear state estimator
//! (Extended Kalman Filter), offline control-law synthesis (trim solving, linearization, LQR gain
//! computation), and a validation layer that performs observability analysis and estimator-consistency
//! testing under sensor fault and adversarial-noise injection. Simulation runs synchronously on the
//! calling thread; only Monte Carlo trials fan out across threads. The only source of
//! nondeterminism is seeded random number generation.
//!
//! The crate is built primarily on these dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): dense linear algebra (Cholesky, LU, SVD, Schur).
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr):
//!   sensor noise, fault random walks, adversarial directions and Monte Carlo trials.
//! - [`serde`](https://crates.io/crates/serde): configuration files and the validation snapshot contract.
//! - [`rayon`](https://crates.io/crates/rayon): parallel Monte Carlo trials.
//! - [`csv`](https://crates.io/crates/csv): headless simulation output.
//!
//! ## Crate overview
//!
//! - [math]: vector and quaternion primitives and the Euler <-> quaternion boundary.
//! - [aircraft]: immutable airframe parameter records and the built-in database.
//! - [aerodynamics]: linear stability-derivative force and moment model.
//! - [dynamics]: rigid-body equations of motion.
//! - [integrator]: stateless RK4 and explicit Euler steppers.
//! - [trim]: Newton-Raphson level-flight trim solver.
//! - [linearize]: finite-difference Jacobians and eigenvalue stability classification.
//! - [kalman]: the 19-state Extended Kalman Filter and its process models.
//! - [lqr]: Riccati ODE integration for state-feedback gains.
//! - [control]: PID loops and the autopilot.
//! - [measurements]: GPS and IMU sensor models.
//! - [faults]: time-windowed sensor fault injection.
//! - [adversarial]: measurement-space perturbations aimed at weakly observable directions.
//! - [observability] and [consistency]: rank/conditioning analysis and NEES/NIS statistics.
//! - [validation]: the serialized validation snapshot and Monte Carlo runs.
//! - [engine]: the fixed-step host-loop simulation engine.
//! - [sim]: headless scripted simulation with CSV output.
//!
//! ## Coordinate and state definitions
//!
//! The inertial frame is North-East-Down (NED) and the body frame is forward-right-down. The truth
//! model carries the classic twelve-state vector
//!
//! $$
//! x = [u, v, w, p, q, r, \phi, \theta, \psi, x_n, y_e, z_d]
//! $$
//!
//! where $(u, v, w)$ is body-frame velocity (m/s), $(p, q, r)$ body rates (rad/s), $(\phi, \theta, \psi)$
//! ZYX Euler angles (rad) and $(x_n, y_e, z_d)$ NED position (m). Altitude is $-z_d$. The estimator carries
//! a different, quaternion-based nineteen-state vector; see [kalman::EkfState]. Conversions between the
//! two representations live in [math] and [kalman] and are never mixed implicitly.
//!
//! The Euler kinematic equations divide by $\cos\theta$. The truth model clamps that divisor away from
//! zero, so the accepted attitude envelope is $|\theta| < 89.9°$.
pub mod adversarial;
pub mod aerodynamics;
pub mod aircraft;
pub mod consistency;
pub mod control;
pub mod dynamics;
pub mod engine;
pub mod error;
pub mod faults;
pub mod integrator;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod lqr;
pub mod math;
pub mod measurements;
pub mod observability;
pub mod sim;
pub mod trim;
pub mod validation;

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{self, Display};

use crate::error::{Result, SimError};
use crate::measurements::MeasurementModel;

/// Number of scalars in [`RigidBodyState`].
pub const RIGID_BODY_STATE_DIM: usize = 12;
/// Number of scalars in [`ControlInput`].
pub const CONTROL_DIM: usize = 4;

/// Generic Bayesian navigation filter interface.
///
/// `predict` always runs; `update` may decline a measurement (gating) or fail on a singular
/// innovation covariance, in which case the filter state is left untouched.
pub trait NavigationFilter {
    fn predict(&mut self, controls: &ControlInput, dt: f64);
    fn update<M: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &M,
    ) -> Result<kalman::UpdateReport>;
    fn get_estimate(&self) -> DVector<f64>;
    fn get_certainty(&self) -> DMatrix<f64>;
}

/// Normalized control surface and throttle commands.
///
/// Throttle lives in [0, 1]; the three surfaces live in [-1, 1] and are scaled by the
/// airframe's [`aircraft::ControlLimits`] into radians by the aerodynamic model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlInput {
    pub throttle: f64,
    pub aileron: f64,
    pub elevator: f64,
    pub rudder: f64,
}

impl ControlInput {
    pub fn new(throttle: f64, aileron: f64, elevator: f64, rudder: f64) -> Self {
        ControlInput {
            throttle,
            aileron,
            elevator,
            rudder,
        }
    }

    /// Saturate every channel to its physical range.
    pub fn clamped(&self) -> Self {
        ControlInput {
            throttle: self.throttle.clamp(0.0, 1.0),
            aileron: self.aileron.clamp(-1.0, 1.0),
            elevator: self.elevator.clamp(-1.0, 1.0),
            rudder: self.rudder.clamp(-1.0, 1.0),
        }
    }

    /// Vector form, ordered (throttle, aileron, elevator, rudder).
    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.throttle, self.aileron, self.elevator, self.rudder])
    }

    pub fn from_vector(u: &DVector<f64>) -> Result<Self> {
        if u.len() != CONTROL_DIM {
            return Err(SimError::dimension("control vector", CONTROL_DIM, u.len()));
        }
        Ok(ControlInput::new(u[0], u[1], u[2], u[3]))
    }
}

/// Twelve-state truth representation using Euler attitude.
///
/// Each integration step produces a new value; states are never mutated in place by the
/// integrator so that RK4 stage evaluations stay composable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigidBodyState {
    /// Body-frame forward velocity (m/s)
    pub u: f64,
    /// Body-frame right velocity (m/s)
    pub v: f64,
    /// Body-frame down velocity (m/s)
    pub w: f64,
    /// Roll rate (rad/s)
    pub p: f64,
    /// Pitch rate (rad/s)
    pub q: f64,
    /// Yaw rate (rad/s)
    pub r: f64,
    /// Roll angle (rad)
    pub phi: f64,
    /// Pitch angle (rad)
    pub theta: f64,
    /// Yaw angle (rad)
    pub psi: f64,
    /// North position (m)
    pub x: f64,
    /// East position (m)
    pub y: f64,
    /// Down position (m)
    pub z: f64,
}

impl RigidBodyState {
    /// Wings-level state flying at `airspeed` along the body x axis at `altitude`.
    pub fn level(airspeed: f64, altitude: f64) -> Self {
        RigidBodyState {
            u: airspeed,
            z: -altitude,
            ..Default::default()
        }
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.u, self.v, self.w)
    }

    pub fn rates(&self) -> Vector3<f64> {
        Vector3::new(self.p, self.q, self.r)
    }

    pub fn euler(&self) -> Vector3<f64> {
        Vector3::new(self.phi, self.theta, self.psi)
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn altitude(&self) -> f64 {
        -self.z
    }

    pub fn airspeed(&self) -> f64 {
        self.velocity().norm()
    }

    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.to_array())
    }

    pub fn to_array(&self) -> [f64; RIGID_BODY_STATE_DIM] {
        [
            self.u, self.v, self.w, self.p, self.q, self.r, self.phi, self.theta, self.psi,
            self.x, self.y, self.z,
        ]
    }

    pub fn from_vector(x: &DVector<f64>) -> Result<Self> {
        RigidBodyState::try_from(x.as_slice())
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl TryFrom<&[f64]> for RigidBodyState {
    type Error = SimError;

    fn try_from(slice: &[f64]) -> std::result::Result<Self, Self::Error> {
        if slice.len() != RIGID_BODY_STATE_DIM {
            return Err(SimError::dimension(
                "rigid body state",
                RIGID_BODY_STATE_DIM,
                slice.len(),
            ));
        }
        Ok(RigidBodyState {
            u: slice[0],
            v: slice[1],
            w: slice[2],
            p: slice[3],
            q: slice[4],
            r: slice[5],
            phi: slice[6],
            theta: slice[7],
            psi: slice[8],
            x: slice[9],
            y: slice[10],
            z: slice[11],
        })
    }
}

impl From<&RigidBodyState> for DVector<f64> {
    fn from(state: &RigidBodyState) -> Self {
        state.to_vector()
    }
}

impl Display for RigidBodyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RigidBodyState {{ uvw: [{:.3}, {:.3}, {:.3}] m/s, pqr: [{:.4}, {:.4}, {:.4}] rad/s, attitude: [{:.2} deg, {:.2} deg, {:.2} deg], ned: [{:.2}, {:.2}, {:.2}] m }}",
            self.u,
            self.v,
            self.w,
            self.p,
            self.q,
            self.r,
            self.phi.to_degrees(),
            self.theta.to_degrees(),
            self.psi.to_degrees(),
            self.x,
            self.y,
            self.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn level_state() {
        let s = RigidBodyState::level(60.0, 1000.0);
        assert_approx_eq!(s.u, 60.0);
        assert_approx_eq!(s.z, -1000.0);
        assert_approx_eq!(s.altitude(), 1000.0);
        assert_approx_eq!(s.airspeed(), 60.0);
    }

    #[test]
    fn vector_round_trip() {
        let v: Vec<f64> = (0..12).map(|i| i as f64 * 0.5).collect();
        let s = RigidBodyState::try_from(v.as_slice()).unwrap();
        assert_approx_eq!(s.theta, 3.5);
        assert_approx_eq!(s.z, 5.5);
        assert_eq!(s.to_vector().as_slice(), v.as_slice());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = RigidBodyState::try_from([0.0; 9].as_slice()).unwrap_err();
        assert!(matches!(
            err,
            SimError::DimensionMismatch {
                expected: 12,
                found: 9,
                ..
            }
        ));
    }

    #[test]
    fn controls_clamp() {
        let c = ControlInput::new(1.4, -2.0, 0.3, 5.0).clamped();
        assert_eq!(c, ControlInput::new(1.0, -1.0, 0.3, 1.0));
        let neg = ControlInput::new(-0.2, 0.0, 0.0, 0.0).clamped();
        assert_approx_eq!(neg.throttle, 0.0);
    }

    #[test]
    fn controls_vector_order() {
        let c = ControlInput::new(0.5, 0.1, -0.2, 0.3);
        let u = c.to_vector();
        assert_eq!(u.as_slice(), &[0.5, 0.1, -0.2, 0.3]);
        assert_eq!(ControlInput::from_vector(&u).unwrap(), c);
        assert!(ControlInput::from_vector(&DVector::zeros(3)).is_err());
    }

    #[test]
    fn display_is_readable() {
        let s = RigidBodyState::level(60.0, 1000.0);
        let text = format!("{s}");
        assert!(text.contains("60.000"));
        assert!(text.contains("-1000.00"));
    }
}
