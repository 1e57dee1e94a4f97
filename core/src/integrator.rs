//! Fixed-step explicit integrators.
//!
//! Both steppers are pure functions of `(t, x, dt)` and a derivative callback, so the same
//! code drives forward simulation, the engine's deterministic prediction, and the
//! finite-difference Jacobians. Classical RK4 is used for the truth model. Explicit Euler is
//! used only inside the EKF predict step; it is a deliberate first-order approximation that
//! matches the discrete transition Φ = I + A·dt used for the covariance.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Classical fourth-order Runge-Kutta step with weights (1, 2, 2, 1)/6.
pub fn rk4<F>(t: f64, x: &DVector<f64>, dt: f64, f: F) -> DVector<f64>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let half = 0.5 * dt;
    let k1 = f(t, x);
    let k2 = f(t + half, &(x + &k1 * half));
    let k3 = f(t + half, &(x + &k2 * half));
    let k4 = f(t + dt, &(x + &k3 * dt));
    x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (dt / 6.0)
}

/// Explicit (forward) Euler step.
pub fn euler<F>(t: f64, x: &DVector<f64>, dt: f64, f: F) -> DVector<f64>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    x + f(t, x) * dt
}

/// Selectable integration scheme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integrator {
    #[default]
    Rk4,
    Euler,
}

impl Integrator {
    pub fn step<F>(&self, t: f64, x: &DVector<f64>, dt: f64, f: F) -> DVector<f64>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    {
        match self {
            Integrator::Rk4 => rk4(t, x, dt, f),
            Integrator::Euler => euler(t, x, dt, f),
        }
    }

    /// Integrate over `[t0, t0 + steps·dt]`.
    pub fn propagate<F>(
        &self,
        t0: f64,
        x0: &DVector<f64>,
        dt: f64,
        steps: usize,
        f: F,
    ) -> DVector<f64>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    {
        let mut x = x0.clone();
        for k in 0..steps {
            x = self.step(t0 + k as f64 * dt, &x, dt, &f);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::cessna_172r;
    use crate::aerodynamics;
    use crate::dynamics::{aircraft_derivative, rigid_body_derivative};
    use crate::{ControlInput, RigidBodyState};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector3;

    fn decay(_t: f64, x: &DVector<f64>) -> DVector<f64> {
        -x
    }

    #[test]
    fn rk4_exponential_decay() {
        let x0 = DVector::from_vec(vec![1.0]);
        let x = Integrator::Rk4.propagate(0.0, &x0, 0.1, 10, decay);
        assert_approx_eq!(x[0], (-1.0f64).exp(), 1e-6);
    }

    #[test]
    fn euler_is_first_order() {
        let x0 = DVector::from_vec(vec![1.0]);
        let x = Integrator::Euler.propagate(0.0, &x0, 0.1, 10, decay);
        assert_approx_eq!(x[0], 0.9f64.powi(10), 1e-12);
        let single = euler(0.0, &x0, 0.1, decay);
        assert_approx_eq!(single[0], 0.9);
    }

    #[test]
    fn rk4_harmonic_oscillator_conserves_energy() {
        let f = |_t: f64, x: &DVector<f64>| DVector::from_vec(vec![x[1], -x[0]]);
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        let x = Integrator::Rk4.propagate(0.0, &x0, 0.01, 628, f);
        let energy = x[0] * x[0] + x[1] * x[1];
        assert_approx_eq!(energy, 1.0, 1e-8);
    }

    #[test]
    fn rk4_uses_time_argument() {
        let f = |t: f64, _x: &DVector<f64>| DVector::from_vec(vec![2.0 * t]);
        let x = rk4(1.0, &DVector::from_vec(vec![0.0]), 0.5, f);
        // ∫_1^1.5 2t dt = 1.25, exact for polynomials of degree ≤ 4.
        assert_approx_eq!(x[0], 1.25, 1e-12);
    }

    #[test]
    fn coasting_body_keeps_velocity_and_rates() {
        let mass = cessna_172r().mass;
        let state = RigidBodyState {
            u: 40.0,
            v: 1.0,
            psi: 0.3,
            z: -500.0,
            ..Default::default()
        };
        let f = |_t: f64, x: &DVector<f64>| match RigidBodyState::from_vector(x) {
            Ok(s) => rigid_body_derivative(&mass, &s, &Vector3::zeros(), &Vector3::zeros(), 0.0)
                .to_vector(),
            Err(_) => DVector::zeros(x.len()),
        };
        for dt in [0.001, 0.01, 0.5] {
            let next = RigidBodyState::from_vector(&rk4(0.0, &state.to_vector(), dt, f)).unwrap();
            assert_approx_eq!(next.u, state.u, 1e-12);
            assert_approx_eq!(next.v, state.v, 1e-12);
            assert_approx_eq!(next.p, 0.0, 1e-12);
            assert_approx_eq!(next.q, 0.0, 1e-12);
            assert_approx_eq!(next.r, 0.0, 1e-12);
            assert!(next.x > state.x);
        }
    }

    #[test]
    fn truth_model_step_is_deterministic() {
        let config = cessna_172r();
        let controls = ControlInput::new(0.5, 0.0, 0.0, 0.0);
        let x0 = RigidBodyState::level(60.0, 1000.0).to_vector();
        let a = rk4(0.0, &x0, 0.01, aircraft_derivative(&config, controls));
        let b = rk4(0.0, &x0, 0.01, aircraft_derivative(&config, controls));
        assert_eq!(a, b);
        let s = RigidBodyState::from_vector(&a).unwrap();
        assert!(s.x > 0.5);
        assert!(aerodynamics::compute(&config, &s, &controls).air_data.airspeed > 59.0);
    }
}
