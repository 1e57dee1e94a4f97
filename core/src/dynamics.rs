//! Rigid-body equations of motion for the twelve-state truth model.
//!
//! Translational dynamics follow Newton's law in the rotating body frame:
//!
//! $$
//! \dot v_b = \frac{F_b}{m} + g_b - \omega \times v_b
//! $$
//!
//! Rotational dynamics follow Euler's equation with a non-zero $I_{xz}$ product of inertia,
//! which couples roll and yaw accelerations through a 2×2 linear solve while pitch stays
//! decoupled. Euler-angle kinematics use the standard tan/sec transformation and the NED
//! position rate is the body velocity rotated by $R_{be}(\phi, \theta, \psi)$.

use log::warn;
use nalgebra::{DVector, Vector3};

use crate::aerodynamics;
use crate::aircraft::{AircraftConfig, MassProperties};
use crate::math::{GRAVITY, body_to_ned_matrix};
use crate::{ControlInput, RIGID_BODY_STATE_DIM, RigidBodyState};

/// Smallest |cos θ| used in the Euler kinematic divisors.
pub const MIN_COS_THETA: f64 = 1e-6;
/// Below this |Γ| = |IxxIzz − Ixz²| the roll/yaw solve falls back to the decoupled form.
const MIN_INERTIA_DETERMINANT: f64 = 1e-9;

/// State derivative for given body-frame force (N) and moment (N·m) under gravity `gravity`.
///
/// The returned [`RigidBodyState`] holds time derivatives component-wise.
pub fn rigid_body_derivative(
    mass: &MassProperties,
    state: &RigidBodyState,
    force: &Vector3<f64>,
    moment: &Vector3<f64>,
    gravity: f64,
) -> RigidBodyState {
    let (u, v, w) = (state.u, state.v, state.w);
    let (p, q, r) = (state.p, state.q, state.r);
    let (sin_phi, cos_phi) = state.phi.sin_cos();
    let (sin_theta, raw_cos_theta) = state.theta.sin_cos();

    let g = Vector3::new(
        -gravity * sin_theta,
        gravity * sin_phi * raw_cos_theta,
        gravity * cos_phi * raw_cos_theta,
    );

    let u_dot = force.x / mass.mass + g.x - (q * w - r * v);
    let v_dot = force.y / mass.mass + g.y - (r * u - p * w);
    let w_dot = force.z / mass.mass + g.z - (p * v - q * u);

    let (ixx, iyy, izz, ixz) = (mass.ixx, mass.iyy, mass.izz, mass.ixz);
    let roll_rhs = moment.x + (iyy - izz) * q * r + ixz * p * q;
    let yaw_rhs = moment.z + (ixx - iyy) * p * q - ixz * q * r;
    let gamma = ixx * izz - ixz * ixz;
    let (p_dot, r_dot) = if gamma.abs() > MIN_INERTIA_DETERMINANT {
        (
            (izz * roll_rhs + ixz * yaw_rhs) / gamma,
            (ixz * roll_rhs + ixx * yaw_rhs) / gamma,
        )
    } else {
        (roll_rhs / ixx, yaw_rhs / izz)
    };
    let q_dot = (moment.y + (izz - ixx) * p * r + ixz * (r * r - p * p)) / iyy;

    let cos_theta = guarded_cos(raw_cos_theta);
    let tan_theta = sin_theta / cos_theta;
    let q_sin_r_cos = q * sin_phi + r * cos_phi;
    let phi_dot = p + q_sin_r_cos * tan_theta;
    let theta_dot = q * cos_phi - r * sin_phi;
    let psi_dot = q_sin_r_cos / cos_theta;

    let position_dot = body_to_ned_matrix(state.phi, state.theta, state.psi) * state.velocity();

    RigidBodyState {
        u: u_dot,
        v: v_dot,
        w: w_dot,
        p: p_dot,
        q: q_dot,
        r: r_dot,
        phi: phi_dot,
        theta: theta_dot,
        psi: psi_dot,
        x: position_dot.x,
        y: position_dot.y,
        z: position_dot.z,
    }
}

fn guarded_cos(cos_theta: f64) -> f64 {
    if cos_theta.abs() >= MIN_COS_THETA {
        cos_theta
    } else if cos_theta >= 0.0 {
        MIN_COS_THETA
    } else {
        -MIN_COS_THETA
    }
}

/// Full truth-model derivative: aerodynamics, thrust and standard gravity.
pub fn state_derivative(
    config: &AircraftConfig,
    state: &RigidBodyState,
    controls: &ControlInput,
) -> RigidBodyState {
    let aero = aerodynamics::compute(config, state, controls);
    rigid_body_derivative(&config.mass, state, &aero.force, &aero.moment, GRAVITY)
}

/// Specific force (N/kg) sensed by an accelerometer at the centre of gravity.
pub fn specific_force(
    config: &AircraftConfig,
    state: &RigidBodyState,
    controls: &ControlInput,
) -> Vector3<f64> {
    aerodynamics::compute(config, state, controls).force / config.mass.mass
}

/// Vector form of [`state_derivative`]. A vector of the wrong length yields a zero derivative.
pub fn derivative_vector(
    config: &AircraftConfig,
    x: &DVector<f64>,
    controls: &ControlInput,
) -> DVector<f64> {
    match RigidBodyState::from_vector(x) {
        Ok(state) => state_derivative(config, &state, controls).to_vector(),
        Err(e) => {
            warn!("Truth derivative skipped: {e}");
            DVector::zeros(x.len())
        }
    }
}

/// Closure adapter binding an airframe and a held control input for the integrators.
pub fn aircraft_derivative<'a>(
    config: &'a AircraftConfig,
    controls: ControlInput,
) -> impl Fn(f64, &DVector<f64>) -> DVector<f64> + 'a {
    move |_t, x| derivative_vector(config, x, &controls)
}

/// Dimension of the vector produced by [`aircraft_derivative`].
pub const fn state_dimension() -> usize {
    RIGID_BODY_STATE_DIM
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::cessna_172r;
    use assert_approx_eq::assert_approx_eq;

    fn mass() -> MassProperties {
        cessna_172r().mass
    }

    #[test]
    fn free_fall_from_rest() {
        let state = RigidBodyState::default();
        let zero = Vector3::zeros();
        let d = rigid_body_derivative(&mass(), &state, &zero, &zero, GRAVITY);
        assert_approx_eq!(d.u, 0.0);
        assert_approx_eq!(d.w, GRAVITY);
        assert_approx_eq!(d.x, 0.0);
        assert_approx_eq!(d.z, 0.0);
    }

    #[test]
    fn coasting_without_forces_keeps_velocity() {
        let state = RigidBodyState {
            u: 50.0,
            v: -2.0,
            w: 1.0,
            psi: 0.5,
            ..Default::default()
        };
        let d = rigid_body_derivative(&mass(), &state, &Vector3::zeros(), &Vector3::zeros(), 0.0);
        for value in [d.u, d.v, d.w, d.p, d.q, d.r, d.phi, d.theta, d.psi] {
            assert_approx_eq!(value, 0.0);
        }
        let expected = body_to_ned_matrix(0.0, 0.0, 0.5) * state.velocity();
        assert_approx_eq!(d.x, expected.x);
        assert_approx_eq!(d.y, expected.y);
    }

    #[test]
    fn moments_map_to_rates_without_cross_term() {
        let m = mass();
        let state = RigidBodyState::default();
        let moment = Vector3::new(100.0, 200.0, 300.0);
        let d = rigid_body_derivative(&m, &state, &Vector3::zeros(), &moment, 0.0);
        assert_approx_eq!(d.p, 100.0 / m.ixx);
        assert_approx_eq!(d.q, 200.0 / m.iyy);
        assert_approx_eq!(d.r, 300.0 / m.izz);
    }

    #[test]
    fn cross_product_of_inertia_couples_roll_and_yaw() {
        let mut m = mass();
        m.ixz = 120.0;
        let state = RigidBodyState::default();
        let moment = Vector3::new(100.0, 0.0, 0.0);
        let d = rigid_body_derivative(&m, &state, &Vector3::zeros(), &moment, 0.0);
        // Residuals of Ixx ṗ − Ixz ṙ = L and Izz ṙ − Ixz ṗ = N.
        assert_approx_eq!(m.ixx * d.p - m.ixz * d.r, 100.0, 1e-9);
        assert_approx_eq!(m.izz * d.r - m.ixz * d.p, 0.0, 1e-9);
        assert!(d.r > 0.0);
    }

    #[test]
    fn gyroscopic_coupling() {
        let m = mass();
        let state = RigidBodyState {
            p: 0.3,
            r: 0.2,
            ..Default::default()
        };
        let d = rigid_body_derivative(&m, &state, &Vector3::zeros(), &Vector3::zeros(), 0.0);
        assert_approx_eq!(d.q, (m.izz - m.ixx) * 0.3 * 0.2 / m.iyy);
    }

    #[test]
    fn euler_rates_in_bank() {
        let state = RigidBodyState {
            phi: 0.4,
            theta: 0.2,
            q: 0.1,
            r: 0.05,
            ..Default::default()
        };
        let d = rigid_body_derivative(&mass(), &state, &Vector3::zeros(), &Vector3::zeros(), 0.0);
        let (s, c) = 0.4f64.sin_cos();
        assert_approx_eq!(d.phi, (0.1 * s + 0.05 * c) * 0.2f64.tan());
        assert_approx_eq!(d.theta, 0.1 * c - 0.05 * s);
        assert_approx_eq!(d.psi, (0.1 * s + 0.05 * c) / 0.2f64.cos());
    }

    #[test]
    fn gimbal_lock_stays_finite() {
        let state = RigidBodyState {
            u: 30.0,
            theta: std::f64::consts::FRAC_PI_2,
            q: 0.1,
            r: 0.1,
            ..Default::default()
        };
        let zero = Vector3::zeros();
        let d = rigid_body_derivative(&mass(), &state, &zero, &zero, GRAVITY);
        assert!(d.is_finite());
    }

    #[test]
    fn climbing_attitude_moves_up() {
        let state = RigidBodyState {
            u: 50.0,
            theta: 0.1,
            ..Default::default()
        };
        let d = rigid_body_derivative(&mass(), &state, &Vector3::zeros(), &Vector3::zeros(), 0.0);
        assert!(d.z < 0.0);
        assert_approx_eq!(d.z, -50.0 * 0.1f64.sin());
    }

    #[test]
    fn closure_adapter_matches_direct_call() {
        let config = cessna_172r();
        let controls = ControlInput::new(0.5, 0.0, -0.05, 0.0);
        let state = RigidBodyState::level(60.0, 1000.0);
        let f = aircraft_derivative(&config, controls);
        let via_closure = f(0.0, &state.to_vector());
        let direct = state_derivative(&config, &state, &controls).to_vector();
        assert_eq!(via_closure, direct);
        assert_eq!(f(0.0, &DVector::zeros(5)).len(), 5);
        assert_eq!(via_closure.len(), state_dimension());
    }

    #[test]
    fn specific_force_excludes_gravity() {
        let config = cessna_172r();
        let state = RigidBodyState::level(60.0, 1000.0);
        let f = specific_force(&config, &state, &ControlInput::default());
        let aero = aerodynamics::compute(&config, &state, &ControlInput::default());
        assert_approx_eq!(f.z, aero.force.z / 1111.0);
    }
}
