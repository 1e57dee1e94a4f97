//! Linear stability-derivative aerodynamic model.
//!
//! Maps a [`RigidBodyState`] and normalized [`ControlInput`] to body-frame forces and
//! moments. Lift and drag are computed in stability axes and rotated into the body frame by
//! the angle of attack; side force and the three moments are formed directly in body axes.
//! Each coefficient is the sum of a zero-offset, a slope in α or β, a rate-damping term
//! non-dimensionalised by reference length / (2V), and a control-effectiveness term.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::{ControlInput, RigidBodyState};

/// Below this airspeed (m/s) forces, moments and airflow angles are defined as zero.
pub const MIN_AIRSPEED: f64 = 0.1;

/// Derived airflow quantities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AirData {
    pub airspeed: f64,
    /// Angle of attack α = atan2(w, u) (rad)
    pub alpha: f64,
    /// Sideslip β = asin(v / V) (rad)
    pub beta: f64,
    /// ½ρV² (Pa)
    pub dynamic_pressure: f64,
}

impl AirData {
    pub fn from_state(state: &RigidBodyState, density: f64) -> Self {
        let airspeed = state.airspeed();
        if airspeed < MIN_AIRSPEED {
            return AirData::default();
        }
        AirData {
            airspeed,
            alpha: state.w.atan2(state.u),
            beta: (state.v / airspeed).clamp(-1.0, 1.0).asin(),
            dynamic_pressure: 0.5 * density * airspeed * airspeed,
        }
    }
}

/// Non-dimensional coefficients at the current flight condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AeroCoefficientValues {
    pub lift: f64,
    pub drag: f64,
    pub side: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Body-frame force (N) and moment (N·m) plus the air data they were computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AeroOutput {
    pub force: Vector3<f64>,
    pub moment: Vector3<f64>,
    pub air_data: AirData,
    pub coefficients: AeroCoefficientValues,
}

/// Evaluate the coefficient build-up for a known air-data point.
pub fn coefficients(
    config: &AircraftConfig,
    state: &RigidBodyState,
    controls: &ControlInput,
    air: &AirData,
) -> AeroCoefficientValues {
    if air.airspeed < MIN_AIRSPEED {
        return AeroCoefficientValues::default();
    }
    let aero = &config.aero;
    let geometry = &config.geometry;
    let limits = &config.limits;

    let elevator = controls.elevator * limits.elevator_max_rad;
    let aileron = controls.aileron * limits.aileron_max_rad;
    let rudder = controls.rudder * limits.rudder_max_rad;

    let two_v = 2.0 * air.airspeed;
    let q_hat = state.q * geometry.mean_chord / two_v;
    let p_hat = state.p * geometry.wing_span / two_v;
    let r_hat = state.r * geometry.wing_span / two_v;

    let lift = aero.lift.c_l_0
        + aero.lift.c_l_alpha * air.alpha
        + aero.lift.c_l_q * q_hat
        + aero.lift.c_l_deltae * elevator;
    let drag = aero.drag.c_d_0 + aero.drag.k * lift * lift;
    let side = aero.side_force.c_y_beta * air.beta + aero.side_force.c_y_deltar * rudder;
    let roll = aero.roll.c_l_beta * air.beta
        + aero.roll.c_l_p * p_hat
        + aero.roll.c_l_deltaa * aileron;
    let pitch = aero.pitch.c_m_0
        + aero.pitch.c_m_alpha * air.alpha
        + aero.pitch.c_m_q * q_hat
        + aero.pitch.c_m_deltae * elevator;
    let yaw =
        aero.yaw.c_n_beta * air.beta + aero.yaw.c_n_r * r_hat + aero.yaw.c_n_deltar * rudder;

    AeroCoefficientValues {
        lift,
        drag,
        side,
        roll,
        pitch,
        yaw,
    }
}

/// Body-frame forces and moments for the given state and controls, thrust included.
pub fn compute(
    config: &AircraftConfig,
    state: &RigidBodyState,
    controls: &ControlInput,
) -> AeroOutput {
    let air_data = AirData::from_state(state, config.air_density);
    if air_data.airspeed < MIN_AIRSPEED {
        return AeroOutput::default();
    }
    let c = coefficients(config, state, controls, &air_data);
    let qs = air_data.dynamic_pressure * config.geometry.wing_area;

    let lift = qs * c.lift;
    let drag = qs * c.drag;
    let (sin_a, cos_a) = air_data.alpha.sin_cos();
    let thrust = config.propulsion.max_thrust * controls.throttle;

    let force = Vector3::new(
        -drag * cos_a + lift * sin_a + thrust,
        qs * c.side,
        -drag * sin_a - lift * cos_a,
    );
    let moment = Vector3::new(
        qs * config.geometry.wing_span * c.roll,
        qs * config.geometry.mean_chord * c.pitch,
        qs * config.geometry.wing_span * c.yaw,
    );
    AeroOutput {
        force,
        moment,
        air_data,
        coefficients: c,
    }
}
