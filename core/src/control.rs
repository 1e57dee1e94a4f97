//! PID loops and the autopilot that closes them around the aircraft.
//!
//! The autopilot consumes a twelve-state [`RigidBodyState`] (in the engine this is the EKF
//! estimate converted back to Euler form) and returns normalized, clamped [`ControlInput`]s.
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::error::Result;
use crate::linearize::{Linearizer, index};
use crate::lqr::{LqrConfig, LqrController, LqrSolution, LqrWeights, solve_care};
use crate::math::wrap_to_pi;
use crate::trim::TrimResult;
use crate::{ControlInput, RigidBodyState};

/// Single-loop PID with output clamping.
#[derive(Clone, Debug, PartialEq)]
pub struct Pid {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub min: f64,
    pub max: f64,
    integral: f64,
    prev_error: Option<f64>,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, min: f64, max: f64) -> Self {
        Pid {
            kp,
            ki,
            kd,
            min,
            max,
            integral: 0.0,
            prev_error: None,
        }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Advance the loop by `dt` with the current error.
    ///
    /// The derivative term is zero on the first call after a reset. The integral is frozen
    /// while the output is saturated in the direction of the error.
    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return (self.kp * error).clamp(self.min, self.max);
        }
        let derivative = self.prev_error.map_or(0.0, |prev| (error - prev) / dt);
        self.prev_error = Some(error);
        let integral = self.integral + error * dt;
        let raw = self.kp * error + self.ki * integral + self.kd * derivative;
        let output = raw.clamp(self.min, self.max);
        let winding_up = (raw > self.max && error > 0.0) || (raw < self.min && error < 0.0);
        if !winding_up {
            self.integral = integral;
        }
        output
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotMode {
    /// Manual controls pass through
    #[default]
    Off,
    /// Altitude, heading and airspeed hold
    PidSimple,
    /// Full-state LQR hold about the state latched on engagement
    LqrHold,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotTargets {
    /// m
    pub altitude: f64,
    /// rad
    pub heading: f64,
    /// m/s, body forward velocity
    pub airspeed: f64,
}

impl Default for AutopilotTargets {
    fn default() -> Self {
        AutopilotTargets {
            altitude: 1000.0,
            heading: 0.0,
            airspeed: 60.0,
        }
    }
}

/// Throttle around which the speed loop trims.
const BASE_THROTTLE: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct Autopilot {
    mode: AutopilotMode,
    pub targets: AutopilotTargets,
    altitude_pid: Pid,
    heading_pid: Pid,
    speed_pid: Pid,
    gain: Option<DMatrix<f64>>,
    trim_controls: ControlInput,
    hold: Option<LqrController>,
}

impl Default for Autopilot {
    fn default() -> Self {
        Autopilot {
            mode: AutopilotMode::Off,
            targets: AutopilotTargets::default(),
            altitude_pid: Pid::new(0.1, 0.01, 0.05, -0.2, 0.2),
            heading_pid: Pid::new(1.0, 0.0, 0.1, -0.5, 0.5),
            speed_pid: Pid::new(0.5, 0.1, 0.0, 0.0, 1.0),
            gain: None,
            trim_controls: ControlInput::new(BASE_THROTTLE, 0.0, 0.0, 0.0),
            hold: None,
        }
    }
}

impl Autopilot {
    pub fn new(mode: AutopilotMode) -> Self {
        Autopilot {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> AutopilotMode {
        self.mode
    }

    /// Switch modes, resetting loop memory and releasing any latched LQR reference.
    pub fn set_mode(&mut self, mode: AutopilotMode) {
        if mode != self.mode {
            debug!("Autopilot mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
        self.altitude_pid.reset();
        self.heading_pid.reset();
        self.speed_pid.reset();
        self.hold = None;
    }

    pub fn has_gain(&self) -> bool {
        self.gain.is_some()
    }

    pub fn gain(&self) -> Option<&DMatrix<f64>> {
        self.gain.as_ref()
    }

    /// Install a precomputed gain and the trim controls it regulates about.
    pub fn set_gain(&mut self, gain: DMatrix<f64>, trim_controls: ControlInput) {
        self.gain = Some(gain);
        self.trim_controls = trim_controls;
        self.hold = None;
    }

    /// Linearize at `trim`, solve the Riccati equation and install the gain.
    pub fn design_lqr(
        &mut self,
        aircraft: &AircraftConfig,
        trim: &TrimResult,
        weights: &LqrWeights,
        config: &LqrConfig,
    ) -> Result<LqrSolution> {
        weights.validate()?;
        let model = Linearizer::new(aircraft).linearize(&trim.trim_state(), &trim.trim_controls());
        let solution =
            solve_care(&model.a, &model.b, &weights.q_matrix(), &weights.r_matrix(), config)?;
        info!(
            "Installed LQR hold gain for {} (converged: {})",
            trim.trim_id(),
            solution.converged
        );
        self.set_gain(solution.k.clone(), trim.trim_controls());
        Ok(solution)
    }

    /// Reference latched by the LQR hold, if engaged.
    pub fn reference(&self) -> Option<&DVector<f64>> {
        self.hold.as_ref().map(|h| &h.x_ref)
    }

    /// Controls for the current state. `manual` is returned unchanged when the autopilot is off.
    pub fn update(
        &mut self,
        dt: f64,
        state: &RigidBodyState,
        manual: &ControlInput,
    ) -> ControlInput {
        match self.mode {
            AutopilotMode::Off => *manual,
            AutopilotMode::PidSimple => self.pid_simple(dt, state),
            AutopilotMode::LqrHold => self.lqr_hold(state),
        }
    }

    fn pid_simple(&mut self, dt: f64, state: &RigidBodyState) -> ControlInput {
        let altitude_error = self.targets.altitude - state.altitude();
        let heading_error = wrap_to_pi(self.targets.heading - state.psi);
        let speed_error = self.targets.airspeed - state.u;
        // Positive elevator pitches the nose down.
        let elevator = -self.altitude_pid.update(altitude_error, dt);
        let aileron = self.heading_pid.update(heading_error, dt);
        let throttle = BASE_THROTTLE + self.speed_pid.update(speed_error, dt);
        ControlInput::new(throttle, aileron, elevator, 0.0).clamped()
    }

    fn lqr_hold(&mut self, state: &RigidBodyState) -> ControlInput {
        let Some(gain) = self.gain.as_ref() else {
            return self.trim_controls;
        };
        let mut x = state.to_vector();
        if self.hold.is_none() {
            let u_ref = self.trim_controls.to_vector();
            match LqrController::with_input_reference(gain.clone(), x.clone(), u_ref) {
                Ok(hold) => self.hold = Some(hold),
                Err(e) => {
                    warn!("Cannot engage LQR hold: {e}");
                    return self.trim_controls;
                }
            }
        }
        let Some(hold) = self.hold.as_ref() else {
            return self.trim_controls;
        };
        // Horizontal position is not regulated and heading error is taken the short way round.
        x[index::X] = hold.x_ref[index::X];
        x[index::Y] = hold.x_ref[index::Y];
        x[index::PSI] = hold.x_ref[index::PSI] + wrap_to_pi(state.psi - hold.x_ref[index::PSI]);
        match hold.control(&x).and_then(|u| ControlInput::from_vector(&u)) {
            Ok(u) => u.clamped(),
            Err(e) => {
                warn!("LQR hold failed: {e}");
                self.trim_controls
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::cessna_172r;
    use crate::dynamics::aircraft_derivative;
    use crate::integrator::rk4;
    use crate::trim::TrimSolver;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn pid_proportional_and_clamp() {
        let mut pid = Pid::new(2.0, 0.0, 0.0, -1.0, 1.0);
        assert_approx_eq!(pid.update(0.25, 0.1), 0.5);
        assert_approx_eq!(pid.update(5.0, 0.1), 1.0);
        assert_approx_eq!(pid.update(-5.0, 0.1), -1.0);
    }

    #[test]
    fn pid_integral_and_derivative() {
        let mut pid = Pid::new(0.0, 1.0, 0.0, -10.0, 10.0);
        for _ in 0..10 {
            pid.update(1.0, 0.1);
        }
        assert_approx_eq!(pid.integral(), 1.0, 1e-12);
        let mut d = Pid::new(0.0, 0.0, 1.0, -10.0, 10.0);
        assert_approx_eq!(d.update(1.0, 0.1), 0.0);
        assert_approx_eq!(d.update(1.5, 0.1), 5.0, 1e-12);
        d.reset();
        assert_approx_eq!(d.update(3.0, 0.1), 0.0);
    }

    #[test]
    fn pid_does_not_wind_up_when_saturated() {
        let mut pid = Pid::new(1.0, 1.0, 0.0, -1.0, 1.0);
        for _ in 0..100 {
            pid.update(5.0, 0.1);
        }
        assert_approx_eq!(pid.integral(), 0.0);
        assert_approx_eq!(pid.update(0.0, 0.0), 0.0);
    }

    #[test]
    fn off_passes_manual_through() {
        let mut ap = Autopilot::default();
        let manual = ControlInput::new(0.3, 0.1, -0.1, 0.05);
        assert_eq!(ap.update(0.01, &RigidBodyState::level(60.0, 1000.0), &manual), manual);
    }

    #[test]
    fn pid_simple_signs() {
        let mut ap = Autopilot::new(AutopilotMode::PidSimple);
        // Low, slow and pointed left of target: climb, speed up, roll right.
        let mut state = RigidBodyState::level(50.0, 900.0);
        state.psi = -0.3;
        let u = ap.update(0.01, &state, &ControlInput::default());
        assert!(u.elevator < 0.0);
        assert!(u.throttle > BASE_THROTTLE);
        assert!(u.aileron > 0.0);
        assert_approx_eq!(u.rudder, 0.0);
        assert!(u.elevator >= -0.2);
    }

    #[test]
    fn heading_error_wraps() {
        let mut ap = Autopilot::new(AutopilotMode::PidSimple);
        ap.targets.heading = 3.0;
        let mut state = RigidBodyState::level(60.0, 1000.0);
        state.psi = -3.0;
        // Short way round is negative, through ±π.
        assert!(ap.update(0.01, &state, &ControlInput::default()).aileron < 0.0);
    }

    #[test]
    fn lqr_hold_without_gain_returns_trim() {
        let mut ap = Autopilot::new(AutopilotMode::LqrHold);
        let u = ap.update(0.01, &RigidBodyState::level(60.0, 1000.0), &ControlInput::default());
        assert_approx_eq!(u.throttle, BASE_THROTTLE);
        assert!(ap.reference().is_none());
    }

    #[test]
    fn lqr_hold_recovers_from_upset() {
        let aircraft = cessna_172r();
        let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
        let mut ap = Autopilot::new(AutopilotMode::LqrHold);
        let solution = ap
            .design_lqr(&aircraft, &trim, &LqrWeights::default(), &LqrConfig::default())
            .unwrap();
        assert_eq!(solution.k.shape(), (4, 12));
        assert!(solution.k.iter().all(|v| v.is_finite()));

        let trim_state = trim.trim_state();
        let engaged = ap.update(0.01, &trim_state, &ControlInput::default());
        assert_approx_eq!(engaged.throttle, trim.throttle, 1e-9);
        assert!(ap.reference().is_some());

        let mut state = trim_state;
        state.phi = 0.1;
        state.theta += 0.05;
        state.z += 10.0;
        let dt = 0.01;
        for _ in 0..3000 {
            let u = ap.update(dt, &state, &ControlInput::default());
            let next = rk4(0.0, &state.to_vector(), dt, aircraft_derivative(&aircraft, u));
            state = RigidBodyState::from_vector(&next).unwrap();
        }
        assert_approx_eq!(state.altitude(), 1000.0, 2.0);
        assert_approx_eq!(state.phi, 0.0, 0.02);
        assert_approx_eq!(state.theta, trim.alpha, 0.02);
        assert_approx_eq!(state.u, trim_state.u, 1.0);
    }

    #[test]
    fn set_mode_releases_reference() {
        let mut ap = Autopilot::new(AutopilotMode::LqrHold);
        ap.set_gain(DMatrix::zeros(4, 12), ControlInput::new(0.4, 0.0, -0.04, 0.0));
        ap.update(0.01, &RigidBodyState::level(60.0, 1000.0), &ControlInput::default());
        assert!(ap.reference().is_some());
        ap.set_mode(AutopilotMode::PidSimple);
        assert!(ap.reference().is_none());
        assert_eq!(ap.mode(), AutopilotMode::PidSimple);
    }
}
