//! Newton-Raphson level-flight trim solver.
//!
//! Unknowns are angle of attack α (rad), elevator deflection δe (rad) and throttle τ ∈ [0, 1].
//! For a given airspeed and altitude a wings-level state is built with u = V cos α,
//! w = V sin α, θ = α and all rates zero, and the solver drives the residual
//! (u̇, ẇ, q̇) to zero. The Jacobian is formed by one-sided finite differences and the
//! Newton step is solved in closed form with Cramer's rule.

use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::dynamics::state_derivative;
use crate::{ControlInput, RigidBodyState};

/// Solver parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub max_iterations: usize,
    /// Every residual component must fall below this value.
    pub tolerance: f64,
    /// One-sided finite-difference step applied to each unknown.
    pub perturbation: f64,
    /// Starting point `[alpha_rad, elevator_rad, throttle]`.
    pub initial_guess: [f64; 3],
    /// Newton steps are skipped when |det J| is below this value.
    pub singular_det: f64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        TrimConfig {
            max_iterations: 50,
            tolerance: 1e-4,
            perturbation: 1e-5,
            initial_guess: [0.05, 0.0, 0.5],
            singular_det: 1e-9,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrimResiduals {
    pub u_dot: f64,
    pub w_dot: f64,
    pub q_dot: f64,
}

impl TrimResiduals {
    fn from_vector(r: &Vector3<f64>) -> Self {
        TrimResiduals {
            u_dot: r.x,
            w_dot: r.y,
            q_dot: r.z,
        }
    }

    pub fn norm(&self) -> f64 {
        Vector3::new(self.u_dot, self.w_dot, self.q_dot).norm()
    }

    pub fn max_abs(&self) -> f64 {
        self.u_dot.abs().max(self.w_dot.abs()).max(self.q_dot.abs())
    }
}

/// Equilibrium found (or best effort) for one flight condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrimResult {
    pub aircraft_id: String,
    pub airspeed: f64,
    pub altitude: f64,
    pub alpha: f64,
    /// Normalized elevator command in [-1, 1] units.
    pub elevator: f64,
    pub elevator_rad: f64,
    pub throttle: f64,
    pub converged: bool,
    pub iterations: usize,
    pub residuals: TrimResiduals,
    pub residual_norm: f64,
}

/// Trim output in the shape served by the remote aircraft service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrimBackend {
    pub x0: Vec<f64>,
    pub u0: Vec<f64>,
    pub alpha_rad: f64,
    pub throttle: f64,
    pub elevator_rad: f64,
    pub residual_norm: f64,
}

impl TrimResult {
    /// Twelve-state equilibrium with NED down position `-altitude`.
    pub fn trim_state(&self) -> RigidBodyState {
        level_state(self.airspeed, self.altitude, self.alpha)
    }

    pub fn trim_controls(&self) -> ControlInput {
        ControlInput::new(self.throttle, 0.0, self.elevator, 0.0)
    }

    pub fn trim_id(&self) -> String {
        trim_id(&self.aircraft_id, self.airspeed, self.altitude)
    }

    pub fn to_backend(&self) -> TrimBackend {
        TrimBackend {
            x0: self.trim_state().to_vector().as_slice().to_vec(),
            u0: self.trim_controls().to_vector().as_slice().to_vec(),
            alpha_rad: self.alpha,
            throttle: self.throttle,
            elevator_rad: self.elevator_rad,
            residual_norm: self.residual_norm,
        }
    }
}

/// Identifier of a flight condition, e.g. `cessna_172r_V60_H1000`.
pub fn trim_id(aircraft_id: &str, airspeed: f64, altitude: f64) -> String {
    format!("{aircraft_id}_V{airspeed:.0}_H{altitude:.0}")
}

/// Wings-level state at angle of attack `alpha` with flight-path angle zero.
pub fn level_state(airspeed: f64, altitude: f64, alpha: f64) -> RigidBodyState {
    let (sin_a, cos_a) = alpha.sin_cos();
    RigidBodyState {
        u: airspeed * cos_a,
        w: airspeed * sin_a,
        theta: alpha,
        z: -altitude,
        ..Default::default()
    }
}

/// Solve `j · x = b` by Cramer's rule. Returns `None` when |det j| < `min_det`.
pub fn solve_cramer(j: &Matrix3<f64>, b: &Vector3<f64>, min_det: f64) -> Option<Vector3<f64>> {
    let det = j.determinant();
    if !det.is_finite() || det.abs() < min_det {
        return None;
    }
    let mut x = Vector3::zeros();
    for col in 0..3 {
        let mut replaced = *j;
        replaced.set_column(col, b);
        x[col] = replaced.determinant() / det;
    }
    Some(x)
}

pub struct TrimSolver<'a> {
    aircraft: &'a AircraftConfig,
    config: TrimConfig,
}

impl<'a> TrimSolver<'a> {
    pub fn new(aircraft: &'a AircraftConfig, config: TrimConfig) -> Self {
        TrimSolver { aircraft, config }
    }

    pub fn with_defaults(aircraft: &'a AircraftConfig) -> Self {
        TrimSolver::new(aircraft, TrimConfig::default())
    }

    pub fn config(&self) -> &TrimConfig {
        &self.config
    }

    fn elevator_limit(&self) -> f64 {
        self.aircraft.limits.elevator_max_rad
    }

    /// Residual (u̇, ẇ, q̇) for unknowns `[alpha, elevator_rad, throttle]`.
    pub fn residual(&self, airspeed: f64, altitude: f64, unknowns: &Vector3<f64>) -> Vector3<f64> {
        let state = level_state(airspeed, altitude, unknowns.x);
        let controls = ControlInput::new(unknowns.z, 0.0, unknowns.y / self.elevator_limit(), 0.0);
        let d = state_derivative(self.aircraft, &state, &controls);
        Vector3::new(d.u, d.w, d.q)
    }

    fn jacobian(
        &self,
        airspeed: f64,
        altitude: f64,
        unknowns: &Vector3<f64>,
        base: &Vector3<f64>,
    ) -> Matrix3<f64> {
        let h = self.config.perturbation;
        let mut j = Matrix3::zeros();
        for col in 0..3 {
            let mut perturbed = *unknowns;
            perturbed[col] += h;
            let column = (self.residual(airspeed, altitude, &perturbed) - base) / h;
            j.set_column(col, &column);
        }
        j
    }

    /// Find trim for level flight at `airspeed` (m/s) and `altitude` (m).
    ///
    /// Never fails: a solver that exhausts its iteration budget returns its last iterate
    /// with `converged = false`.
    pub fn solve(&self, airspeed: f64, altitude: f64) -> TrimResult {
        let mut unknowns = Vector3::from(self.config.initial_guess);
        let mut residual = self.residual(airspeed, altitude, &unknowns);
        let mut converged = false;
        let mut iterations = 0;
        let mut warned_singular = false;

        while iterations < self.config.max_iterations {
            if residual.iter().all(|r| r.abs() < self.config.tolerance) {
                converged = true;
                break;
            }
            let j = self.jacobian(airspeed, altitude, &unknowns, &residual);
            match solve_cramer(&j, &(-residual), self.config.singular_det) {
                Some(step) => unknowns += step,
                None => {
                    if !warned_singular {
                        warn!(
                            "Trim Jacobian near-singular at V={airspeed:.1} m/s (det={:.3e}); skipping Newton step",
                            j.determinant()
                        );
                        warned_singular = true;
                    }
                }
            }
            unknowns.z = unknowns.z.clamp(0.0, 1.0);
            residual = self.residual(airspeed, altitude, &unknowns);
            iterations += 1;
            debug!(
                "trim iteration {iterations}: alpha={:.5} de={:.5} throttle={:.4} |r|={:.3e}",
                unknowns.x,
                unknowns.y,
                unknowns.z,
                residual.norm()
            );
        }
        if !converged && residual.iter().all(|r| r.abs() < self.config.tolerance) {
            converged = true;
        }

        let residuals = TrimResiduals::from_vector(&residual);
        let result = TrimResult {
            aircraft_id: self.aircraft.id.clone(),
            airspeed,
            altitude,
            alpha: unknowns.x,
            elevator: unknowns.y / self.elevator_limit(),
            elevator_rad: unknowns.y,
            throttle: unknowns.z,
            converged,
            iterations,
            residual_norm: residuals.norm(),
            residuals,
        };
        if converged {
            info!(
                "Trim {} converged in {} iterations: alpha={:.4} rad, elevator={:.4} rad, throttle={:.3}",
                result.trim_id(),
                iterations,
                result.alpha,
                result.elevator_rad,
                result.throttle
            );
        } else {
            warn!(
                "Trim {} did not converge after {} iterations (residual norm {:.3e})",
                result.trim_id(),
                iterations,
                result.residual_norm
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::{cessna_172r, cessna_172r_relaxed};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn cessna_trims_at_sixty_meters_per_second() {
        let aircraft = cessna_172r();
        let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
        assert!(trim.converged);
        assert!(trim.iterations <= 50);
        assert!(trim.residuals.max_abs() < 1e-4);
        assert!(trim.residual_norm < 1e-4);
        assert!(trim.alpha > 0.0 && trim.alpha < 0.08);
        assert!(trim.throttle > 0.0 && trim.throttle < 1.0);
        assert!(trim.elevator_rad.abs() <= aircraft.limits.elevator_max_rad);
        // C_L0 = 0.25 already supplies most of the C_L ≈ 0.31 that 60 m/s level flight needs,
        // leaving about 0.011 rad for the lift slope.
        let required_cl = aircraft.mass.mass * crate::math::GRAVITY
            / (0.5 * aircraft.air_density * 60.0 * 60.0 * aircraft.geometry.wing_area);
        assert!(aircraft.aero.lift.c_l_0 / required_cl > 0.8);
        assert_approx_eq!(trim.alpha, 0.0108, 1e-3);
        assert_approx_eq!(trim.throttle, 0.475, 5e-3);
        assert_approx_eq!(trim.elevator, trim.elevator_rad / 25.0f64.to_radians(), 1e-12);
    }

    #[test]
    fn slower_flight_needs_more_alpha() {
        let aircraft = cessna_172r();
        let solver = TrimSolver::with_defaults(&aircraft);
        let fast = solver.solve(60.0, 1000.0);
        let slow = solver.solve(45.0, 1000.0);
        assert!(slow.converged);
        assert!(slow.alpha > fast.alpha);
    }

    #[test]
    fn trim_state_is_an_equilibrium() {
        let aircraft = cessna_172r();
        let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
        let d = state_derivative(&aircraft, &trim.trim_state(), &trim.trim_controls());
        assert!(d.u.abs() < 1e-4);
        assert!(d.w.abs() < 1e-4);
        assert!(d.q.abs() < 1e-4);
        assert!(d.z.abs() < 1e-6);
        assert_approx_eq!(trim.trim_state().z, -1000.0);
    }

    #[test]
    fn relaxed_airframe_still_trims() {
        let aircraft = cessna_172r_relaxed();
        let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
        assert!(trim.converged);
        assert!(trim.elevator_rad > 0.0);
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let aircraft = cessna_172r();
        let config = TrimConfig {
            max_iterations: 0,
            ..Default::default()
        };
        let trim = TrimSolver::new(&aircraft, config).solve(60.0, 1000.0);
        assert!(!trim.converged);
        assert_eq!(trim.iterations, 0);
        assert_approx_eq!(trim.alpha, 0.05);
    }

    #[test]
    fn unreachable_speed_clamps_throttle() {
        let aircraft = cessna_172r();
        let trim = TrimSolver::with_defaults(&aircraft).solve(150.0, 1000.0);
        assert!(!trim.converged);
        assert!(trim.throttle <= 1.0 && trim.throttle >= 0.0);
    }

    #[test]
    fn cramer_matches_direct_solve() {
        let j = Matrix3::new(2.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 4.0);
        let b = Vector3::new(1.0, 2.0, 3.0);
        let x = solve_cramer(&j, &b, 1e-9).unwrap();
        assert_approx_eq!((j * x - b).norm(), 0.0, 1e-12);
        assert!(solve_cramer(&Matrix3::zeros(), &b, 1e-9).is_none());
    }

    #[test]
    fn backend_shape_and_id() {
        let aircraft = cessna_172r();
        let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
        assert_eq!(trim.trim_id(), "cessna_172r_V60_H1000");
        let backend = trim.to_backend();
        assert_eq!(backend.x0.len(), 12);
        assert_eq!(backend.u0.len(), 4);
        assert_approx_eq!(backend.u0[0], trim.throttle);
        assert_approx_eq!(backend.alpha_rad, trim.alpha);
        let json = serde_json::to_value(&backend).unwrap();
        assert!(json.get("residual_norm").is_some());
    }
}
