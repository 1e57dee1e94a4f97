//! Linear-quadratic regulator synthesis.
//!
//! The continuous algebraic Riccati equation
//!
//! $$
//! A^T P + P A - P B R^{-1} B^T P + Q = 0
//! $$
//!
//! is approached by integrating the matrix ODE $\dot P = A^T P + P A - P S P + Q$ with
//! $S = B R^{-1} B^T$ forward from $P = 0$ using explicit Euler over a fixed horizon. The result
//! is an approximation whose quality depends on the horizon and step size, so the solver
//! reports whether `trace(P)` was still moving at the end rather than pretending to be exact.
use log::{debug, info, warn};
use nalgebra::{Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::linalg::{invert, symmetrize, to_rows};
use crate::{CONTROL_DIM, RIGID_BODY_STATE_DIM};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LqrConfig {
    /// Integration horizon (s)
    pub horizon: f64,
    /// Euler step (s)
    pub dt: f64,
    /// Relative bound on |d trace(P)/dt| for the convergence flag
    pub growth_tolerance: f64,
}

impl Default for LqrConfig {
    fn default() -> Self {
        LqrConfig {
            horizon: 10.0,
            dt: 0.01,
            growth_tolerance: 1e-6,
        }
    }
}

/// Diagonal state and input weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LqrWeights {
    pub q: Vec<f64>,
    pub r: Vec<f64>,
}

impl Default for LqrWeights {
    /// Attitude-heavy hold about trim; horizontal position is left free.
    fn default() -> Self {
        LqrWeights {
            q: vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 10.0, 10.0, 1.0, 0.0, 0.0, 0.01],
            r: vec![1.0; CONTROL_DIM],
        }
    }
}

impl LqrWeights {
    pub fn q_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&self.q))
    }

    pub fn r_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&self.r))
    }

    pub fn validate(&self) -> Result<()> {
        if self.q.len() != RIGID_BODY_STATE_DIM {
            return Err(SimError::dimension(
                "LQR state weights",
                RIGID_BODY_STATE_DIM,
                self.q.len(),
            ));
        }
        if self.r.len() != CONTROL_DIM {
            return Err(SimError::dimension("LQR input weights", CONTROL_DIM, self.r.len()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LqrSolution {
    /// Gain K = R⁻¹ Bᵀ P (m × n)
    pub k: DMatrix<f64>,
    pub p: DMatrix<f64>,
    pub converged: bool,
    pub final_trace: f64,
    /// d trace(P)/dt at the last step
    pub trace_rate: f64,
    pub steps: usize,
}

/// JSON shape of an [`LqrSolution`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LqrReport {
    #[serde(rename = "K")]
    pub k: Vec<Vec<f64>>,
    #[serde(rename = "P")]
    pub p: Vec<Vec<f64>>,
    pub converged: bool,
    pub final_trace: f64,
    pub trace_rate: f64,
    pub steps: usize,
}

impl LqrSolution {
    pub fn to_report(&self) -> LqrReport {
        LqrReport {
            k: to_rows(&self.k),
            p: to_rows(&self.p),
            converged: self.converged,
            final_trace: self.final_trace,
            trace_rate: self.trace_rate,
            steps: self.steps,
        }
    }
}

/// Integrate the Riccati ODE and form the state-feedback gain.
///
/// A non-positive-definite `r` is reported as [`SimError::SingularMatrix`]. Non-convergence is
/// data: see [`LqrSolution::converged`].
pub fn solve_care(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
    config: &LqrConfig,
) -> Result<LqrSolution> {
    let n = a.nrows();
    if !a.is_square() {
        return Err(SimError::dimension("LQR state matrix columns", n, a.ncols()));
    }
    if b.nrows() != n {
        return Err(SimError::dimension("LQR input matrix rows", n, b.nrows()));
    }
    let m = b.ncols();
    if q.shape() != (n, n) {
        return Err(SimError::dimension("LQR state weight", n, q.nrows()));
    }
    if r.shape() != (m, m) {
        return Err(SimError::dimension("LQR input weight", m, r.nrows()));
    }
    if !(config.dt > 0.0 && config.horizon > 0.0) {
        return Err(SimError::InvalidParameter(format!(
            "LQR horizon {} and step {} must be positive",
            config.horizon, config.dt
        )));
    }
    if Cholesky::new(symmetrize(r)).is_none() {
        warn!("LQR input weight is not positive definite");
        return Err(SimError::singular("LQR input weight R"));
    }
    let r_inv = invert(r, "LQR input weight R")?;
    let s = b * &r_inv * b.transpose();
    let a_t = a.transpose();

    let steps = (config.horizon / config.dt).round().max(1.0) as usize;
    let mut p = DMatrix::zeros(n, n);
    let mut trace_rate = 0.0;
    let mut taken = 0;
    for _ in 0..steps {
        let p_dot = &a_t * &p + &p * a - &p * &s * &p + q;
        let next = symmetrize(&(&p + &p_dot * config.dt));
        if next.iter().any(|v| !v.is_finite()) {
            warn!("Riccati integration diverged after {taken} steps");
            break;
        }
        trace_rate = p_dot.trace();
        p = next;
        taken += 1;
    }
    let final_trace = p.trace();
    let converged = taken == steps
        && trace_rate.abs() <= config.growth_tolerance * (1.0 + final_trace.abs());
    let k = &r_inv * b.transpose() * &p;
    if converged {
        info!("LQR converged: trace(P) = {final_trace:.4} after {taken} steps");
    } else {
        info!(
            "LQR not converged after {taken} steps: trace(P) = {final_trace:.4}, d/dt = {trace_rate:.3e}"
        );
    }
    debug!("LQR gain norm {:.4}", k.norm());
    Ok(LqrSolution {
        k,
        p,
        converged,
        final_trace,
        trace_rate,
        steps: taken,
    })
}

/// Full-state feedback u = u_ref − K (x − x_ref).
#[derive(Clone, Debug, PartialEq)]
pub struct LqrController {
    pub k: DMatrix<f64>,
    pub x_ref: DVector<f64>,
    pub u_ref: DVector<f64>,
}

impl LqrController {
    /// Regulate to `x_ref` with a zero input reference.
    pub fn new(k: DMatrix<f64>, x_ref: DVector<f64>) -> Result<Self> {
        let u_ref = DVector::zeros(k.nrows());
        LqrController::with_input_reference(k, x_ref, u_ref)
    }

    pub fn with_input_reference(
        k: DMatrix<f64>,
        x_ref: DVector<f64>,
        u_ref: DVector<f64>,
    ) -> Result<Self> {
        if k.ncols() != x_ref.len() {
            return Err(SimError::dimension("LQR reference state", k.ncols(), x_ref.len()));
        }
        if k.nrows() != u_ref.len() {
            return Err(SimError::dimension("LQR reference input", k.nrows(), u_ref.len()));
        }
        Ok(LqrController { k, x_ref, u_ref })
    }

    /// Unclamped command; saturation is the caller's job.
    pub fn control(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        if x.len() != self.x_ref.len() {
            return Err(SimError::dimension("LQR state", self.x_ref.len(), x.len()));
        }
        Ok(&self.u_ref - &self.k * (x - &self.x_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn mat(rows: usize, cols: usize, v: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(rows, cols, v)
    }

    #[test]
    fn scalar_integrator() {
        // ẋ = u, Q = R = 1: P = 1, K = 1
        let sol = solve_care(
            &mat(1, 1, &[0.0]),
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[1.0]),
            &LqrConfig::default(),
        )
        .unwrap();
        assert!(sol.converged);
        assert_eq!(sol.steps, 1000);
        assert_approx_eq!(sol.k[(0, 0)], 1.0, 1e-6);
        assert_approx_eq!(sol.final_trace, 1.0, 1e-6);
    }

    #[test]
    fn double_integrator() {
        let a = mat(2, 2, &[0.0, 1.0, 0.0, 0.0]);
        let b = mat(2, 1, &[0.0, 1.0]);
        let sol = solve_care(
            &a,
            &b,
            &DMatrix::identity(2, 2),
            &mat(1, 1, &[1.0]),
            &LqrConfig::default(),
        )
        .unwrap();
        let sqrt3 = 3f64.sqrt();
        assert_approx_eq!(sol.k[(0, 0)], 1.0, 1e-3);
        assert_approx_eq!(sol.k[(0, 1)], sqrt3, 1e-3);
        assert_approx_eq!(sol.p[(0, 0)], sqrt3, 1e-3);
        assert_approx_eq!(sol.p[(0, 1)], sol.p[(1, 0)], 1e-12);
    }

    #[test]
    fn uncontrollable_unstable_mode_is_flagged() {
        let sol = solve_care(
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[0.0]),
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[1.0]),
            &LqrConfig::default(),
        )
        .unwrap();
        assert!(!sol.converged);
        assert!(sol.trace_rate > 0.0);
    }

    #[test]
    fn singular_input_weight() {
        let err = solve_care(
            &DMatrix::zeros(2, 2),
            &DMatrix::identity(2, 2),
            &DMatrix::identity(2, 2),
            &mat(2, 2, &[1.0, 0.0, 0.0, 0.0]),
            &LqrConfig::default(),
        );
        assert!(matches!(err, Err(SimError::SingularMatrix(_))));
        let neg = solve_care(
            &DMatrix::zeros(1, 1),
            &DMatrix::identity(1, 1),
            &DMatrix::identity(1, 1),
            &mat(1, 1, &[-1.0]),
            &LqrConfig::default(),
        );
        assert!(matches!(neg, Err(SimError::SingularMatrix(_))));
    }

    #[test]
    fn dimension_checks() {
        let err = solve_care(
            &DMatrix::zeros(3, 3),
            &DMatrix::zeros(2, 1),
            &DMatrix::identity(3, 3),
            &DMatrix::identity(1, 1),
            &LqrConfig::default(),
        );
        assert!(matches!(err, Err(SimError::DimensionMismatch { expected: 3, found: 2, .. })));
        assert!(LqrWeights { q: vec![1.0; 9], r: vec![1.0; 4] }.validate().is_err());
        assert!(LqrWeights::default().validate().is_ok());
    }

    #[test]
    fn controller_feedback_sign() {
        let k = mat(1, 2, &[2.0, 1.0]);
        let ctrl = LqrController::with_input_reference(
            k,
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::from_vec(vec![0.5]),
        )
        .unwrap();
        let u = ctrl.control(&DVector::from_vec(vec![2.0, 1.0])).unwrap();
        assert_approx_eq!(u[0], 0.5 - 3.0);
        assert!(ctrl.control(&DVector::zeros(3)).is_err());
        assert!(LqrController::new(DMatrix::zeros(4, 12), DVector::zeros(9)).is_err());
    }

    #[test]
    fn report_uses_row_major_gain() {
        let sol = solve_care(
            &mat(1, 1, &[0.0]),
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[1.0]),
            &mat(1, 1, &[1.0]),
            &LqrConfig::default(),
        )
        .unwrap();
        let json = serde_json::to_string(&sol.to_report()).unwrap();
        assert!(json.contains("\"K\""));
        assert!(json.contains("\"finalTrace\""));
    }
}
