//! Finite-difference linearization and open-loop stability classification
//!
//! This module extracts the state matrix A = ∂ẋ/∂x (12×12) and input matrix B = ∂ẋ/∂u (12×4)
//! of the truth model about an operating point by central differences, computes the eigenvalues
//! of A through a real Schur decomposition, and classifies the open-loop modes.
//!
//! # State and input ordering
//!
//! ```text
//! x = [u, v, w, p, q, r, phi, theta, psi, x_n, y_e, z_d]
//! u = [throttle, aileron, elevator, rudder]
//! ```
//!
//! The input matrix is taken with respect to the normalized commands, so its elevator column
//! already contains the deflection limit scaling.
//!
//! # Usage Example
//!
//! ```rust
//! use aerosim::aircraft::cessna_172r;
//! use aerosim::linearize::{Linearizer, classify_stability, eigenvalues};
//! use aerosim::trim::TrimSolver;
//!
//! let aircraft = cessna_172r();
//! let trim = TrimSolver::with_defaults(&aircraft).solve(60.0, 1000.0);
//! let model = Linearizer::new(&aircraft).linearize(&trim.trim_state(), &trim.trim_controls());
//! let eigs = eigenvalues(&model.a);
//! assert!(classify_stability(&eigs, 1e-6).is_stable());
//! ```
//!
//! Each Jacobian column costs two model evaluations, so callers that need A repeatedly at the
//! same operating point should keep the result rather than recompute it.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::aircraft::AircraftConfig;
use crate::dynamics::{derivative_vector, state_derivative};
use crate::error::Result;
use crate::linalg;
use crate::trim::TrimResult;
use crate::{CONTROL_DIM, ControlInput, RIGID_BODY_STATE_DIM, RigidBodyState};

/// Default central-difference step.
pub const DEFAULT_EPSILON: f64 = 1e-4;

pub mod index {
    pub const U: usize = 0;
    pub const V: usize = 1;
    pub const W: usize = 2;
    pub const P: usize = 3;
    pub const Q: usize = 4;
    pub const R: usize = 5;
    pub const PHI: usize = 6;
    pub const THETA: usize = 7;
    pub const PSI: usize = 8;
    pub const X: usize = 9;
    pub const Y: usize = 10;
    pub const Z: usize = 11;

    pub const THROTTLE: usize = 0;
    pub const AILERON: usize = 1;
    pub const ELEVATOR: usize = 2;
    pub const RUDDER: usize = 3;
}

/// Longitudinal subsystem: states (u, w, q, θ), inputs (throttle, elevator).
pub const LONGITUDINAL_STATES: [usize; 4] = [index::U, index::W, index::Q, index::THETA];
pub const LONGITUDINAL_INPUTS: [usize; 2] = [index::THROTTLE, index::ELEVATOR];
/// Lateral-directional subsystem: states (v, p, r, φ), inputs (aileron, rudder).
pub const LATERAL_STATES: [usize; 4] = [index::V, index::P, index::R, index::PHI];
pub const LATERAL_INPUTS: [usize; 2] = [index::AILERON, index::RUDDER];

/// Central-difference Jacobian of `f` at `x` with step `eps` on every coordinate.
pub fn numerical_jacobian<F>(f: F, x: &DVector<f64>, eps: f64) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n = x.len();
    let mut columns: Vec<DVector<f64>> = Vec::with_capacity(n);
    let mut m = 0;
    for i in 0..n {
        let mut plus = x.clone();
        let mut minus = x.clone();
        plus[i] += eps;
        minus[i] -= eps;
        let column = (f(&plus) - f(&minus)) / (2.0 * eps);
        m = column.len();
        columns.push(column);
    }
    let mut jac = DMatrix::zeros(m, n);
    for (i, column) in columns.iter().enumerate() {
        jac.set_column(i, column);
    }
    jac
}

/// One eigenvalue of the state matrix.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Eigenvalue {
    pub re: f64,
    pub im: f64,
}

impl Eigenvalue {
    pub fn is_oscillatory(&self) -> bool {
        self.im.abs() > 1e-9
    }

    /// Natural frequency (rad/s) and damping ratio of the mode.
    pub fn frequency_and_damping(&self) -> (f64, f64) {
        let wn = (self.re * self.re + self.im * self.im).sqrt();
        if wn == 0.0 {
            (0.0, 1.0)
        } else {
            (wn, -self.re / wn)
        }
    }
}

/// Eigenvalues of a square matrix, sorted by descending real part.
pub fn eigenvalues(a: &DMatrix<f64>) -> Vec<Eigenvalue> {
    let mut eigs: Vec<Eigenvalue> = a
        .complex_eigenvalues()
        .iter()
        .map(|c| Eigenvalue { re: c.re, im: c.im })
        .collect();
    eigs.sort_by(|x, y| y.re.total_cmp(&x.re));
    eigs
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityClass {
    Stable,
    Unstable { count: usize },
}

impl StabilityClass {
    pub fn is_stable(&self) -> bool {
        matches!(self, StabilityClass::Stable)
    }
}

/// Any eigenvalue with real part above `tol` is an unstable mode.
pub fn classify_stability(eigs: &[Eigenvalue], tol: f64) -> StabilityClass {
    let count = eigs.iter().filter(|e| e.re > tol).count();
    if count == 0 {
        StabilityClass::Stable
    } else {
        StabilityClass::Unstable { count }
    }
}

/// Extract the rows/columns of A and B that belong to a decoupled subsystem.
pub fn select_subsystem(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    states: &[usize],
    inputs: &[usize],
) -> (DMatrix<f64>, DMatrix<f64>) {
    let a_sub = a.select_rows(states.iter()).select_columns(states.iter());
    let b_sub = b.select_rows(states.iter()).select_columns(inputs.iter());
    (a_sub, b_sub)
}

/// Linear model about an operating point.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearModel {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

impl LinearModel {
    pub fn longitudinal(&self) -> LinearModel {
        let (a, b) = select_subsystem(&self.a, &self.b, &LONGITUDINAL_STATES, &LONGITUDINAL_INPUTS);
        LinearModel { a, b }
    }

    pub fn lateral(&self) -> LinearModel {
        let (a, b) = select_subsystem(&self.a, &self.b, &LATERAL_STATES, &LATERAL_INPUTS);
        LinearModel { a, b }
    }
}

/// Linearization in the shape served by the remote aircraft service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearizationResult {
    #[serde(rename = "A")]
    pub a: Vec<Vec<f64>>,
    #[serde(rename = "B")]
    pub b: Vec<Vec<f64>>,
    pub eigenvalues: Vec<Eigenvalue>,
    pub stability: StabilityClass,
    pub trim: TrimResult,
}

impl LinearizationResult {
    pub fn model(&self) -> Result<LinearModel> {
        Ok(LinearModel {
            a: linalg::from_rows(&self.a)?,
            b: linalg::from_rows(&self.b)?,
        })
    }
}

pub struct Linearizer<'a> {
    aircraft: &'a AircraftConfig,
    epsilon: f64,
}

impl<'a> Linearizer<'a> {
    pub fn new(aircraft: &'a AircraftConfig) -> Self {
        Linearizer {
            aircraft,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// A = ∂ẋ/∂x at `(x, u)`.
    pub fn state_jacobian(&self, x: &RigidBodyState, u: &ControlInput) -> DMatrix<f64> {
        let f = |xv: &DVector<f64>| derivative_vector(self.aircraft, xv, u);
        numerical_jacobian(f, &x.to_vector(), self.epsilon)
    }

    /// B = ∂ẋ/∂u at `(x, u)`, columns ordered throttle, aileron, elevator, rudder.
    pub fn input_jacobian(&self, x: &RigidBodyState, u: &ControlInput) -> DMatrix<f64> {
        let f = |uv: &DVector<f64>| match ControlInput::from_vector(uv) {
            Ok(controls) => state_derivative(self.aircraft, x, &controls).to_vector(),
            Err(_) => DVector::zeros(RIGID_BODY_STATE_DIM),
        };
        let b = numerical_jacobian(f, &u.to_vector(), self.epsilon);
        debug_assert_eq!(b.shape(), (RIGID_BODY_STATE_DIM, CONTROL_DIM));
        b
    }

    pub fn linearize(&self, x: &RigidBodyState, u: &ControlInput) -> LinearModel {
        LinearModel {
            a: self.state_jacobian(x, u),
            b: self.input_jacobian(x, u),
        }
    }

    /// Linearize about a trim point and classify the open-loop modes.
    pub fn linearize_at_trim(&self, trim: &TrimResult) -> LinearizationResult {
        let model = self.linearize(&trim.trim_state(), &trim.trim_controls());
        let eigs = eigenvalues(&model.a);
        LinearizationResult {
            a: linalg::to_rows(&model.a),
            b: linalg::to_rows(&model.b),
            stability: classify_stability(&eigs, 1e-6),
            eigenvalues: eigs,
            trim: trim.clone(),
        }
    }
}
