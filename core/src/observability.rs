//! Finite-horizon observability analysis.
//!
//! For a discrete pair (F, H) the stacked matrix
//!
//! $$
//! \mathcal{O} = \begin{bmatrix} H \\ HF \\ HF^2 \\ \vdots \\ HF^{k-1} \end{bmatrix}
//! $$
//!
//! has full column rank exactly when every state direction leaves a trace in the measurements
//! within k steps. Its singular value decomposition gives the rank, the conditioning, and the
//! right singular vectors spanning the weak and unobservable directions.
use nalgebra::{DMatrix, DVector, SVD, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::linalg::{invert, symmetrize, to_rows};

/// Singular values at or below this are treated as zero.
pub const DEFAULT_RANK_TOLERANCE: f64 = 1e-4;

/// Stack H, HF, …, HF^(steps−1). `None` uses the state dimension.
pub fn observability_matrix(
    f: &DMatrix<f64>,
    h: &DMatrix<f64>,
    steps: Option<usize>,
) -> Result<DMatrix<f64>> {
    let n = f.nrows();
    if !f.is_square() {
        return Err(SimError::dimension("observability transition columns", n, f.ncols()));
    }
    if h.ncols() != n {
        return Err(SimError::dimension("observability measurement columns", n, h.ncols()));
    }
    let steps = steps.unwrap_or(n).max(1);
    let m = h.nrows();
    let mut o = DMatrix::zeros(m * steps, n);
    let mut block = h.clone();
    for k in 0..steps {
        o.view_mut((k * m, 0), (m, n)).copy_from(&block);
        block = &block * f;
    }
    Ok(o)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObservabilityReport {
    pub rank: usize,
    pub state_dim: usize,
    /// σ_max / σ_min; infinite when σ_min is zero
    pub condition_number: f64,
    pub smallest_singular_value: f64,
    /// Descending
    pub singular_values: Vec<f64>,
    /// Right singular vectors, ordered to match `singular_values`
    pub right_singular_vectors: DMatrix<f64>,
    /// Columns spanning directions with σ ≤ tolerance
    pub null_space: DMatrix<f64>,
    pub weakest_direction: DVector<f64>,
    pub fully_observable: bool,
}

impl ObservabilityReport {
    /// Null-space basis as a list of vectors.
    pub fn null_space_vectors(&self) -> Vec<DVector<f64>> {
        self.null_space
            .column_iter()
            .map(|c| c.into_owned())
            .collect()
    }
}

/// Rank and conditioning of the observability matrix of (F, H).
pub fn analyze(f: &DMatrix<f64>, h: &DMatrix<f64>, tolerance: f64) -> Result<ObservabilityReport> {
    analyze_with_steps(f, h, None, tolerance)
}

pub fn analyze_with_steps(
    f: &DMatrix<f64>,
    h: &DMatrix<f64>,
    steps: Option<usize>,
    tolerance: f64,
) -> Result<ObservabilityReport> {
    let n = f.nrows();
    let mut o = observability_matrix(f, h, steps)?;
    if o.iter().any(|v| !v.is_finite()) {
        return Err(SimError::singular("observability matrix (non-finite entries)"));
    }
    if o.nrows() < n {
        // Pad so the decomposition yields a full set of right singular vectors.
        o = o.resize_vertically(n, 0.0);
    }
    let svd = SVD::try_new(o, false, true, f64::EPSILON, 0)
        .ok_or_else(|| SimError::singular("observability SVD did not converge"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| SimError::singular("observability SVD without right vectors"))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|a, b| svd.singular_values[*b].total_cmp(&svd.singular_values[*a]));
    let singular_values: Vec<f64> = order.iter().map(|i| svd.singular_values[*i]).collect();
    let right_singular_vectors =
        DMatrix::from_fn(n, order.len(), |r, c| v_t[(order[c], r)]);

    let rank = singular_values.iter().filter(|s| **s > tolerance).count();
    let largest = singular_values.first().copied().unwrap_or(0.0);
    let smallest = singular_values.last().copied().unwrap_or(0.0);
    let condition_number = if smallest > 0.0 {
        largest / smallest
    } else {
        f64::INFINITY
    };
    let null_columns: Vec<usize> = (rank..singular_values.len()).collect();
    let null_space = right_singular_vectors.select_columns(null_columns.iter());
    let weakest_direction = right_singular_vectors
        .column(right_singular_vectors.ncols().saturating_sub(1))
        .into_owned();

    Ok(ObservabilityReport {
        rank,
        state_dim: n,
        condition_number,
        smallest_singular_value: smallest,
        singular_values,
        right_singular_vectors,
        null_space,
        weakest_direction,
        fully_observable: rank == n,
    })
}

/// Eigenvalues of the information matrix HᵀR⁻¹H, descending.
///
/// Each value is the information one measurement carries along the matching eigenvector; a zero
/// marks a state direction the sensor cannot see at all.
pub fn information_content(h: &DMatrix<f64>, r: &DMatrix<f64>) -> Result<DVector<f64>> {
    if r.shape() != (h.nrows(), h.nrows()) {
        return Err(SimError::dimension("information noise covariance", h.nrows(), r.nrows()));
    }
    let r_inv = invert(r, "information noise covariance")?;
    let information = symmetrize(&(h.transpose() * r_inv * h));
    let (eigenvalues, _) = descending_eigen(information);
    Ok(DVector::from_vec(eigenvalues))
}

/// Eigen-decomposition of a running filter's covariance.
///
/// The dominant direction carries the largest variance, so it is the combination of states the
/// measurements have constrained least. Correlated uncertainty shows up here even when every
/// diagonal entry looks alike.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CovarianceObservability {
    /// Descending
    pub eigenvalues: Vec<f64>,
    /// Row-major; column j pairs with `eigenvalues[j]`
    pub eigenvectors: Vec<Vec<f64>>,
    /// λ_max / λ_min; infinite when λ_min is zero to working precision
    pub condition_number: f64,
    /// Unit eigenvector of the largest eigenvalue, largest component positive
    pub dominant_direction: Vec<f64>,
}

impl CovarianceObservability {
    pub fn largest_variance(&self) -> f64 {
        self.eigenvalues.first().copied().unwrap_or(0.0)
    }
}

pub fn covariance_observability(p: &DMatrix<f64>) -> Result<CovarianceObservability> {
    if !p.is_square() {
        return Err(SimError::dimension("covariance observability", p.nrows(), p.ncols()));
    }
    if p.iter().any(|v| !v.is_finite()) {
        return Err(SimError::singular("covariance observability (non-finite entries)"));
    }
    let (eigenvalues, eigenvectors) = descending_eigen(symmetrize(p));
    let largest = eigenvalues.first().copied().unwrap_or(0.0);
    let smallest = eigenvalues.last().copied().unwrap_or(0.0);
    let floor = f64::EPSILON * largest.abs() * eigenvalues.len() as f64;
    let condition_number = if smallest > floor {
        largest / smallest
    } else {
        f64::INFINITY
    };
    let mut dominant = if eigenvectors.ncols() > 0 {
        eigenvectors.column(0).into_owned()
    } else {
        DVector::zeros(0)
    };
    if !dominant.is_empty() && dominant[dominant.iamax()] < 0.0 {
        dominant = -dominant;
    }
    Ok(CovarianceObservability {
        eigenvalues,
        eigenvectors: to_rows(&eigenvectors),
        condition_number,
        dominant_direction: dominant.iter().copied().collect(),
    })
}

fn descending_eigen(m: DMatrix<f64>) -> (Vec<f64>, DMatrix<f64>) {
    let n = m.nrows();
    let eigen = SymmetricEigen::new(m);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));
    let values = order.iter().map(|i| eigen.eigenvalues[*i]).collect();
    let vectors = DMatrix::from_fn(n, n, |r, c| eigen.eigenvectors[(r, order[c])]);
    (values, vectors)
}
