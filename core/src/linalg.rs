//! Linear algebra helpers for covariance handling and guarded inversions.
//!
//! `matrix_square_root` factors a noise covariance R as S·Sᵀ so correlated Gaussian noise can be
//! drawn as S·n. It tries, in order:
//! 1) Cholesky of the symmetrized matrix
//! 2) Cholesky with a geometrically growing diagonal jitter
//! 3) Symmetric EVD with negative modes clamped: S = U · sqrt(Λ⁺) · Uᵀ
//!
//! Solves that feed a state update (Kalman gain, Riccati R⁻¹, NEES/NIS) never add
//! jitter. A matrix that fails both Cholesky and LU is reported as singular so the
//! caller can skip the step and keep its prior state.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SimError};

/// Relative pivot threshold below which an LU-inverted matrix is treated as singular.
const SINGULAR_RCOND: f64 = 1e-14;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// # Arguments
/// * `matrix` - A square, nominally symmetric positive semi-definite matrix.
///
/// # Returns
/// A lower triangular Cholesky factor when the matrix is positive definite (possibly after
/// a small diagonal jitter), otherwise a symmetric square root from the floored
/// eigen-decomposition.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-6;
    const MAX_TRIES: usize = 6;
    const EIGEN_FLOOR: f64 = 0.0;
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let pj = p + DMatrix::identity(p.nrows(), p.ncols()) * jitter;
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l().into_owned());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::from_diagonal(&sqrt_vals) * u.transpose()
}

/// Solve A X = B for a symmetric A without regularization.
///
/// Cholesky is attempted first, then a pivoted LU inverse. A matrix that is singular to
/// working precision yields [`SimError::SingularMatrix`] tagged with `context`.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>, context: &str) -> Result<DMatrix<f64>> {
    if !a.is_square() {
        return Err(SimError::dimension(context, a.nrows(), a.ncols()));
    }
    if a.nrows() != b.nrows() {
        return Err(SimError::dimension(context, a.nrows(), b.nrows()));
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        let x = ch.solve(b);
        if x.iter().all(|v| v.is_finite()) {
            return Ok(x);
        }
    }
    let inv = invert(&a_sym, context)?;
    Ok(&inv * b)
}

/// Invert a square matrix, failing on singular or non-finite input.
pub fn invert(m: &DMatrix<f64>, context: &str) -> Result<DMatrix<f64>> {
    if !m.is_square() {
        return Err(SimError::dimension(context, m.nrows(), m.ncols()));
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(SimError::singular(format!("{context} (non-finite entries)")));
    }
    let scale = m.amax();
    if scale == 0.0 {
        return Err(SimError::singular(context));
    }
    let lu = m.clone().lu();
    let u = lu.u();
    let min_pivot = u.diagonal().iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
    if min_pivot <= SINGULAR_RCOND * scale {
        return Err(SimError::singular(context));
    }
    match lu.try_inverse() {
        Some(inv) if inv.iter().all(|v| v.is_finite()) => Ok(inv),
        _ => Err(SimError::singular(context)),
    }
}

/// Compute vᵀ M⁻¹ v without forming the inverse when M is positive definite.
pub fn inverse_quadratic_form(v: &DVector<f64>, m: &DMatrix<f64>, context: &str) -> Result<f64> {
    if v.len() != m.nrows() {
        return Err(SimError::dimension(context, m.nrows(), v.len()));
    }
    let rhs = DMatrix::from_column_slice(v.len(), 1, v.as_slice());
    let x = spd_solve(m, &rhs, context)?;
    Ok(v.dot(&x.column(0)))
}

/// Row-major nested vectors, the layout used by the JSON contracts.
pub fn to_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|r| r.iter().copied().collect()).collect()
}

/// Build a matrix from row-major nested vectors. Ragged input is rejected.
pub fn from_rows(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |r| r.len());
    if let Some(bad) = rows.iter().find(|r| r.len() != ncols) {
        return Err(SimError::dimension("row-major matrix", ncols, bad.len()));
    }
    Ok(DMatrix::from_fn(nrows, ncols, |i, j| rows[i][j]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        a.shape() == b.shape() && (a - b).amax() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
    }

    #[test]
    fn t_square_root_of_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 2.0, 0.5, 0.0, 1.0, -1.0, 0.0, 0.0, 0.2]);
        let p = &a * a.transpose();
        let s = matrix_square_root(&p);
        assert!(approx_eq(&(&s * s.transpose()), &p, 1e-12));
    }

    #[test]
    fn t_square_root_of_semidefinite() {
        let p = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        let s = matrix_square_root(&p);
        assert!(approx_eq(&(&s * s.transpose()), &p, 1e-5));
    }

    #[test]
    fn t_evd_floor_clamps_negative_modes() {
        let p = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let s = evd_symmetric_sqrt_with_floor(&p, 0.0);
        let back = &s * s.transpose();
        let se = SymmetricEigen::new(back);
        assert!(se.eigenvalues.iter().all(|l| *l >= -1e-12));
    }

    #[test]
    fn t_square_root_of_nearly_singular() {
        let p = DMatrix::from_row_slice(2, 2, &[1.0, 1.0 - 1e-13, 1.0 - 1e-13, 1.0]);
        let s = matrix_square_root(&p);
        assert!(s.iter().all(|v| v.is_finite()));
        assert!(approx_eq(&(&s * s.transpose()), &p, 1e-6));
    }

    #[test]
    fn t_spd_solve_falls_back_to_lu_for_indefinite() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let b = DMatrix::from_row_slice(2, 1, &[3.0, 3.0]);
        let x = spd_solve(&a, &b, "test").unwrap();
        assert!(approx_eq(&(&a * &x), &b, 1e-12));
    }

    #[test]
    fn t_spd_solve_rejects_zero_matrix() {
        let a = DMatrix::<f64>::zeros(3, 3);
        let b = DMatrix::<f64>::identity(3, 3);
        let err = spd_solve(&a, &b, "innovation covariance").unwrap_err();
        assert!(matches!(err, SimError::SingularMatrix(_)));
    }

    #[test]
    fn t_invert_rank_deficient() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(invert(&m, "rank one").is_err());
    }

    #[test]
    fn t_invert_rejects_nan() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, 0.0, 1.0]);
        assert!(invert(&m, "nan").is_err());
    }

    #[test]
    fn t_inverse_quadratic_form() {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0]));
        let v = DVector::from_vec(vec![2.0, 3.0]);
        let q = inverse_quadratic_form(&v, &m, "quad").unwrap();
        assert!((q - 2.0).abs() < 1e-12);
    }

    #[test]
    fn t_rows_round_trip_rejects_ragged() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = to_rows(&m);
        assert_eq!(rows[1], vec![4.0, 5.0, 6.0]);
        assert!(approx_eq(&from_rows(&rows).unwrap(), &m, 0.0));
        assert!(from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }
}
