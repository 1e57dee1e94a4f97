//! Measurement-space perturbations aimed at the estimator's weakly observable directions.
//!
//! The information a measurement carries about the state is $H^T R^{-1} H$. Its eigenvector with
//! the smallest non-zero eigenvalue is the state direction the sensor constrains least; mapping
//! that direction through $H$ gives a measurement-space bias that moves the estimate where it is
//! already least certain. A cheaper random-direction mode is also provided.
use log::warn;
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::linalg::{inverse_quadratic_form, invert, symmetrize};

/// Relative eigenvalue floor separating the information null space from weak directions.
const NULL_EIGENVALUE_RTOL: f64 = 1e-9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackMode {
    #[default]
    RandomDirection,
    WeakestDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdversarialConfig {
    pub enabled: bool,
    /// α in [0, 1]
    pub strength: f64,
    pub mode: AttackMode,
    /// Multiplier applied on top of `strength`
    pub scale_factor: f64,
    /// Cap on the perturbation's own NIS contribution δᵀS⁻¹δ
    pub max_nis: Option<f64>,
    pub seed: u64,
}

impl Default for AdversarialConfig {
    fn default() -> Self {
        AdversarialConfig {
            enabled: false,
            strength: 0.0,
            mode: AttackMode::RandomDirection,
            scale_factor: 5.0,
            max_nis: None,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdversarialNoise {
    config: AdversarialConfig,
    rng: StdRng,
}

impl Default for AdversarialNoise {
    fn default() -> Self {
        AdversarialNoise::new(AdversarialConfig::default())
    }
}

/// Unit state-space vector along the least informative non-null direction of HᵀR⁻¹H.
///
/// The sign is fixed so that the largest-magnitude component is positive.
pub fn weakest_direction(h: &DMatrix<f64>, r: &DMatrix<f64>) -> Result<DVector<f64>> {
    if r.shape() != (h.nrows(), h.nrows()) {
        return Err(SimError::dimension("adversarial noise covariance", h.nrows(), r.nrows()));
    }
    let r_inv = invert(r, "adversarial noise covariance")?;
    let information = symmetrize(&(h.transpose() * r_inv * h));
    let eigen = SymmetricEigen::new(information);
    let largest = eigen.eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let floor = NULL_EIGENVALUE_RTOL * largest.max(f64::MIN_POSITIVE);
    let weakest = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > floor)
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| SimError::singular("measurement information matrix"))?;
    let mut v = eigen.eigenvectors.column(weakest).into_owned();
    let pivot = v.iamax();
    if v[pivot] < 0.0 {
        v = -v;
    }
    Ok(v)
}

impl AdversarialNoise {
    pub fn new(config: AdversarialConfig) -> Self {
        AdversarialNoise {
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    pub fn config(&self) -> &AdversarialConfig {
        &self.config
    }

    pub fn configure(&mut self, config: AdversarialConfig) {
        if config.seed != self.config.seed {
            self.rng = StdRng::seed_from_u64(config.seed);
        }
        self.config = config;
    }

    fn magnitude(&self) -> f64 {
        self.config.strength * self.config.scale_factor
    }

    /// Perturbation to add to a measurement with Jacobian `h` and noise `r`.
    ///
    /// `s` is the innovation covariance used by the NIS cap; `r` stands in when it is absent.
    /// Disabled or zero-strength generators return zeros.
    pub fn generate(
        &mut self,
        h: &DMatrix<f64>,
        r: &DMatrix<f64>,
        s: Option<&DMatrix<f64>>,
    ) -> Result<DVector<f64>> {
        let m = h.nrows();
        if !self.config.enabled || self.config.strength <= 0.0 || m == 0 {
            return Ok(DVector::zeros(m));
        }
        let direction = match self.config.mode {
            // A draw too short to normalize is discarded and redrawn.
            AttackMode::RandomDirection => loop {
                let raw = DVector::from_fn(m, |_, _| self.rng.random_range(-0.5..0.5));
                if let Some(unit) = raw.try_normalize(f64::EPSILON) {
                    break unit;
                }
            },
            AttackMode::WeakestDirection => {
                let projected = h * weakest_direction(h, r)?;
                let norm = projected.norm();
                if norm <= f64::EPSILON {
                    warn!("Weakest direction is unobservable through H; no perturbation");
                    return Ok(DVector::zeros(m));
                }
                projected / norm
            }
        };
        let mut delta = direction * self.magnitude();
        if let Some(cap) = self.config.max_nis {
            let s = s.unwrap_or(r);
            let nis = inverse_quadratic_form(&delta, s, "adversarial NIS cap")?;
            if nis > cap && nis > 0.0 {
                delta *= (cap / nis).sqrt();
            }
        }
        Ok(delta)
    }

    /// z + δ.
    pub fn apply(
        &mut self,
        z: &DVector<f64>,
        h: &DMatrix<f64>,
        r: &DMatrix<f64>,
        s: Option<&DMatrix<f64>>,
    ) -> Result<DVector<f64>> {
        if z.len() != h.nrows() {
            return Err(SimError::dimension("adversarial measurement", h.nrows(), z.len()));
        }
        Ok(z + self.generate(h, r, s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::gps_position_jacobian;
    use assert_approx_eq::assert_approx_eq;

    fn gps_r() -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 4.0, 16.0]))
    }

    fn enabled(mode: AttackMode, strength: f64) -> AdversarialConfig {
        AdversarialConfig {
            enabled: true,
            strength,
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_generator_is_silent() {
        let mut adv = AdversarialNoise::default();
        let d = adv.generate(&gps_position_jacobian(19), &gps_r(), None).unwrap();
        assert_eq!(d.len(), 3);
        assert_approx_eq!(d.norm(), 0.0);
    }

    #[test]
    fn random_direction_has_requested_size() {
        let mut adv = AdversarialNoise::new(enabled(AttackMode::RandomDirection, 0.4));
        let d = adv.generate(&gps_position_jacobian(19), &gps_r(), None).unwrap();
        assert_approx_eq!(d.norm(), 2.0, 1e-12);
        let mut again = AdversarialNoise::new(enabled(AttackMode::RandomDirection, 0.4));
        assert_eq!(again.generate(&gps_position_jacobian(19), &gps_r(), None).unwrap(), d);
    }

    #[test]
    fn random_direction_is_exactly_unit_for_every_draw() {
        let h = gps_position_jacobian(19);
        for seed in 0..200 {
            let config = AdversarialConfig {
                seed,
                ..enabled(AttackMode::RandomDirection, 0.2)
            };
            let d = AdversarialNoise::new(config).generate(&h, &gps_r(), None).unwrap();
            assert_approx_eq!(d.norm(), 1.0, 1e-12);
        }
        // A one-row measurement can only point one way or the other.
        let scalar = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let mut adv = AdversarialNoise::new(enabled(AttackMode::RandomDirection, 0.2));
        let d = adv.generate(&scalar, &DMatrix::identity(1, 1), None).unwrap();
        assert_approx_eq!(d[0].abs(), 1.0, 1e-12);
        let empty = DMatrix::zeros(0, 19);
        assert_eq!(adv.generate(&empty, &DMatrix::zeros(0, 0), None).unwrap().len(), 0);
    }

    #[test]
    fn weakest_direction_for_gps_is_vertical() {
        let v = weakest_direction(&gps_position_jacobian(19), &gps_r()).unwrap();
        assert_eq!(v.len(), 19);
        assert_approx_eq!(v[2], 1.0, 1e-9);
        assert_approx_eq!(v.norm(), 1.0, 1e-9);

        let mut adv = AdversarialNoise::new(enabled(AttackMode::WeakestDirection, 1.0));
        let d = adv.generate(&gps_position_jacobian(19), &gps_r(), None).unwrap();
        assert_approx_eq!(d[0], 0.0, 1e-9);
        assert_approx_eq!(d[2], 5.0, 1e-9);
    }

    #[test]
    fn nis_cap_limits_perturbation() {
        let config = AdversarialConfig {
            max_nis: Some(1.0),
            ..enabled(AttackMode::WeakestDirection, 1.0)
        };
        let mut adv = AdversarialNoise::new(config);
        let r = gps_r();
        let d = adv.generate(&gps_position_jacobian(19), &r, Some(&r)).unwrap();
        assert_approx_eq!(inverse_quadratic_form(&d, &r, "test").unwrap(), 1.0, 1e-9);
        assert_approx_eq!(d[2], 4.0, 1e-9);
    }

    #[test]
    fn apply_adds_to_measurement() {
        let mut adv = AdversarialNoise::new(enabled(AttackMode::WeakestDirection, 0.2));
        let z = DVector::from_vec(vec![10.0, 20.0, -1000.0]);
        let out = adv.apply(&z, &gps_position_jacobian(19), &gps_r(), None).unwrap();
        assert_approx_eq!(out[2], -999.0, 1e-9);
        assert!(adv.apply(&DVector::zeros(2), &gps_position_jacobian(19), &gps_r(), None).is_err());
    }

    #[test]
    fn singular_noise_is_reported() {
        let mut adv = AdversarialNoise::new(enabled(AttackMode::WeakestDirection, 1.0));
        let err = adv.generate(&gps_position_jacobian(19), &DMatrix::zeros(3, 3), None);
        assert!(matches!(err, Err(SimError::SingularMatrix(_))));
    }
}
