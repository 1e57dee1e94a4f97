//! Estimator consistency statistics and the innovation-side safeguards built on them.
//!
//! - NEES (normalized estimation error squared) and NIS (normalized innovation squared) with
//!   their χ² acceptance bounds, plus a bounded tracker for running fractions.
//! - [`InnovationGate`]: χ² 99% gating of individual measurements.
//! - [`AdaptiveRTuner`]: per-sensor, exponentially smoothed scaling of the measurement noise
//!   covariance driven by the sample innovation variance.
use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::linalg::inverse_quadratic_form;

/// Standard normal quantile at 97.5%.
const Z_975: f64 = 1.959_963_985;

/// χ² 99% quantile for the gate, by degrees of freedom.
pub fn chi_squared_99(dof: usize) -> f64 {
    match dof {
        1 => 6.63,
        2 => 9.21,
        3 => 11.34,
        6 => 16.81,
        9 => 21.67,
        _ => 11.34,
    }
}

// ============= NEES / NIS =======================================================================

/// eᵀ P⁻¹ e with e = truth − estimate.
pub fn compute_nees(
    truth: &DVector<f64>,
    estimate: &DVector<f64>,
    p: &DMatrix<f64>,
) -> Result<f64> {
    if truth.len() != estimate.len() {
        return Err(SimError::dimension("NEES estimate", truth.len(), estimate.len()));
    }
    let error = truth - estimate;
    inverse_quadratic_form(&error, p, "NEES covariance")
}

/// yᵀ S⁻¹ y.
pub fn compute_nis(innovation: &DVector<f64>, s: &DMatrix<f64>) -> Result<f64> {
    inverse_quadratic_form(innovation, s, "NIS innovation covariance")
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChiSquaredBounds {
    pub lower: f64,
    pub upper: f64,
}

impl ChiSquaredBounds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Two-sided acceptance interval for a χ² statistic with `dof` degrees of freedom.
///
/// Tabulated for 3 and 9 dof; everything else uses the Wilson–Hilferty approximation at the
/// 2.5% and 97.5% points.
pub fn chi_squared_bounds(dof: usize) -> ChiSquaredBounds {
    match dof {
        3 => ChiSquaredBounds {
            lower: 0.35,
            upper: 7.81,
        },
        9 => ChiSquaredBounds {
            lower: 2.70,
            upper: 19.02,
        },
        0 => ChiSquaredBounds {
            lower: 0.0,
            upper: 0.0,
        },
        _ => {
            let k = dof as f64;
            let spread = (2.0 / (9.0 * k)).sqrt();
            let centre = 1.0 - 2.0 / (9.0 * k);
            let quantile = |z: f64| k * (centre + z * spread).max(0.0).powi(3);
            ChiSquaredBounds {
                lower: quantile(-Z_975),
                upper: quantile(Z_975),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub nees: f64,
    pub nis: f64,
    pub nees_bounds: ChiSquaredBounds,
    pub nis_bounds: ChiSquaredBounds,
    pub is_consistent: bool,
}

impl ConsistencyCheck {
    pub fn new(nees: f64, nees_dof: usize, nis: f64, nis_dof: usize) -> Self {
        let nees_bounds = chi_squared_bounds(nees_dof);
        let nis_bounds = chi_squared_bounds(nis_dof);
        ConsistencyCheck {
            nees,
            nis,
            nees_bounds,
            nis_bounds,
            is_consistent: nees_bounds.contains(nees) && nis_bounds.contains(nis),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistencySample {
    pub time: f64,
    pub nees: f64,
    pub nis: f64,
}

/// Bounded history of NEES/NIS samples.
#[derive(Clone, Debug)]
pub struct ConsistencyTracker {
    samples: VecDeque<ConsistencySample>,
    capacity: usize,
    nees_dof: usize,
    nis_dof: usize,
}

impl ConsistencyTracker {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(nees_dof: usize, nis_dof: usize) -> Self {
        ConsistencyTracker {
            samples: VecDeque::new(),
            capacity: Self::DEFAULT_CAPACITY,
            nees_dof,
            nis_dof,
        }
    }

    pub fn record(&mut self, time: f64, nees: f64, nis: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ConsistencySample { time, nees, nis });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ConsistencySample> {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn fraction_within(
        &self,
        bounds: ChiSquaredBounds,
        pick: impl Fn(&ConsistencySample) -> f64,
    ) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let inside = self.samples.iter().filter(|s| bounds.contains(pick(s))).count();
        inside as f64 / self.samples.len() as f64
    }

    pub fn fraction_nees_in_bounds(&self) -> f64 {
        self.fraction_within(chi_squared_bounds(self.nees_dof), |s| s.nees)
    }

    pub fn fraction_nis_in_bounds(&self) -> f64 {
        self.fraction_within(chi_squared_bounds(self.nis_dof), |s| s.nis)
    }

    pub fn mean_nees(&self) -> f64 {
        mean(self.samples.iter().map(|s| s.nees))
    }

    pub fn mean_nis(&self) -> f64 {
        mean(self.samples.iter().map(|s| s.nis))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

// ============= Innovation gating ================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingConfig {
    pub enabled: bool,
    /// Number of recent gate decisions kept for the rejection rate
    pub history: usize,
    /// Seconds a sensor may go without an accepted update before the filter forces its next
    /// measurement through on an inflated covariance. Zero disables recovery.
    pub recovery_after: f64,
}

impl Default for GatingConfig {
    fn default() -> Self {
        GatingConfig {
            enabled: true,
            history: 100,
            recovery_after: 20.0,
        }
    }
}

/// χ² gate on the normalized innovation squared.
#[derive(Clone, Debug, Default)]
pub struct InnovationGate {
    config: GatingConfig,
    rejection_count: usize,
    recovery_count: usize,
    recent: VecDeque<bool>,
}

impl InnovationGate {
    pub fn new(config: GatingConfig) -> Self {
        InnovationGate {
            config,
            rejection_count: 0,
            recovery_count: 0,
            recent: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &GatingConfig {
        &self.config
    }

    /// True once `silent_for` seconds without an accepted update reach the recovery window.
    pub fn recovery_due(&self, silent_for: f64) -> bool {
        self.config.recovery_after > 0.0 && silent_for >= self.config.recovery_after
    }

    /// Count a rejected measurement that was forced through anyway.
    pub fn record_recovery(&mut self) {
        self.recovery_count += 1;
    }

    pub fn recovery_count(&self) -> usize {
        self.recovery_count
    }

    pub fn threshold(&self, dof: usize) -> f64 {
        chi_squared_99(dof)
    }

    /// Record and return whether a measurement with this NIS should be accepted.
    pub fn check(&mut self, nis: f64, dof: usize) -> bool {
        let accepted = nis.is_finite() && nis <= self.threshold(dof);
        if !accepted {
            self.rejection_count += 1;
        }
        if self.recent.len() >= self.config.history.max(1) {
            self.recent.pop_front();
        }
        self.recent.push_back(accepted);
        accepted
    }

    pub fn rejection_count(&self) -> usize {
        self.rejection_count
    }

    /// Fraction of rejections among the recent decisions.
    pub fn rejection_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().filter(|a| !**a).count() as f64 / self.recent.len() as f64
    }

    pub fn reset(&mut self) {
        self.rejection_count = 0;
        self.recovery_count = 0;
        self.recent.clear();
    }
}

// ============= Adaptive measurement noise =======================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRConfig {
    pub enabled: bool,
    pub window: usize,
    pub rate: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl Default for AdaptiveRConfig {
    fn default() -> Self {
        AdaptiveRConfig {
            enabled: true,
            window: 20,
            rate: 0.1,
            min_multiplier: 0.5,
            max_multiplier: 10.0,
        }
    }
}

/// Innovation-driven R scaling for a single sensor.
#[derive(Clone, Debug)]
pub struct AdaptiveRTuner {
    config: AdaptiveRConfig,
    history: VecDeque<DVector<f64>>,
    multiplier: f64,
}

impl AdaptiveRTuner {
    pub fn new(config: AdaptiveRConfig) -> Self {
        AdaptiveRTuner {
            config,
            history: VecDeque::new(),
            multiplier: 1.0,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Base R scaled by the current multiplier.
    pub fn effective_noise(&self, base: &DMatrix<f64>) -> DMatrix<f64> {
        base * self.multiplier
    }

    /// Mean squared innovation component over the window; zero below two samples.
    pub fn sample_variance(&self) -> f64 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let (sum, count) = self
            .history
            .iter()
            .flat_map(|y| y.iter())
            .fold((0.0, 0usize), |(s, n), v| (s + v * v, n + 1));
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    /// Fold a new innovation and its predicted covariance into the multiplier.
    pub fn update(&mut self, innovation: &DVector<f64>, s: &DMatrix<f64>) -> f64 {
        if self.history.len() >= self.config.window.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(innovation.clone());
        let m = innovation.len();
        if m == 0 || self.history.len() < 2 {
            return self.multiplier;
        }
        let expected = s.trace() / m as f64;
        let ratio = self.sample_variance() / (expected + 1e-6);
        let target = ratio.clamp(self.config.min_multiplier, self.config.max_multiplier);
        if target.is_finite() {
            self.multiplier =
                (1.0 - self.config.rate) * self.multiplier + self.config.rate * target;
        }
        self.multiplier
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.multiplier = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};
    use std::cmp::Ordering;

    /// Share of 2000 correlated Gaussian draws whose NEES (or NIS) lands inside the χ² band.
    fn sampled_fraction_in_bounds(dof: usize, seed: u64, innovation: bool) -> f64 {
        let l = DMatrix::from_fn(dof, dof, |i, j| match i.cmp(&j) {
            Ordering::Equal => 1.0 + 0.1 * i as f64,
            Ordering::Greater => 0.5,
            Ordering::Less => 0.0,
        });
        let p = &l * l.transpose();
        let bounds = chi_squared_bounds(dof);
        let estimate = DVector::from_element(dof, 10.0);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let draws = 2000;
        let inside = (0..draws)
            .filter(|_| {
                let e = &l * DVector::from_fn(dof, |_, _| normal.sample(&mut rng));
                let value = if innovation {
                    compute_nis(&e, &p)
                } else {
                    compute_nees(&(&estimate + &e), &estimate, &p)
                };
                bounds.contains(value.unwrap())
            })
            .count();
        inside as f64 / draws as f64
    }

    #[test]
    fn nees_of_unit_error() {
        let truth = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let est = DVector::zeros(3);
        let p = DMatrix::identity(3, 3) * 0.25;
        assert_approx_eq!(compute_nees(&truth, &est, &p).unwrap(), 4.0, 1e-12);
    }

    #[test]
    fn nis_singular_is_error() {
        let y = DVector::from_vec(vec![1.0, 1.0]);
        let s = DMatrix::zeros(2, 2);
        assert!(matches!(compute_nis(&y, &s), Err(SimError::SingularMatrix(_))));
    }

    #[test]
    fn nees_dimension_mismatch() {
        let err = compute_nees(&DVector::zeros(3), &DVector::zeros(2), &DMatrix::identity(3, 3));
        assert!(matches!(err, Err(SimError::DimensionMismatch { .. })));
    }

    #[test]
    fn tabulated_bounds() {
        let b3 = chi_squared_bounds(3);
        assert_approx_eq!(b3.lower, 0.35);
        assert_approx_eq!(b3.upper, 7.81);
        let b9 = chi_squared_bounds(9);
        assert_approx_eq!(b9.upper, 19.02);
    }

    #[test]
    fn gaussian_errors_keep_nees_inside_nine_dof_band() {
        for seed in [7, 11] {
            let fraction = sampled_fraction_in_bounds(9, seed, false);
            assert!(fraction >= 0.9, "seed {seed}: {fraction}");
        }
    }

    #[test]
    fn gaussian_innovations_keep_nis_inside_three_dof_band() {
        // The 3-dof table runs from the 5% to the 95% point, so about 90% of draws fall inside.
        let fraction = sampled_fraction_in_bounds(3, 23, true);
        assert!(fraction >= 0.87 && fraction <= 0.93, "{fraction}");
        let check = ConsistencyCheck::new(9.0, 9, 3.0, 3);
        assert!(check.is_consistent);
    }

    #[test]
    fn wilson_hilferty_bounds_are_close() {
        // χ²(6): 2.5% = 1.237, 97.5% = 14.449
        let b = chi_squared_bounds(6);
        assert_approx_eq!(b.lower, 1.237, 0.05);
        assert_approx_eq!(b.upper, 14.449, 0.1);
        let b1 = chi_squared_bounds(1);
        assert!(b1.lower >= 0.0 && b1.upper > 4.0);
    }

    #[test]
    fn consistency_check_flags_outliers() {
        assert!(ConsistencyCheck::new(3.0, 3, 2.5, 3).is_consistent);
        assert!(!ConsistencyCheck::new(30.0, 3, 2.5, 3).is_consistent);
        assert!(!ConsistencyCheck::new(3.0, 3, 0.01, 3).is_consistent);
    }

    #[test]
    fn tracker_is_bounded() {
        let mut t = ConsistencyTracker::new(3, 3);
        for k in 0..1500 {
            let v = if k % 2 == 0 { 3.0 } else { 50.0 };
            t.record(k as f64, v, 3.0);
        }
        assert_eq!(t.len(), ConsistencyTracker::DEFAULT_CAPACITY);
        assert_approx_eq!(t.fraction_nees_in_bounds(), 0.5);
        assert_approx_eq!(t.fraction_nis_in_bounds(), 1.0);
        assert_approx_eq!(t.mean_nis(), 3.0);
        assert_eq!(t.samples().next().map(|s| s.time), Some(500.0));
    }

    #[test]
    fn gate_thresholds() {
        let mut gate = InnovationGate::new(GatingConfig::default());
        assert_approx_eq!(gate.threshold(3), 11.34);
        assert_approx_eq!(gate.threshold(6), 16.81);
        assert_approx_eq!(gate.threshold(4), 11.34);
        assert!(gate.check(11.0, 3));
        assert!(!gate.check(12.0, 3));
        assert!(!gate.check(f64::NAN, 3));
        assert_eq!(gate.rejection_count(), 2);
        assert_approx_eq!(gate.rejection_rate(), 2.0 / 3.0);
    }

    #[test]
    fn gate_history_is_bounded() {
        let mut gate = InnovationGate::new(GatingConfig::default());
        for _ in 0..100 {
            gate.check(100.0, 3);
        }
        for _ in 0..100 {
            gate.check(1.0, 3);
        }
        assert_eq!(gate.rejection_count(), 100);
        assert_approx_eq!(gate.rejection_rate(), 0.0);
    }

    #[test]
    fn gate_recovery_window() {
        let mut gate = InnovationGate::new(GatingConfig::default());
        assert!(!gate.recovery_due(19.9));
        assert!(gate.recovery_due(20.0));
        gate.record_recovery();
        assert_eq!(gate.recovery_count(), 1);
        gate.reset();
        assert_eq!(gate.recovery_count(), 0);

        let never = InnovationGate::new(GatingConfig {
            recovery_after: 0.0,
            ..Default::default()
        });
        assert!(!never.recovery_due(1e6));
    }

    #[test]
    fn adaptive_multiplier_grows_with_large_innovations() {
        let mut tuner = AdaptiveRTuner::new(AdaptiveRConfig::default());
        let s = DMatrix::identity(3, 3);
        let y = DVector::from_vec(vec![3.0, -3.0, 3.0]);
        assert_approx_eq!(tuner.update(&y, &s), 1.0);
        // variance 9 against expected 1: target 9, one smoothing step
        let m = tuner.update(&y, &s);
        assert_approx_eq!(m, 0.9 + 0.1 * 9.0 / (1.0 + 1e-6), 1e-9);
        for _ in 0..200 {
            tuner.update(&y, &s);
        }
        assert!(tuner.multiplier() > 8.9 && tuner.multiplier() <= 10.0);
    }

    #[test]
    fn adaptive_multiplier_floor() {
        let mut tuner = AdaptiveRTuner::new(AdaptiveRConfig::default());
        let s = DMatrix::identity(2, 2) * 100.0;
        let y = DVector::from_vec(vec![0.1, 0.1]);
        for _ in 0..500 {
            tuner.update(&y, &s);
        }
        assert_approx_eq!(tuner.multiplier(), 0.5, 1e-6);
        let r = tuner.effective_noise(&DMatrix::identity(2, 2));
        assert_approx_eq!(r[(1, 1)], 0.5, 1e-6);
        tuner.reset();
        assert_approx_eq!(tuner.multiplier(), 1.0);
    }
}
