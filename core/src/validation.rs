//! Validation layer: the serialized snapshot, Monte Carlo consistency runs and envelope checks.
//!
//! A [`ValidationSnapshot`] freezes what the estimator believes about the engine's current flight
//! condition: the discrete transition Φ, the GPS measurement matrix, the observability of that
//! pair, the configured attack and a NEES/NIS consistency verdict. Field names follow the camelCase
//! contract consumed by the validation dashboard.
//!
//! [`ValidationEngine::monte_carlo`] forks the engine's filter into independent trials, each with
//! its own seeded truth perturbation and GPS noise, optionally biased along the measurement image
//! of the least observable state direction.
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::adversarial::weakest_direction;
use crate::aircraft::AircraftConfig;
use crate::consistency::{
    ChiSquaredBounds, ConsistencyCheck, ConsistencyTracker, chi_squared_bounds, compute_nees,
};
use crate::dynamics::aircraft_derivative;
use crate::engine::{SimulationEngine, TruthState};
use crate::error::{Result, SimError};
use crate::integrator::rk4;
use crate::kalman::{AircraftProcessModel, EkfState, ExtendedKalmanFilter, index};
use crate::linalg::{matrix_square_root, to_rows};
use crate::measurements::{GPS_SENSOR_ID, Measurement, MeasurementKind};
use crate::observability::{DEFAULT_RANK_TOLERANCE, analyze_with_steps};
use crate::trim::trim_id;
use crate::{ControlInput, NavigationFilter, RigidBodyState};

/// Position NEES and GPS NIS both have three degrees of freedom.
const POSITION_DOF: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackTarget {
    Process,
    #[default]
    Measurement,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Discretization step for Φ (s)
    pub dt: f64,
    /// Observability horizon; `None` uses the state dimension
    pub observability_steps: Option<usize>,
    pub rank_tolerance: f64,
    pub attack_gain: f64,
    pub attack_target: AttackTarget,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            dt: 0.05,
            observability_steps: None,
            rank_tolerance: DEFAULT_RANK_TOLERANCE,
            attack_gain: 0.0,
            attack_target: AttackTarget::Measurement,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySummary {
    pub singular_values: Vec<f64>,
    pub weakest_direction: Vec<f64>,
    /// Right singular vectors, one per entry, ordered like `singular_values`
    pub eigen_vectors: Vec<Vec<f64>>,
    pub rank: usize,
    /// `null` in JSON when the pair is unobservable
    pub condition_number: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttackSummary {
    pub gain: f64,
    pub target: AttackTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBounds {
    pub nees95: f64,
    pub nis95: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencySummary {
    pub nees: f64,
    pub nis: f64,
    pub bounds: SnapshotBounds,
    pub is_consistent: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSnapshot {
    pub trim_id: String,
    #[serde(rename = "F")]
    pub f: Vec<Vec<f64>>,
    #[serde(rename = "H")]
    pub h: Vec<Vec<f64>>,
    pub observability: ObservabilitySummary,
    pub attack: AttackSummary,
    pub consistency: ConsistencySummary,
}

impl ValidationSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SimError::Io(std::io::Error::other(e)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub runs: usize,
    /// Simulated time per run (s)
    pub horizon: f64,
    pub dt: f64,
    /// Bias (m) injected along H·v_weak on every GPS fix
    pub attack_gain: f64,
    /// Half-width (m) of the uniform perturbation added to the truth position each step
    pub position_noise: f64,
    pub seed: u64,
    pub parallel: bool,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        MonteCarloConfig {
            runs: 5,
            horizon: 2.0,
            dt: 0.05,
            attack_gain: 0.0,
            position_noise: 0.25,
            seed: 42,
            parallel: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloRun {
    pub run: usize,
    pub seed: u64,
    pub mean_nees: f64,
    pub mean_nis: f64,
    pub nees_in_bounds: f64,
    pub nis_in_bounds: f64,
    pub final_position_error: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub runs: Vec<MonteCarloRun>,
    pub mean_nees: f64,
    pub mean_nis: f64,
    pub nees_bounds: ChiSquaredBounds,
    pub nis_bounds: ChiSquaredBounds,
    pub is_consistent: bool,
}

impl MonteCarloResult {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SimError::Io(std::io::Error::other(e)))
    }
}

#[derive(Clone, Debug, Default)]
pub struct ValidationEngine {
    pub config: ValidationConfig,
}

/// Everything a Monte Carlo trial needs from the engine, shared read-only across threads.
struct TrialSeed<'a> {
    aircraft: &'a AircraftConfig,
    filter: &'a ExtendedKalmanFilter<AircraftProcessModel>,
    truth: RigidBodyState,
    controls: ControlInput,
    gps_noise: DMatrix<f64>,
    attack: DVector<f64>,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self {
        ValidationEngine { config }
    }

    /// Estimator snapshot at the engine's current render state.
    pub fn snapshot(&self, engine: &SimulationEngine) -> Result<ValidationSnapshot> {
        let render = engine.get_render_state(engine.time());
        let x = EkfState::from_rigid_body(&render.to_rigid_body()).to_vector();
        let f = engine
            .ekf()
            .transition_matrix_at(&x, &engine.applied_controls(), self.config.dt);
        let h = engine.gps().jacobian();
        let report = analyze_with_steps(
            &f,
            &h,
            self.config.observability_steps,
            self.config.rank_tolerance,
        )?;

        let estimate = engine.get_estimate();
        let nees = position_nees(&render, &estimate.state, &estimate.covariance)?;
        let nis = engine.last_gps_report().map_or(0.0, |r| r.nis);
        let check = ConsistencyCheck::new(nees, POSITION_DOF, nis, POSITION_DOF);
        let upper = chi_squared_bounds(POSITION_DOF).upper;

        let rb = render.to_rigid_body();
        Ok(ValidationSnapshot {
            trim_id: trim_id(&engine.aircraft().id, rb.airspeed(), rb.altitude()),
            f: to_rows(&f),
            h: to_rows(&h),
            observability: ObservabilitySummary {
                singular_values: report.singular_values.clone(),
                weakest_direction: report.weakest_direction.as_slice().to_vec(),
                eigen_vectors: report
                    .right_singular_vectors
                    .column_iter()
                    .map(|c| c.iter().copied().collect())
                    .collect(),
                rank: report.rank,
                condition_number: report.condition_number,
            },
            attack: AttackSummary {
                gain: self.config.attack_gain,
                target: self.config.attack_target,
            },
            consistency: ConsistencySummary {
                nees,
                nis,
                bounds: SnapshotBounds {
                    nees95: upper,
                    nis95: upper,
                },
                is_consistent: check.is_consistent,
            },
        })
    }

    /// Independent filter trials forked from the engine's current state.
    pub fn monte_carlo(
        &self,
        engine: &SimulationEngine,
        config: &MonteCarloConfig,
    ) -> Result<MonteCarloResult> {
        if config.runs == 0 || !(config.dt > 0.0) || !(config.horizon > 0.0) {
            return Err(SimError::InvalidParameter(
                "Monte Carlo needs at least one run and positive dt and horizon".to_string(),
            ));
        }
        let gps = engine.gps();
        let gps_noise = gps.noise_covariance();
        let h = gps.jacobian();
        let attack = if config.attack_gain != 0.0 {
            &h * weakest_direction(&h, &gps_noise)? * config.attack_gain
        } else {
            DVector::zeros(h.nrows())
        };
        let seed = TrialSeed {
            aircraft: engine.aircraft(),
            filter: engine.ekf(),
            truth: *engine.truth(),
            controls: engine.applied_controls(),
            gps_noise,
            attack,
        };

        let runs: Vec<MonteCarloRun> = if config.parallel {
            (0..config.runs)
                .into_par_iter()
                .map(|run| run_trial(&seed, config, run))
                .collect::<Result<_>>()?
        } else {
            (0..config.runs)
                .map(|run| run_trial(&seed, config, run))
                .collect::<Result<_>>()?
        };

        let n = runs.len() as f64;
        let mean_nees = runs.iter().map(|r| r.mean_nees).sum::<f64>() / n;
        let mean_nis = runs.iter().map(|r| r.mean_nis).sum::<f64>() / n;
        let check = ConsistencyCheck::new(mean_nees, POSITION_DOF, mean_nis, POSITION_DOF);
        info!(
            "Monte Carlo: {} runs, mean NEES {:.3}, mean NIS {:.3}, consistent: {}",
            runs.len(),
            mean_nees,
            mean_nis,
            check.is_consistent
        );
        Ok(MonteCarloResult {
            runs,
            mean_nees,
            mean_nis,
            nees_bounds: check.nees_bounds,
            nis_bounds: check.nis_bounds,
            is_consistent: check.is_consistent,
        })
    }
}

fn position_nees(
    truth: &TruthState,
    estimate: &EkfState,
    covariance: &DMatrix<f64>,
) -> Result<f64> {
    let p = covariance
        .view((index::POSITION, index::POSITION), (3, 3))
        .into_owned();
    compute_nees(
        &DVector::from_column_slice(truth.position.as_slice()),
        &DVector::from_column_slice(estimate.position.as_slice()),
        &p,
    )
}

/// Zero-mean Gaussian with covariance R, drawn as L·n for L·Lᵀ = R and n standard normal.
struct CorrelatedNoise {
    factor: DMatrix<f64>,
    standard: Normal<f64>,
}

impl CorrelatedNoise {
    fn new(covariance: &DMatrix<f64>) -> Result<Self> {
        if !covariance.is_square() || covariance.iter().any(|v| !v.is_finite()) {
            return Err(SimError::InvalidParameter(
                "GPS noise covariance must be square and finite".into(),
            ));
        }
        let standard = Normal::new(0.0, 1.0)
            .map_err(|e| SimError::InvalidParameter(format!("GPS noise: {e}")))?;
        Ok(CorrelatedNoise {
            factor: matrix_square_root(covariance),
            standard,
        })
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let n = DVector::from_fn(self.factor.ncols(), |_, _| self.standard.sample(rng));
        &self.factor * n
    }
}

fn run_trial(seed: &TrialSeed<'_>, config: &MonteCarloConfig, run: usize) -> Result<MonteCarloRun> {
    let run_seed = config.seed.wrapping_add(run as u64);
    let mut rng = StdRng::seed_from_u64(run_seed);
    let noise = CorrelatedNoise::new(&seed.gps_noise)?;

    let mut filter = seed.filter.clone();
    let mut truth = seed.truth;
    let mut tracker = ConsistencyTracker::new(POSITION_DOF, POSITION_DOF);
    let steps = (config.horizon / config.dt).round().max(1.0) as usize;
    let derivative = aircraft_derivative(seed.aircraft, seed.controls);

    for k in 1..=steps {
        let t = k as f64 * config.dt;
        let next = rk4(t, &truth.to_vector(), config.dt, &derivative);
        match RigidBodyState::from_vector(&next) {
            Ok(state) if state.is_finite() => truth = state,
            _ => warn!("Monte Carlo run {run}: truth diverged at t = {t:.2}"),
        }
        if config.position_noise > 0.0 {
            truth.x += rng.random_range(-config.position_noise..config.position_noise);
            truth.y += rng.random_range(-config.position_noise..config.position_noise);
            truth.z += rng.random_range(-config.position_noise..config.position_noise);
        }

        filter.predict(&seed.controls, config.dt);
        let position = DVector::from_column_slice(truth.position().as_slice());
        let z = position + noise.sample(&mut rng) + &seed.attack;
        let measurement = Measurement::new(
            GPS_SENSOR_ID,
            z,
            seed.gps_noise.clone(),
            MeasurementKind::GpsPosition,
            t,
        )?;
        let nis = match filter.update(&measurement) {
            Ok(report) => report.nis,
            Err(e) => {
                warn!("Monte Carlo run {run}: update skipped: {e}");
                continue;
            }
        };
        let nees = position_nees(
            &TruthState::from_rigid_body(&truth),
            &filter.state(),
            filter.covariance(),
        )?;
        tracker.record(t, nees, nis);
    }

    let final_position_error = (filter.state().position - truth.position()).norm();
    Ok(MonteCarloRun {
        run,
        seed: run_seed,
        mean_nees: tracker.mean_nees(),
        mean_nis: tracker.mean_nis(),
        nees_in_bounds: tracker.fraction_nees_in_bounds(),
        nis_in_bounds: tracker.fraction_nis_in_bounds(),
        final_position_error,
    })
}

// ============= Flight envelope ==================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeLimits {
    pub max_bank_deg: f64,
    pub max_pitch_deg: f64,
    /// Below this airspeed (m/s) the state is flagged as a stall
    pub stall_speed: f64,
    /// Above this airspeed (m/s) a warning is raised
    pub never_exceed_speed: f64,
    pub max_altitude: f64,
    /// Below this altitude (m) a warning is raised
    pub ground_proximity: f64,
    pub stall_alpha_deg: f64,
    pub critical_alpha_deg: f64,
}

impl Default for EnvelopeLimits {
    fn default() -> Self {
        EnvelopeLimits {
            max_bank_deg: 60.0,
            max_pitch_deg: 30.0,
            stall_speed: 45.0,
            never_exceed_speed: 250.0,
            max_altitude: 18_000.0,
            ground_proximity: 100.0,
            stall_alpha_deg: 15.0,
            critical_alpha_deg: 20.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeReport {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Compare a truth sample against the operating envelope.
pub fn check_envelope(state: &TruthState, limits: &EnvelopeLimits) -> EnvelopeReport {
    let rb = state.to_rigid_body();
    let mut report = EnvelopeReport::default();
    if !rb.is_finite() || !state.alpha.is_finite() {
        report.errors.push("state contains non-finite values".to_string());
        return report;
    }
    let bank = rb.phi.to_degrees();
    let pitch = rb.theta.to_degrees();
    let alpha = state.alpha.to_degrees();
    let airspeed = rb.airspeed();
    let altitude = rb.altitude();

    if bank.abs() > limits.max_bank_deg {
        report.errors.push(format!(
            "bank angle {bank:.1} deg exceeds {:.0} deg",
            limits.max_bank_deg
        ));
    }
    if pitch.abs() > limits.max_pitch_deg {
        report.errors.push(format!(
            "pitch angle {pitch:.1} deg exceeds {:.0} deg",
            limits.max_pitch_deg
        ));
    }
    if airspeed < limits.stall_speed {
        report.errors.push(format!("airspeed {airspeed:.1} m/s below stall speed"));
    }
    if airspeed > limits.never_exceed_speed {
        report.warnings.push(format!("airspeed {airspeed:.1} m/s above never-exceed speed"));
    }
    if alpha > limits.critical_alpha_deg {
        report.errors.push(format!("critical stall: alpha {alpha:.1} deg"));
    } else if alpha > limits.stall_alpha_deg {
        report.errors.push(format!("stall: alpha {alpha:.1} deg"));
    }
    if altitude < 0.0 {
        report.errors.push(format!("altitude {altitude:.1} m below ground"));
    } else if altitude < limits.ground_proximity {
        report.warnings.push(format!("ground proximity: altitude {altitude:.1} m"));
    }
    if altitude > limits.max_altitude {
        report.errors.push(format!("altitude {altitude:.0} m above service ceiling"));
    }
    report.is_valid = report.errors.is_empty();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use assert_approx_eq::assert_approx_eq;

    fn flown_engine(seconds: f64) -> SimulationEngine {
        let mut engine = SimulationEngine::new(EngineConfig::default()).unwrap();
        let controls = ControlInput::new(0.5, 0.0, 0.0, 0.0);
        let mut t = 0.0;
        while t < seconds {
            engine.step(0.1, &controls);
            t += 0.1;
        }
        engine
    }

    #[test]
    fn snapshot_shapes_and_fields() {
        let engine = flown_engine(1.0);
        let snap = ValidationEngine::default().snapshot(&engine).unwrap();
        assert!(snap.trim_id.starts_with("cessna_172r_V"));
        assert_eq!(snap.f.len(), 19);
        assert_eq!(snap.f[0].len(), 19);
        assert_eq!(snap.h.len(), 3);
        assert_eq!(snap.observability.singular_values.len(), 19);
        assert_eq!(snap.observability.eigen_vectors.len(), 19);
        assert_eq!(snap.observability.weakest_direction.len(), 19);
        assert!(snap.observability.rank <= 19);
        assert_approx_eq!(snap.consistency.bounds.nees95, 7.81);
        assert!(snap.consistency.nis > 0.0);
    }

    #[test]
    fn snapshot_json_uses_contract_names() {
        let engine = flown_engine(0.5);
        let json = ValidationEngine::default().snapshot(&engine).unwrap().to_json().unwrap();
        for key in [
            "\"trimId\"",
            "\"F\"",
            "\"H\"",
            "\"singularValues\"",
            "\"weakestDirection\"",
            "\"eigenVectors\"",
            "\"nees95\"",
            "\"nis95\"",
            "\"isConsistent\"",
            "\"measurement\"",
        ] {
            assert!(json.contains(key), "missing {key}");
        }
    }

    #[test]
    fn monte_carlo_is_reproducible_and_parallel_safe() {
        let engine = flown_engine(0.5);
        let validator = ValidationEngine::default();
        let serial = MonteCarloConfig {
            parallel: false,
            ..Default::default()
        };
        let a = validator.monte_carlo(&engine, &serial).unwrap();
        let b = validator.monte_carlo(&engine, &MonteCarloConfig::default()).unwrap();
        assert_eq!(a.runs.len(), 5);
        assert_eq!(a, b);
        assert!(a.mean_nees.is_finite() && a.mean_nees > 0.0);
        assert!(a.mean_nis.is_finite() && a.mean_nis > 0.0);
        assert_eq!(a.runs[3].seed, 45);
    }

    #[test]
    fn gps_noise_carries_cross_axis_correlation() {
        let r = DMatrix::from_row_slice(3, 3, &[4.0, 1.5, 0.0, 1.5, 2.0, 0.3, 0.0, 0.3, 1.0]);
        let noise = CorrelatedNoise::new(&r).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let draws = 20_000;
        let mut sum = DMatrix::zeros(3, 3);
        for _ in 0..draws {
            let e = noise.sample(&mut rng);
            sum += &e * e.transpose();
        }
        let empirical = sum / draws as f64;
        assert!((empirical - &r).amax() < 0.15);

        let nan = DMatrix::from_element(3, 3, f64::NAN);
        assert!(CorrelatedNoise::new(&nan).is_err());
    }

    #[test]
    fn monte_carlo_rejects_empty_runs() {
        let engine = flown_engine(0.1);
        let config = MonteCarloConfig {
            runs: 0,
            ..Default::default()
        };
        assert!(ValidationEngine::default().monte_carlo(&engine, &config).is_err());
    }

    #[test]
    fn envelope_accepts_cruise() {
        let state = TruthState::from_rigid_body(&RigidBodyState::level(60.0, 1000.0));
        let report = check_envelope(&state, &EnvelopeLimits::default());
        assert!(report.is_valid);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn envelope_flags_violations() {
        let state = TruthState::from_rigid_body(&RigidBodyState {
            phi: 70f64.to_radians(),
            ..RigidBodyState::level(40.0, 50.0)
        });
        let report = check_envelope(&state, &EnvelopeLimits::default());
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.warnings.len(), 1);

        let bad = TruthState::from_rigid_body(&RigidBodyState {
            u: f64::NAN,
            ..Default::default()
        });
        assert!(!check_envelope(&bad, &EnvelopeLimits::default()).is_valid);
    }
}
