//! Time-windowed sensor fault injection.
//!
//! Faults intercept a raw measurement vector before it leaves a sensor model. Each
//! [`FaultConfig`] is active on the closed window `[start_time, start_time + duration]` and
//! targets either a single axis or every axis of the measurement.
//!
//! - `bias_step` adds a constant offset.
//! - `bias_ramp` adds a drift that performs a bounded random walk, `acc += magnitude·dt·U(-1, 1)`.
//! - `freeze` returns the first value observed during the window on each affected axis.
//! - `dropout` suppresses the measurement entirely (`None`), which callers must treat as
//!   "no update this step", not as an error.
//!
//! Bias faults compose additively. Freeze overrides the biases on its axes and dropout
//! overrides everything. The only mutable state (ramp drift and frozen snapshots) lives in a
//! per-sensor [`SensorAccumulator`], created on first activation and dropped by
//! [`FaultInjector::clear_faults`].

use std::collections::HashMap;

use log::{debug, warn};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn default_seed() -> u64 {
    42
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    BiasStep,
    BiasRamp,
    Dropout,
    Freeze,
}

/// One fault on one sensor.
///
/// Serialized as `{"type": "bias_step", "startTime": 5.0, "duration": 10.0, "magnitude": 2.0, "axis": 0}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultConfig {
    #[serde(rename = "type")]
    pub kind: FaultType,
    pub start_time: f64,
    pub duration: f64,
    #[serde(default)]
    pub magnitude: f64,
    /// Affected measurement component. `None` applies to every component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<usize>,
}

impl FaultConfig {
    pub fn bias_step(start_time: f64, duration: f64, magnitude: f64, axis: Option<usize>) -> Self {
        FaultConfig {
            kind: FaultType::BiasStep,
            start_time,
            duration,
            magnitude,
            axis,
        }
    }

    pub fn bias_ramp(start_time: f64, duration: f64, magnitude: f64, axis: Option<usize>) -> Self {
        FaultConfig {
            kind: FaultType::BiasRamp,
            start_time,
            duration,
            magnitude,
            axis,
        }
    }

    pub fn dropout(start_time: f64, duration: f64) -> Self {
        FaultConfig {
            kind: FaultType::Dropout,
            start_time,
            duration,
            magnitude: 0.0,
            axis: None,
        }
    }

    pub fn freeze(start_time: f64, duration: f64, axis: Option<usize>) -> Self {
        FaultConfig {
            kind: FaultType::Freeze,
            start_time,
            duration,
            magnitude: 0.0,
            axis,
        }
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// Inclusive window test.
    pub fn is_active(&self, t: f64) -> bool {
        t >= self.start_time && t <= self.end_time()
    }

    fn axes(&self, dim: usize) -> Vec<usize> {
        match self.axis {
            Some(axis) if axis < dim => vec![axis],
            Some(axis) => {
                warn!("Fault axis {axis} out of range for {dim}-dimensional measurement");
                Vec::new()
            }
            None => (0..dim).collect(),
        }
    }
}

/// A fault bound to a sensor id, the form used in scenario files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFault {
    pub sensor_id: String,
    pub fault: FaultConfig,
}

/// Mutable per-sensor fault state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorAccumulator {
    /// Accumulated ramp drift per axis.
    pub ramp: HashMap<usize, f64>,
    /// Snapshot captured at freeze onset per axis.
    pub frozen: HashMap<usize, f64>,
    /// Time of the previous call to [`FaultInjector::apply`] for this sensor.
    pub last_time: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct FaultInjector {
    faults: HashMap<String, Vec<FaultConfig>>,
    accumulators: HashMap<String, SensorAccumulator>,
    rng: StdRng,
}

impl Default for FaultInjector {
    fn default() -> Self {
        FaultInjector::new(default_seed())
    }
}

impl FaultInjector {
    pub fn new(seed: u64) -> Self {
        FaultInjector {
            faults: HashMap::new(),
            accumulators: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn add_fault(&mut self, sensor_id: &str, fault: FaultConfig) {
        debug!("Adding {:?} fault to '{sensor_id}'", fault.kind);
        self.faults
            .entry(sensor_id.to_string())
            .or_default()
            .push(fault);
    }

    /// Replace every fault on a sensor.
    pub fn set_faults(&mut self, sensor_id: &str, faults: Vec<FaultConfig>) {
        self.faults.insert(sensor_id.to_string(), faults);
        self.accumulators.remove(sensor_id);
    }

    /// Remove faults and accumulated state for one sensor, or for all sensors when `None`.
    pub fn clear_faults(&mut self, sensor_id: Option<&str>) {
        match sensor_id {
            Some(id) => {
                self.faults.remove(id);
                self.accumulators.remove(id);
            }
            None => {
                self.faults.clear();
                self.accumulators.clear();
            }
        }
    }

    pub fn faults(&self, sensor_id: &str) -> &[FaultConfig] {
        self.faults.get(sensor_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn active_faults(&self, sensor_id: &str, t: f64) -> Vec<&FaultConfig> {
        self.faults(sensor_id)
            .iter()
            .filter(|f| f.is_active(t))
            .collect()
    }

    pub fn has_faults(&self) -> bool {
        self.faults.values().any(|f| !f.is_empty())
    }

    pub fn accumulator(&self, sensor_id: &str) -> Option<&SensorAccumulator> {
        self.accumulators.get(sensor_id)
    }

    /// Pass a raw measurement through the faults of `sensor_id` at time `t`.
    ///
    /// Returns `None` when a dropout is active.
    pub fn apply(&mut self, sensor_id: &str, z: &DVector<f64>, t: f64) -> Option<DVector<f64>> {
        let active: Vec<FaultConfig> = self
            .active_faults(sensor_id, t)
            .into_iter()
            .cloned()
            .collect();

        if active.is_empty() {
            // Leaving every window releases frozen values.
            if let Some(acc) = self.accumulators.get_mut(sensor_id) {
                acc.frozen.clear();
                acc.last_time = Some(t);
            }
            return Some(z.clone());
        }

        let dim = z.len();
        let acc = self.accumulators.entry(sensor_id.to_string()).or_default();
        let dt = acc.last_time.map(|last| (t - last).max(0.0)).unwrap_or(0.0);
        acc.last_time = Some(t);

        if active.iter().any(|f| f.kind == FaultType::Dropout) {
            return None;
        }

        let mut out = z.clone();
        let mut ramped: Vec<usize> = Vec::new();
        let mut frozen_axes: Vec<usize> = Vec::new();
        for fault in &active {
            let axes = fault.axes(dim);
            match fault.kind {
                FaultType::BiasStep => {
                    for &i in &axes {
                        out[i] += fault.magnitude;
                    }
                }
                FaultType::BiasRamp => {
                    for &i in &axes {
                        let step: f64 = self.rng.random_range(-1.0..=1.0);
                        *acc.ramp.entry(i).or_insert(0.0) += fault.magnitude * dt * step;
                        if !ramped.contains(&i) {
                            ramped.push(i);
                        }
                    }
                }
                FaultType::Freeze => frozen_axes.extend(axes),
                FaultType::Dropout => {}
            }
        }
        for i in ramped {
            out[i] += acc.ramp.get(&i).copied().unwrap_or(0.0);
        }

        acc.frozen.retain(|axis, _| frozen_axes.contains(axis));
        for i in frozen_axes {
            let value = *acc.frozen.entry(i).or_insert(z[i]);
            out[i] = value;
        }
        Some(out)
    }
}
