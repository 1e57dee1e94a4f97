//! Aircraft parameter model and the built-in airframe database.
//!
//! An [`AircraftConfig`] is loaded once per session and never mutated. It bundles the
//! mass properties, wing geometry, linear stability derivatives, propulsion limit, and
//! control-surface deflection limits consumed by [`crate::aerodynamics`] and
//! [`crate::dynamics`]. Configurations round-trip through JSON, YAML, and TOML so that
//! custom airframes can be supplied from disk.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// Identifier of the default airframe.
pub const DEFAULT_AIRCRAFT_ID: &str = "cessna_172r";
/// Sea-level ISA air density (kg/m³).
pub const SEA_LEVEL_DENSITY: f64 = 1.225;

fn default_density() -> f64 {
    SEA_LEVEL_DENSITY
}

/// Open-loop static stability classification of an airframe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityMode {
    #[default]
    Stable,
    Relaxed,
    Unstable,
}

/// Mass and inertia (kg, kg·m²). `ixz` is the product of inertia in the symmetry plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MassProperties {
    pub mass: f64,
    pub ixx: f64,
    pub iyy: f64,
    pub izz: f64,
    #[serde(default)]
    pub ixz: f64,
}

impl MassProperties {
    /// Body-axis inertia tensor with the usual sign convention on the cross term.
    pub fn inertia_tensor(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.ixx, 0.0, -self.ixz, 0.0, self.iyy, 0.0, -self.ixz, 0.0, self.izz,
        )
    }
}

/// Reference geometry (m², m, m).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub wing_area: f64,
    pub wing_span: f64,
    pub mean_chord: f64,
}

/// Lift coefficients. Slopes are per radian, `c_l_q` multiplies q·c/(2V).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiftCoefficients {
    pub c_l_0: f64,
    pub c_l_alpha: f64,
    pub c_l_q: f64,
    pub c_l_deltae: f64,
}

/// Parabolic drag polar CD = CD0 + k·CL².
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DragCoefficients {
    pub c_d_0: f64,
    pub k: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchCoefficients {
    pub c_m_0: f64,
    pub c_m_alpha: f64,
    pub c_m_q: f64,
    pub c_m_deltae: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SideForceCoefficients {
    pub c_y_beta: f64,
    pub c_y_deltar: f64,
}

/// Rolling moment coefficients. `c_l_p` multiplies p·b/(2V).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollCoefficients {
    pub c_l_beta: f64,
    pub c_l_p: f64,
    pub c_l_deltaa: f64,
}

/// Yawing moment coefficients. `c_n_r` multiplies r·b/(2V).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct YawCoefficients {
    pub c_n_beta: f64,
    pub c_n_r: f64,
    pub c_n_deltar: f64,
}

/// Complete linear stability-derivative set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AeroCoefficients {
    pub lift: LiftCoefficients,
    pub drag: DragCoefficients,
    pub pitch: PitchCoefficients,
    pub side_force: SideForceCoefficients,
    pub roll: RollCoefficients,
    pub yaw: YawCoefficients,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Propulsion {
    /// Thrust at full throttle along body x (N).
    pub max_thrust: f64,
}

/// Physical deflection at a normalized command of ±1 (radians).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub elevator_max_rad: f64,
    pub aileron_max_rad: f64,
    pub rudder_max_rad: f64,
}

impl Default for ControlLimits {
    fn default() -> Self {
        ControlLimits {
            elevator_max_rad: 25.0_f64.to_radians(),
            aileron_max_rad: 20.0_f64.to_radians(),
            rudder_max_rad: 30.0_f64.to_radians(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub notes: String,
}

/// Immutable per-airframe parameter record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AircraftConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stability_mode: StabilityMode,
    pub mass: MassProperties,
    pub geometry: Geometry,
    pub aero: AeroCoefficients,
    pub propulsion: Propulsion,
    #[serde(default)]
    pub limits: ControlLimits,
    #[serde(default = "default_density")]
    pub air_density: f64,
    #[serde(default)]
    pub metadata: AircraftMetadata,
}

impl Default for AircraftConfig {
    fn default() -> Self {
        cessna_172r()
    }
}

/// Backend-shaped summary returned by [`select`]: `{geometry, inertia, aero, metadata}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AircraftSummary {
    pub id: String,
    pub name: String,
    pub geometry: Geometry,
    pub inertia: MassProperties,
    pub aero: AeroCoefficients,
    pub metadata: AircraftMetadata,
}

impl AircraftConfig {
    /// Reject parameter sets that would make the equations of motion meaningless.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("mass", self.mass.mass),
            ("ixx", self.mass.ixx),
            ("iyy", self.mass.iyy),
            ("izz", self.mass.izz),
            ("wing_area", self.geometry.wing_area),
            ("wing_span", self.geometry.wing_span),
            ("mean_chord", self.geometry.mean_chord),
            ("air_density", self.air_density),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(SimError::InvalidParameter(format!(
                    "{}: {name} must be positive, got {value}",
                    self.id
                )));
            }
        }
        if self.propulsion.max_thrust < 0.0 {
            return Err(SimError::InvalidParameter(format!(
                "{}: max_thrust must be non-negative",
                self.id
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> AircraftSummary {
        AircraftSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            geometry: self.geometry,
            inertia: self.mass,
            aero: self.aero,
            metadata: self.metadata.clone(),
        }
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension()),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension()),
        }
    }
}

pub(crate) fn extension_of(p: &Path) -> Option<String> {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

pub(crate) fn unsupported_extension() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "unsupported file extension")
}

// ============= Built-in airframes ===============================================================

/// Cessna 172R nominal dataset (statically stable trainer).
pub fn cessna_172r() -> AircraftConfig {
    AircraftConfig {
        id: DEFAULT_AIRCRAFT_ID.to_string(),
        name: "Cessna 172R".to_string(),
        stability_mode: StabilityMode::Stable,
        mass: MassProperties {
            mass: 1111.0,
            ixx: 1285.0,
            iyy: 1824.0,
            izz: 2666.0,
            ixz: 0.0,
        },
        geometry: Geometry {
            wing_area: 16.2,
            wing_span: 11.0,
            mean_chord: 1.49,
        },
        aero: AeroCoefficients {
            lift: LiftCoefficients {
                c_l_0: 0.25,
                c_l_alpha: 5.7,
                c_l_q: 8.5,
                c_l_deltae: 0.4,
            },
            drag: DragCoefficients {
                c_d_0: 0.027,
                k: 0.053,
            },
            pitch: PitchCoefficients {
                c_m_0: 0.02,
                c_m_alpha: -3.8,
                c_m_q: -8.5,
                c_m_deltae: -1.2,
            },
            side_force: SideForceCoefficients {
                c_y_beta: -0.98,
                c_y_deltar: -0.06,
            },
            roll: RollCoefficients {
                c_l_beta: -0.12,
                c_l_p: -0.5,
                c_l_deltaa: 0.08,
            },
            yaw: YawCoefficients {
                c_n_beta: 0.15,
                c_n_r: -0.2,
                c_n_deltar: -0.06,
            },
        },
        propulsion: Propulsion { max_thrust: 2400.0 },
        limits: ControlLimits::default(),
        air_density: SEA_LEVEL_DENSITY,
        metadata: AircraftMetadata {
            source: "Academic nominal dataset".to_string(),
            notes: "Stable trainer reference".to_string(),
        },
    }
}

/// The Cessna 172R airframe with the centre of gravity moved aft of the neutral point
/// (positive pitch stiffness). Used to exercise the unstable-mode classification path.
pub fn cessna_172r_relaxed() -> AircraftConfig {
    let mut config = cessna_172r();
    config.id = "cessna_172r_relaxed".to_string();
    config.name = "Cessna 172R (aft CG)".to_string();
    config.stability_mode = StabilityMode::Relaxed;
    config.aero.pitch.c_m_alpha = 1.0;
    config.metadata.notes = "Relaxed static stability variant".to_string();
    config
}

/// Ids of every airframe in the built-in database, sorted.
pub fn list_ids() -> Vec<String> {
    let mut ids: Vec<String> = database().into_iter().map(|c| c.id).collect();
    ids.sort();
    ids
}

/// Look up a built-in airframe by id.
pub fn by_id(id: &str) -> Result<AircraftConfig> {
    database()
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| SimError::UnknownAircraft(id.to_string()))
}

/// Backend `select(aircraft_id)` contract.
pub fn select(id: &str) -> Result<AircraftSummary> {
    by_id(id).map(|c| c.summary())
}

fn database() -> Vec<AircraftConfig> {
    vec![cessna_172r(), cessna_172r_relaxed()]
}
