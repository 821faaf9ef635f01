//! Startup configuration of the localizer.
//!
//! Configuration files may be JSON, YAML or TOML; the format is chosen from the file
//! extension. Every field has a default so partial files are accepted.
//!
//! ```
//! use uwb_mcl::config::{AnchorConfig, LocalizerConfig};
//!
//! let cfg = LocalizerConfig {
//!     anchors: vec![
//!         AnchorConfig::new("C584", 16.0, 0.0, 151.0),
//!         AnchorConfig::new("DA36", 40.0, 325.0, 79.0),
//!         AnchorConfig::new("9234", 291.0, 285.0, 55.0),
//!         AnchorConfig::new("8287", 270.0, 0.0, 134.0),
//!     ],
//!     ..LocalizerConfig::default()
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::estimate::EstimateConfig;
use crate::measurements::{GaussianNormalization, ObservationModel};
use crate::motion::{MotionModel, MotionNoise};
use crate::particle::ResamplingStrategy;
use crate::world::{Anchor, DistanceMode, OccupancyGrid, World};

/// Longest accepted fixed-rate cycle period, in seconds.
pub const MAX_CYCLE_PERIOD_S: f64 = 3600.0;

fn default_num_particles() -> usize {
    2000
}
fn default_seed() -> u64 {
    42
}
fn default_cycle_period_s() -> f64 {
    1.0
}
fn default_sigma() -> f64 {
    15.0
}
fn default_z_range() -> Option<[f64; 2]> {
    Some([30.0, 150.0])
}
fn default_anchor_position_tolerance() -> Option<f64> {
    Some(10.0)
}

/// Anchor entry of the configuration file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    pub id: String,
    /// `[x, y, z]` in world units.
    pub position: [f64; 3],
}
impl AnchorConfig {
    pub fn new(id: impl Into<String>, x: f64, y: f64, z: f64) -> AnchorConfig {
        AnchorConfig {
            id: id.into(),
            position: [x, y, z],
        }
    }
}
impl From<&AnchorConfig> for Anchor {
    fn from(cfg: &AnchorConfig) -> Self {
        Anchor::new(cfg.id.clone(), cfg.position[0], cfg.position[1], cfg.position[2])
    }
}

/// Text occupancy map over the world bounds.
///
/// ```toml
/// [world.occupancy]
/// cell_size = 50.0
/// rows = ["..##", "....", "...."]
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OccupancyConfig {
    /// Side of a square cell, in world units.
    pub cell_size: f64,
    /// One string per row, top (largest y) first. `.` is free, `#` is blocked.
    pub rows: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// `[min, max]` height range of the tag. Anchor heights are used when absent.
    pub z_range: Option<[f64; 2]>,
    pub distance_mode: DistanceMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<OccupancyConfig>,
}
impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            z_range: default_z_range(),
            distance_mode: DistanceMode::Spatial,
            occupancy: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Expected ranging noise standard deviation, in world units.
    pub sigma: f64,
    pub normalization: GaussianNormalization,
    /// Maximum accepted offset between the anchor position reported with a range and the
    /// configured one, in world units. `null` disables the check.
    pub anchor_position_tolerance: Option<f64>,
}
impl Default for ObservationConfig {
    fn default() -> Self {
        ObservationConfig {
            sigma: default_sigma(),
            normalization: GaussianNormalization::PeakNormalized,
            anchor_position_tolerance: default_anchor_position_tolerance(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Track pitch (3D heading). Particles stay level when false.
    pub pitch_enabled: bool,
    pub noise: MotionNoise,
}
impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            pitch_enabled: false,
            noise: MotionNoise::default(),
        }
    }
}

/// Complete localizer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizerConfig {
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    /// Seed of the filter's random source, for repeatable runs.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Period of the fixed-rate cycle loop, in seconds.
    #[serde(default = "default_cycle_period_s")]
    pub cycle_period_s: f64,
    #[serde(default)]
    pub resampling: ResamplingStrategy,
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub observation: ObservationConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub estimate: EstimateConfig,
    #[serde(default)]
    pub anchors: Vec<AnchorConfig>,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        LocalizerConfig {
            num_particles: default_num_particles(),
            seed: default_seed(),
            cycle_period_s: default_cycle_period_s(),
            resampling: ResamplingStrategy::default(),
            world: WorldConfig::default(),
            observation: ObservationConfig::default(),
            motion: MotionConfig::default(),
            estimate: EstimateConfig::default(),
            anchors: Vec::new(),
        }
    }
}

impl LocalizerConfig {
    /// Template with the four-anchor room layout (centimetres) used in the deployment.
    pub fn template() -> LocalizerConfig {
        LocalizerConfig {
            anchors: vec![
                AnchorConfig::new("C584", 16.0, 0.0, 151.0),
                AnchorConfig::new("DA36", 40.0, 325.0, 79.0),
                AnchorConfig::new("9234", 291.0, 285.0, 55.0),
                AnchorConfig::new("8287", 270.0, 0.0, 134.0),
            ],
            ..LocalizerConfig::default()
        }
    }

    /// Check every invariant the filter relies on.
    ///
    /// # Errors
    /// The first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_particles == 0 {
            return Err(ConfigError::NoParticles);
        }
        self.build_observation_model()?;
        self.build_world()?;
        self.motion.noise.validate()?;
        let threshold = self.estimate.distance_threshold;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        let proportion = self.estimate.confidence_proportion;
        if !(proportion > 0.0 && proportion <= 1.0) {
            return Err(ConfigError::InvalidProportion(proportion));
        }
        if let Some(tolerance) = self.observation.anchor_position_tolerance
            && !(tolerance >= 0.0)
        {
            return Err(ConfigError::InvalidTolerance(tolerance));
        }
        if !(self.cycle_period_s > 0.0 && self.cycle_period_s <= MAX_CYCLE_PERIOD_S) {
            return Err(ConfigError::InvalidCyclePeriod(self.cycle_period_s));
        }
        Ok(())
    }

    pub fn build_world(&self) -> Result<World, ConfigError> {
        let world = World::new(
            self.anchors.iter().map(Anchor::from).collect(),
            self.world.z_range.map(|[lo, hi]| (lo, hi)),
            self.world.distance_mode,
        )?;
        match &self.world.occupancy {
            Some(map) => {
                world.with_occupancy(OccupancyGrid::from_rows(map.cell_size, map.rows.as_slice())?)
            }
            None => Ok(world),
        }
    }

    pub fn build_observation_model(&self) -> Result<ObservationModel, ConfigError> {
        ObservationModel::new(self.observation.sigma, self.observation.normalization)
    }

    pub fn build_motion_model(&self) -> Result<MotionModel, ConfigError> {
        self.motion.noise.validate()?;
        Ok(MotionModel::new(self.motion.noise, self.motion.pitch_enabled))
    }

    /// Render the configuration in `format`.
    pub fn serialize_as(&self, format: ConfigFormat) -> io::Result<String> {
        match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(io::Error::other),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(io::Error::other),
            ConfigFormat::Toml => toml::to_string(self).map_err(io::Error::other),
        }
    }

    /// Parse a configuration written in `format`. Missing fields take their defaults.
    ///
    /// # Errors
    /// [`io::ErrorKind::InvalidData`] when the text does not parse.
    pub fn parse_as(text: &str, format: ConfigFormat) -> io::Result<LocalizerConfig> {
        match format {
            ConfigFormat::Json => serde_json::from_str(text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            ConfigFormat::Yaml => serde_yaml::from_str(text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            ConfigFormat::Toml => {
                toml::from_str(text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }

    /// Write the configuration, in the format named by the file extension.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let text = self.serialize_as(ConfigFormat::from_path(path)?)?;
        fs::write(path, text)
    }

    /// Read a configuration file, in the format named by its extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<LocalizerConfig> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        LocalizerConfig::parse_as(&fs::read_to_string(path)?, format)
    }
}

/// On-disk encoding of a [`LocalizerConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Format named by the extension of `path`: `json`, `yaml` or `yml`, `toml` (any case).
    ///
    /// # Errors
    /// [`io::ErrorKind::InvalidInput`] for any other extension.
    pub fn from_path(path: &Path) -> io::Result<ConfigFormat> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported configuration file '{}'", path.display()),
            )),
        }
    }
}
