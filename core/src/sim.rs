//! Offline runs of the localizer.
//!
//! Two sources of observations are supported:
//!
//! * a [`SimulatedTag`] walking through the world and ranging through a noisy
//!   [`SensorNoiseProfile`] ([`run_simulation`]),
//! * a recorded stream of [`TagReport`]s, one JSON object per line ([`replay`]).
//!
//! Both produce one [`LocalizationRecord`] per cycle, which can be written to and read back
//! from CSV.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, info};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::Position;
use crate::config::LocalizerConfig;
use crate::error::LocalizationError;
use crate::filter::{CycleReport, MonteCarloLocalizer, MotionStep};
use crate::measurements::{Observation, SensorNoiseProfile, read_ranges};
use crate::messages::TagReport;
use crate::motion::{MotionModel, MotionNoise, SpeedEstimator};
use crate::particle::Particle;
use crate::world::World;

/// Ground-truth tag for simulation: a pose plus the sensor it ranges with.
#[derive(Clone, Debug)]
pub struct SimulatedTag {
    pub state: Particle,
    pub profile: SensorNoiseProfile,
    motion: MotionModel,
}

impl SimulatedTag {
    pub fn new(state: Particle, profile: SensorNoiseProfile, motion: MotionModel) -> SimulatedTag {
        SimulatedTag {
            state,
            profile,
            motion,
        }
    }

    /// Tag at a random free position with a random heading.
    pub fn random<R: Rng + ?Sized>(
        world: &World,
        profile: SensorNoiseProfile,
        motion: MotionModel,
        rng: &mut R,
    ) -> SimulatedTag {
        SimulatedTag::new(Particle::random(world, 1.0, rng), profile, motion)
    }

    pub fn position(&self) -> Position {
        self.state.position
    }

    /// Walk for `dt`, bouncing off the world boundary.
    pub fn step<R: Rng + ?Sized>(&mut self, world: &World, speed: f64, dt: f64, rng: &mut R) {
        self.state = self.motion.advance_within(world, &self.state, speed, dt, rng);
    }

    /// Range to the anchors through the tag's sensor profile.
    pub fn read<R: Rng + ?Sized>(&self, world: &World, rng: &mut R) -> Observation {
        let mut observation = read_ranges(world, &self.state.position, &self.profile, rng);
        observation.reference_position = Some(self.state.position);
        observation
    }
}

fn default_cycles() -> usize {
    50
}
fn default_tag_seed() -> u64 {
    7
}

/// Parameters of a simulated run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_cycles")]
    pub cycles: usize,
    /// Walking speed of the tag, world units per second.
    #[serde(default)]
    pub speed: f64,
    /// Start position; random when absent.
    #[serde(default)]
    pub start: Option<[f64; 3]>,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub sensor: SensorNoiseProfile,
    /// Motion noise of the tag itself.
    #[serde(default)]
    pub tag_motion: MotionNoise,
    /// Feed the tag's true heading to the resampler.
    #[serde(default)]
    pub heading_hint: bool,
    /// Seed of the tag's random source, independent of the filter's.
    #[serde(default = "default_tag_seed")]
    pub seed: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            cycles: default_cycles(),
            speed: 0.0,
            start: None,
            heading: 0.0,
            sensor: SensorNoiseProfile::EXACT,
            tag_motion: MotionNoise::default(),
            heading_hint: false,
            seed: default_tag_seed(),
        }
    }
}

/// One row of a localization results file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRecord {
    pub cycle: u64,
    pub time_s: f64,
    pub est_x: Option<f64>,
    pub est_y: Option<f64>,
    pub est_z: Option<f64>,
    pub confidence: bool,
    pub clustered_fraction: f64,
    pub effective_sample_size: f64,
    pub observed_anchors: usize,
    pub regenerated: usize,
    pub ref_x: Option<f64>,
    pub ref_y: Option<f64>,
    pub ref_z: Option<f64>,
    /// Distance between estimate and reference, when both exist.
    pub error: Option<f64>,
}

impl LocalizationRecord {
    pub fn from_report(report: &CycleReport, time_s: f64, reference: Option<Position>) -> Self {
        let estimate = report.estimate.as_ref();
        let position = estimate.map(|e| e.position);
        LocalizationRecord {
            cycle: report.cycle,
            time_s,
            est_x: position.map(|p| p.x),
            est_y: position.map(|p| p.y),
            est_z: position.map(|p| p.z),
            confidence: estimate.is_some_and(|e| e.confidence),
            clustered_fraction: estimate.map_or(0.0, |e| e.clustered_fraction),
            effective_sample_size: estimate.map_or(0.0, |e| e.effective_sample_size),
            observed_anchors: report.observed_anchors,
            regenerated: report.regenerated,
            ref_x: reference.map(|p| p.x),
            ref_y: reference.map(|p| p.y),
            ref_z: reference.map(|p| p.z),
            error: position.zip(reference).map(|(p, r)| (p - r).norm()),
        }
    }

    pub fn estimate(&self) -> Option<Position> {
        Some(Position::new(self.est_x?, self.est_y?, self.est_z?))
    }

    /// Read records from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, LocalizationError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Write records to a CSV file with a header row.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<(), LocalizationError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Run the localizer against a simulated tag.
///
/// Each cycle the tag ranges, the filter runs one cycle with the tag's speed and then the tag
/// walks. The cycle period of `config` is the time step.
pub fn run_simulation(
    config: &LocalizerConfig,
    settings: &SimulationSettings,
) -> Result<Vec<LocalizationRecord>, LocalizationError> {
    let mut localizer = MonteCarloLocalizer::new(config)?;
    let world = localizer.world().clone();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let tag_motion = MotionModel::new(settings.tag_motion, config.motion.pitch_enabled);
    let mut tag = match settings.start {
        Some([x, y, z]) => SimulatedTag::new(
            Particle::new(Position::new(x, y, z), settings.heading, 0.0, 1.0),
            settings.sensor,
            tag_motion,
        ),
        None => SimulatedTag::random(&world, settings.sensor, tag_motion, &mut rng),
    };
    info!(
        "Simulating {} cycles, tag starting at {:?}",
        settings.cycles,
        tag.position().as_slice()
    );

    let dt = config.cycle_period_s;
    let mut records = Vec::with_capacity(settings.cycles);
    for i in 0..settings.cycles {
        let observation = tag.read(&world, &mut rng);
        let mut step = MotionStep::new(settings.speed, dt);
        if settings.heading_hint {
            step = step.with_heading(tag.state.heading);
        }
        let report = localizer.cycle(Some(&observation), step);
        records.push(LocalizationRecord::from_report(
            &report,
            i as f64 * dt,
            Some(tag.position()),
        ));
        tag.step(&world, settings.speed, dt, &mut rng);
    }
    Ok(records)
}

fn default_distance_scale() -> f64 {
    100.0
}
fn default_speed_window() -> usize {
    10
}

/// Parameters of a replay run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    /// Factor applied to every reported length (device metres to world centimetres).
    #[serde(default = "default_distance_scale")]
    pub distance_scale: f64,
    /// Window of the speed estimator fed by the device's own position solution.
    #[serde(default = "default_speed_window")]
    pub speed_window: usize,
}
impl Default for ReplaySettings {
    fn default() -> Self {
        ReplaySettings {
            distance_scale: default_distance_scale(),
            speed_window: default_speed_window(),
        }
    }
}

/// Read a JSON-lines file of tag reports. Blank lines are skipped.
pub fn read_reports<P: AsRef<Path>>(path: P) -> Result<Vec<TagReport>, LocalizationError> {
    let reader = BufReader::new(File::open(path)?);
    let mut reports = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        reports.push(TagReport::from_json(&line)?);
    }
    Ok(reports)
}

/// Speed of the tag estimated from the device's own position solution.
#[derive(Clone, Debug)]
pub struct ReportedSpeed {
    estimator: SpeedEstimator,
}
impl ReportedSpeed {
    pub fn new(window: usize) -> ReportedSpeed {
        ReportedSpeed {
            estimator: SpeedEstimator::new(window),
        }
    }

    /// Record the observation's reference position at `time_s` and return the current speed.
    pub fn observe(&mut self, observation: Option<&Observation>, time_s: f64) -> f64 {
        if let Some(position) = observation.and_then(|o| o.reference_position) {
            if let Some(sample) = self.estimator.record(position, time_s) {
                debug!("Differential speed sample {:.2}", sample);
            }
        }
        self.estimator.speed()
    }
}

/// Run the localizer over recorded tag reports, one cycle per report.
pub fn replay(
    config: &LocalizerConfig,
    reports: &[TagReport],
    settings: &ReplaySettings,
) -> Result<Vec<LocalizationRecord>, LocalizationError> {
    let mut localizer = MonteCarloLocalizer::new(config)?;
    let mut speed = ReportedSpeed::new(settings.speed_window);
    let dt = config.cycle_period_s;
    info!("Replaying {} tag reports", reports.len());

    let mut records = Vec::with_capacity(reports.len());
    for (i, report) in reports.iter().enumerate() {
        let time_s = i as f64 * dt;
        let observation = report.to_observation(settings.distance_scale);
        let v = speed.observe(Some(&observation), time_s);
        let cycle = localizer.cycle(Some(&observation), MotionStep::new(v, dt));
        records.push(LocalizationRecord::from_report(
            &cycle,
            time_s,
            observation.reference_position,
        ));
    }
    Ok(records)
}
