//! Monte Carlo localization cycle driver.
//!
//! [`MonteCarloLocalizer`] owns the particle population, the world model and a seeded random
//! source, and glues the components together. One cycle is
//!
//! 1. weight update against the cycle's observation (skipped when there is none),
//! 2. estimate extraction,
//! 3. resampling into a fresh population of the same size,
//! 4. a noisy motion step. Particles it carries out of the free space lose their weight at
//!    once, so a following cycle without observation never draws from them.
//!
//! Each step is also exposed on its own so that callers can drive the filter manually. The
//! driver is synchronous; observations arrive through a [`Mailbox`] when the transport runs on
//! another thread (see [`MonteCarloLocalizer::run_fixed_rate`]).

use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::LocalizerConfig;
use crate::error::LocalizationError;
use crate::estimate::{Estimate, EstimateConfig, compute_estimate};
use crate::measurements::{Observation, ObservationModel, RejectedReading};
use crate::messages::{Mailbox, PopulationSnapshot};
use crate::motion::MotionModel;
use crate::particle::{Particle, ResamplingStrategy, random_population, resample};
use crate::world::World;

/// Motion applied to the population at the end of a cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionStep {
    pub speed: f64,
    pub dt: f64,
    /// Known heading of the tag (degrees), inherited by resampled particles.
    pub heading_hint: Option<f64>,
}
impl MotionStep {
    pub fn new(speed: f64, dt: f64) -> MotionStep {
        MotionStep {
            speed,
            dt,
            heading_hint: None,
        }
    }
    pub fn stationary(dt: f64) -> MotionStep {
        MotionStep::new(0.0, dt)
    }
    pub fn with_heading(self, heading: f64) -> MotionStep {
        MotionStep {
            heading_hint: Some(heading),
            ..self
        }
    }
}

/// Outcome of a weight update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WeightUpdate {
    /// Anchors used by the likelihood.
    pub observed_anchors: usize,
    pub rejected: Vec<RejectedReading>,
    /// False when the update was skipped and prior weights retained.
    pub applied: bool,
}

/// Summary of one full cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// `None` when the population carried no weight.
    pub estimate: Option<Estimate>,
    pub observed_anchors: usize,
    pub rejected: Vec<RejectedReading>,
    pub picked: usize,
    pub regenerated: usize,
}

pub struct MonteCarloLocalizer {
    world: World,
    observation_model: ObservationModel,
    motion: MotionModel,
    resampling: ResamplingStrategy,
    estimate_config: EstimateConfig,
    position_tolerance: Option<f64>,
    cycle_period_s: f64,
    particles: Vec<Particle>,
    rng: StdRng,
    cycle: u64,
    snapshots: Option<Mailbox<PopulationSnapshot>>,
}

impl MonteCarloLocalizer {
    /// Validate the configuration and seed a uniform population.
    ///
    /// # Errors
    /// [`LocalizationError::Config`] when any configuration invariant is violated.
    pub fn new(config: &LocalizerConfig) -> Result<MonteCarloLocalizer, LocalizationError> {
        config.validate()?;
        let world = config.build_world()?;
        let observation_model = config.build_observation_model()?;
        let motion = config.build_motion_model()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let particles = random_population(&world, config.num_particles, &mut rng);
        info!(
            "Initialized localizer: {} particles, {} anchors, {:?} distances, bounds {:?}..{:?}",
            particles.len(),
            world.anchors().len(),
            world.distance_mode(),
            world.bounds().min.as_slice(),
            world.bounds().max.as_slice(),
        );
        info!(
            "Observation sigma {} ({:?}), pitch tracking {}, occupancy map {}",
            observation_model.sigma(),
            observation_model.normalization(),
            if motion.pitch_enabled() { "on" } else { "off" },
            world
                .occupancy()
                .map_or("none".to_string(), |g| format!("{:?} cells", g.dimensions())),
        );
        Ok(MonteCarloLocalizer {
            world,
            observation_model,
            motion,
            resampling: config.resampling,
            estimate_config: config.estimate,
            position_tolerance: config.observation.anchor_position_tolerance,
            cycle_period_s: config.cycle_period_s,
            particles,
            rng,
            cycle: 0,
            snapshots: None,
        })
    }

    /// Post a [`PopulationSnapshot`] to `mailbox` after every cycle.
    pub fn publish_snapshots(&mut self, mailbox: Mailbox<PopulationSnapshot>) {
        self.snapshots = Some(mailbox);
    }

    pub fn world(&self) -> &World {
        &self.world
    }
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }
    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }
    pub fn cycle_period_s(&self) -> f64 {
        self.cycle_period_s
    }

    /// Reweight the population against `observation`.
    ///
    /// Readings that fail validation against the world are dropped and logged. When no usable
    /// reading remains the prior weights are kept.
    pub fn update(&mut self, observation: &Observation) -> WeightUpdate {
        let (accepted, rejected) = observation.validated(&self.world, self.position_tolerance);
        for reading in &rejected {
            warn!("Dropping reading: {}", reading);
        }
        if accepted.is_empty() {
            debug!("No usable ranges this cycle, keeping prior weights");
            return WeightUpdate {
                observed_anchors: 0,
                rejected,
                applied: false,
            };
        }

        let weights = self
            .observation_model
            .weigh(&self.world, &self.particles, &accepted);
        self.particles = self
            .particles
            .iter()
            .zip(weights)
            .map(|(p, w)| p.with_weight(w))
            .collect();

        let (min, max) = self
            .particles
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), p| (lo.min(p.weight), hi.max(p.weight)));
        debug!(
            "Weighted {} particles against {} anchors: weight range [{:.3e}, {:.3e}]",
            self.particles.len(),
            accepted.len(),
            min,
            max
        );
        if max <= 0.0 {
            warn!("Every particle is improbable, population will be regenerated");
        }
        WeightUpdate {
            observed_anchors: accepted.len(),
            rejected,
            applied: true,
        }
    }

    pub fn estimate(&self) -> Option<Estimate> {
        compute_estimate(&self.world, &self.particles, &self.estimate_config)
    }

    /// Replace the population by a resampled one.
    ///
    /// # Returns
    /// `(picked, regenerated)` counts.
    pub fn resample(&mut self, heading_hint: Option<f64>) -> (usize, usize) {
        let resampled = resample(
            &self.particles,
            self.resampling,
            &self.world,
            &self.motion,
            heading_hint,
            &mut self.rng,
        );
        if resampled.regenerated > 0 {
            warn!(
                "Regenerated {} of {} particles from the world model",
                resampled.regenerated,
                resampled.particles.len()
            );
        }
        self.particles = resampled.particles;
        (resampled.picked, resampled.regenerated)
    }

    /// Advance every particle with a noisy motion step.
    ///
    /// Particles that end outside the free space keep their new position but get weight 0.
    ///
    /// # Returns
    /// The number of particles pruned this way.
    pub fn predict(&mut self, speed: f64, dt: f64) -> usize {
        let motion = &self.motion;
        let world = &self.world;
        let rng = &mut self.rng;
        let mut pruned = 0;
        self.particles = self
            .particles
            .iter()
            .map(|p| {
                let moved = motion.advance(p, speed, dt, true, rng);
                if world.is_free(&moved.position) {
                    moved
                } else {
                    pruned += 1;
                    moved.with_weight(0.0)
                }
            })
            .collect();
        if pruned > 0 {
            debug!(
                "Motion step left {} of {} particles outside the free space",
                pruned,
                self.particles.len()
            );
        }
        pruned
    }

    /// Run one full cycle. `None` stands for a cycle without any observation.
    pub fn cycle(&mut self, observation: Option<&Observation>, step: MotionStep) -> CycleReport {
        self.cycle += 1;
        let update = match observation {
            Some(observation) => self.update(observation),
            None => {
                debug!("Cycle {}: no observation", self.cycle);
                WeightUpdate::default()
            }
        };
        let estimate = self.estimate();
        match &estimate {
            Some(e) => debug!(
                "Cycle {}: estimate ({:.1}, {:.1}, {:.1}) confident={} clustered={:.3} ess={:.1}",
                self.cycle,
                e.position.x,
                e.position.y,
                e.position.z,
                e.confidence,
                e.clustered_fraction,
                e.effective_sample_size
            ),
            None => debug!("Cycle {}: no estimate available", self.cycle),
        }

        let (picked, regenerated) = self.resample(step.heading_hint);
        self.predict(step.speed, step.dt);

        if let Some(mailbox) = &self.snapshots {
            mailbox.post(self.snapshot_with(estimate));
        }

        CycleReport {
            cycle: self.cycle,
            estimate,
            observed_anchors: update.observed_anchors,
            rejected: update.rejected,
            picked,
            regenerated,
        }
    }

    fn snapshot_with(&self, estimate: Option<Estimate>) -> PopulationSnapshot {
        PopulationSnapshot {
            cycle: self.cycle,
            particles: self.particles.clone(),
            estimate,
        }
    }

    /// Fixed-rate loop fed by a mailbox.
    ///
    /// Every `cycle_period_s` the latest observation is taken (if any), `speed_source` is asked
    /// for the tag speed and a cycle is run. The loop stops when `sink` returns
    /// [`ControlFlow::Break`].
    ///
    /// # Returns
    /// The number of cycles run.
    pub fn run_fixed_rate<S, F>(
        &mut self,
        observations: &Mailbox<Observation>,
        mut speed_source: S,
        mut sink: F,
    ) -> u64
    where
        S: FnMut(Option<&Observation>) -> f64,
        F: FnMut(&CycleReport) -> ControlFlow<()>,
    {
        let period = Duration::from_secs_f64(self.cycle_period_s);
        let mut deadline = Instant::now();
        let mut cycles = 0;
        info!("Starting fixed-rate loop, period {:?}", period);
        loop {
            let observation = observations.take_latest();
            let speed = speed_source(observation.as_ref());
            let report = self.cycle(
                observation.as_ref(),
                MotionStep::new(speed, self.cycle_period_s),
            );
            cycles += 1;
            if sink(&report).is_break() {
                info!("Fixed-rate loop stopped after {} cycles", cycles);
                return cycles;
            }

            deadline += period;
            let now = Instant::now();
            match deadline.checked_duration_since(now) {
                Some(wait) => thread::sleep(wait),
                None => {
                    debug!("Cycle {} overran its period", self.cycle);
                    deadline = now;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnchorConfig;
    use crate::error::ConfigError;
    use crate::Position;
    use crate::measurements::{AnchorRange, RejectionReason};

    fn config() -> LocalizerConfig {
        LocalizerConfig {
            num_particles: 300,
            seed: 3,
            anchors: vec![
                AnchorConfig::new("A0", 0.0, 0.0, 0.0),
                AnchorConfig::new("A1", 1000.0, 0.0, 0.0),
                AnchorConfig::new("A2", 1000.0, 1000.0, 0.0),
                AnchorConfig::new("A3", 0.0, 1000.0, 0.0),
            ],
            ..LocalizerConfig::default()
        }
    }

    #[test]
    fn invalid_configuration_fails_fast() {
        let cfg = LocalizerConfig {
            num_particles: 0,
            ..config()
        };
        assert!(matches!(
            MonteCarloLocalizer::new(&cfg),
            Err(LocalizationError::Config(ConfigError::NoParticles))
        ));
        let cfg = LocalizerConfig {
            anchors: vec![],
            ..config()
        };
        assert!(matches!(
            MonteCarloLocalizer::new(&cfg),
            Err(LocalizationError::Config(ConfigError::NoAnchors))
        ));
    }

    #[test]
    fn initial_population_is_uniform_and_in_bounds() {
        let localizer = MonteCarloLocalizer::new(&config()).unwrap();
        assert_eq!(localizer.particles().len(), 300);
        for p in localizer.particles() {
            assert!(localizer.world().is_in_bounds(&p.position));
            assert!((p.weight - 1.0 / 300.0).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_observation_keeps_prior_weights() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let before: Vec<f64> = localizer.particles().iter().map(|p| p.weight).collect();
        let update = localizer.update(&Observation::new());
        assert!(!update.applied);
        let after: Vec<f64> = localizer.particles().iter().map(|p| p.weight).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn unknown_anchors_are_rejected_not_used() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let observation = Observation::from_distances([("A0", 700.0), ("ZZ", 10.0)]);
        let update = localizer.update(&observation);
        assert!(update.applied);
        assert_eq!(update.observed_anchors, 1);
        assert_eq!(update.rejected.len(), 1);
        assert_eq!(update.rejected[0].reason, RejectionReason::UnknownAnchor);
    }

    #[test]
    fn misplaced_anchor_is_rejected_with_default_tolerance() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let mut observation = Observation::new();
        observation.insert(
            "A1",
            AnchorRange {
                distance: 700.0,
                quality: None,
                anchor_position: Some(Position::new(1000.0, 0.0, 0.0)),
            },
        );
        // reported in metres against a centimetre layout
        observation.insert(
            "A2",
            AnchorRange {
                distance: 700.0,
                quality: None,
                anchor_position: Some(Position::new(10.0, 10.0, 0.0)),
            },
        );
        let update = localizer.update(&observation);
        assert!(update.applied);
        assert_eq!(update.observed_anchors, 1);
        assert_eq!(update.rejected.len(), 1);
        assert_eq!(update.rejected[0].anchor, "A2");
        assert!(matches!(
            update.rejected[0].reason,
            RejectionReason::PositionMismatch(offset) if offset > 1000.0
        ));
    }

    #[test]
    fn particles_leaving_the_world_lose_their_weight() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let mut pruned = 0;
        for _ in 0..10 {
            pruned += localizer.predict(50.0, 1.0);
            for p in localizer.particles() {
                if !localizer.world().is_free(&p.position) {
                    assert_eq!(p.weight, 0.0);
                }
            }
        }
        assert!(pruned > 0);
    }

    #[test]
    fn only_unknown_anchors_skip_update() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let update = localizer.update(&Observation::from_distances([("ZZ", 10.0)]));
        assert!(!update.applied);
        assert_eq!(update.rejected.len(), 1);
    }

    #[test]
    fn cycles_keep_population_size() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let observation = Observation::from_distances([("A0", 707.1), ("A2", 707.1)]);
        for i in 0..5 {
            let obs = (i % 2 == 0).then_some(&observation);
            let report = localizer.cycle(obs, MotionStep::new(1.0, 1.0));
            assert_eq!(report.cycle, i + 1);
            assert_eq!(report.picked + report.regenerated, 300);
            assert_eq!(localizer.particles().len(), 300);
        }
    }

    #[test]
    fn same_seed_same_trajectory() {
        let observation = Observation::from_distances([("A0", 707.1), ("A1", 707.1), ("A2", 707.1)]);
        let run = || {
            let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
            for _ in 0..3 {
                localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
            }
            localizer.particles().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn snapshots_are_published() {
        let mut localizer = MonteCarloLocalizer::new(&config()).unwrap();
        let snapshots = Mailbox::new();
        localizer.publish_snapshots(snapshots.clone());
        localizer.cycle(None, MotionStep::stationary(1.0));
        localizer.cycle(None, MotionStep::stationary(1.0));
        let snapshot = snapshots.take_latest().unwrap();
        assert_eq!(snapshot.cycle, 2);
        assert_eq!(snapshot.particles.len(), 300);
        assert!(snapshots.take_latest().is_none());
    }

    #[test]
    fn fixed_rate_loop_stops_on_break() {
        let cfg = LocalizerConfig {
            cycle_period_s: 0.001,
            ..config()
        };
        let mut localizer = MonteCarloLocalizer::new(&cfg).unwrap();
        let mailbox = Mailbox::new();
        mailbox.post(Observation::from_distances([("A0", 707.1)]));
        let mut seen = Vec::new();
        let cycles = localizer.run_fixed_rate(
            &mailbox,
            |_| 0.0,
            |report| {
                seen.push(report.observed_anchors);
                if report.cycle >= 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        assert_eq!(cycles, 3);
        // only the first cycle found an observation waiting
        assert_eq!(seen, vec![1, 0, 0]);
    }
}
