//! Kinematic motion model.
//!
//! A particle (or the reference tag) moves at `speed` along its heading and pitch for `dt`:
//!
//! $$
//! \Delta x = v \cos\theta \sin\psi \, \Delta t, \quad
//! \Delta y = v \cos\theta \cos\psi \, \Delta t, \quad
//! \Delta z = v \sin\theta \, \Delta t
//! $$
//!
//! where $\psi$ is the heading (0° along +y, 90° along +x) and $\theta$ the pitch. When noise is
//! requested the effective speed, heading and pitch are perturbed for this step only; the
//! particle keeps its own heading.

use std::collections::VecDeque;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::Position;
use crate::error::ConfigError;
use crate::particle::{Particle, wrap_heading};
use crate::world::World;

/// Shape of the additive noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum NoiseDistribution {
    /// Symmetric uniform on `[-level, level]`.
    #[default]
    Uniform,
    /// Zero-mean normal with standard deviation `level`.
    Gaussian,
}

/// Noise amplitudes of the motion model, in world units and degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionNoise {
    /// Horizontal position noise applied to resampled copies.
    pub position: f64,
    /// Vertical position noise applied to resampled copies.
    pub vertical: f64,
    pub speed: f64,
    pub heading: f64,
    pub pitch: f64,
    pub distribution: NoiseDistribution,
}
impl Default for MotionNoise {
    fn default() -> Self {
        MotionNoise {
            position: 5.0,
            vertical: 5.0,
            speed: 0.5,
            heading: 10.0,
            pitch: 10.0,
            distribution: NoiseDistribution::Uniform,
        }
    }
}
impl MotionNoise {
    /// All amplitudes zero.
    pub fn none() -> MotionNoise {
        MotionNoise {
            position: 0.0,
            vertical: 0.0,
            speed: 0.0,
            heading: 0.0,
            pitch: 0.0,
            distribution: NoiseDistribution::Uniform,
        }
    }

    /// # Errors
    /// [`ConfigError::NegativeNoise`] naming the first negative or non-finite amplitude.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, level) in [
            ("position", self.position),
            ("vertical", self.vertical),
            ("speed", self.speed),
            ("heading", self.heading),
            ("pitch", self.pitch),
        ] {
            if !(level.is_finite() && level >= 0.0) {
                return Err(ConfigError::NegativeNoise(name, level));
            }
        }
        Ok(())
    }
}

/// Add noise of the given amplitude to `value`. Zero amplitude returns `value` unchanged.
fn perturb<R: Rng + ?Sized>(value: f64, level: f64, distribution: NoiseDistribution, rng: &mut R) -> f64 {
    if level <= 0.0 {
        return value;
    }
    match distribution {
        NoiseDistribution::Uniform => value + rng.random_range(-level..=level),
        NoiseDistribution::Gaussian => match Normal::new(0.0, level) {
            Ok(normal) => value + normal.sample(rng),
            Err(_) => value,
        },
    }
}

/// Maximum heading retries when a bounded move keeps leaving the world.
pub const MAX_BOUNCE_ATTEMPTS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionModel {
    noise: MotionNoise,
    /// When false every particle keeps a pitch of 0 and pitch noise is ignored.
    pitch_enabled: bool,
}

impl MotionModel {
    pub fn new(noise: MotionNoise, pitch_enabled: bool) -> MotionModel {
        MotionModel {
            noise,
            pitch_enabled,
        }
    }

    pub fn noise(&self) -> &MotionNoise {
        &self.noise
    }

    pub fn pitch_enabled(&self) -> bool {
        self.pitch_enabled
    }

    fn noisy_pitch<R: Rng + ?Sized>(&self, pitch: f64, rng: &mut R) -> f64 {
        if self.pitch_enabled {
            perturb(pitch, self.noise.pitch, self.noise.distribution, rng).clamp(-90.0, 90.0)
        } else {
            0.0
        }
    }

    /// Displacement for one step at the given speed, heading and pitch (degrees).
    pub fn displacement(speed: f64, heading: f64, pitch: f64, dt: f64) -> Position {
        let (heading_r, pitch_r) = (heading.to_radians(), pitch.to_radians());
        let horizontal = speed * pitch_r.cos() * dt;
        Position::new(
            heading_r.sin() * horizontal,
            heading_r.cos() * horizontal,
            pitch_r.sin() * speed * dt,
        )
    }

    /// Move a particle by `speed` for `dt`.
    ///
    /// With `noisy` the speed, heading and pitch used for this step are perturbed. The returned
    /// particle keeps the original heading, pitch and weight; it may lie outside the world.
    pub fn advance<R: Rng + ?Sized>(
        &self,
        particle: &Particle,
        speed: f64,
        dt: f64,
        noisy: bool,
        rng: &mut R,
    ) -> Particle {
        let (speed, heading, pitch) = if noisy {
            (
                perturb(speed, self.noise.speed, self.noise.distribution, rng),
                wrap_heading(perturb(particle.heading, self.noise.heading, self.noise.distribution, rng)),
                self.noisy_pitch(particle.pitch, rng),
            )
        } else {
            let pitch = if self.pitch_enabled { particle.pitch } else { 0.0 };
            (speed, particle.heading, pitch)
        };
        Particle {
            position: particle.position + Self::displacement(speed, heading, pitch, dt),
            ..*particle
        }
    }

    /// Noisy move that stays inside the world.
    ///
    /// When the destination is not free a new random heading is chosen and the step retried,
    /// up to [`MAX_BOUNCE_ATTEMPTS`] times; the particle stays in place if every attempt fails.
    /// Used for the simulated reference tag, never for filter particles.
    pub fn advance_within<R: Rng + ?Sized>(
        &self,
        world: &World,
        particle: &Particle,
        speed: f64,
        dt: f64,
        rng: &mut R,
    ) -> Particle {
        let mut current = *particle;
        for _ in 0..MAX_BOUNCE_ATTEMPTS {
            let moved = self.advance(&current, speed, dt, true, rng);
            if world.is_free(&moved.position) {
                return moved;
            }
            current.heading = rng.random_range(0.0..360.0);
        }
        current
    }

    /// Noisy copy of a resampled particle.
    ///
    /// Position, heading and (if enabled) pitch are perturbed so that repeated resampling does
    /// not collapse the population onto a single point. `heading_hint` replaces the heading
    /// before perturbation when the true heading is known.
    pub fn jitter<R: Rng + ?Sized>(
        &self,
        particle: &Particle,
        heading_hint: Option<f64>,
        rng: &mut R,
    ) -> Particle {
        let d = self.noise.distribution;
        let position = Position::new(
            perturb(particle.position.x, self.noise.position, d, rng),
            perturb(particle.position.y, self.noise.position, d, rng),
            perturb(particle.position.z, self.noise.vertical, d, rng),
        );
        let heading = perturb(heading_hint.unwrap_or(particle.heading), self.noise.heading, d, rng);
        let pitch = self.noisy_pitch(particle.pitch, rng);
        Particle::new(position, heading, pitch, particle.weight)
    }
}

/// Moving-window speed estimate from successive reference positions.
///
/// Each new timestamped position yields a horizontal differential speed; the estimate is the
/// mean over the last `capacity` samples.
#[derive(Clone, Debug)]
pub struct SpeedEstimator {
    window: VecDeque<f64>,
    capacity: usize,
    last: Option<(Position, f64)>,
}
impl Default for SpeedEstimator {
    fn default() -> Self {
        SpeedEstimator::new(10)
    }
}
impl SpeedEstimator {
    pub fn new(capacity: usize) -> SpeedEstimator {
        let capacity = capacity.max(1);
        SpeedEstimator {
            window: VecDeque::with_capacity(capacity),
            capacity,
            last: None,
        }
    }

    /// Record a reference position observed at `time_s` seconds.
    ///
    /// # Returns
    /// The differential speed against the previous sample, if the time step is positive.
    pub fn record(&mut self, position: Position, time_s: f64) -> Option<f64> {
        let previous = self.last.replace((position, time_s));
        let (prev_position, prev_time) = previous?;
        let dt = time_s - prev_time;
        if !(dt > 0.0) {
            return None;
        }
        let displacement =
            ((position.x - prev_position.x).powi(2) + (position.y - prev_position.y).powi(2)).sqrt();
        let speed = displacement / dt;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(speed);
        Some(speed)
    }

    /// Mean of the window, 0 before any speed sample.
    pub fn speed(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }
}
