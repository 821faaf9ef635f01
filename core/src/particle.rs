//! Particle population and weighted resampling.
//!
//! A particle is one weighted hypothesis of the tag pose: a position, a horizontal heading and
//! an optional pitch. The population size is fixed for the lifetime of the filter. Nothing in
//! this module mutates a population in place; resampling returns a fresh vector which the
//! cycle driver assigns.
use std::fmt::{self, Display};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Position;
use crate::motion::MotionModel;
use crate::world::World;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub position: Position,
    /// Horizontal heading in degrees, wrapped to [0, 360). 0 points along +y.
    pub heading: f64,
    /// Pitch in degrees, [-90, 90].
    pub pitch: f64,
    pub weight: f64,
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.position.x)
            .field("y", &self.position.y)
            .field("z", &self.position.z)
            .field("heading", &self.heading)
            .field("pitch", &self.pitch)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(position: Position, heading: f64, pitch: f64, weight: f64) -> Particle {
        Particle {
            position,
            heading: wrap_heading(heading),
            pitch: pitch.clamp(-90.0, 90.0),
            weight,
        }
    }

    /// Particle at a uniformly random free position with a uniformly random heading.
    pub fn random<R: Rng + ?Sized>(world: &World, weight: f64, rng: &mut R) -> Particle {
        let position = world.random_free_position(rng);
        let heading = rng.random_range(0.0..360.0);
        Particle::new(position, heading, 0.0, weight)
    }

    /// Copy with a different weight.
    pub fn with_weight(self, weight: f64) -> Particle {
        Particle { weight, ..self }
    }
}

/// Wrap a heading in degrees into [0, 360).
pub fn wrap_heading(heading: f64) -> f64 {
    let wrapped = heading.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Uniformly distributed initial population.
pub fn random_population<R: Rng + ?Sized>(world: &World, count: usize, rng: &mut R) -> Vec<Particle> {
    let weight = 1.0 / count.max(1) as f64;
    (0..count)
        .map(|_| Particle::random(world, weight, rng))
        .collect()
}

/// Weights scaled to sum to one.
///
/// # Returns
/// `None` when the population is degenerate: the weights sum to zero or to a non-finite value.
pub fn normalized_weights(weights: &[f64]) -> Option<Vec<f64>> {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        Some(weights.iter().map(|w| w / sum).collect())
    } else {
        None
    }
}

/// Effective sample size `1 / Σ w²` of normalized weights, or 0 for a degenerate population.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    match normalized_weights(weights) {
        Some(normalized) => {
            let sum_of_squares: f64 = normalized.iter().map(|w| w * w).sum();
            if sum_of_squares > 0.0 {
                1.0 / sum_of_squares
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}

/// Cumulative distribution over the strictly positive weights, for repeated weighted picks.
///
/// Particles with zero weight are left out of the pool. The cumulative sums of non-negative
/// weights are non-decreasing, so a pick is a binary search.
#[derive(Clone, Debug)]
pub struct WeightedDistribution {
    /// Index into the original weight slice for each pool entry.
    indices: Vec<usize>,
    cumulative: Vec<f64>,
}

impl WeightedDistribution {
    pub fn new(weights: &[f64]) -> WeightedDistribution {
        let mut indices = Vec::with_capacity(weights.len());
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut accum = 0.0;
        for (i, &w) in weights.iter().enumerate() {
            if w > 0.0 && w.is_finite() {
                accum += w;
                indices.push(i);
                cumulative.push(accum);
            }
        }
        WeightedDistribution {
            indices,
            cumulative,
        }
    }

    /// Number of particles in the picking pool.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Draw one index of the original weight slice, proportionally to its weight.
    ///
    /// # Returns
    /// `None` iff the pool is empty, i.e. every particle is improbable.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        let total = self.total();
        if self.is_empty() || total <= 0.0 {
            return None;
        }
        let u = rng.random_range(0.0..=total);
        let slot = self
            .cumulative
            .partition_point(|&c| c < u)
            .min(self.cumulative.len() - 1);
        Some(self.indices[slot])
    }
}

/// How the new population is drawn from the weighted one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ResamplingStrategy {
    /// N independent weighted picks.
    #[default]
    Multinomial,
    /// `floor(N·w)` deterministic copies, remainder picked from the residual weights.
    Residual,
}

/// Result of one resampling pass.
#[derive(Clone, Debug)]
pub struct Resampled {
    pub particles: Vec<Particle>,
    /// Survivors drawn from the weighted population.
    pub picked: usize,
    /// Particles regenerated uniformly because nothing could be picked.
    pub regenerated: usize,
}

/// Draw a new population of the same size.
///
/// Every survivor is a noisy copy of its pick (see [`MotionModel::jitter`]), taking
/// `heading_hint` as its heading when one is given. When the pool is empty every draw is
/// replaced by a fresh particle at a uniformly random free position. All weights of the new
/// population are `1/N`.
pub fn resample<R: Rng + ?Sized>(
    particles: &[Particle],
    strategy: ResamplingStrategy,
    world: &World,
    motion: &MotionModel,
    heading_hint: Option<f64>,
    rng: &mut R,
) -> Resampled {
    let n = particles.len();
    let uniform = 1.0 / n.max(1) as f64;
    let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();
    let distribution = WeightedDistribution::new(&weights);

    let mut new_particles = Vec::with_capacity(n);
    let mut picked = 0;
    let mut regenerated = 0;

    let mut draws = n;
    if strategy == ResamplingStrategy::Residual && !distribution.is_empty() {
        let total = distribution.total();
        let mut residual = vec![0.0; n];
        for (i, &w) in weights.iter().enumerate() {
            if !(w > 0.0 && w.is_finite()) {
                continue;
            }
            let scaled = w / total * n as f64;
            let copies = scaled.floor() as usize;
            residual[i] = scaled - copies as f64;
            for _ in 0..copies.min(n - new_particles.len()) {
                new_particles.push(motion.jitter(&particles[i], heading_hint, rng).with_weight(uniform));
                picked += 1;
            }
        }
        draws = n - new_particles.len();
        let residual_distribution = WeightedDistribution::new(&residual);
        let source = if residual_distribution.is_empty() {
            &distribution
        } else {
            &residual_distribution
        };
        for _ in 0..draws {
            if let Some(i) = source.pick(rng) {
                new_particles.push(motion.jitter(&particles[i], heading_hint, rng).with_weight(uniform));
                picked += 1;
            }
        }
        draws = 0;
    }

    for _ in 0..draws {
        match distribution.pick(rng) {
            Some(i) => {
                new_particles.push(motion.jitter(&particles[i], heading_hint, rng).with_weight(uniform));
                picked += 1;
            }
            None => {
                new_particles.push(Particle::random(world, uniform, rng));
                regenerated += 1;
            }
        }
    }

    Resampled {
        particles: new_particles,
        picked,
        regenerated,
    }
}
