//! Best-estimate extraction from a weighted population.
//!
//! The estimate is a centroid of the particle positions plus a convergence flag: the belief is
//! considered confident when more than a configured proportion of *all* particles lies within
//! a distance threshold of the centroid.

use serde::{Deserialize, Serialize};

use crate::Position;
use crate::particle::{Particle, effective_sample_size};
use crate::world::World;

/// How the centroid is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AveragingStrategy {
    /// Σ(position·weight) / Σ(weight).
    #[default]
    WeightedAverage,
    /// Plain mean of particles with positive weight.
    UnweightedAverage,
    /// Position of the single heaviest particle.
    HighestWeight,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    pub distance_threshold: f64,
    /// Fraction of the population that must lie within the threshold.
    pub confidence_proportion: f64,
    pub averaging: AveragingStrategy,
}
impl Default for EstimateConfig {
    fn default() -> Self {
        EstimateConfig {
            distance_threshold: 25.0,
            confidence_proportion: 0.95,
            averaging: AveragingStrategy::WeightedAverage,
        }
    }
}

/// Position estimate for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub position: Position,
    pub confidence: bool,
    /// Fraction of the population within the distance threshold of `position`.
    pub clustered_fraction: f64,
    pub effective_sample_size: f64,
}

/// Compute the centroid and confidence flag.
///
/// # Returns
/// `None` when the weights sum to zero (or the population is empty): there is no estimate,
/// rather than a fabricated position.
pub fn compute_estimate(
    world: &World,
    particles: &[Particle],
    config: &EstimateConfig,
) -> Option<Estimate> {
    let total_weight: f64 = particles.iter().map(|p| p.weight).sum();
    if !(total_weight > 0.0 && total_weight.is_finite()) {
        return None;
    }

    let position = match config.averaging {
        AveragingStrategy::WeightedAverage => {
            particles
                .iter()
                .fold(Position::zeros(), |acc, p| acc + p.position * p.weight)
                / total_weight
        }
        AveragingStrategy::UnweightedAverage => {
            let (sum, count) = particles
                .iter()
                .filter(|p| p.weight > 0.0)
                .fold((Position::zeros(), 0usize), |(acc, n), p| (acc + p.position, n + 1));
            sum / count as f64
        }
        AveragingStrategy::HighestWeight => {
            particles
                .iter()
                .max_by(|a, b| a.weight.total_cmp(&b.weight))?
                .position
        }
    };

    let clustered = particles
        .iter()
        .filter(|p| world.distance(&p.position, &position) < config.distance_threshold)
        .count();
    let clustered_fraction = clustered as f64 / particles.len() as f64;
    let weights: Vec<f64> = particles.iter().map(|p| p.weight).collect();

    Some(Estimate {
        position,
        confidence: clustered_fraction > config.confidence_proportion,
        clustered_fraction,
        effective_sample_size: effective_sample_size(&weights),
    })
}
