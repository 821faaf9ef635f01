//! Range observations and the likelihood model used to weight particles.
//!
//! An [`Observation`] is the set of anchor ranges reported by the tag in one cycle. Anchors
//! the tag did not range to are simply absent: they are never treated as a zero distance.
//!
//! The [`ObservationModel`] compares the observation with the ranges a particle *would* have
//! measured from its own position. The comparison is restricted to the anchors present in
//! both readings, and the error vector over that intersection is scored by a zero-mean
//! multivariate Gaussian with diagonal covariance $\sigma^2 I$:
//!
//! $$
//! p(e) = (2 \pi \sigma^2)^{-d/2} \exp\left( -\frac{\lVert e \rVert^2}{2 \sigma^2} \right)
//! $$
//!
//! With [`GaussianNormalization::PeakNormalized`] the density is divided by $p(0)$ so a
//! perfect match scores exactly 1 regardless of how many anchors were seen.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use nalgebra::DVector;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Position;
use crate::error::ConfigError;
use crate::particle::Particle;
use crate::world::{AnchorId, World};

/// One anchor's entry in an observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorRange {
    /// Measured two-way-ranging distance, in world units.
    pub distance: f64,
    /// Device reported quality factor (0-100). Passed through, not used by the likelihood.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    /// Anchor position as reported alongside the range, if the transport provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_position: Option<Position>,
}
impl AnchorRange {
    pub fn new(distance: f64) -> AnchorRange {
        AnchorRange {
            distance,
            quality: None,
            anchor_position: None,
        }
    }
}

/// Ranges reported in one cycle, keyed by anchor identifier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub ranges: BTreeMap<AnchorId, AnchorRange>,
    /// Position solution reported by the tag itself, if any. Only used for display and
    /// speed estimation, never by the likelihood.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_position: Option<Position>,
}

impl Observation {
    pub fn new() -> Observation {
        Observation::default()
    }

    /// Build an observation from bare `(anchor, distance)` pairs.
    pub fn from_distances<I, S>(distances: I) -> Observation
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<AnchorId>,
    {
        Observation {
            ranges: distances
                .into_iter()
                .map(|(id, d)| (id.into(), AnchorRange::new(d)))
                .collect(),
            reference_position: None,
        }
    }

    pub fn insert(&mut self, anchor: impl Into<AnchorId>, range: AnchorRange) {
        self.ranges.insert(anchor.into(), range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn distance(&self, anchor: &str) -> Option<f64> {
        self.ranges.get(anchor).map(|r| r.distance)
    }

    pub fn anchor_ids(&self) -> impl Iterator<Item = &AnchorId> {
        self.ranges.keys()
    }

    /// Drop readings that cannot be trusted against the world model.
    ///
    /// A reading is rejected when its anchor is unknown, its distance is negative or not
    /// finite, or (when `position_tolerance` is set) the anchor position it reports differs
    /// from the configured one by more than the tolerance.
    ///
    /// # Returns
    /// The filtered observation and the list of rejected readings.
    pub fn validated(
        &self,
        world: &World,
        position_tolerance: Option<f64>,
    ) -> (Observation, Vec<RejectedReading>) {
        let mut accepted = Observation {
            ranges: BTreeMap::new(),
            reference_position: self.reference_position,
        };
        let mut rejected = Vec::new();
        for (id, range) in &self.ranges {
            let reason = match world.anchor(id) {
                None => Some(RejectionReason::UnknownAnchor),
                Some(_) if !(range.distance.is_finite() && range.distance >= 0.0) => {
                    Some(RejectionReason::InvalidDistance(range.distance))
                }
                Some(anchor) => match (position_tolerance, range.anchor_position) {
                    (Some(tolerance), Some(reported)) => {
                        let offset = (reported - anchor.position).norm();
                        (offset.is_nan() || offset > tolerance)
                            .then_some(RejectionReason::PositionMismatch(offset))
                    }
                    _ => None,
                },
            };
            match reason {
                Some(reason) => rejected.push(RejectedReading {
                    anchor: id.clone(),
                    reason,
                }),
                None => {
                    accepted.ranges.insert(id.clone(), range.clone());
                }
            }
        }
        (accepted, rejected)
    }
}

/// Why a reading was dropped by [`Observation::validated`].
#[derive(Clone, Debug, PartialEq)]
pub enum RejectionReason {
    UnknownAnchor,
    InvalidDistance(f64),
    /// Offset between reported and configured anchor position.
    PositionMismatch(f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RejectedReading {
    pub anchor: AnchorId,
    pub reason: RejectionReason,
}
impl Display for RejectedReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            RejectionReason::UnknownAnchor => {
                write!(f, "anchor '{}' is not part of the world model", self.anchor)
            }
            RejectionReason::InvalidDistance(d) => {
                write!(f, "anchor '{}' reported invalid distance {}", self.anchor, d)
            }
            RejectionReason::PositionMismatch(offset) => write!(
                f,
                "anchor '{}' reported a position {:.2} units away from its configured position",
                self.anchor, offset
            ),
        }
    }
}

/// Scaling convention of the Gaussian kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum GaussianNormalization {
    /// Density divided by the density at the zero error vector. A perfect match weighs 1.
    #[default]
    PeakNormalized,
    /// Raw multivariate normal density. Scale depends on the number of anchors compared.
    Density,
}

/// Zero-mean diagonal Gaussian likelihood over anchor range errors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObservationModel {
    sigma: f64,
    normalization: GaussianNormalization,
}

impl ObservationModel {
    /// # Errors
    /// [`ConfigError::NonPositiveSigma`] when `sigma` is not strictly positive and finite.
    pub fn new(sigma: f64, normalization: GaussianNormalization) -> Result<Self, ConfigError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(ConfigError::NonPositiveSigma(sigma));
        }
        Ok(ObservationModel {
            sigma,
            normalization,
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn normalization(&self) -> GaussianNormalization {
        self.normalization
    }

    /// Ranges a tag at `position` would measure to the anchors present in `observation`.
    ///
    /// Anchors unknown to the world are skipped, so the result never contains more anchors
    /// than the observation.
    pub fn expected_ranges(
        &self,
        world: &World,
        position: &Position,
        observation: &Observation,
    ) -> BTreeMap<AnchorId, f64> {
        observation
            .anchor_ids()
            .filter_map(|id| {
                world
                    .anchor(id)
                    .map(|a| (id.clone(), world.distance(position, &a.position)))
            })
            .collect()
    }

    /// Gaussian score of the error between an observation and a hypothetical reading.
    ///
    /// # Returns
    /// `None` when the two readings share no anchor, `Some(weight)` otherwise.
    pub fn likelihood(
        &self,
        observed: &Observation,
        expected: &BTreeMap<AnchorId, f64>,
    ) -> Option<f64> {
        let errors: Vec<f64> = observed
            .ranges
            .iter()
            .filter_map(|(id, range)| expected.get(id).map(|e| range.distance - e))
            .collect();
        if errors.is_empty() {
            return None;
        }
        let error = DVector::from_vec(errors);
        let variance = self.sigma * self.sigma;
        let exponent = -0.5 * error.norm_squared() / variance;
        let log_weight = match self.normalization {
            GaussianNormalization::PeakNormalized => exponent,
            GaussianNormalization::Density => {
                let dimension = error.len() as f64;
                exponent - 0.5 * dimension * (2.0 * std::f64::consts::PI * variance).ln()
            }
        };
        Some(log_weight.exp())
    }

    /// Weight of one particle for this cycle.
    ///
    /// # Returns
    /// * `Some(0.0)` when the particle lies outside the world bounds.
    /// * `None` when no anchor of the observation can be compared; the caller keeps the
    ///   previous weight.
    /// * `Some(weight)` otherwise.
    pub fn particle_weight(
        &self,
        world: &World,
        particle: &Particle,
        observation: &Observation,
    ) -> Option<f64> {
        if !world.is_free(&particle.position) {
            return Some(0.0);
        }
        let expected = self.expected_ranges(world, &particle.position, observation);
        self.likelihood(observation, &expected)
    }

    /// New weights for the whole population. Pure: identical inputs give identical weights.
    pub fn weigh(
        &self,
        world: &World,
        particles: &[Particle],
        observation: &Observation,
    ) -> Vec<f64> {
        particles
            .iter()
            .map(|p| {
                self.particle_weight(world, p, observation)
                    .unwrap_or(p.weight)
            })
            .collect()
    }
}

/// Imperfections of a range sensor, selected per role.
///
/// Filter particles read ranges through [`SensorNoiseProfile::EXACT`]; a simulated reference
/// tag uses a noisy, possibly lossy profile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorNoiseProfile {
    /// Half-width of the symmetric uniform noise added to each range.
    pub range_noise: f64,
    /// Probability that an anchor is missing from a reading.
    pub dropout_probability: f64,
}
impl Default for SensorNoiseProfile {
    fn default() -> Self {
        SensorNoiseProfile::EXACT
    }
}
impl SensorNoiseProfile {
    pub const EXACT: SensorNoiseProfile = SensorNoiseProfile {
        range_noise: 0.0,
        dropout_probability: 0.0,
    };
}

/// Read ranges from `position` to every anchor of the world through a sensor profile.
///
/// Noisy ranges are clamped at zero. Dropped anchors are absent from the result.
pub fn read_ranges<R: Rng + ?Sized>(
    world: &World,
    position: &Position,
    profile: &SensorNoiseProfile,
    rng: &mut R,
) -> Observation {
    let mut observation = Observation::new();
    for anchor in world.anchors() {
        if profile.dropout_probability > 0.0 && rng.random::<f64>() < profile.dropout_probability
        {
            continue;
        }
        let mut distance = world.distance(position, &anchor.position);
        if profile.range_noise > 0.0 {
            distance += rng.random_range(-profile.range_noise..=profile.range_noise);
        }
        observation.insert(
            anchor.id.clone(),
            AnchorRange {
                distance: distance.max(0.0),
                quality: None,
                anchor_position: Some(anchor.position),
            },
        );
    }
    observation
}
