//! Monte Carlo localization of an ultra-wideband tag
//!
//! This crate estimates the 3D position of a mobile tag inside a building from noisy, intermittently
//! available two-way-ranging distances to a small set of fixed anchors. The estimator is a particle
//! filter: a fixed-size population of weighted pose hypotheses is reweighted against every observation,
//! resampled in proportion to its weights, and moved forward with a noisy kinematic model. Each cycle
//! yields a best-estimate position and a boolean confidence flag that signals when the population has
//! converged onto a tight cluster.
//!
//! The transport layer (serial framing, MQTT) and any rendering of the population are external
//! collaborators. The crate only consumes already-parsed observations, either directly as an
//! [`Observation`] or decoded from the device's JSON tag report ([`messages::TagReport`]).
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): positions and the error vector of the likelihood.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): seedable random
//!   sources injected into every stochastic component, for repeatable runs.
//! - [`serde`](https://crates.io/crates/serde): configuration files (JSON, YAML, TOML), tag reports and CSV results.
//!
//! ## Crate overview
//!
//! - [world]: Anchor set, feasible bounding volume, optional occupancy map and the distance
//!   function.
//! - [particle]: Particle record, weight normalization, weighted distribution pick and resampling.
//! - [measurements]: Observations, validation against the world and the Gaussian observation model.
//! - [motion]: Kinematic motion model with speed, heading and pitch noise, and the speed estimator.
//! - [estimate]: Weighted centroid and confidence flag.
//! - [filter]: The cycle driver ([`MonteCarloLocalizer`]).
//! - [messages]: Tag report payload, latest-value-wins mailbox and population snapshots.
//! - [config]: Startup configuration and its file formats.
//! - [error]: Error types.
//! - [sim]: Simulated tag, report replay and CSV results.
//!
//! ## Cycle
//!
//! ```text
//! Observation -> weights -> estimate -> resample -> move -> next cycle
//! ```
//!
//! A particle's weight is the zero-mean diagonal Gaussian evaluated at the error between the observed
//! ranges and the ranges the particle would measure, restricted to the anchors present in the observation:
//!
//! $$
//! w = \exp\left(-\frac{1}{2\sigma^2} \sum_{i \in A} (d_i - \hat{d}_i)^2\right)
//! $$
//!
//! By default the kernel is divided by its value at zero error so that a perfect match weighs 1
//! whatever the number of anchors (see [`measurements::GaussianNormalization`]).
//!
//! ## Example
//!
//! ```
//! use uwb_mcl::config::{AnchorConfig, LocalizerConfig};
//! use uwb_mcl::filter::{MonteCarloLocalizer, MotionStep};
//! use uwb_mcl::measurements::Observation;
//!
//! let config = LocalizerConfig {
//!     num_particles: 500,
//!     anchors: vec![
//!         AnchorConfig::new("A0", 0.0, 0.0, 0.0),
//!         AnchorConfig::new("A1", 1000.0, 0.0, 0.0),
//!         AnchorConfig::new("A2", 1000.0, 1000.0, 0.0),
//!     ],
//!     ..LocalizerConfig::default()
//! };
//! let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
//! let observation = Observation::from_distances([("A0", 707.0), ("A2", 707.0)]);
//! let report = localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
//! assert_eq!(localizer.particles().len(), 500);
//! assert!(report.estimate.is_some());
//! ```

pub mod config;
pub mod error;
pub mod estimate;
pub mod filter;
pub mod measurements;
pub mod messages;
pub mod motion;
pub mod particle;
pub mod sim;
pub mod world;

/// Cartesian position in world units.
pub type Position = nalgebra::Vector3<f64>;

pub use config::LocalizerConfig;
pub use error::{ConfigError, LocalizationError, ReportError};
pub use estimate::Estimate;
pub use filter::{CycleReport, MonteCarloLocalizer, MotionStep};
pub use measurements::Observation;
pub use particle::Particle;
pub use world::{Anchor, OccupancyGrid, World};
