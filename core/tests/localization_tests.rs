//! End-to-end behaviour of the localizer on the square four-anchor layout.
use std::ops::ControlFlow;
use std::thread;

use assert_approx_eq::assert_approx_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use uwb_mcl::config::{AnchorConfig, LocalizerConfig, OccupancyConfig};
use uwb_mcl::estimate::Estimate;
use uwb_mcl::filter::{MonteCarloLocalizer, MotionStep};
use uwb_mcl::measurements::{GaussianNormalization, Observation, ObservationModel};
use uwb_mcl::messages::{Mailbox, PopulationSnapshot};
use uwb_mcl::motion::{MotionModel, MotionNoise};
use uwb_mcl::particle::{
    Particle, ResamplingStrategy, WeightedDistribution, normalized_weights, random_population,
    resample,
};
use uwb_mcl::world::{Bounds, DistanceMode, World};
use uwb_mcl::Position;

const TAG: [f64; 3] = [500.0, 500.0, 0.0];

fn square_config(num_particles: usize) -> LocalizerConfig {
    let mut config = LocalizerConfig {
        num_particles,
        anchors: vec![
            AnchorConfig::new("A0", 0.0, 0.0, 0.0),
            AnchorConfig::new("A1", 1000.0, 0.0, 0.0),
            AnchorConfig::new("A2", 1000.0, 1000.0, 0.0),
            AnchorConfig::new("A3", 0.0, 1000.0, 0.0),
        ],
        ..LocalizerConfig::default()
    };
    config.observation.sigma = 15.0;
    config.world.z_range = Some([0.0, 0.0]);
    config.motion.noise.vertical = 0.0;
    config
}

fn exact_observation(world: &World, tag: &Position) -> Observation {
    Observation::from_distances(world.distances_to_all_anchors(tag))
}

#[test]
fn converges_on_stationary_tag() {
    let config = square_config(2000);
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let tag = Position::from(TAG);
    let observation = exact_observation(localizer.world(), &tag);

    let mut last = None;
    for _ in 0..50 {
        last = Some(localizer.cycle(Some(&observation), MotionStep::stationary(1.0)));
    }
    let estimate = last.unwrap().estimate.unwrap();
    let error = (estimate.position - tag).norm();
    assert!(error < 25.0, "estimate {:?} is {} away", estimate.position, error);
    assert!(estimate.confidence, "clustered fraction {}", estimate.clustered_fraction);
}

#[test]
fn converges_with_residual_resampling() {
    let mut config = square_config(2000);
    config.resampling = ResamplingStrategy::Residual;
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let tag = Position::new(300.0, 700.0, 0.0);
    let observation = exact_observation(localizer.world(), &tag);

    let mut last = None;
    for _ in 0..50 {
        last = Some(localizer.cycle(Some(&observation), MotionStep::stationary(1.0)));
    }
    let estimate = last.unwrap().estimate.unwrap();
    assert!((estimate.position - tag).norm() < 25.0);
}

#[test]
fn single_anchor_observation_updates_full_population() {
    let config = square_config(500);
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let observation = Observation::from_distances([("A2", 707.0)]);

    let report = localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
    assert_eq!(report.observed_anchors, 1);
    assert!(report.estimate.is_some());
    assert_eq!(report.picked + report.regenerated, 500);
    assert_eq!(localizer.particles().len(), 500);
}

fn assert_feasible(localizer: &MonteCarloLocalizer, estimate: Option<&Estimate>) {
    let world = localizer.world();
    if let Some(estimate) = estimate {
        let Bounds { min, max } = *world.bounds();
        let p = estimate.position;
        for i in 0..3 {
            assert!(
                p[i] >= min[i] - 1e-6 && p[i] <= max[i] + 1e-6,
                "estimate {:?} outside the world",
                p.as_slice()
            );
        }
    }
    for p in localizer.particles().iter().filter(|p| p.weight > 0.0) {
        assert!(
            world.is_free(&p.position),
            "weighted particle at {:?} outside the world",
            p.position.as_slice()
        );
    }
}

#[test]
fn missing_observation_keeps_filter_running() {
    let config = square_config(300);
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    for i in 0..30 {
        let step = MotionStep::new((i % 3) as f64 * 10.0, 1.0);
        let report = localizer.cycle(Some(&Observation::new()), step);
        assert_eq!(report.observed_anchors, 0);
        assert_eq!(report.picked + report.regenerated, 300);
        assert_feasible(&localizer, report.estimate.as_ref());
    }
    assert_eq!(localizer.particles().len(), 300);
}

#[test]
fn long_dropout_never_reports_positions_outside_the_world() {
    let mut config = square_config(500);
    config.world.z_range = Some([30.0, 150.0]);
    config.motion.noise = MotionNoise::default();
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();

    let walking = (0..100).map(|_| MotionStep::new(20.0, 1.0));
    let standing = (0..100).map(|_| MotionStep::stationary(1.0));
    let mut estimates = 0;
    for step in walking.chain(standing) {
        let report = localizer.cycle(None, step);
        assert_eq!(report.picked + report.regenerated, 500);
        assert_feasible(&localizer, report.estimate.as_ref());
        estimates += usize::from(report.estimate.is_some());
    }
    assert!(estimates > 100, "only {estimates} cycles produced an estimate");

    // ranges coming back after the dropout are weighed as usual
    let observation = exact_observation(localizer.world(), &Position::new(500.0, 500.0, 90.0));
    for _ in 0..10 {
        let report = localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
        assert_eq!(report.observed_anchors, 4);
        assert_feasible(&localizer, report.estimate.as_ref());
    }
}

#[test]
fn blocked_cells_never_hold_weighted_particles() {
    let mut config = square_config(2000);
    config.world.occupancy = Some(OccupancyConfig {
        cell_size: 250.0,
        rows: ["##..", "##..", "##..", "##.."].map(String::from).to_vec(),
    });
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    assert!(localizer.particles().iter().all(|p| p.position.x >= 500.0));

    let tag = Position::new(750.0, 500.0, 0.0);
    let observation = exact_observation(localizer.world(), &tag);
    let mut last = None;
    for i in 0..50 {
        let obs = (i % 4 != 3).then_some(&observation);
        let report = localizer.cycle(obs, MotionStep::stationary(1.0));
        assert_feasible(&localizer, report.estimate.as_ref());
        last = report.estimate;
    }
    assert!((last.unwrap().position - tag).norm() < 25.0);
}

#[test]
fn inconsistent_ranges_regenerate_population() {
    let config = square_config(400);
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let far = 10.0 * localizer.world().bounds().diagonal();
    let observation = Observation::from_distances([("A0", far), ("A1", far), ("A2", far), ("A3", far)]);

    let report = localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
    assert!(report.estimate.is_none());
    assert_eq!(report.picked, 0);
    assert_eq!(report.regenerated, 400);
    assert_eq!(localizer.particles().len(), 400);
    for p in localizer.particles() {
        assert!(p.weight.is_finite() && p.weight > 0.0);
    }

    // consistent data afterwards still converges
    let tag = Position::from(TAG);
    let observation = exact_observation(localizer.world(), &tag);
    let mut last = None;
    for _ in 0..40 {
        last = Some(localizer.cycle(Some(&observation), MotionStep::stationary(1.0)));
    }
    assert!(last.unwrap().estimate.is_some());
}

#[test]
fn particle_leaving_z_range_gets_zero_weight() {
    let mut world_config = square_config(10);
    world_config.world.z_range = Some([0.0, 50.0]);
    let world = world_config.build_world().unwrap();
    let motion = MotionModel::new(MotionNoise::none(), true);
    let mut rng = StdRng::seed_from_u64(11);

    let climbing = Particle::new(Position::new(500.0, 500.0, 40.0), 0.0, 60.0, 1.0);
    let moved = motion.advance(&climbing, 30.0, 1.0, false, &mut rng);
    assert!(moved.position.z > 50.0);
    assert!(!world.is_in_bounds(&moved.position));

    let model = ObservationModel::new(15.0, GaussianNormalization::PeakNormalized).unwrap();
    let observation = exact_observation(&world, &moved.position);
    assert_eq!(model.particle_weight(&world, &moved, &observation), Some(0.0));
    let weights = model.weigh(&world, &[climbing, moved], &observation);
    assert_eq!(weights[1], 0.0);
}

#[test]
fn weighting_is_idempotent() {
    let config = square_config(200);
    let world = config.build_world().unwrap();
    let model = config.build_observation_model().unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let particles = random_population(&world, 200, &mut rng);
    let observation = Observation::from_distances([("A0", 640.0), ("A3", 512.0), ("A2", 801.0)]);

    let first = model.weigh(&world, &particles, &observation);
    let second = model.weigh(&world, &particles, &observation);
    assert_eq!(first, second);
}

#[test]
fn normalized_weights_sum_to_one() {
    let mut rng = StdRng::seed_from_u64(17);
    for n in [1, 2, 10, 1000] {
        let weights: Vec<f64> = (0..n).map(|_| rng.random::<f64>() * 1e-3).collect();
        let normalized = normalized_weights(&weights).unwrap();
        assert_approx_eq!(normalized.iter().sum::<f64>(), 1.0, 1e-9);
        assert!(normalized.iter().all(|w| *w >= 0.0));
    }
    assert!(normalized_weights(&[0.0, 0.0, 0.0]).is_none());
}

#[test]
fn resampling_preserves_population_size() {
    let config = square_config(1);
    let world = config.build_world().unwrap();
    let motion = config.build_motion_model().unwrap();
    let mut rng = StdRng::seed_from_u64(23);
    for strategy in [ResamplingStrategy::Multinomial, ResamplingStrategy::Residual] {
        for n in [1, 2, 3, 17, 256] {
            let mut particles = random_population(&world, n, &mut rng);
            for (i, p) in particles.iter_mut().enumerate() {
                p.weight = (i % 3) as f64;
            }
            let resampled = resample(&particles, strategy, &world, &motion, None, &mut rng);
            assert_eq!(resampled.particles.len(), n);
            assert_eq!(resampled.picked + resampled.regenerated, n);
            for p in &resampled.particles {
                assert_approx_eq!(p.weight, 1.0 / n as f64, 1e-12);
            }
        }
    }
}

#[test]
fn pick_stays_inside_pool() {
    let mut rng = StdRng::seed_from_u64(29);
    let weights = [0.0, 2.0, 0.0, 0.5, 1.5, 0.0];
    let distribution = WeightedDistribution::new(&weights);
    for _ in 0..1000 {
        let index = distribution.pick(&mut rng).unwrap();
        assert!(index < weights.len());
        assert!(weights[index] > 0.0);
    }
    assert!(WeightedDistribution::new(&[0.0; 4]).pick(&mut rng).is_none());
    assert!(WeightedDistribution::new(&[]).pick(&mut rng).is_none());
}

#[test]
fn mailbox_hands_latest_observation_to_driver() {
    let config = LocalizerConfig {
        cycle_period_s: 0.001,
        ..square_config(200)
    };
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let world = localizer.world().clone();
    let mailbox = Mailbox::new();

    let producer = {
        let mailbox = mailbox.clone();
        thread::spawn(move || {
            // The A2 range only appears in the last observation
            mailbox.post(Observation::from_distances([("A0", 700.0)]));
            mailbox.post(exact_observation(&world, &Position::from(TAG)));
        })
    };
    producer.join().unwrap();

    let mut observed = Vec::new();
    localizer.run_fixed_rate(
        &mailbox,
        |_| 0.0,
        |report| {
            observed.push(report.observed_anchors);
            if observed.len() == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        },
    );
    assert_eq!(observed, vec![4, 0]);
}

#[test]
fn snapshots_reach_visualization_thread() {
    let config = square_config(100);
    let mut localizer = MonteCarloLocalizer::new(&config).unwrap();
    let snapshots: Mailbox<PopulationSnapshot> = Mailbox::new();
    localizer.publish_snapshots(snapshots.clone());

    let observation = exact_observation(localizer.world(), &Position::from(TAG));
    for _ in 0..4 {
        localizer.cycle(Some(&observation), MotionStep::stationary(1.0));
    }

    let consumer = thread::spawn(move || snapshots.take_latest());
    let snapshot = consumer.join().unwrap().unwrap();
    assert_eq!(snapshot.cycle, 4);
    assert_eq!(snapshot.particles.len(), 100);
    assert!(snapshot.estimate.is_some());
}

#[test]
fn planar_distances_ignore_height() {
    let mut config = square_config(10);
    config.world.distance_mode = DistanceMode::Planar;
    config.world.z_range = Some([0.0, 100.0]);
    let world = config.build_world().unwrap();
    let a = Position::new(0.0, 0.0, 0.0);
    let b = Position::new(30.0, 40.0, 90.0);
    assert_approx_eq!(world.distance(&a, &b), 50.0, 1e-12);
}
