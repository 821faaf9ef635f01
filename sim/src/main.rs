//! UWB MCL SIM: Monte Carlo localization of an ultra-wideband tag from the command line.
//!
//! This program can operate in three modes: simulate, replay and config.
//!
//! - Simulate: a simulated tag walks through the anchor layout and ranges through a noisy sensor.
//!   The localizer runs against its readings and every cycle is written to a CSV file.
//!
//! - Replay: recorded tag reports (one JSON object per line, as published by the anchor device)
//!   are fed to the localizer. With `--realtime` the reports are posted from a producer thread
//!   into the hand-off mailbox and the fixed-rate loop consumes them.
//!
//! - Config: write a configuration template (TOML/JSON/YAML).
//!
//! The localizer configuration is read from `--config` when given, otherwise the built-in
//! four-anchor template is used. Command line flags override individual fields.

mod common;

use std::cell::Cell;
use std::error::Error;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use common::{ensure_parent_dir, init_logger, validate_input_file};
use log::{debug, info, warn};
use uwb_mcl::config::LocalizerConfig;
use uwb_mcl::estimate::AveragingStrategy;
use uwb_mcl::measurements::{GaussianNormalization, Observation, SensorNoiseProfile};
use uwb_mcl::messages::Mailbox;
use uwb_mcl::particle::ResamplingStrategy;
use uwb_mcl::sim::{
    LocalizationRecord, ReplaySettings, ReportedSpeed, SimulationSettings, read_reports, replay,
    run_simulation,
};
use uwb_mcl::world::DistanceMode;
use uwb_mcl::{MonteCarloLocalizer, Position};

const LONG_ABOUT: &str =
    "UWB MCL SIM: Monte Carlo localization of an ultra-wideband tag from anchor ranges.

This program can operate in three modes: simulate, replay and config.

- Simulate: a simulated tag walks through the anchor layout and ranges through a noisy,
  possibly lossy sensor. The particle filter runs against its readings.

- Replay: recorded tag reports (JSON lines, as published by the anchor device) are fed to the
  particle filter, either back to back or in real time through the observation mailbox.

- Config: write a configuration template. The format follows the file extension
  (.toml, .json, .yaml/.yml).

Results are written as CSV, one row per filter cycle: estimate, confidence, in-threshold
fraction, effective sample size and, when a reference position is known, the error.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Monte Carlo localization of an ultra-wideband tag.", long_about = LONG_ABOUT)]
struct Cli {
    /// Localizer configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "simulate",
        about = "Localize a simulated tag",
        long_about = "Run the particle filter against a simulated tag. The tag bounces off the boundary of the anchor volume and ranges to every anchor through a sensor with uniform range noise and per-anchor dropout."
    )]
    Simulate(SimulateArgs),
    #[command(
        name = "replay",
        about = "Localize from recorded tag reports",
        long_about = "Run the particle filter over a JSON-lines file of tag reports. Distances are scaled into world units and the device's own position solution, when present, drives the speed estimate and the error column."
    )]
    Replay(ReplayArgs),
    #[command(
        name = "config",
        about = "Write a configuration template",
        long_about = "Write the default four-anchor configuration to a file. The format is chosen from the extension."
    )]
    Config(ConfigArgs),
}

/// Overrides applied on top of the loaded configuration.
#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,

    /// Ranging noise standard deviation of the observation model (world units)
    #[arg(long)]
    sigma: Option<f64>,

    /// Seed of the filter's random source
    #[arg(long)]
    seed: Option<u64>,

    /// Gaussian kernel scaling
    #[arg(long, value_enum)]
    normalization: Option<GaussianNormalization>,

    /// Resampling strategy
    #[arg(long, value_enum)]
    resampling: Option<ResamplingStrategy>,

    /// Centroid computation
    #[arg(long, value_enum)]
    averaging: Option<AveragingStrategy>,

    /// 2D or 3D distances
    #[arg(long, value_enum)]
    distance_mode: Option<DistanceMode>,

    /// Track particle pitch
    #[arg(long)]
    pitch: bool,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Number of cycles
    #[arg(long, default_value_t = 50)]
    cycles: usize,

    /// Tag speed (world units per second)
    #[arg(long, default_value_t = 0.0)]
    speed: f64,

    /// Tag start position; random when omitted
    #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], allow_negative_numbers = true)]
    start: Option<Vec<f64>>,

    /// Half-width of the uniform range noise of the tag's sensor
    #[arg(long, default_value_t = 0.0)]
    range_noise: f64,

    /// Probability that an anchor is missing from a reading
    #[arg(long, default_value_t = 0.0)]
    dropout: f64,

    /// Give the resampler the tag's true heading
    #[arg(long)]
    heading_hint: bool,

    /// Seed of the simulated tag
    #[arg(long, default_value_t = 7)]
    tag_seed: u64,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// JSON-lines file of tag reports
    #[arg(short, long, value_parser)]
    input: PathBuf,

    /// Output CSV file path
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Factor from report lengths to world units
    #[arg(long, default_value_t = 100.0)]
    distance_scale: f64,

    /// Window of the speed estimator
    #[arg(long, default_value_t = 10)]
    speed_window: usize,

    /// Feed reports through the mailbox from a producer thread at the cycle period
    #[arg(long)]
    realtime: bool,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output configuration file (.toml, .json, .yaml, .yml)
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

fn load_config(path: Option<&PathBuf>, args: &FilterArgs) -> Result<LocalizerConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            LocalizerConfig::from_file(path)?
        }
        None => {
            info!("No configuration file given, using the built-in template");
            LocalizerConfig::template()
        }
    };
    if let Some(n) = args.particles {
        config.num_particles = n;
    }
    if let Some(sigma) = args.sigma {
        config.observation.sigma = sigma;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(normalization) = args.normalization {
        config.observation.normalization = normalization;
    }
    if let Some(resampling) = args.resampling {
        config.resampling = resampling;
    }
    if let Some(averaging) = args.averaging {
        config.estimate.averaging = averaging;
    }
    if let Some(mode) = args.distance_mode {
        config.world.distance_mode = mode;
    }
    if args.pitch {
        config.motion.pitch_enabled = true;
    }
    config.validate()?;
    Ok(config)
}

fn write_records(records: &[LocalizationRecord], output: &PathBuf) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(output)?;
    LocalizationRecord::to_csv(records, output)?;
    let confident = records.iter().filter(|r| r.confidence).count();
    info!(
        "Wrote {} records to {} ({} confident)",
        records.len(),
        output.display(),
        confident
    );
    if let Some(last) = records.last() {
        match (last.estimate(), last.error) {
            (Some(p), Some(e)) => info!(
                "Final estimate ({:.1}, {:.1}, {:.1}), error {:.2}",
                p.x, p.y, p.z, e
            ),
            (Some(p), None) => info!("Final estimate ({:.1}, {:.1}, {:.1})", p.x, p.y, p.z),
            _ => warn!("No estimate available at the last cycle"),
        }
    }
    Ok(())
}

fn run_simulate(config_path: Option<&PathBuf>, args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path, &args.filter)?;
    let start = match args.start.as_deref() {
        Some([x, y, z]) => Some([*x, *y, *z]),
        Some(_) => return Err("--start takes exactly three values".into()),
        None => None,
    };
    let settings = SimulationSettings {
        cycles: args.cycles,
        speed: args.speed,
        start,
        sensor: SensorNoiseProfile {
            range_noise: args.range_noise,
            dropout_probability: args.dropout,
        },
        heading_hint: args.heading_hint,
        seed: args.tag_seed,
        ..SimulationSettings::default()
    };
    let records = run_simulation(&config, &settings)?;
    write_records(&records, &args.output)
}

fn run_replay(config_path: Option<&PathBuf>, args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    validate_input_file(&args.input)?;
    let config = load_config(config_path, &args.filter)?;
    let reports = read_reports(&args.input)?;
    info!("Read {} tag reports from {}", reports.len(), args.input.display());
    let settings = ReplaySettings {
        distance_scale: args.distance_scale,
        speed_window: args.speed_window,
    };

    let records = if args.realtime {
        let observations = reports
            .iter()
            .map(|r| r.to_observation(settings.distance_scale))
            .collect();
        replay_realtime(&config, observations, &settings)?
    } else {
        replay(&config, &reports, &settings)?
    };
    write_records(&records, &args.output)
}

/// Replay through the mailbox: a producer thread posts one observation per period while the
/// fixed-rate loop consumes the latest one. Stops once the producer is done and the mailbox
/// is drained.
fn replay_realtime(
    config: &LocalizerConfig,
    observations: Vec<Observation>,
    settings: &ReplaySettings,
) -> Result<Vec<LocalizationRecord>, Box<dyn Error>> {
    let mut localizer = MonteCarloLocalizer::new(config)?;
    let period = Duration::from_secs_f64(config.cycle_period_s);
    let mailbox = Mailbox::new();
    let finished = Arc::new(AtomicBool::new(false));

    let producer = {
        let mailbox = mailbox.clone();
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            for observation in observations {
                if mailbox.post(observation) {
                    debug!("Unread observation replaced");
                }
                thread::sleep(period);
            }
            finished.store(true, Ordering::Release);
        })
    };

    let mut speed = ReportedSpeed::new(settings.speed_window);
    let reference: Cell<Option<Position>> = Cell::new(None);
    let mut records = Vec::new();
    let time_s = Cell::new(0.0);
    localizer.run_fixed_rate(
        &mailbox,
        |observation| {
            if let Some(o) = observation {
                reference.set(o.reference_position);
            }
            speed.observe(observation, time_s.get())
        },
        |report| {
            records.push(LocalizationRecord::from_report(
                report,
                time_s.get(),
                reference.get(),
            ));
            time_s.set(time_s.get() + config.cycle_period_s);
            if finished.load(Ordering::Acquire) && !mailbox.has_pending() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        },
    );

    if producer.join().is_err() {
        return Err("observation producer thread panicked".into());
    }
    Ok(records)
}

fn create_config_file(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    LocalizerConfig::template().to_file(&args.output)?;
    info!("Configuration template written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Simulate(args) => run_simulate(cli.config.as_ref(), args),
        Command::Replay(args) => run_replay(cli.config.as_ref(), args),
        Command::Config(args) => create_config_file(args),
    }
}
