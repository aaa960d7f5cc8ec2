//! Command line front end for the probe locator.
//!
//! - `simulate` renders a synthetic probe track, runs it through the threaded engine and writes the
//!   per-cycle log.
//! - `replay` summarizes a previously written log.
//! - `locate` runs landmark extraction on a single image.
//! - `config` writes a template configuration file.
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use log::{info, warn};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use locator::features::{Deadline, FeatureExtractor, Frame};
use locator::record::{TrajectoryLog, TrajectorySummary, read_trajectory};
use locator::sim::{LinearTrack, SpotRenderer};
use locator::worker::EngineWorker;
use locator::{FilterConfig, FilterEngine, PriorRegion, TrackingState};

const LONG_ABOUT: &str = "Particle-filter localization of a scanning probe.

Every frame drives one predict/weight/resample/estimate cycle: the commanded stage displacement moves
the particles, landmarks extracted from the image weight them. The filter configuration can be given
with --config as a JSON, YAML or TOML file; use the `config` command to write a template.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Particle-filter localization of a scanning probe.", long_about = LONG_ABOUT)]
struct Cli {
    /// Filter configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log filter: a level (off, error, warn, info, debug, trace) or module directives such as
    /// `warn,locator::engine=debug`
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
        about = "Track a synthetic probe moving along a straight line",
        long_about = "Render a bright spot moving at constant velocity, feed the frames and the matching stage displacements to the engine thread and write one CSV row per cycle."
    )]
    Simulate(SimulateArgs),
    #[command(name = "replay", about = "Summarize a per-cycle log")]
    Replay {
        /// CSV log written by `simulate`
        log: PathBuf,
    },
    #[command(name = "locate", about = "Extract landmark observations from one image")]
    Locate(LocateArgs),
    #[command(name = "config", about = "Write a template configuration file")]
    CreateConfig {
        /// Output path; the extension selects the format
        #[arg(default_value = "probe-locator.toml")]
        output: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Number of frames
    #[arg(long, default_value_t = 50)]
    frames: usize,

    /// Displacement per frame (x y)
    #[arg(long, num_args = 2, value_names = ["X", "Y"], default_values_t = [1.0, 0.0], allow_negative_numbers = true)]
    velocity: Vec<f64>,

    /// Side of the square prior around the start position
    #[arg(long, default_value_t = 10.0)]
    prior_side: f64,

    /// Rendered frame width and height in pixels
    #[arg(long, default_value_t = 256)]
    frame_size: u32,

    /// Per-pixel intensity noise of the rendered frames
    #[arg(long, default_value_t = 0.02)]
    pixel_noise: f64,

    /// Output CSV log
    #[arg(short, long, default_value = "cycles.csv")]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct LocateArgs {
    /// Image file (PNG, PGM, JPEG or TIFF)
    #[arg(long)]
    image: PathBuf,

    /// Timestamp attached to the observations
    #[arg(long, default_value_t = 0.0)]
    timestamp: f64,
}

/// Install the process-wide logger.
///
/// Each record carries local time, level, thread name and module path.
///
/// # Arguments
/// * `filters` - `env_logger` filter directives: a bare level (`info`) or per-module levels such as
///   `warn,locator::engine=debug`
/// * `log_file` - Optional path to log file, appended to (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or a logger is already installed.
fn init_logger(filters: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    if filters.trim().is_empty() {
        builder.filter_level(log::LevelFilter::Info);
    } else {
        builder.parse_filters(filters);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            std::thread::current().name().unwrap_or("?"),
            record.target(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<FilterConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            Ok(FilterConfig::from_file(path)?)
        }
        None => Ok(FilterConfig::default()),
    }
}

fn run_simulation(mut config: FilterConfig, args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let track = LinearTrack {
        velocity: Vector3::new(args.velocity[0], args.velocity[1], 0.0),
        frames: args.frames,
        axes: config.axes,
        ..LinearTrack::default()
    };
    let renderer = SpotRenderer {
        width: args.frame_size,
        height: args.frame_size,
        calibration: track.fit_calibration(args.frame_size, args.frame_size, 16.0),
        noise_stddev: args.pixel_noise,
        ..SpotRenderer::default()
    };
    config.calibration = renderer.calibration;
    info!(
        "simulating {} frames at {:.3} px/unit, writing {}",
        track.frames,
        renderer.calibration.px_per_unit,
        args.output.display()
    );

    let axes = config.axes;
    let particle_count = config.particle_count;
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let mut engine = FilterEngine::new(config)?;
    engine.initialize(
        PriorRegion::square(track.start.x, track.start.y, args.prior_side),
        particle_count,
    )?;
    let worker = EngineWorker::spawn(engine)?;
    let mut log_writer = TrajectoryLog::create(&args.output, axes)?;

    let mut final_error = None;
    for step in track.steps(&mut rng) {
        let frame = renderer.render(&step.truth, step.timestamp, &mut rng);
        worker.submit_control(step.control);
        worker.submit_frame(frame);
        match worker.reports().recv_timeout(Duration::from_secs(5)) {
            Ok(report) => {
                log_writer.write_estimate(&report.estimate)?;
                final_error = Some(report.estimate.planar_error(&step.truth));
                if report.estimate.state == TrackingState::Lost {
                    warn!("track lost at t={:.3}, stopping", step.timestamp);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("no cycle report for frame t={:.3}", step.timestamp)
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for diagnostic in worker.diagnostics().try_iter() {
            info!("diagnostic: {diagnostic}");
        }
    }

    if let Some(latest) = worker.latest() {
        println!("final estimate: {latest}");
    }
    if let Some(error) = final_error {
        println!("final planar error: {error:.4}");
    }
    println!("{} cycle(s) written to {}", log_writer.rows(), args.output.display());
    worker.stop()?;
    Ok(())
}

fn run_replay(log: &PathBuf) -> Result<(), Box<dyn Error>> {
    let records = read_trajectory(log)?;
    info!("read {} record(s) from {}", records.len(), log.display());
    println!("{}", TrajectorySummary::from_records(&records));
    Ok(())
}

fn run_locate(config: &FilterConfig, args: &LocateArgs) -> Result<(), Box<dyn Error>> {
    config.validate()?;
    let extractor = config.extractor.build(config.calibration)?;
    let frame = Frame::open(&args.image, args.timestamp)?;
    let image = frame.to_gray()?;
    let deadline = Deadline::from_millis(config.extraction_time_budget_ms);
    let mut found = 0;
    for observation in extractor.extract(&image, frame.timestamp, deadline) {
        let observation = observation?;
        found += 1;
        println!(
            "({:.4}, {:.4}, {:.4}) stddev={:.4} confidence={:.3}",
            observation.position.x,
            observation.position.y,
            observation.position.z,
            observation.stddev,
            observation.confidence
        );
    }
    if found == 0 {
        println!("no landmark found in {}", args.image.display());
    }
    Ok(())
}

fn create_config_file(output: &PathBuf) -> Result<(), Box<dyn Error>> {
    FilterConfig::default().to_file(output)?;
    println!("configuration template written to {}", output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match &cli.command {
        Command::Simulate(args) => run_simulation(load_config(cli.config.as_ref())?, args),
        Command::Replay { log } => run_replay(log),
        Command::Locate(args) => run_locate(&load_config(cli.config.as_ref())?, args),
        Command::CreateConfig { output } => create_config_file(output),
    }
}
