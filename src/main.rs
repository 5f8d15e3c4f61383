use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ccdphot::common::TimeScale;
use ccdphot::config::Config;
use ccdphot::pipeline::{Pipeline, Step};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Photometric calibration of CCD images
#[derive(Parser, Debug)]
#[command(name = "ccdphot")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Stars file
    #[arg(short, long, global = true)]
    stars_file: Option<PathBuf>,

    /// Synonyms of the star names
    #[arg(long, global = true)]
    synonyms_file: Option<PathBuf>,

    /// Directory holding the observation
    #[arg(short, long, global = true)]
    target_dir: Option<PathBuf>,

    /// Directory for the result files
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    /// Also write the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Measurement times are Modified Julian Dates
    #[arg(long, global = true)]
    modified_julian: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Register images and write their pixel catalogs
    Astrometry,
    /// Run the photometry program on every catalogued image
    Photometry,
    /// Collect, extinction correct and calibrate magnitudes
    Magnitudes,
    /// Differential light curves
    Curves,
    /// Every step in order
    All,
}

impl From<Command> for Step {
    fn from(command: Command) -> Self {
        match command {
            Command::Astrometry => Step::Astrometry,
            Command::Photometry => Step::Photometry,
            Command::Magnitudes => Step::Magnitudes,
            Command::Curves => Step::Curves,
            Command::All => Step::All,
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Reading configuration file {path:?}"))?,
        None => Config::default(),
    };

    if let Some(path) = &args.stars_file {
        config.stars_file = Some(path.clone());
    }
    if let Some(path) = &args.synonyms_file {
        config.synonyms_file = Some(path.clone());
    }
    if let Some(path) = &args.target_dir {
        config.target_dir = Some(path.clone());
    }
    if let Some(path) = &args.output_dir {
        config.output_dir = Some(path.clone());
    }
    if let Some(path) = &args.log_file {
        config.log_file = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if args.modified_julian {
        config.time_scale = TimeScale::ModifiedJulian;
    }
    Ok(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("Invalid log level {}", config.log_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Opening log file {path:?}"))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    let pipeline = Pipeline::from_config(&config).context("Setting up the pipeline")?;
    let report = pipeline.run(args.command.into())?;
    info!("Run finished: {report}");
    Ok(())
}
