use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

mod config;
mod coverage_filter;
mod cross_section;
mod error;
mod gap_classifier;
mod hybrid_imputer;
mod idw_interpolator;
mod local_level_smoother;
mod observation_table;
mod pipeline;
mod schema_validator;
mod spatial_calibrator;
mod station_registry;

use config::PipelineConfig;
use pipeline::{ArtifactPaths, InputPaths};

#[derive(Debug, Parser)]
#[command(name = "aq-gapfill", version, about = "Gap classification and hybrid imputation for hourly air-quality stations")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Debug, Args)]
struct Settings {
    /// JSON configuration file; missing fields keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output folder for every artifact
    #[arg(long, global = true, default_value = "output")]
    out_dir: PathBuf,

    /// Seed for calibration timestamp sampling
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Worker threads (defaults to every core)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// Minimum fraction of valid values a partition needs to be kept
    #[arg(long, global = true)]
    min_coverage: Option<f64>,
}

#[derive(Debug, Args)]
struct Inputs {
    /// Wide hourly observation CSV (station_id, datetime, pollutant columns)
    #[arg(long)]
    observations: PathBuf,

    /// Station details CSV (station_id, lon, lat)
    #[arg(long)]
    stations: PathBuf,

    /// Optional prediction-locations CSV, checked for readability only
    #[arg(long)]
    locations: Option<PathBuf>,
}

impl Inputs {
    fn into_paths(self) -> InputPaths {
        InputPaths {
            observations: self.observations,
            stations: self.stations,
            locations: self.locations,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check schemas and print the missingness report
    Validate(Inputs),
    /// Trim structural gaps and write the gap registry
    Gaps {
        #[arg(long)]
        observations: PathBuf,
    },
    /// Calibrate the IDW exponent per pollutant
    Calibrate(Inputs),
    /// Fill gaps in the trimmed table
    Impute {
        /// Trimmed wide table written by `gaps`
        #[arg(long)]
        observations: PathBuf,
        /// Gap registry written by `gaps`
        #[arg(long)]
        gaps: PathBuf,
        #[arg(long)]
        stations: PathBuf,
        /// Exponent table written by `calibrate`
        #[arg(long)]
        calibration: PathBuf,
    },
    /// Drop station-years below the coverage threshold
    Trim {
        /// Long imputed table written by `impute`
        #[arg(long)]
        input: PathBuf,
    },
    /// Run every stage in sequence
    Run(Inputs),
}

fn load_config(settings: &Settings) -> Result<PipelineConfig> {
    let mut config = match &settings.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(seed) = settings.seed {
        config.calibration.seed = seed;
    }
    if let Some(threads) = settings.threads {
        config.threads = Some(threads);
    }
    if let Some(min_coverage) = settings.min_coverage {
        config.coverage.min_coverage = min_coverage;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli.settings)?;

    let threads = config.worker_threads();
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .context("failed to build worker pool")?;
    info!("using {} worker threads", threads);

    println!("\n🌫️  AIR-QUALITY GAP FILLING");
    println!("===========================");

    match cli.command {
        Command::Validate(inputs) => {
            println!("\n🔍 Validating inputs...");
            pipeline::run_validate(&inputs.into_paths(), &config).context("validation failed")?;
        }
        Command::Gaps { observations } => {
            println!("\n🕳️  Classifying gaps...");
            let out = ArtifactPaths::new(&cli.settings.out_dir)?;
            pipeline::run_gap_stage(&observations, &out, &config)
                .with_context(|| format!("gap classification failed for {}", observations.display()))?;
        }
        Command::Calibrate(inputs) => {
            println!("\n🎯 Calibrating IDW exponents...");
            let out = ArtifactPaths::new(&cli.settings.out_dir)?;
            pipeline::run_calibration_stage(&inputs.into_paths(), &out, &config).context("calibration failed")?;
        }
        Command::Impute { observations, gaps, stations, calibration } => {
            println!("\n🔧 Imputing gaps...");
            let out = ArtifactPaths::new(&cli.settings.out_dir)?;
            pipeline::run_imputation_stage(&observations, &gaps, &stations, &calibration, &out, &config)
                .context("imputation failed")?;
        }
        Command::Trim { input } => {
            println!("\n✂️  Applying coverage filter...");
            let out = ArtifactPaths::new(&cli.settings.out_dir)?;
            pipeline::run_coverage_stage(&input, &out, &config)
                .with_context(|| format!("coverage filter failed for {}", input.display()))?;
        }
        Command::Run(inputs) => {
            println!("\n🚀 Running the full pipeline...");
            let out = ArtifactPaths::new(&cli.settings.out_dir)?;
            pipeline::run_all(&inputs.into_paths(), &out, &config).context("pipeline failed")?;
        }
    }

    println!("\n✅ Done.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_apply_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "aq-gapfill",
            "trim",
            "--input",
            "imputed.csv",
            "--seed",
            "7",
            "--min-coverage",
            "0.9",
        ]);
        let config = load_config(&cli.settings).unwrap();
        assert_eq!(config.calibration.seed, 7);
        assert_eq!(config.coverage.min_coverage, 0.9);
        assert!(matches!(cli.command, Command::Trim { .. }));
    }

    #[test]
    fn test_out_of_range_coverage_is_rejected() {
        let cli = Cli::parse_from(["aq-gapfill", "trim", "--input", "x.csv", "--min-coverage", "1.5"]);
        assert!(load_config(&cli.settings).is_err());
    }
}
