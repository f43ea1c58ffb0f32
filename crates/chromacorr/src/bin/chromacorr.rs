//! `chromacorr` command-line interface.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chromacorr::{aberration_map, pipeline, read_correction_file, PhysicalScale, RunConfig};
use clap::{Parser, Subcommand};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "chromacorr")]
#[command(about = "Build, validate and apply chromatic aberration corrections")]
#[command(version)]
struct Cli {
    /// Emit `tracing` output as JSON lines (requires the `tracing` feature).
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full calibrate-and-apply pipeline from a JSON config.
    Run {
        /// Path to the run configuration.
        config: PathBuf,

        /// Also write the run summary as JSON.
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Leave-one-out target registration error of the calibration points.
    Tre {
        /// Path to the run configuration.
        config: PathBuf,
    },
    /// Print the correction vector at one location of a stored correction.
    Correct {
        /// Correction XML file.
        correction: PathBuf,
        /// Query x in pixels.
        #[arg(allow_negative_numbers = true)]
        x: f64,
        /// Query y in pixels.
        #[arg(allow_negative_numbers = true)]
        y: f64,
    },
    /// Sample a stored correction on a pixel rectangle and write it as JSON (nm).
    Map {
        /// Correction XML file.
        correction: PathBuf,
        /// Output JSON path.
        out: PathBuf,
        /// First and one-past-last x pixel.
        #[arg(
            long,
            required = true,
            num_args = 2,
            allow_negative_numbers = true,
            value_names = ["MIN", "MAX"]
        )]
        x: Vec<i32>,
        /// First and one-past-last y pixel.
        #[arg(
            long,
            required = true,
            num_args = 2,
            allow_negative_numbers = true,
            value_names = ["MIN", "MAX"]
        )]
        y: Vec<i32>,
        #[arg(long, default_value_t = 80.0)]
        pixelsize_nm: f64,
        #[arg(long, default_value_t = 100.0)]
        z_sectionsize_nm: f64,
    },
}

fn init_logging(detailed: bool, json: bool) {
    #[cfg(feature = "tracing")]
    {
        let _ = detailed;
        chromacorr::core::init_tracing(json);
    }
    #[cfg(not(feature = "tracing"))]
    {
        let _ = json;
        let _ = chromacorr::core::init_with_level(chromacorr::core::level_for_verbosity(detailed));
    }
}

fn load_config(path: &Path, json_log: bool) -> CliResult<RunConfig> {
    let config = RunConfig::load_json(path)
        .map_err(|e| -> CliError { format!("cannot read config {}: {e}", path.display()).into() })?;
    init_logging(config.log_detailed_messages, json_log);
    Ok(config)
}

fn execute(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Run { config, summary } => {
            let config = load_config(&config, cli.json_log)?;
            let result = pipeline::run(&config)?;
            log::info!(
                "corrected {} of {} points",
                result.corrected,
                result.corrected + result.uncorrected
            );
            if let Some(path) = summary {
                std::fs::write(path, serde_json::to_string_pretty(&result)?)?;
            }
        }
        Commands::Tre { config } => {
            let config = load_config(&config, cli.json_log)?;
            let report = pipeline::run_tre(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Correct { correction, x, y } => {
            init_logging(false, cli.json_log);
            let field = read_correction_file(&correction)?;
            let v = field.correct(x, y)?;
            println!("{} {} {}", v.x, v.y, v.z);
        }
        Commands::Map {
            correction,
            out,
            x,
            y,
            pixelsize_nm,
            z_sectionsize_nm,
        } => {
            init_logging(false, cli.json_log);
            let field = read_correction_file(&correction)?;
            let scale = PhysicalScale::new(pixelsize_nm, z_sectionsize_nm);
            let (&[x0, x1, ..], &[y0, y1, ..]) = (x.as_slice(), y.as_slice()) else {
                return Err("map bounds need MIN and MAX".into());
            };
            let map = aberration_map(&field, x0..x1, y0..y1, &scale);
            std::fs::write(&out, serde_json::to_string(&map)?)?;
            println!("{} of {} cells covered", map.covered(), map.cells.len());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match execute(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
