//! plansim - multi-year retirement-plan simulation runner.
//!
//! Thin CLI over `plansim_core`: runs year ranges, resumes from checkpoints,
//! and inspects the checkpoint store.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use plansim_core::checkpoint::CheckpointStatus;
use plansim_core::{CheckpointStore, Pipeline, PipelineError, RunMode, SimulationConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Exit code for recoverable failures: the run can be resumed as-is.
const EXIT_RECOVERABLE: u8 = 1;
/// Exit code for fatal failures requiring operator intervention.
const EXIT_FATAL: u8 = 2;

/// plansim - deterministic multi-year plan simulation
#[derive(Parser, Debug)]
#[command(name = "plansim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to run configuration file
    #[arg(short, long, default_value = "plansim.toml")]
    config: PathBuf,

    /// Data directory (checkpoints, caches, run log)
    #[arg(long, default_value = "plansim-data")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a year range, e.g. `run 2025..2030`
    Run {
        /// Inclusive year range, `<start>..<end>`
        range: String,

        /// Resume from the latest valid checkpoint (the default); errors
        /// if checkpoints exist but none is valid
        #[arg(long, conflicts_with = "force_restart")]
        resume: bool,

        /// Ignore existing checkpoints and recompute from the start year
        #[arg(long)]
        force_restart: bool,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Inspect and manage the checkpoint store
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
}

#[derive(Subcommand, Debug)]
enum CheckpointCommands {
    /// List checkpoint artifacts, newest first
    List,

    /// Show the latest pointer and per-artifact validity
    Status,

    /// Validate every artifact; exits nonzero if any is unusable
    Validate,

    /// Delete all but the newest N artifacts
    Cleanup {
        /// Artifacts to keep
        #[arg(long)]
        keep: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            // Pipeline failures carry their own recoverability; everything
            // else (bad config, bad arguments, IO) needs intervention.
            let code = err
                .downcast_ref::<PipelineError>()
                .map_or(EXIT_FATAL, |pipeline_err| {
                    if pipeline_err.is_resumable() {
                        EXIT_RECOVERABLE
                    } else {
                        EXIT_FATAL
                    }
                });
            ExitCode::from(code)
        },
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode> {
    let mut config = SimulationConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match &cli.command {
        Commands::Run {
            range,
            resume: _,
            force_restart,
            workers,
        } => {
            let (start, end) = parse_year_range(range)?;
            config.run.start_year = start;
            config.run.end_year = end;
            if let Some(workers) = workers {
                config.engine.max_workers = *workers;
            }
            config.validate().context("configuration rejected")?;

            let mode = if *force_restart {
                RunMode::Fresh
            } else {
                RunMode::Resume
            };
            let pipeline = Pipeline::demo(config, &cli.data_dir)?;
            let run = pipeline.run(mode)?;

            for year in &run.years {
                println!(
                    "{}  entities={} active={} new={} ceased={} warnings={} {}ms",
                    year.year,
                    year.entity_counts.total,
                    year.entity_counts.active,
                    year.entity_counts.new_this_year,
                    year.entity_counts.ceased_this_year,
                    year.validation_warnings,
                    year.duration_ms,
                );
            }
            match run.resumed_from {
                Some(from) => println!(
                    "run {} complete: {} year(s), resumed after {from}",
                    run.run_id,
                    run.years.len()
                ),
                None => println!("run {} complete: {} year(s)", run.run_id, run.years.len()),
            }
            Ok(ExitCode::SUCCESS)
        },
        Commands::Checkpoint(cmd) => checkpoint_command(cmd, &config, &cli.data_dir),
    }
}

fn checkpoint_command(
    cmd: &CheckpointCommands,
    config: &SimulationConfig,
    data_dir: &std::path::Path,
) -> Result<ExitCode> {
    let store = CheckpointStore::open(data_dir.join("checkpoints"))?;

    match cmd {
        CheckpointCommands::List => {
            for summary in store.list()? {
                println!("{}  {} bytes", summary.year, summary.size_bytes);
            }
            Ok(ExitCode::SUCCESS)
        },
        CheckpointCommands::Status => {
            let fingerprint = config.fingerprint()?;
            match store.latest_pointer() {
                Some(year) => println!("latest: {year}"),
                None => println!("latest: none"),
            }
            println!("config fingerprint: {}", fingerprint.short());
            for (year, status) in store.validate_all(&fingerprint)? {
                println!("{year}  {}", describe_status(&status));
            }
            Ok(ExitCode::SUCCESS)
        },
        CheckpointCommands::Validate => {
            let fingerprint = config.fingerprint()?;
            let statuses = store.validate_all(&fingerprint)?;
            let mut unusable = 0usize;
            for (year, status) in &statuses {
                println!("{year}  {}", describe_status(status));
                if !matches!(status, CheckpointStatus::Valid) {
                    unusable += 1;
                }
            }
            if unusable > 0 {
                eprintln!("{unusable} of {} artifact(s) unusable", statuses.len());
                return Ok(ExitCode::from(EXIT_RECOVERABLE));
            }
            Ok(ExitCode::SUCCESS)
        },
        CheckpointCommands::Cleanup { keep } => {
            let deleted = store.cleanup(*keep)?;
            println!("deleted {deleted} artifact(s), kept newest {keep}");
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn describe_status(status: &CheckpointStatus) -> String {
    match status {
        CheckpointStatus::Valid => "valid".to_owned(),
        CheckpointStatus::FingerprintMismatch { stored } => {
            format!("fingerprint mismatch (written under {})", &stored[..12.min(stored.len())])
        },
        CheckpointStatus::Invalid { reason } => format!("invalid: {reason}"),
    }
}

/// Parses `<start>..<end>` as an inclusive year range.
fn parse_year_range(range: &str) -> Result<(u16, u16)> {
    let (start, end) = range
        .split_once("..")
        .ok_or_else(|| anyhow!("year range must look like 2025..2030, got {range:?}"))?;
    let end = end.strip_prefix('=').unwrap_or(end);
    let start: u16 = start
        .trim()
        .parse()
        .with_context(|| format!("invalid start year {start:?}"))?;
    let end: u16 = end
        .trim()
        .parse()
        .with_context(|| format!("invalid end year {end:?}"))?;
    if start > end {
        return Err(anyhow!("start year {start} is after end year {end}"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_range_parses_inclusive() {
        assert_eq!(parse_year_range("2025..2030").unwrap(), (2025, 2030));
        assert_eq!(parse_year_range("2025..=2030").unwrap(), (2025, 2030));
        assert_eq!(parse_year_range("2025..2025").unwrap(), (2025, 2025));
    }

    #[test]
    fn malformed_ranges_are_rejected()  {
        assert!(parse_year_range("2025").is_err());
        assert!(parse_year_range("2030..2025").is_err());
        assert!(parse_year_range("20x5..2030").is_err());
    }

    #[test]
    fn cli_parses_run_with_overrides() {
        let cli = Cli::parse_from([
            "plansim",
            "--config",
            "other.toml",
            "run",
            "2025..2030",
            "--force-restart",
            "--workers",
            "8",
        ]);
        match cli.command {
            Commands::Run {
                range,
                force_restart,
                workers,
                ..
            } => {
                assert_eq!(range, "2025..2030");
                assert!(force_restart);
                assert_eq!(workers, Some(8));
            },
            Commands::Checkpoint(_) => panic!("expected run"),
        }
    }

    #[test]
    fn resume_conflicts_with_force_restart() {
        let parsed =
            Cli::try_parse_from(["plansim", "run", "2025..2030", "--resume", "--force-restart"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn checkpoint_cleanup_requires_keep() {
        assert!(Cli::try_parse_from(["plansim", "checkpoint", "cleanup"]).is_err());
        let cli = Cli::parse_from(["plansim", "checkpoint", "cleanup", "--keep", "3"]);
        assert!(matches!(
            cli.command,
            Commands::Checkpoint(CheckpointCommands::Cleanup { keep: 3 })
        ));
    }
}
