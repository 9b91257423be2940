//! plansim-harness - scale and parity validation for the simulation pipeline.
//!
//! Each subcommand runs real pipelines against synthetic censuses and prints
//! a machine-readable JSON verdict on stdout. Exit status follows the
//! verdict: zero on pass, one on fail.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod parity;
mod scale;
mod stats;
mod support;

/// plansim-harness - scale and parity verdicts
#[derive(Parser, Debug)]
#[command(name = "plansim-harness")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Time runs across population and horizon sizes, test for linear scaling
    Scale {
        /// Comma-separated entity counts, smallest first
        #[arg(long, default_value = "1000,5000,10000,20000", value_delimiter = ',')]
        entities: Vec<usize>,

        /// Comma-separated year counts, shortest first
        #[arg(long, default_value = "2,4,6", value_delimiter = ',')]
        years: Vec<u16>,

        /// Worker count for every sample
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Compare two worker counts for bitwise result parity
    Parity {
        /// Worker count of the first run
        #[arg(long, default_value_t = 1)]
        workers_a: usize,

        /// Worker count of the second run
        #[arg(long, default_value_t = 8)]
        workers_b: usize,

        /// Years to simulate
        #[arg(long, default_value_t = 3)]
        years: u16,

        /// Bootstrap population size
        #[arg(long, default_value_t = 1000)]
        entities: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match dispatch(&cli.command) {
        Ok(pass) => {
            if pass {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        },
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        },
    }
}

fn dispatch(command: &Commands) -> Result<bool> {
    match command {
        Commands::Scale {
            entities,
            years,
            workers,
        } => {
            let verdict = scale::run(entities, years, *workers)?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(verdict.pass)
        },
        Commands::Parity {
            workers_a,
            workers_b,
            years,
            entities,
        } => {
            let verdict = parity::run(*workers_a, *workers_b, *years, *entities)?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            Ok(verdict.pass)
        },
    }
}
