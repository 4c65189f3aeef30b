use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Context;
use clap::Parser;

use bot_referee::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "bot-referee", version)]
#[command(about = "Referee many seeded runs between a judge process and bot processes")]
struct Args {
    /// JSON parameter file describing the game, the bots and the settings
    config: PathBuf,

    /// Worker pool width (overrides the parameter file)
    #[arg(long)]
    workers: Option<usize>,

    /// Number of runs (overrides the parameter file)
    #[arg(long)]
    runs: Option<usize>,

    /// Master seed (overrides the parameter file)
    #[arg(long)]
    seed: Option<u64>,

    /// Fail a run when a judge or bot stays silent this long, in milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Do not print progress
    #[arg(short, long)]
    quiet: bool,

    /// Write a tracing log file in the game directory
    #[arg(long)]
    log: bool,
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<Report> {
    let mut config = Configuration::from_json_file(&args.config)?.with_env_overrides();
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(runs) = args.runs {
        config = config.with_runs(runs);
    }
    if let Some(seed) = args.seed {
        config = config.with_master_seed(seed);
    }
    if let Some(ms) = args.read_timeout_ms {
        config = config.with_read_timeout(Duration::from_millis(ms));
    }
    if args.quiet {
        config = config.with_verbose(false);
    }
    if args.log {
        config = config.with_log(true);
    }

    let referee = Referee::new(config).context("could not set up the referee")?;
    referee.run()
}
