//! Batch driver tying the pieces together.
//!
//! [`Referee::run`] follows the same steps for every batch:
//!
//! 1. create `<output dir>/<game>/`
//! 2. build the seed bank from the master seed and assign one seed per run
//! 3. plan the runs (and their stderr log directories)
//! 4. play them on the [`RunScheduler`]
//! 5. build the [`Report`] and persist it to `<output dir>/<game>/ranking.log`
//!
//! Configuration problems surface before any process is spawned. Run failures never do:
//! they only show up in the report's failed-run count.

use anyhow::Context;
use tracing::{info, trace, warn};

use crate::{
    configuration::Configuration,
    logger::init_logger,
    report::{Report, ScoreLog},
    scheduler::{plan_runs, RunScheduler},
    seed_bank::SeedBank,
};

/// File name of the aggregate log.
pub const RANKING_LOG: &str = "ranking.log";
/// File name of the per-run ranking log.
pub const SCORES_LOG: &str = "scores.log";

/// Plays a whole batch described by a [`Configuration`].
#[derive(Debug)]
pub struct Referee {
    config: Configuration,
}

impl Referee {
    /// Validate `config` and set up logging.
    ///
    /// # Errors
    /// Returns a configuration error (zero bots, zero runs, zero workers, duplicate names...)
    /// or an error creating the output directory.
    pub fn new(config: Configuration) -> anyhow::Result<Referee> {
        config.validate()?;

        let game_dir = config.game_dir();
        std::fs::create_dir_all(&game_dir)
            .with_context(|| format!("could not create '{}'", game_dir.display()))?;

        if config.log {
            if let Err(e) = init_logger(&game_dir) {
                warn!("file logging disabled: {e:#}");
            }
        }
        trace!(?config);

        Ok(Referee { config })
    }

    /// Play every run and return the final statistics.
    pub fn run(&self) -> anyhow::Result<Report> {
        let config = &self.config;
        let game_dir = config.game_dir();

        let master = config.master_seed.unwrap_or_else(SeedBank::random_master);
        let mut bank = match &config.seeds {
            Some(seeds) => SeedBank::from_seeds(seeds.clone(), master),
            None => SeedBank::derive(master, config.runs)?,
        };
        let seeds = bank.draw(config.runs)?;
        info!(master, runs = config.runs, "seeds assigned");
        if config.verbose {
            println!(
                "Refereeing {} runs of '{}' between {} bots (master seed {master})",
                config.runs,
                config.judge.name,
                config.bots.len()
            );
        }

        let descriptors = plan_runs(config, &seeds)?;

        let mut scheduler = RunScheduler::new(config.clone());
        if config.log_scores {
            scheduler = scheduler.with_score_log(ScoreLog::create(&game_dir.join(SCORES_LOG))?);
        }
        let outcome = scheduler.execute(descriptors);

        let names = config.bots.iter().map(|b| b.name.clone()).collect();
        let report = Report::new(names, outcome.matrix, config.runs, outcome.failed);
        report.write_to(&game_dir.join(RANKING_LOG))?;
        info!(
            completed = report.completed(),
            failed = report.failed().len(),
            "report written"
        );
        Ok(report)
    }
}
