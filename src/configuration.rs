//! Config for the referee behaviors
//!
//! A [`Configuration`] describes one batch: the judge executable, the bots, how many runs to
//! play and how to play them. It can be created programmatically with [`Configuration::new()`]
//! and the `with_*` setters, or read from a JSON parameter file with
//! [`Configuration::from_json_file()`].
//!
//! # Parameter file
//!
//! ```json
//! {
//!   "Game": { "Name": "tron", "Game bin": "./tron_eval", "Arguments": ["{bots}", "{seed}"] },
//!   "Bots": [
//!     { "Name": "left", "Bin": "./bot_a", "Arguments": [] },
//!     { "Name": "right", "Bin": "./bot_b", "Arguments": ["--fast"] }
//!   ],
//!   "Settings": { "Runs": 100, "Workers": 4, "Log stderr": true, "Log scores": true, "Seed": 42 }
//! }
//! ```
//!
//! Optional settings: `Workers`, `Seed`, `Seeds` (explicit seed bank), `Read timeout ms`,
//! `Output dir`, `Verbose`, `Log`.
//!
//! # Judge argument placeholders
//!
//! - `{seed}` is replaced by the seed of the run
//! - `{bots}` is replaced by the number of bots
//!
//! # Environment Variables
//!
//! [`Configuration::with_env_overrides()`] applies the following variables when set:
//!
//! - `REFEREE_RUNS`: number of runs
//! - `REFEREE_WORKERS`: worker pool width
//! - `REFEREE_SEED`: master seed
//! - `REFEREE_READ_TIMEOUT_MS`: per-read deadline in milliseconds (`0` disables it)
//! - `REFEREE_VERBOSE`: `"true"` to print progress on stdout
//! - `REFEREE_LOG`: `"true"` to write a tracing log file

use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::error::RefereeError;

/// Placeholder replaced by the run seed in judge arguments.
pub const SEED_PLACEHOLDER: &str = "{seed}";
/// Placeholder replaced by the bot count in judge arguments.
pub const BOTS_PLACEHOLDER: &str = "{bots}";

/// The game-simulation process of every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeSpec {
    /// Game name, used for the output subdirectory and the judge log file.
    pub name: String,
    /// Path to the judge executable.
    pub executable: PathBuf,
    /// Arguments, possibly containing placeholders.
    pub arguments: Vec<String>,
}

impl JudgeSpec {
    /// Create a judge description.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        arguments: Vec<String>,
    ) -> Self {
        JudgeSpec {
            name: name.into(),
            executable: executable.into(),
            arguments,
        }
    }

    /// Arguments of the judge with the placeholders substituted for one run.
    pub fn arguments_for_run(&self, seed: u64, nbots: usize) -> Vec<String> {
        self.arguments
            .iter()
            .map(|arg| {
                arg.replace(SEED_PLACEHOLDER, &seed.to_string())
                    .replace(BOTS_PLACEHOLDER, &nbots.to_string())
            })
            .collect()
    }
}

/// A player process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSpec {
    /// Bot name, must be unique in a batch.
    pub name: String,
    /// Path to the bot executable.
    pub executable: PathBuf,
    /// Arguments given to the bot.
    pub arguments: Vec<String>,
}

impl BotSpec {
    /// Create a bot description.
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<PathBuf>,
        arguments: Vec<String>,
    ) -> Self {
        BotSpec {
            name: name.into(),
            executable: executable.into(),
            arguments,
        }
    }
}

/// Configuration of one batch of runs.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) judge: JudgeSpec,
    pub(crate) bots: Vec<BotSpec>,
    pub(crate) runs: usize,
    pub(crate) workers: usize,
    pub(crate) log_stderr: bool,
    pub(crate) log_scores: bool,
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) master_seed: Option<u64>,
    pub(crate) seeds: Option<Vec<u64>>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) output_dir: PathBuf,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - One run is played.
    /// - The worker pool is as wide as the number of physical CPUs.
    /// - Judge and bot stderr are discarded, per-run scores are not logged.
    /// - Progress is printed on stdout, no tracing log file is written.
    /// - Seeds are derived from a random master seed.
    /// - Reads wait indefinitely.
    /// - Output goes to `runs/`.
    pub fn new(judge: JudgeSpec, bots: Vec<BotSpec>) -> Self {
        Self {
            judge,
            bots,
            runs: 1,
            workers: num_cpus::get_physical(),
            log_stderr: false,
            log_scores: false,
            verbose: true,
            log: false,
            master_seed: None,
            seeds: None,
            read_timeout: None,
            output_dir: PathBuf::from("runs"),
        }
    }

    /// Read the JSON parameter file used by the referee binary.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read parameter file '{}'", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("invalid parameter file '{}'", path.display()))
    }

    /// Parse a JSON parameter document.
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let file: ParameterFile = serde_json::from_str(text).context("malformed JSON")?;
        Ok(file.into())
    }

    /// Apply `REFEREE_*` environment variables on top of this configuration.
    pub fn with_env_overrides(mut self) -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn parse_env<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.parse().ok()
        }

        if let Some(runs) = parse_env("REFEREE_RUNS") {
            self.runs = runs;
        }
        if let Some(workers) = parse_env("REFEREE_WORKERS") {
            self.workers = workers;
        }
        if let Some(seed) = parse_env("REFEREE_SEED") {
            self.master_seed = Some(seed);
        }
        if let Some(ms) = parse_env::<u64>("REFEREE_READ_TIMEOUT_MS") {
            self.read_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        self.verbose = get_env_flag("REFEREE_VERBOSE", self.verbose);
        self.log = get_env_flag("REFEREE_LOG", self.log);
        self
    }

    /// Set the number of runs played (and the denominator of the final percentages).
    pub fn with_runs(mut self, runs: usize) -> Self {
        self.runs = runs;
        self
    }

    /// Set the worker pool width. `1` plays runs strictly in index order.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Redirect judge and bot stderr to per-run log files.
    pub fn with_log_stderr(mut self, value: bool) -> Self {
        self.log_stderr = value;
        self
    }

    /// Append each completed run's ranking to `scores.log`.
    pub fn with_log_scores(mut self, value: bool) -> Self {
        self.log_scores = value;
        self
    }

    /// Enable or disable progress output on stdout.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable the tracing log file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Fix the master seed the seed bank is derived from.
    pub fn with_master_seed(mut self, seed: u64) -> Self {
        self.master_seed = Some(seed);
        self
    }

    /// Use an explicit seed bank instead of deriving one.
    ///
    /// The bank is still shuffled with the master seed.
    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    /// Fail a run when a judge or bot stays silent, or stops consuming its input, for longer
    /// than `timeout`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Root directory of the per-game outputs.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// The judge of this batch.
    pub fn judge(&self) -> &JudgeSpec {
        &self.judge
    }

    /// The bots of this batch, in index order.
    pub fn bots(&self) -> &[BotSpec] {
        &self.bots
    }

    /// Configured number of runs.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Configured worker pool width.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// `<output dir>/<game name>`
    pub fn game_dir(&self) -> PathBuf {
        self.output_dir.join(&self.judge.name)
    }

    /// Check everything that must hold before any run is scheduled.
    pub fn validate(&self) -> Result<(), RefereeError> {
        let fail = |msg: String| Err(RefereeError::Configuration(msg));

        if self.bots.is_empty() {
            return fail("at least one bot is required".into());
        }
        if self.runs == 0 {
            return fail("the run count must be positive".into());
        }
        if self.workers == 0 {
            return fail("the worker count must be positive".into());
        }
        if self.judge.name.trim().is_empty() {
            return fail("the game needs a name".into());
        }
        if self.judge.executable.as_os_str().is_empty() {
            return fail("the judge executable is empty".into());
        }

        let mut names = HashSet::new();
        for bot in &self.bots {
            if bot.name.trim().is_empty() {
                return fail("bot names cannot be empty".into());
            }
            if !names.insert(bot.name.as_str()) {
                return fail(format!("bot name '{}' is used twice", bot.name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ParameterFile {
    #[serde(rename = "Game")]
    game: GameSection,
    #[serde(rename = "Bots")]
    bots: Vec<BotSection>,
    #[serde(rename = "Settings")]
    settings: SettingsSection,
}

#[derive(Debug, Deserialize)]
struct GameSection {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Game bin")]
    bin: PathBuf,
    #[serde(rename = "Arguments", default)]
    arguments: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BotSection {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Bin")]
    bin: PathBuf,
    #[serde(rename = "Arguments", default)]
    arguments: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsSection {
    #[serde(rename = "Runs")]
    runs: usize,
    #[serde(rename = "Workers")]
    workers: Option<usize>,
    #[serde(rename = "Log stderr", default)]
    log_stderr: bool,
    #[serde(rename = "Log scores", default)]
    log_scores: bool,
    #[serde(rename = "Seed")]
    seed: Option<u64>,
    #[serde(rename = "Seeds")]
    seeds: Option<Vec<u64>>,
    #[serde(rename = "Read timeout ms")]
    read_timeout_ms: Option<u64>,
    #[serde(rename = "Output dir")]
    output_dir: Option<PathBuf>,
    #[serde(rename = "Verbose")]
    verbose: Option<bool>,
    #[serde(rename = "Log")]
    log: Option<bool>,
}

impl From<ParameterFile> for Configuration {
    fn from(file: ParameterFile) -> Self {
        let judge = JudgeSpec::new(file.game.name, file.game.bin, file.game.arguments);
        let bots = file
            .bots
            .into_iter()
            .map(|b| BotSpec::new(b.name, b.bin, b.arguments))
            .collect();
        let s = file.settings;

        let mut config = Configuration::new(judge, bots)
            .with_runs(s.runs)
            .with_log_stderr(s.log_stderr)
            .with_log_scores(s.log_scores);
        if let Some(workers) = s.workers {
            config.workers = workers;
        }
        config.master_seed = s.seed;
        config.seeds = s.seeds;
        config.read_timeout = s
            .read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        if let Some(dir) = s.output_dir {
            config.output_dir = dir;
        }
        if let Some(verbose) = s.verbose {
            config.verbose = verbose;
        }
        if let Some(log) = s.log {
            config.log = log;
        }
        config
    }
}
