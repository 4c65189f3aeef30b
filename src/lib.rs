//! # Bot Referee
//!
//! A process-orchestration crate for refereeing turn-based bot matches.
//!
//! It provides:
//! - A line-oriented relay between one judge process and N bot processes (`RelayLoop`)
//! - Many independent runs played over a bounded worker pool (`RunScheduler`)
//! - Deterministic per-run seeds derived from one master seed (`SeedBank`)
//! - Rank-frequency statistics aggregated across the batch (`RankingAggregator`, `Report`)
//!
//! Each run spawns the judge and every bot as separate OS processes. A run that fails (a
//! process does not start, crashes, stays silent past its deadline or breaks the protocol)
//! is dropped from the statistics without affecting the other runs.
//!
//! # Documentation Overview
//!
//! - For the judge/bot protocol, see the [`relay`] module.
//! - For the batch configuration and its JSON parameter file, see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For scheduling, cancellation and per-run cleanup, see the [`scheduler`] module.
//! - For the final percentages, see [`Report`](crate::report::Report).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//! use bot_referee::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let judge = JudgeSpec::new("tron", "./tron_eval", vec!["{bots}".into(), "{seed}".into()]);
//!     let bots = vec![
//!         BotSpec::new("left", "./left_bot", vec![]),
//!         BotSpec::new("right", "./right_bot", vec![]),
//!     ];
//!
//!     let config = Configuration::new(judge, bots)
//!         .with_runs(100)
//!         .with_workers(4)
//!         .with_master_seed(42)
//!         .with_read_timeout(Duration::from_secs(5))
//!         .with_log_stderr(true);
//!
//!     let report = Referee::new(config)?.run()?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
//!
//! # Judge Requirements
//!
//! The judge writes on its stdout, one directive per line:
//!  * `k > 0` followed by `k` lines: forwarded to the current bot, whose one-line reply is
//!    written back on the judge's stdin
//!  * `0`: the current bot is skipped
//!  * a negative number followed by `tied` or the bot indices best first: end of the run
//!
//! The current bot starts at 0 and moves to the next bot after every directive.
//!
//! # Platform
//!
//! Judge and bots are started in their own process group, which is killed as a whole when
//! the run ends, so this crate only builds on Unix.
#![warn(missing_docs)]

pub use anyhow;
pub mod configuration;
pub mod error;
mod logger;
pub mod process;
pub mod ranking;
pub mod referee;
pub mod relay;
pub mod report;
pub mod scheduler;
pub mod seed_bank;

/// Commonly used types for quick access.
///
/// ```rust
/// use bot_referee::prelude::*;
/// ```
pub mod prelude {
    pub use crate::configuration::{BotSpec, Configuration, JudgeSpec};
    pub use crate::error::RefereeError;
    pub use crate::ranking::{RankingAggregator, RankingMatrix};
    pub use crate::referee::Referee;
    pub use crate::relay::RunResult;
    pub use crate::report::Report;
    pub use crate::scheduler::{RunDescriptor, RunScheduler};
}
