//! The per-run protocol between one judge and its bots.
//!
//! The judge drives everything, one directive per line:
//!
//! - it writes an integer `exec_code`
//! - `exec_code > 0`: the next `exec_code` judge lines go to the current bot, then one reply
//!   line of that bot goes back to the judge
//! - `exec_code == 0`: the current bot sits this tick out
//! - `exec_code < 0`: the next judge line is the final ranking, either `tied` or a
//!   whitespace-separated permutation of bot indices, best first
//!
//! After every tick the current bot moves to the next index, wrapping around.
//!
//! The relay never looks inside forwarded lines, so any turn-based judge following this
//! framing can be refereed.

use std::{cmp::Ordering, collections::HashSet, fmt::Display};

use thiserror::Error;
use tracing::trace;

use crate::{error::RefereeError, process::LineEndpoint};

/// Ranking line meaning every bot shares first place.
pub const TIE_TOKEN: &str = "tied";

/// Outcome of a run that reached its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Joint first place for every bot.
    Tied,
    /// Bot indices, best first. Always a permutation of all bot indices.
    Ranked(Vec<usize>),
}

/// Why a ranking line was refused.
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RankingError {
    #[error("ranking line is empty")]
    Empty,
    #[error("'{0}' is not a bot index")]
    NotAnIndex(String),
    #[error("bot index {index} is out of range for {nbots} bots")]
    OutOfRange { index: usize, nbots: usize },
    #[error("bot {0} is ranked twice")]
    Duplicate(usize),
    #[error("ranking lists {got} bots, expected {expected}")]
    WrongLength { got: usize, expected: usize },
}

impl RunResult {
    /// Parse the line following a negative exec code.
    pub fn parse(line: &str, nbots: usize) -> Result<RunResult, RankingError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RankingError::Empty);
        }
        if line.eq_ignore_ascii_case(TIE_TOKEN) {
            return Ok(RunResult::Tied);
        }

        let order = line
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<usize>()
                    .map_err(|_| RankingError::NotAnIndex(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ranked = RunResult::Ranked(order);
        ranked.validate(nbots)?;
        Ok(ranked)
    }

    /// Check that a ranking is a permutation of `0..nbots`.
    pub fn validate(&self, nbots: usize) -> Result<(), RankingError> {
        let RunResult::Ranked(order) = self else {
            return Ok(());
        };
        let mut seen = HashSet::with_capacity(order.len());
        for &index in order {
            if index >= nbots {
                return Err(RankingError::OutOfRange { index, nbots });
            }
            if !seen.insert(index) {
                return Err(RankingError::Duplicate(index));
            }
        }
        if order.len() != nbots {
            return Err(RankingError::WrongLength {
                got: order.len(),
                expected: nbots,
            });
        }
        Ok(())
    }
}

impl Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Tied => write!(f, "{TIE_TOKEN}"),
            RunResult::Ranked(order) => {
                let s = order
                    .iter()
                    .map(usize::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(f, "{s}")
            }
        }
    }
}

/// Counters of one relay session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Exec codes read from the judge, the final one included.
    pub ticks: usize,
    /// Ticks with a zero exec code.
    pub skipped: usize,
    /// Judge lines forwarded to bots.
    pub forwarded: usize,
    /// Bot replies forwarded to the judge.
    pub replies: usize,
}

/// Drives one judge and its bots until the judge announces a ranking.
pub struct RelayLoop<'a, J, B> {
    judge: &'a mut J,
    bots: &'a mut [B],
    current: usize,
    stats: RelayStats,
}

impl<'a, J: LineEndpoint, B: LineEndpoint> RelayLoop<'a, J, B> {
    /// Bot 0 is the first designated bot.
    pub fn new(judge: &'a mut J, bots: &'a mut [B]) -> Self {
        RelayLoop {
            judge,
            bots,
            current: 0,
            stats: RelayStats::default(),
        }
    }

    /// Relay until the judge sends a negative exec code and a valid ranking.
    ///
    /// Any I/O failure or grammar violation ends the run with an error.
    pub fn run(mut self) -> Result<(RunResult, RelayStats), RefereeError> {
        if self.bots.is_empty() {
            return Err(RefereeError::Configuration("no bot to relay to".into()));
        }

        loop {
            let exec_code = self.await_code()?;
            self.stats.ticks += 1;

            match exec_code.cmp(&0) {
                Ordering::Less => {
                    let result = self.read_ranking()?;
                    return Ok((result, self.stats));
                }
                Ordering::Equal => {
                    trace!(bot = self.current, "bot skipped");
                    self.stats.skipped += 1;
                }
                Ordering::Greater => self.feed_bot(exec_code as u64)?,
            }

            self.current = (self.current + 1) % self.bots.len();
        }
    }

    fn await_code(&mut self) -> Result<i64, RefereeError> {
        let line = self.judge.read_line()?;
        line.trim().parse::<i64>().map_err(|_| {
            RefereeError::protocol(
                self.judge.name(),
                format!("expected an exec code, got '{line}'"),
            )
        })
    }

    fn feed_bot(&mut self, lines: u64) -> Result<(), RefereeError> {
        let bot = &mut self.bots[self.current];
        trace!(bot = self.current, lines, "feeding bot");

        for _ in 0..lines {
            let line = self.judge.read_line()?;
            bot.write_line(&line)?;
            self.stats.forwarded += 1;
        }

        let reply = bot.read_line()?;
        self.judge.write_line(&reply)?;
        self.stats.replies += 1;
        Ok(())
    }

    fn read_ranking(&mut self) -> Result<RunResult, RefereeError> {
        let line = self.judge.read_line()?;
        RunResult::parse(&line, self.bots.len())
            .map_err(|e| RefereeError::protocol(self.judge.name(), format!("bad ranking: {e}")))
    }
}
