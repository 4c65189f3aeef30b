//! Final statistics and the persisted logs of a batch.

use std::{
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Mutex,
};

use anyhow::Context;
use tracing::warn;

use crate::{ranking::RankingMatrix, relay::RunResult};

/// Rank percentages of every bot over the configured number of runs.
#[derive(Debug, Clone)]
pub struct Report {
    names: Vec<String>,
    matrix: RankingMatrix,
    runs: usize,
    failed: Vec<(usize, String)>,
}

impl Report {
    /// `runs` is the configured run count, `failed` the `(run index, reason)` of failed runs.
    pub fn new(
        names: Vec<String>,
        matrix: RankingMatrix,
        runs: usize,
        failed: Vec<(usize, String)>,
    ) -> Self {
        debug_assert_eq!(names.len(), matrix.nbots());
        Report {
            names,
            matrix,
            runs,
            failed,
        }
    }

    /// Bot names, in index order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The aggregated counts.
    pub fn matrix(&self) -> &RankingMatrix {
        &self.matrix
    }

    /// Configured number of runs.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Runs that ended with an error, by index.
    pub fn failed(&self) -> &[(usize, String)] {
        &self.failed
    }

    /// Runs that produced a result.
    pub fn completed(&self) -> usize {
        self.runs.saturating_sub(self.failed.len())
    }

    /// Share of the configured runs in which `bot` finished at `rank`.
    pub fn percentage(&self, bot: usize, rank: usize) -> f64 {
        if self.runs == 0 {
            return 0.0;
        }
        self.matrix.count(bot, rank) as f64 * 100.0 / self.runs as f64
    }

    /// Persist the table to `path`.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("could not create ranking log '{}'", path.display()))?;
        let mut writer = BufWriter::new(file);
        write!(writer, "{self}")?;
        writer.flush()?;
        Ok(())
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = (1..=self.matrix.nbots())
            .map(ordinal)
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(f, "bot\t{header}")?;

        for (bot, name) in self.names.iter().enumerate() {
            let row = (0..self.matrix.nbots())
                .map(|rank| format!("{:.2}", self.percentage(bot, rank)))
                .collect::<Vec<_>>()
                .join("\t");
            writeln!(f, "{name}\t{row}")?;
        }
        writeln!(f, "failed runs: {} / {}", self.failed.len(), self.runs)
    }
}

fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// `scores.log`: one line per completed run, in completion order.
#[derive(Debug)]
pub struct ScoreLog {
    writer: Mutex<BufWriter<File>>,
}

impl ScoreLog {
    /// Create (or truncate) the log at `path`.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("could not create score log '{}'", path.display()))?;
        Ok(ScoreLog {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append `<run index> <ranking>`. A write failure is logged, never fatal.
    pub fn append(&self, run_index: usize, result: &RunResult) {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{run_index} {result}").and_then(|_| writer.flush()) {
            warn!(run_index, "could not write score log: {e}");
        }
    }
}

/// Human readable ranking with bot names, e.g. `alice; bob`.
pub fn named_ranking(result: &RunResult, names: &[String]) -> String {
    match result {
        RunResult::Tied => "tied".to_string(),
        RunResult::Ranked(order) => order
            .iter()
            .map(|&i| names[i].as_str())
            .collect::<Vec<_>>()
            .join("; "),
    }
}
