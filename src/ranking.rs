//! Rank-frequency aggregation shared by every worker.

use std::sync::Mutex;

use tracing::trace;

use crate::relay::{RankingError, RunResult};

/// `counts[bot][rank]`: how many completed runs placed `bot` at `rank`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingMatrix {
    counts: Vec<Vec<u64>>,
}

impl RankingMatrix {
    /// An all-zero `nbots × nbots` matrix.
    pub fn new(nbots: usize) -> Self {
        RankingMatrix {
            counts: vec![vec![0; nbots]; nbots],
        }
    }

    /// Number of bots (and ranks).
    pub fn nbots(&self) -> usize {
        self.counts.len()
    }

    /// How many times `bot` finished at `rank`.
    pub fn count(&self, bot: usize, rank: usize) -> u64 {
        self.counts[bot][rank]
    }

    /// Counts of `bot` for every rank, best rank first.
    pub fn row(&self, bot: usize) -> &[u64] {
        &self.counts[bot]
    }

    /// Sum of every cell.
    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }


    /// Add one run. The result must already be valid for this matrix.
    fn apply(&mut self, result: &RunResult) {
        match result {
            // joint first place
            RunResult::Tied => self.counts.iter_mut().for_each(|row| row[0] += 1),
            RunResult::Ranked(order) => {
                for (rank, &bot) in order.iter().enumerate() {
                    self.counts[bot][rank] += 1;
                }
            }
        }
    }
}

/// The one piece of state crossing worker boundaries.
#[derive(Debug)]
pub struct RankingAggregator {
    nbots: usize,
    matrix: Mutex<RankingMatrix>,
}

impl RankingAggregator {
    /// Aggregator over `nbots` bots.
    pub fn new(nbots: usize) -> Self {
        RankingAggregator {
            nbots,
            matrix: Mutex::new(RankingMatrix::new(nbots)),
        }
    }

    /// Count one completed run.
    ///
    /// The result is validated before taking the lock; an invalid ranking changes nothing.
    pub fn record(&self, result: &RunResult) -> Result<(), RankingError> {
        result.validate(self.nbots)?;
        self.lock().apply(result);
        trace!(%result, "run aggregated");
        Ok(())
    }

    /// Copy of the current matrix.
    pub fn snapshot(&self) -> RankingMatrix {
        self.lock().clone()
    }

    /// The final matrix.
    pub fn into_matrix(self) -> RankingMatrix {
        self.matrix
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RankingMatrix> {
        // increments cannot leave the matrix half-updated, a poisoned lock is still usable
        self.matrix
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
