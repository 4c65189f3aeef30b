//! Runs many independent matches over a bounded pool of workers.
//!
//! Each worker takes the next [`RunDescriptor`], plays it end to end (spawn, relay,
//! aggregate, cleanup) and only then takes another one. A run is a function of its
//! descriptor and the immutable [`Configuration`]; the only state shared between workers is
//! the [`RankingAggregator`].
//!
//! A failing run is logged and dropped, it never stops its siblings nor the scheduler.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Display,
    path::PathBuf,
    sync::{mpsc, Arc, Mutex},
    thread,
};

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use crate::{
    configuration::Configuration,
    error::RefereeError,
    process::{CancelToken, ProcessHandle},
    ranking::{RankingAggregator, RankingMatrix},
    relay::{RelayLoop, RelayStats, RunResult},
    report::{named_ranking, ScoreLog},
};

/// One run to play. Seeds are assigned before scheduling starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDescriptor {
    /// Zero-based index of the run.
    pub run_index: usize,
    /// Where judge and bot stderr go, if logged.
    pub log_dir: Option<PathBuf>,
    /// Seed handed to the judge.
    pub seed: u64,
}

impl Display for RunDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {:03} (seed {})", self.run_index + 1, self.seed)
    }
}

/// Build one descriptor per seed, in index order.
///
/// When stderr logging is on, each run gets a fresh `run_NNN` directory under the game
/// directory; a leftover directory from a previous batch is emptied.
pub fn plan_runs(config: &Configuration, seeds: &[u64]) -> anyhow::Result<Vec<RunDescriptor>> {
    seeds
        .iter()
        .enumerate()
        .map(|(run_index, &seed)| {
            let log_dir = if config.log_stderr {
                let dir = config
                    .game_dir()
                    .join(format!("run_{:03}", run_index + 1));
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)
                        .with_context(|| format!("could not clear '{}'", dir.display()))?;
                }
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("could not create '{}'", dir.display()))?;
                Some(dir)
            } else {
                None
            };
            Ok(RunDescriptor {
                run_index,
                log_dir,
                seed,
            })
        })
        .collect()
}

/// Play one run: spawn the judge and the bots, relay until the ranking, stop everything.
///
/// Every process is stopped exactly once whatever the outcome; processes started before a
/// launch failure are stopped when dropped.
#[instrument(skip_all, fields(run = descriptor.run_index, seed = descriptor.seed))]
pub fn execute_run(
    descriptor: &RunDescriptor,
    config: &Configuration,
    cancel: CancelToken,
) -> Result<(RunResult, RelayStats), RefereeError> {
    let log_dir = descriptor.log_dir.as_deref();
    let judge_spec = &config.judge;

    let judge_log = log_dir.map(|dir| dir.join(format!("{}.log", judge_spec.name)));
    let mut judge = ProcessHandle::start(
        &judge_spec.name,
        &judge_spec.executable,
        &judge_spec.arguments_for_run(descriptor.seed, config.bots.len()),
        judge_log.as_deref(),
    )?
    .with_timeout(config.read_timeout)
    .with_cancel_token(cancel.clone());

    let mut bots = Vec::with_capacity(config.bots.len());
    for spec in &config.bots {
        let bot_log = log_dir.map(|dir| dir.join(format!("{}.err", spec.name)));
        let bot = ProcessHandle::start(
            &spec.name,
            &spec.executable,
            &spec.arguments,
            bot_log.as_deref(),
        )?
        .with_timeout(config.read_timeout)
        .with_cancel_token(cancel.clone());
        bots.push(bot);
    }

    let outcome = RelayLoop::new(&mut judge, &mut bots).run();

    judge.stop();
    bots.iter_mut().for_each(ProcessHandle::stop);
    outcome
}

/// Result of a whole batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Aggregated ranks of the completed runs.
    pub matrix: RankingMatrix,
    /// Number of runs that produced a result.
    pub completed: usize,
    /// `(run index, reason)` of every failed run, by index.
    pub failed: Vec<(usize, String)>,
}

/// Lets another thread see which runs are in flight and force-fail one of them.
#[derive(Debug, Clone, Default)]
pub struct Canceller {
    running: Arc<Mutex<BTreeMap<usize, CancelToken>>>,
}

impl Canceller {
    /// Indices of the runs currently being played, sorted.
    pub fn running(&self) -> Vec<usize> {
        self.lock().keys().copied().collect()
    }

    /// Fire the token of `run_index`. Returns false if that run is not in flight.
    pub fn cancel(&self, run_index: usize) -> bool {
        match self.lock().get(&run_index) {
            Some(token) => {
                warn!(run_index, "cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn register(&self, run_index: usize) -> CancelToken {
        let token = CancelToken::new();
        self.lock().insert(run_index, token.clone());
        token
    }

    fn unregister(&self, run_index: usize) {
        self.lock().remove(&run_index);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, CancelToken>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Dispatches runs to a pool of `Configuration::workers` threads.
pub struct RunScheduler {
    config: Arc<Configuration>,
    canceller: Canceller,
    score_log: Option<Arc<ScoreLog>>,
}

impl RunScheduler {
    /// Scheduler for an already validated configuration.
    pub fn new(config: Configuration) -> Self {
        RunScheduler {
            config: Arc::new(config),
            canceller: Canceller::default(),
            score_log: None,
        }
    }

    /// Append every completed run's ranking to `log`.
    pub fn with_score_log(mut self, log: ScoreLog) -> Self {
        self.score_log = Some(Arc::new(log));
        self
    }

    /// Handle to the in-flight runs of this scheduler.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Play every descriptor and aggregate the completed ones.
    ///
    /// With one worker runs are played strictly in the given order. With more, completion
    /// order is unspecified but the final matrix is the same.
    pub fn execute(&self, descriptors: Vec<RunDescriptor>) -> BatchOutcome {
        let total = descriptors.len();
        let nbots = self.config.bots.len();
        let workers = self.config.workers.clamp(1, total.max(1));
        info!(runs = total, workers, "starting batch");

        let worker = Worker {
            config: self.config.clone(),
            aggregator: Arc::new(RankingAggregator::new(nbots)),
            canceller: self.canceller.clone(),
            score_log: self.score_log.clone(),
        };
        let queue = Arc::new(Mutex::new(VecDeque::from(descriptors)));
        let (tx_result, rx_result) = mpsc::channel();

        let handles = (0..workers)
            .map(|id| {
                let worker = worker.clone();
                let queue = queue.clone();
                let tx_result = tx_result.clone();
                thread::Builder::new()
                    .name(format!("referee-worker-{id}"))
                    .spawn(move || worker.drain(&queue, &tx_result))
            })
            .collect::<Vec<_>>();
        drop(tx_result);

        let names = self
            .config
            .bots
            .iter()
            .map(|b| b.name.clone())
            .collect::<Vec<_>>();
        let mut completed = 0;
        let mut failed = vec![];

        // every worker dropping its sender ends this loop
        for (descriptor, result) in rx_result {
            if self.config.verbose {
                let done = completed + failed.len() + 1;
                print_run_result(&descriptor, &result, &names, done, total);
            }
            match result {
                Ok(_) => completed += 1,
                Err(e) => failed.push((descriptor.run_index, format!("{}: {e}", e.kind()))),
            }
            if self.config.verbose {
                print_running_runs(&self.canceller.running());
            }
        }

        for handle in handles {
            match handle {
                Ok(handle) => {
                    if handle.join().is_err() {
                        error!("a worker panicked");
                    }
                }
                Err(e) => error!("could not spawn worker: {e}"),
            }
        }

        // runs a worker never got to (spawn failure or panic) count as failed
        let leftovers = std::mem::take(&mut *queue.lock().unwrap_or_else(|p| p.into_inner()));
        failed.extend(
            leftovers
                .into_iter()
                .map(|d| (d.run_index, "run was never scheduled".to_string())),
        );
        failed.sort_by_key(|(index, _)| *index);

        if self.config.verbose {
            clear_line();
        }
        info!(completed, failed = failed.len(), "batch finished");

        BatchOutcome {
            matrix: worker.aggregator.snapshot(),
            completed,
            failed,
        }
    }
}

type RunMessage = (RunDescriptor, Result<RunResult, RefereeError>);

#[derive(Clone)]
struct Worker {
    config: Arc<Configuration>,
    aggregator: Arc<RankingAggregator>,
    canceller: Canceller,
    score_log: Option<Arc<ScoreLog>>,
}

impl Worker {
    fn drain(&self, queue: &Mutex<VecDeque<RunDescriptor>>, tx_result: &mpsc::Sender<RunMessage>) {
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(descriptor) = next else {
                break;
            };
            let result = self.play(&descriptor);
            if tx_result.send((descriptor, result)).is_err() {
                break;
            }
        }
    }

    fn play(&self, descriptor: &RunDescriptor) -> Result<RunResult, RefereeError> {
        let run_index = descriptor.run_index;
        let token = self.canceller.register(run_index);
        let outcome = execute_run(descriptor, &self.config, token);
        self.canceller.unregister(run_index);

        match outcome {
            Ok((result, stats)) => {
                self.aggregator
                    .record(&result)
                    .map_err(|e| RefereeError::protocol(&self.config.judge.name, e.to_string()))?;
                if let Some(log) = &self.score_log {
                    log.append(run_index, &result);
                }
                info!(run_index, %result, ?stats, "run completed");
                Ok(result)
            }
            Err(e) => {
                warn!(run_index, kind = e.kind(), "run failed: {e}");
                Err(e)
            }
        }
    }
}

fn print_run_result(
    descriptor: &RunDescriptor,
    result: &Result<RunResult, RefereeError>,
    names: &[String],
    done: usize,
    total: usize,
) {
    // clear line, green run, result or red error, start of line
    match result {
        Ok(ranking) => println!(
            "\x1b[2K\x1b[32m[{done}/{total}] {descriptor}: \x1b[39mranking = {}\x1b[0G",
            named_ranking(ranking, names)
        ),
        Err(e) => println!(
            "\x1b[2K\x1b[32m[{done}/{total}] {descriptor}: \x1b[31m{e}\x1b[39m\x1b[0G"
        ),
    }
}

fn print_running_runs(running: &[usize]) {
    if running.is_empty() {
        return;
    }
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(|i| format!("run {:03}", i + 1))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn clear_line() {
    print!("\x1b[2K\x1b[0G");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{BotSpec, JudgeSpec};

    fn config(judge_script: &str, bots: usize) -> Configuration {
        let judge = JudgeSpec::new(
            "scripted",
            "sh",
            vec!["-c".into(), judge_script.into(), "judge".into(), "{seed}".into()],
        );
        let bots = (0..bots)
            .map(|i| BotSpec::new(format!("bot{i}"), "sh", vec!["-c".into(), "exec cat".into()]))
            .collect();
        Configuration::new(judge, bots).with_verbose(false)
    }

    fn descriptors(seeds: &[u64]) -> Vec<RunDescriptor> {
        seeds
            .iter()
            .enumerate()
            .map(|(run_index, &seed)| RunDescriptor {
                run_index,
                log_dir: None,
                seed,
            })
            .collect()
    }

    #[test]
    fn descriptor_display() {
        let d = RunDescriptor {
            run_index: 4,
            log_dir: None,
            seed: 99,
        };
        assert_eq!(d.to_string(), "run 005 (seed 99)");
    }

    #[test]
    fn echoed_line_comes_back_to_the_judge() {
        // the judge ranks the bots in the order given by the echoed line
        let script = r#"echo 1; echo "1 0"; read reply; echo -1; echo "$reply""#;
        let config = config(script, 2);
        let (result, stats) =
            execute_run(&descriptors(&[1])[0], &config, CancelToken::new()).unwrap();
        assert_eq!(result, RunResult::Ranked(vec![1, 0]));
        assert_eq!(stats.replies, 1);
    }

    #[test]
    fn seed_reaches_the_judge() {
        let script = r#"echo -1; if [ "$1" = 7 ]; then echo tied; else echo "0 1"; fi"#;
        let config = config(script, 2);
        let (result, _) =
            execute_run(&descriptors(&[7])[0], &config, CancelToken::new()).unwrap();
        assert_eq!(result, RunResult::Tied);
    }

    #[test]
    fn failing_runs_are_counted_not_propagated() {
        let script = r#"if [ "$1" -lt 3 ]; then echo -1; echo "0 1"; else echo nonsense; fi"#;
        let scheduler = RunScheduler::new(config(script, 2).with_workers(2));
        let outcome = scheduler.execute(descriptors(&[0, 1, 2, 3, 4]));

        assert_eq!(outcome.completed, 3);
        assert_eq!(
            outcome.failed.iter().map(|f| f.0).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(outcome.matrix.count(0, 0), 3);
        assert_eq!(outcome.matrix.total(), 6);
    }

    #[test]
    fn missing_judge_fails_every_run() {
        let mut config = config("", 2);
        config.judge.executable = "/no/such/judge".into();
        let outcome = RunScheduler::new(config.with_workers(3)).execute(descriptors(&[1, 2]));
        assert_eq!(outcome.completed, 0);
        assert!(outcome.failed.iter().all(|(_, why)| why.starts_with("launch error")));
        assert_eq!(outcome.matrix.total(), 0);
    }

    #[test]
    fn stuck_run_can_be_cancelled() {
        let config = config("exec sleep 30", 2).with_workers(1);
        let scheduler = RunScheduler::new(config);
        let canceller = scheduler.canceller();

        let watcher = thread::spawn(move || {
            while !canceller.cancel(0) {
                thread::sleep(std::time::Duration::from_millis(10));
            }
        });
        let outcome = scheduler.execute(descriptors(&[5]));
        watcher.join().unwrap();

        assert_eq!(outcome.completed, 0);
        assert!(outcome.failed[0].1.starts_with("cancelled"));
        assert!(scheduler.canceller().running().is_empty());
    }
}
