use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use bot_referee::prelude::*;
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[allow(dead_code)]
fn init_debug_logger() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(true)
        .with_thread_names(true)
        .with_target(false)
        .without_time()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn agent(path: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/agents")
        .join(path)
        .display()
        .to_string()
}

fn judge(script: &str) -> JudgeSpec {
    JudgeSpec::new(
        "test_game",
        "sh",
        vec![agent(script), "{bots}".into(), "{seed}".into()],
    )
}

fn ack_bots(n: usize) -> Vec<BotSpec> {
    (0..n)
        .map(|i| BotSpec::new(format!("bot{i}"), "sh", vec![agent("bots/ack.sh")]))
        .collect()
}

/// False once `pid` is gone or a zombie.
fn alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            let state = stat.rsplit(')').next().and_then(|s| s.split_whitespace().next());
            state != Some("Z")
        })
        .unwrap_or(false)
}

fn quiet_config(judge: JudgeSpec, bots: Vec<BotSpec>, out: &TempDir) -> Configuration {
    Configuration::new(judge, bots)
        .with_verbose(false)
        .with_output_dir(out.path())
}

#[test]
fn sequential_and_concurrent_batches_agree() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/rotating.sh"), ack_bots(3), &out)
        .with_runs(12)
        .with_master_seed(42);

    let sequential = Referee::new(config.clone().with_workers(1))
        .unwrap()
        .run()
        .unwrap();
    let concurrent = Referee::new(config.with_workers(4))
        .unwrap()
        .run()
        .unwrap();

    assert!(sequential.failed().is_empty(), "{:?}", sequential.failed());
    assert_eq!(sequential.matrix(), concurrent.matrix());
    assert_eq!(sequential.matrix().total(), 12 * 3);
}

#[test]
fn single_worker_plays_runs_in_index_order() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/rotating.sh"), ack_bots(2), &out)
        .with_runs(6)
        .with_workers(1)
        .with_master_seed(9)
        .with_log_scores(true);

    let report = Referee::new(config).unwrap().run().unwrap();
    assert_eq!(report.completed(), 6);

    let scores = std::fs::read_to_string(out.path().join("test_game/scores.log")).unwrap();
    let order = scores
        .lines()
        .map(|line| line.split_whitespace().next().unwrap().parse::<usize>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(order, (0..6).collect::<Vec<_>>());
}

#[test]
fn broken_runs_do_not_stop_their_siblings() {
    let out = TempDir::new().unwrap();
    // seeds 5 and 10 make the judge quit without a ranking
    let config = quiet_config(judge("judges/flaky.sh"), ack_bots(2), &out)
        .with_runs(10)
        .with_seeds((1..=10).collect())
        .with_workers(3);

    let report = Referee::new(config).unwrap().run().unwrap();

    assert_eq!(report.completed(), 8);
    assert_eq!(report.failed().len(), 2);
    assert!(report
        .failed()
        .iter()
        .all(|(_, why)| why.starts_with("protocol error")));
    assert_eq!(report.matrix().count(0, 0), 8);
    assert!((report.percentage(0, 0) - 80.0).abs() < 1e-9);
    assert!((report.percentage(1, 1) - 80.0).abs() < 1e-9);
}

#[test]
fn tie_counts_as_first_place_for_everyone() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/tie.sh"), ack_bots(3), &out)
        .with_runs(1)
        .with_master_seed(3);

    let report = Referee::new(config).unwrap().run().unwrap();

    for bot in 0..3 {
        assert_eq!(report.matrix().row(bot), &[1, 0, 0]);
    }
    assert_eq!(report.matrix().total(), 3);
}

#[test]
fn duplicate_ranking_is_rejected() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/duplicate.sh"), ack_bots(2), &out).with_runs(2);

    let report = Referee::new(config).unwrap().run().unwrap();

    assert_eq!(report.completed(), 0);
    assert_eq!(report.matrix().total(), 0);
    // the table is still complete
    assert_eq!(report.to_string().lines().count(), 1 + 2 + 1);
}

#[test]
fn silent_bot_times_out() {
    let out = TempDir::new().unwrap();
    let bots = vec![
        BotSpec::new("ack", "sh", vec![agent("bots/ack.sh")]),
        BotSpec::new("silent", "sh", vec![agent("bots/silent.sh")]),
    ];
    let config = quiet_config(judge("judges/rotating.sh"), bots, &out)
        .with_runs(2)
        .with_workers(2)
        .with_read_timeout(Duration::from_millis(300));

    let report = Referee::new(config).unwrap().run().unwrap();

    assert_eq!(report.failed().len(), 2);
    assert!(report
        .failed()
        .iter()
        .all(|(_, why)| why.starts_with("timeout")));
}

#[test]
fn bot_not_reading_its_input_times_out() {
    let out = TempDir::new().unwrap();
    let bots = vec![BotSpec::new("deaf", "sh", vec![agent("bots/silent.sh")])];
    let config = quiet_config(judge("judges/flood.sh"), bots, &out)
        .with_runs(1)
        .with_workers(1)
        .with_read_timeout(Duration::from_millis(300));

    let start = Instant::now();
    let report = Referee::new(config).unwrap().run().unwrap();

    assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    assert_eq!(report.failed().len(), 1);
    assert!(report.failed()[0].1.starts_with("timeout"), "{:?}", report.failed());
}

#[test]
fn every_bot_is_gone_after_the_batch() {
    let out = TempDir::new().unwrap();
    let pid_file = out.path().join("pids");
    let bots = (0..3)
        .map(|i| {
            BotSpec::new(
                format!("bot{i}"),
                "sh",
                vec![agent("bots/pid.sh"), out.path().display().to_string()],
            )
        })
        .collect::<Vec<_>>();

    // one batch ending normally, one ending on a protocol error
    for (script, completed) in [("judges/rotating.sh", 2), ("judges/garbage.sh", 0)] {
        let _ = std::fs::remove_file(&pid_file);
        let config = quiet_config(judge(script), bots.clone(), &out)
            .with_runs(2)
            .with_workers(2);

        let report = Referee::new(config).unwrap().run().unwrap();
        assert_eq!(report.completed(), completed, "{script}");

        let pids = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(pids.lines().count(), 2 * 3, "{script}");
        for pid in pids.lines().map(|p| p.trim().parse::<u32>().unwrap()) {
            assert!(!alive(pid), "{script}: bot {pid} outlived its run");
        }
    }
}

#[test]
fn missing_bot_binary_fails_runs_not_batch() {
    let out = TempDir::new().unwrap();
    let mut bots = ack_bots(1);
    bots.push(BotSpec::new("ghost", "/no/such/bot/binary", vec![]));
    let config = quiet_config(judge("judges/rotating.sh"), bots, &out).with_runs(3);

    let report = Referee::new(config).unwrap().run().unwrap();

    assert_eq!(report.completed(), 0);
    assert!(report
        .failed()
        .iter()
        .all(|(_, why)| why.starts_with("launch error")));
    assert_eq!(report.percentage(0, 0), 0.0);
}

#[test]
fn logs_are_written_per_run() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/rotating.sh"), ack_bots(2), &out)
        .with_runs(2)
        .with_master_seed(1)
        .with_log_stderr(true)
        .with_log_scores(true);

    let report = Referee::new(config).unwrap().run().unwrap();
    assert_eq!(report.completed(), 2);

    let game_dir = out.path().join("test_game");
    for run in ["run_001", "run_002"] {
        let dir = game_dir.join(run);
        let judge_log = std::fs::read_to_string(dir.join("test_game.log")).unwrap();
        assert!(judge_log.contains("acknowledged"));
        let bot_log = std::fs::read_to_string(dir.join("bot0.err")).unwrap();
        assert!(bot_log.starts_with("got: seed"));
    }

    let scores = std::fs::read_to_string(game_dir.join("scores.log")).unwrap();
    assert_eq!(scores.lines().count(), 2);

    let ranking = std::fs::read_to_string(game_dir.join("ranking.log")).unwrap();
    assert_eq!(ranking, report.to_string());
}

#[test]
fn parameter_file_drives_a_batch() {
    let out = TempDir::new().unwrap();
    let json = format!(
        r#"{{
            "Game": {{ "Name": "from_file", "Game bin": "sh",
                       "Arguments": ["{judge}", "{{bots}}", "{{seed}}"] }},
            "Bots": [
                {{ "Name": "a", "Bin": "sh", "Arguments": ["{bot}"] }},
                {{ "Name": "b", "Bin": "sh", "Arguments": ["{bot}"] }}
            ],
            "Settings": {{ "Runs": 4, "Workers": 2, "Log stderr": false, "Log scores": false,
                           "Seed": 11, "Output dir": "{out}", "Verbose": false }}
        }}"#,
        judge = agent("judges/rotating.sh"),
        bot = agent("bots/ack.sh"),
        out = out.path().display(),
    );
    let path = out.path().join("params.json");
    std::fs::write(&path, json).unwrap();

    let config = Configuration::from_json_file(&path).unwrap();
    let report = Referee::new(config).unwrap().run().unwrap();

    assert_eq!(report.names(), ["a", "b"]);
    assert_eq!(report.completed(), 4);
    assert!(out.path().join("from_file/ranking.log").exists());
}

#[test]
fn invalid_configuration_is_refused_up_front() {
    let out = TempDir::new().unwrap();
    let config = quiet_config(judge("judges/rotating.sh"), vec![], &out);
    let err = Referee::new(config).unwrap_err();
    assert!(err.to_string().contains("at least one bot"));

    let config = quiet_config(judge("judges/rotating.sh"), ack_bots(2), &out)
        .with_runs(3)
        .with_seeds(vec![1, 2]);
    let err = Referee::new(config).unwrap().run().unwrap_err();
    assert!(err.to_string().contains("only 2 seeds"));
}
