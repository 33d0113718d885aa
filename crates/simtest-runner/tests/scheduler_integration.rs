//! Integration tests: plan expansion, scheduling and supervision against
//! real shell processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use simtest_core::{
    BenchValue, Command, HandlerRef, ModuleResolver, RunRecord, RunStatus, StatsAggregator,
    StatsReport, TargetConfig, Testset,
};
use simtest_runner::{
    NoopObserver, ProcessSupervisor, Run, RunObserver, RunPlan, RunnerOptions, ScheduleOutcome,
    Scheduler,
};
use tokio::sync::watch;

fn options() -> RunnerOptions {
    RunnerOptions {
        threads: 2,
        load_average: 1.0,
        ..RunnerOptions::default()
    }
}

fn single(cmd: &str) -> Vec<Testset> {
    let mut root = Testset::new(std::env::temp_dir());
    root.set_name("it");
    root.new_test("t").add_command(Command::shell("run", cmd));
    vec![root]
}

async fn execute(
    forest: &[Testset],
    opts: &RunnerOptions,
    observer: Arc<dyn RunObserver>,
) -> (ScheduleOutcome, StatsReport) {
    let stats = Arc::new(StatsAggregator::new(forest));
    let (_tx, rx) = watch::channel(false);
    let outcome = Scheduler::new(opts)
        .run(RunPlan::expand(forest, opts), Arc::clone(&stats), observer, rx)
        .await;
    (outcome, stats.snapshot())
}

fn only_run(report: &StatsReport) -> RunRecord {
    let runs: Vec<_> = report.runs().cloned().collect();
    assert_eq!(runs.len(), 1, "expected exactly one run");
    runs.into_iter().next().unwrap()
}

/// Test: `true` passes with exit code 0.
#[tokio::test]
async fn test_true_passes() {
    let (outcome, report) = execute(&single("true"), &options(), Arc::new(NoopObserver)).await;
    assert_eq!(outcome.executed, 1);
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Passed);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.output.contains("--- Shell command: true ---"));
}

/// Test: `false` fails.
#[tokio::test]
async fn test_false_fails() {
    let (_, report) = execute(&single("false"), &options(), Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.exit_code, Some(1));
    assert_eq!(report.totals.failed, 1);
}

/// Test: an expected non-zero return code passes.
#[tokio::test]
async fn test_expected_retval() {
    let mut root = Testset::new(std::env::temp_dir());
    root.new_test("t")
        .add_command(Command::shell_with_retval("run", "exit 3", 3));
    let (_, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    assert_eq!(only_run(&report).status, RunStatus::Passed);
}

/// Test: the global timeout kills a long command after about a second.
#[tokio::test]
async fn test_timeout_kills_long_command() {
    let opts = RunnerOptions {
        max_timeout: Some(1.0),
        ..options()
    };
    let (_, report) = execute(&single("sleep 5"), &opts, Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.timed_out);
    assert!(run.output.contains("--- Timeout reached ---"));
    assert!(run.duration_secs >= 0.9, "duration {}", run.duration_secs);
    assert!(run.duration_secs < 4.0, "duration {}", run.duration_secs);
}

/// Test: a test declared on two targets yields two passing runs.
#[tokio::test]
async fn test_two_targets_pass() {
    let mut root = Testset::new(std::env::temp_dir());
    root.set_name("multi");
    root.add_target("a", TargetConfig::default());
    root.add_target("b", TargetConfig::default());
    root.new_test("t").add_command(Command::shell("run", "true"));

    let (outcome, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    assert_eq!(outcome.executed, 2);
    let test = &report.testsets[0].tests[0];
    assert_eq!(test.counters.passed, 2);
    let targets: Vec<&str> = test.runs.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["a", "b"]);
}

/// Test: a benchmark rule extracts the numeric value from the output.
#[tokio::test]
async fn test_benchmark_extraction() {
    let mut root = Testset::new(std::env::temp_dir());
    root.new_test("perf")
        .add_command(Command::shell("run", "echo 'Cycles: 420'"))
        .add_benchmark(r"Cycles: (\d+)", "cycles", "total cycles")
        .unwrap();

    let (_, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    assert_eq!(report.benchmarks.len(), 1);
    assert_eq!(report.benchmarks[0].metric, "cycles");
    assert_eq!(report.benchmarks[0].value, BenchValue::Number(420.0));
}

/// Test: target environment, properties and stderr merging.
#[tokio::test]
async fn test_target_env_and_placeholders() {
    let mut root = Testset::new(std::env::temp_dir());
    let mut config = TargetConfig::default();
    config.env.insert("SIMTEST_IT_VAR".to_string(), "from-env".to_string());
    config.properties.insert("chip".to_string(), json!("pulp"));
    root.add_target("rv", config);
    root.new_test("t").add_command(Command::shell(
        "run",
        "echo \"$SIMTEST_IT_VAR {chip} $SIMTEST_TARGET\"; echo to-stderr >&2",
    ));

    let (_, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Passed);
    assert!(run.output.contains("from-env pulp rv"), "output: {}", run.output);
    assert!(run.output.contains("to-stderr"));
}

/// Test: a target's sourceme script is sourced before each command, and
/// commands run in the test's directory.
#[tokio::test]
async fn test_sourceme_and_workdir() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().canonicalize().expect("canonicalize");
    let sourceme = dir.join("env.sh");
    std::fs::write(&sourceme, "export SIMTEST_IT_SOURCED=yes\n").expect("write sourceme");
    std::fs::write(dir.join("marker.txt"), "").expect("write marker");

    let mut root = Testset::new(&dir);
    root.add_target(
        "sim",
        TargetConfig {
            sourceme: Some(sourceme),
            ..TargetConfig::default()
        },
    );
    root.new_test("t").add_command(Command::shell(
        "run",
        "echo sourced=$SIMTEST_IT_SOURCED; test -f marker.txt",
    ));

    let (_, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Passed, "output: {}", run.output);
    assert!(run.output.contains("sourced=yes"));
}

/// Test: a checker sees earlier output and fails the run.
#[tokio::test]
async fn test_checker_after_shell() {
    let resolver = ModuleResolver::new();
    let handler = resolver.resolve("builtin::output_contains").unwrap();
    let mut root = Testset::new(std::env::temp_dir());
    root.new_test("t")
        .add_command(Command::shell("run", "echo KO"))
        .add_command(Command::Checker {
            name: "verify".to_string(),
            handler: HandlerRef {
                reference: "builtin::output_contains".to_string(),
                handler,
            },
            args: vec![json!("OK")],
            kwargs: Default::default(),
        })
        .add_command(Command::shell("never", "echo SHOULD-NOT-RUN"));

    let (_, report) = execute(&[root], &options(), Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.output.contains("--- Checker command ---"));
    assert!(!run.output.contains("SHOULD-NOT-RUN"));
}

/// Test: stored output is capped and flagged.
#[tokio::test]
async fn test_output_truncation() {
    let opts = RunnerOptions {
        max_output_len: Some(64),
        ..options()
    };
    let (_, report) = execute(&single("seq 1 1000"), &opts, Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert_eq!(run.status, RunStatus::Passed);
    assert!(run.truncated);
    assert!(run.output.len() < 128);
}

#[derive(Default)]
struct ConcurrencyObserver {
    current: AtomicUsize,
    max: AtomicUsize,
    lines: Mutex<Vec<String>>,
}

impl RunObserver for ConcurrencyObserver {
    fn on_start(&self, _run: &Run) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn on_output_line(&self, _run: &Run, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn on_complete(&self, _run: &Run, _record: &RunRecord) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Test: no more than `threads` runs execute at once, and output is
/// streamed line by line.
#[tokio::test]
async fn test_worker_count_bounds_concurrency() {
    let mut root = Testset::new(std::env::temp_dir());
    for i in 0..6 {
        root.new_test(&format!("t{i}"))
            .add_command(Command::shell("run", "echo streamed; sleep 0.2"));
    }
    let observer = Arc::new(ConcurrencyObserver::default());
    let (outcome, report) = execute(&[root], &options(), observer.clone()).await;

    assert_eq!(outcome.executed, 6);
    assert_eq!(report.totals.passed, 6);
    let max = observer.max.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "max concurrency {max}");
    let lines = observer.lines.lock().unwrap();
    assert_eq!(lines.iter().filter(|l| l.as_str() == "streamed").count(), 6);
}

/// Test: an interrupt terminates the in-flight run and records it failed.
#[tokio::test]
async fn test_interrupt_terminates_in_flight_run() {
    let forest = single("sleep 10");
    let opts = RunnerOptions {
        threads: 1,
        ..options()
    };
    let stats = Arc::new(StatsAggregator::new(&forest));
    let (tx, rx) = watch::channel(false);
    let scheduler =
        Scheduler::new(&opts).with_supervisor(ProcessSupervisor::new(None).with_grace(Duration::from_millis(200)));

    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).expect("scheduler listening");
        tx
    });

    let started = std::time::Instant::now();
    let outcome = scheduler
        .run(RunPlan::expand(&forest, &opts), Arc::clone(&stats), Arc::new(NoopObserver), rx)
        .await;
    let _tx = interrupter.await.unwrap();

    assert!(outcome.interrupted);
    assert!(started.elapsed() < Duration::from_secs(5));
    let run = only_run(&stats.snapshot());
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.message.as_deref(), Some("interrupted"));
}

fn process_alive(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)
        .is_some_and(|p| p.status() != sysinfo::ProcessStatus::Zombie)
}

/// Polls until `pid` is gone, for up to two seconds.
async fn wait_gone(pid: u32) -> bool {
    for _ in 0..20 {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn read_pid(path: &std::path::Path) -> u32 {
    std::fs::read_to_string(path)
        .expect("pid file written")
        .trim()
        .parse()
        .expect("pid file holds a pid")
}

/// Test: a timeout also kills processes that were reparented away from the
/// shell but stayed in its process group.
#[cfg(unix)]
#[tokio::test]
async fn test_timeout_kills_reparented_background_process() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().canonicalize().expect("canonicalize");
    let mut root = Testset::new(&dir);
    root.new_test("t").add_command(Command::shell(
        "run",
        "( sleep 37 & echo $! > bg.pid ); sleep 30",
    ));
    let opts = RunnerOptions {
        max_timeout: Some(1.0),
        ..options()
    };

    let (_, report) = execute(&[root], &opts, Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert!(run.timed_out);

    let orphan = read_pid(&dir.join("bg.pid"));
    assert!(wait_gone(orphan).await, "background process {orphan} survived the timeout");
}

/// Test: a timeout inside a script checker kills the script.
#[cfg(unix)]
#[tokio::test]
async fn test_timeout_kills_script_checker() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().canonicalize().expect("canonicalize");
    let script = dir.join("slow.sh");
    std::fs::write(&script, "#!/bin/sh\necho $$ > checker.pid\nexec sleep 38\n").expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    std::fs::write(dir.join("checks.yaml"), "handlers:\n  slow:\n    script: slow.sh\n").expect("write module");

    let resolver = ModuleResolver::with_base(vec![dir.clone()]);
    let handler = resolver.resolve("checks::slow").expect("script handler resolves");
    let mut root = Testset::new(&dir);
    root.new_test("t").add_command(Command::Checker {
        name: "slow".to_string(),
        handler: HandlerRef {
            reference: "checks::slow".to_string(),
            handler,
        },
        args: Vec::new(),
        kwargs: Default::default(),
    });
    let opts = RunnerOptions {
        max_timeout: Some(1.0),
        ..options()
    };

    let started = std::time::Instant::now();
    let (_, report) = execute(&[root], &opts, Arc::new(NoopObserver)).await;
    let run = only_run(&report);
    assert!(run.timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid = read_pid(&dir.join("checker.pid"));
    assert!(wait_gone(pid).await, "checker script {pid} survived the timeout");
}
