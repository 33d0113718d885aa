//! simtest - hierarchical test orchestration CLI
//!
//! The `simtest` command loads testset definition files, expands them
//! into runs for every selected target and executes them on a
//! load-aware worker pool.
//!
//! ## Commands
//!
//! - `tests`: List the loaded testset tree
//! - `run`: Execute the runs
//! - `table`: Execute, then print the results table
//! - `summary`: Execute, then print the pass/fail summary
//! - `junit`: Execute, then write JUnit XML files
//! - `all`: Execute, then table + summary + junit

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use simtest_core::telemetry::init_tracing;
use simtest_core::{
    render_summary, render_table, render_tests, write_json_report, write_junit_files, BenchCsv,
    ConfigResolver, DefinitionLoader, GlobalBenchRule, JsonReport, ModuleResolver, RunRecord,
    RunStatus, StatsAggregator, Testset, DEFAULT_BENCH_PATTERN, DEFINITION_FILENAME,
};
use simtest_runner::{
    Run, RunObserver, RunPlan, RunnerOptions, Scheduler, SessionVerdict, DEFAULT_LOAD_AVERAGE,
    DEFAULT_PLATFORM,
};

#[derive(Parser, Debug)]
#[command(name = "simtest")]
#[command(version = simtest_core::VERSION)]
#[command(about = "Hierarchical test orchestration for multi-target simulation suites", long_about = None)]
struct Cli {
    /// What to do
    #[arg(value_enum, default_value = "all")]
    commands: Vec<Action>,

    /// Testset definition file (repeatable)
    #[arg(long = "testset")]
    testsets: Vec<PathBuf>,

    /// Active target (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Label of runs on the default target
    #[arg(long, default_value = "default")]
    config: String,

    /// Worker count (0 = one per CPU)
    #[arg(short = 'j', long, env = "SIMTEST_THREADS", default_value_t = 0)]
    threads: usize,

    /// Load ceiling as a fraction of CPUs (1.0 disables throttling)
    #[arg(long, env = "SIMTEST_LOAD_AVERAGE", default_value_t = DEFAULT_LOAD_AVERAGE)]
    load_average: f64,

    /// Timeout cap in seconds for every run (negative = none)
    #[arg(long, env = "SIMTEST_MAX_TIMEOUT", allow_hyphen_values = true)]
    max_timeout: Option<f64>,

    /// Only run tests whose full name starts with this prefix (repeatable)
    #[arg(long = "test")]
    tests: Vec<String>,

    /// Skip tests whose full name starts with this prefix (repeatable)
    #[arg(long = "skip")]
    skips: Vec<String>,

    /// Only execute commands with this name (repeatable)
    #[arg(long = "cmd")]
    cmds: Vec<String>,

    /// Never execute commands with this name (repeatable)
    #[arg(long = "cmd-exclude")]
    cmd_excludes: Vec<String>,

    /// Extra flags, available as the {flags} placeholder
    #[arg(long = "flags", allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Property visible to definitions and placeholders (name=value)
    #[arg(long = "property")]
    properties: Vec<String>,

    /// Platform visible to definition guards
    #[arg(long, default_value = DEFAULT_PLATFORM)]
    platform: String,

    /// Root for build directories of make/gvrun tests
    #[arg(long, env = "SIMTEST_WORKDIR")]
    build_root: Option<PathBuf>,

    /// Stream run output as it is produced
    #[arg(long)]
    stdout: bool,

    /// Print each run's whole output once it finishes
    #[arg(long)]
    safe_stdout: bool,

    /// Cap on stored output bytes per run
    #[arg(long, env = "SIMTEST_MAX_OUTPUT_LEN")]
    max_output_len: Option<usize>,

    /// Show every run in the table, not only failures
    #[arg(long)]
    dump_all: bool,

    /// Exit with 0 even when runs failed
    #[arg(long)]
    no_fail: bool,

    /// Benchmark CSV file to update
    #[arg(long)]
    bench_csv_file: Option<PathBuf>,

    /// Line pattern with `value`, `desc` and optional `name` groups
    #[arg(long, default_value = DEFAULT_BENCH_PATTERN)]
    bench_regexp: String,

    /// Directory receiving TEST-<testset>.xml files
    #[arg(long, default_value = "junit-reports")]
    junit_report_path: PathBuf,

    /// Write a JSON report of the session
    #[arg(long)]
    json_report: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Tests,
    Run,
    Table,
    Summary,
    Junit,
    All,
}

impl Cli {
    fn runner_options(&self) -> Result<RunnerOptions> {
        let mut properties = BTreeMap::new();
        for raw in &self.properties {
            let (name, value) = RunnerOptions::parse_property(raw)?;
            properties.insert(name, value);
        }

        let defaults = RunnerOptions::default();
        Ok(RunnerOptions {
            active_targets: if self.targets.is_empty() {
                defaults.active_targets
            } else {
                self.targets.clone()
            },
            config: self.config.clone(),
            threads: self.threads,
            load_average: self.load_average,
            max_timeout: self.max_timeout,
            test_filters: self.tests.clone(),
            skip_filters: self.skips.clone(),
            commands: self.cmds.clone(),
            commands_exclude: self.cmd_excludes.clone(),
            flags: self.flags.clone(),
            properties,
            platform: self.platform.clone(),
            build_root: self.build_root.clone(),
            max_output_len: self.max_output_len,
        })
    }

    fn wants(&self, action: Action) -> bool {
        self.commands.contains(&action) || self.commands.contains(&Action::All)
    }

    fn needs_execution(&self) -> bool {
        self.commands.iter().any(|a| *a != Action::Tests)
    }

    fn testset_files(&self) -> Vec<PathBuf> {
        if self.testsets.is_empty() {
            vec![PathBuf::from(DEFINITION_FILENAME)]
        } else {
            self.testsets.clone()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing(cli.json, level);

    let code = run_session(&cli).await?;
    std::process::exit(code);
}

async fn run_session(cli: &Cli) -> Result<i32> {
    let options = cli.runner_options()?;
    let forest = load_forest(&cli.testset_files(), &options)?;

    if cli.commands.contains(&Action::Tests) {
        print!("{}", render_tests(&forest, &options.active_targets));
    }
    if !cli.needs_execution() {
        return Ok(0);
    }

    let bench_rule = GlobalBenchRule::new(&cli.bench_regexp)
        .with_context(|| format!("Invalid --bench-regexp '{}'", cli.bench_regexp))?;

    let plan = RunPlan::expand(&forest, &options);
    let stats = Arc::new(StatsAggregator::new(&forest));
    let observer = Arc::new(ConsoleObserver::new(cli.stdout, cli.safe_stdout, &forest));
    let scheduler = Scheduler::new(&options).with_bench_rule(Some(bench_rule));
    info!(runs = plan.len(), workers = scheduler.workers(), "run plan ready");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping session");
            let _ = cancel_tx.send(true);
        }
    });

    let outcome = scheduler.run(plan, Arc::clone(&stats), observer, cancel_rx).await;
    interrupt.abort();

    let report = stats.snapshot();

    if cli.wants(Action::Table) {
        print!("{}", render_table(&report, cli.dump_all));
    }
    if cli.wants(Action::Summary) {
        println!("{}", render_summary(&report));
    }
    if cli.wants(Action::Junit) {
        let written = write_junit_files(&report, &cli.junit_report_path)
            .context("Failed to write JUnit reports")?;
        for path in written {
            info!(path = %path.display(), "wrote junit report");
        }
    }

    if let Some(path) = &cli.bench_csv_file {
        update_bench_csv(path, &report.benchmarks)?;
    }

    let verdict = SessionVerdict::evaluate(&report, outcome.interrupted);
    for violation in &verdict.violations {
        warn!(violation = %violation, "session violation");
    }

    if let Some(path) = &cli.json_report {
        write_json_report(path, &JsonReport::new(report))
            .with_context(|| format!("Failed to write JSON report {:?}", path))?;
    }

    Ok(verdict.exit_code(cli.no_fail))
}

/// Load every top-level definition file. A missing file is fatal; a file
/// that fails to evaluate is kept with its load error set.
fn load_forest(files: &[PathBuf], options: &RunnerOptions) -> Result<Vec<Testset>> {
    let loader = DefinitionLoader::new(ConfigResolver::new(), options.build_env());
    let mut resolver = ModuleResolver::new();

    let mut forest = Vec::with_capacity(files.len());
    for file in files {
        if !file.is_file() {
            anyhow::bail!("Unable to open testset file: {}", file.display());
        }
        let file = file
            .canonicalize()
            .with_context(|| format!("Failed to resolve {:?}", file))?;
        let testset = loader.load(&mut resolver, &file);
        info!(file = %file.display(), tests = testset.test_count(), "loaded testset");
        forest.push(testset);
    }
    Ok(forest)
}

fn update_bench_csv(path: &Path, results: &[simtest_core::BenchmarkResult]) -> Result<()> {
    let mut csv = BenchCsv::load(path).with_context(|| format!("Failed to read {:?}", path))?;
    csv.merge(results);
    csv.write(path)
        .with_context(|| format!("Failed to write {:?}", path))?;
    info!(path = %path.display(), rows = csv.len(), "updated benchmark file");
    Ok(())
}

/// Prints run banners and, on request, run output.
struct ConsoleObserver {
    stream: bool,
    dump_output: bool,
    name_width: usize,
    // Keeps a banner and the output printed with it together.
    console: Mutex<()>,
}

impl ConsoleObserver {
    fn new(stream: bool, dump_output: bool, forest: &[Testset]) -> Self {
        Self {
            stream,
            dump_output,
            name_width: longest_test_name(forest) + 5,
            console: Mutex::new(()),
        }
    }

    fn banner(&self, label: &str, name: &str, config: &str) {
        println!("{:<8}{:<width$} {}", label, name, config, width = self.name_width);
    }
}

impl RunObserver for ConsoleObserver {
    fn on_start(&self, run: &Run) {
        let _console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        self.banner("START", run.full_name(), &run.config);
    }

    fn on_output_line(&self, _run: &Run, line: &str) {
        if self.stream {
            let _console = self.console.lock().unwrap_or_else(|e| e.into_inner());
            println!("{line}");
        }
    }

    fn on_complete(&self, run: &Run, record: &RunRecord) {
        let _console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        if self.dump_output {
            print!("{}", record.output);
        }
        self.banner(status_label(record.status), run.full_name(), &run.config);
    }

    fn on_bypass(&self, record: &RunRecord) {
        let _console = self.console.lock().unwrap_or_else(|e| e.into_inner());
        self.banner(status_label(record.status), &record.test_name, &record.config);
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Passed => "OK",
        RunStatus::Failed => "KO",
        RunStatus::Skipped => "SKIP",
        RunStatus::Excluded => "EXCLUDE",
    }
}

fn longest_test_name(forest: &[Testset]) -> usize {
    forest
        .iter()
        .map(|testset| {
            let own = testset
                .tests()
                .iter()
                .map(|t| t.full_name().len())
                .max()
                .unwrap_or(0);
            own.max(longest_test_name(testset.testsets()))
        })
        .max()
        .unwrap_or(0)
}
