//! Aggregation of run records into per-test, per-testset and global
//! counters, plus benchmark extraction.
//!
//! The aggregator mirrors the loaded testset forest as an index-addressed
//! skeleton. Recording only appends a run to its test slot; counters are
//! computed bottom-up when a snapshot is taken, so the final numbers do
//! not depend on completion order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{RunRecord, RunStatus, Test, Testset, DEFAULT_TARGET};

/// Default pattern of the global benchmark rule.
pub const DEFAULT_BENCH_PATTERN: &str = r"@BENCH@(?P<value>[^@]*)@DESC@(?P<desc>[^@]*)@";

/// Extracted benchmark value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BenchValue {
    Number(f64),
    Text(String),
}

impl BenchValue {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(n) => BenchValue::Number(n),
            Err(_) => BenchValue::Text(trimmed.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BenchValue::Number(n) => Some(*n),
            BenchValue::Text(_) => None,
        }
    }
}

impl fmt::Display for BenchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchValue::Number(n) => write!(f, "{n}"),
            BenchValue::Text(s) => f.write_str(s),
        }
    }
}

/// One metric extracted from a run's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub test: String,
    pub target: String,
    pub metric: String,
    pub description: String,
    pub value: BenchValue,
}

/// Output-wide rule applied line by line (`--bench-regexp`).
///
/// The pattern must carry a `value` group; `desc` and `name` are optional.
#[derive(Debug, Clone)]
pub struct GlobalBenchRule {
    pattern: Regex,
}

impl GlobalBenchRule {
    pub fn new(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    fn extract(&self, test: &str, target: &str, output: &str, out: &mut Vec<BenchmarkResult>) {
        for line in output.lines() {
            let Some(caps) = self.pattern.captures(line) else {
                continue;
            };
            let Some(value) = caps.name("value") else {
                continue;
            };
            let metric = match caps.name("name") {
                Some(name) => name.as_str().to_string(),
                None if target == DEFAULT_TARGET => test.to_string(),
                None => format!("{test}:{target}"),
            };
            out.push(BenchmarkResult {
                test: test.to_string(),
                target: target.to_string(),
                metric,
                description: caps
                    .name("desc")
                    .map(|d| d.as_str().to_string())
                    .unwrap_or_default(),
                value: BenchValue::parse(value.as_str()),
            });
        }
    }
}

impl Default for GlobalBenchRule {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_BENCH_PATTERN).unwrap_or_else(|_| unreachable!()),
        }
    }
}

/// Apply a test's rules (and the optional global rule) to `output`.
///
/// Per-test rules are matched line by line and only count when the match
/// starts at the beginning of the line. Each rule contributes at most one
/// result: the last matching line, using capture group 1 when present and
/// the whole match otherwise.
pub fn extract_benchmarks(
    test: &Test,
    target: &str,
    output: &str,
    global: Option<&GlobalBenchRule>,
) -> Vec<BenchmarkResult> {
    let mut results = Vec::new();
    for rule in test.benchmarks() {
        let last = output
            .lines()
            .filter_map(|line| rule.pattern.captures(line))
            .filter(|caps| caps.get(0).is_some_and(|m| m.start() == 0))
            .last();
        let Some(caps) = last else {
            debug!(test = %test.full_name(), metric = %rule.metric, "benchmark pattern not found");
            continue;
        };
        let raw = caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str()).unwrap_or_default();
        results.push(BenchmarkResult {
            test: test.full_name().to_string(),
            target: target.to_string(),
            metric: rule.metric.clone(),
            description: rule.description.clone(),
            value: BenchValue::parse(raw),
        });
    }
    if let Some(global) = global {
        global.extract(test.full_name(), target, output, &mut results);
    }
    results
}

/// Counters at any aggregation scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateCounters {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub excluded: u64,
    /// Sum of executed run durations, in seconds.
    pub duration_secs: f64,
}

impl AggregateCounters {
    pub fn add_run(&mut self, run: &RunRecord) {
        match run.status {
            RunStatus::Passed => self.passed += 1,
            RunStatus::Failed => self.failed += 1,
            RunStatus::Skipped => self.skipped += 1,
            RunStatus::Excluded => self.excluded += 1,
        }
        self.duration_secs += run.duration_secs;
    }

    pub fn merge(&mut self, other: &AggregateCounters) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.excluded += other.excluded;
        self.duration_secs += other.duration_secs;
    }

    /// Every run, including bypassed ones.
    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.skipped + self.excluded
    }

    /// Runs that went through the supervisor.
    pub fn executed(&self) -> u64 {
        self.passed + self.failed
    }
}

#[derive(Debug, Clone, Default)]
struct TestSlot {
    name: String,
    full_name: String,
    runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, Default)]
struct TestsetSlot {
    name: String,
    full_name: Option<String>,
    load_error: Option<String>,
    tests: Vec<TestSlot>,
    testsets: Vec<TestsetSlot>,
}

impl TestsetSlot {
    fn mirror(testset: &Testset) -> Self {
        Self {
            name: testset.display_name(),
            full_name: testset.full_name(),
            load_error: testset.load_error().map(str::to_string),
            tests: testset
                .tests()
                .iter()
                .map(|t| TestSlot {
                    name: t.name().to_string(),
                    full_name: t.full_name().to_string(),
                    runs: Vec::new(),
                })
                .collect(),
            testsets: testset.testsets().iter().map(TestsetSlot::mirror).collect(),
        }
    }

    fn snapshot(&self) -> TestsetStats {
        let mut counters = AggregateCounters::default();
        let tests: Vec<TestStats> = self
            .tests
            .iter()
            .map(|slot| {
                let mut runs = slot.runs.clone();
                runs.sort_by(|a, b| a.target.cmp(&b.target).then_with(|| a.run_id.cmp(&b.run_id)));
                let mut test_counters = AggregateCounters::default();
                for run in &runs {
                    test_counters.add_run(run);
                }
                counters.merge(&test_counters);
                TestStats {
                    name: slot.name.clone(),
                    full_name: slot.full_name.clone(),
                    counters: test_counters,
                    runs,
                }
            })
            .collect();
        let testsets: Vec<TestsetStats> = self.testsets.iter().map(TestsetSlot::snapshot).collect();
        for child in &testsets {
            counters.merge(&child.counters);
        }
        TestsetStats {
            name: self.name.clone(),
            full_name: self.full_name.clone(),
            load_error: self.load_error.clone(),
            counters,
            tests,
            testsets,
        }
    }
}

/// Statistics of one test across its runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStats {
    pub name: String,
    pub full_name: String,
    pub counters: AggregateCounters,
    pub runs: Vec<RunRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsetStats {
    pub name: String,
    pub full_name: Option<String>,
    pub load_error: Option<String>,
    pub counters: AggregateCounters,
    pub tests: Vec<TestStats>,
    pub testsets: Vec<TestsetStats>,
}

impl TestsetStats {
    /// Every test in this subtree, depth first.
    pub fn all_tests(&self) -> Vec<&TestStats> {
        let mut out: Vec<&TestStats> = self.tests.iter().collect();
        for child in &self.testsets {
            out.extend(child.all_tests());
        }
        out
    }

    /// Load errors in this subtree as `(testset name, message)`.
    pub fn load_errors(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        if let Some(err) = &self.load_error {
            out.push((self.name.as_str(), err.as_str()));
        }
        for child in &self.testsets {
            out.extend(child.load_errors());
        }
        out
    }
}

/// Immutable view of the aggregator at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub totals: AggregateCounters,
    pub targets: BTreeMap<String, AggregateCounters>,
    pub testsets: Vec<TestsetStats>,
    pub benchmarks: Vec<BenchmarkResult>,
}

impl StatsReport {
    pub fn runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.testsets
            .iter()
            .flat_map(|ts| ts.all_tests())
            .flat_map(|t| t.runs.iter())
    }

    pub fn failed_runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs().filter(|r| r.status == RunStatus::Failed)
    }

    pub fn has_load_errors(&self) -> bool {
        self.testsets.iter().any(|ts| !ts.load_errors().is_empty())
    }

    /// Whether the overall result should be reported as a failure.
    pub fn has_failures(&self) -> bool {
        self.totals.failed > 0 || self.has_load_errors()
    }
}

/// Thread-safe collector of run records.
#[derive(Debug)]
pub struct StatsAggregator {
    skeleton: Mutex<Vec<TestsetSlot>>,
}

impl StatsAggregator {
    pub fn new(forest: &[Testset]) -> Self {
        Self {
            skeleton: Mutex::new(forest.iter().map(TestsetSlot::mirror).collect()),
        }
    }

    /// Fold one record into its test slot. Records pointing outside the
    /// loaded forest are dropped with a warning.
    pub fn record(&self, record: RunRecord) {
        let mut skeleton = self.skeleton.lock().unwrap_or_else(|e| e.into_inner());
        let location = record.location.clone();
        let mut path = location.testset_path.iter();
        let slot = path
            .next()
            .and_then(|&first| skeleton.get_mut(first))
            .and_then(|mut node| {
                for &idx in path {
                    node = node.testsets.get_mut(idx)?;
                }
                node.tests.get_mut(location.test_index)
            });
        match slot {
            Some(slot) => slot.runs.push(record),
            None => warn!(
                run_id = %record.run_id,
                test = %record.test_name,
                "run record does not match any loaded test, dropped"
            ),
        }
    }

    /// Compute counters over everything recorded so far.
    pub fn snapshot(&self) -> StatsReport {
        let skeleton = self.skeleton.lock().unwrap_or_else(|e| e.into_inner());
        let testsets: Vec<TestsetStats> = skeleton.iter().map(TestsetSlot::snapshot).collect();
        drop(skeleton);

        let mut totals = AggregateCounters::default();
        for ts in &testsets {
            totals.merge(&ts.counters);
        }

        let mut targets: BTreeMap<String, AggregateCounters> = BTreeMap::new();
        let mut benchmarks = Vec::new();
        for run in testsets.iter().flat_map(|ts| ts.all_tests()).flat_map(|t| t.runs.iter()) {
            targets.entry(run.target.clone()).or_default().add_run(run);
            benchmarks.extend(run.benchmarks.iter().cloned());
        }

        StatsReport {
            totals,
            targets,
            testsets,
            benchmarks,
        }
    }
}

// ---------------------------------------------------------------------------
// Benchmark CSV
// ---------------------------------------------------------------------------

/// Rows of a benchmark CSV file (`name,value,description`), in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchCsv {
    rows: Vec<(String, String, String)>,
}

impl BenchCsv {
    /// Load an existing file; a missing file yields an empty table.
    /// Short rows are padded with empty fields.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("open {:?}", path))?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("parse {:?}", path))?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            let field = |i: usize| record.get(i).unwrap_or_default().to_string();
            rows.push((field(0), field(1), field(2)));
        }
        Ok(Self { rows })
    }

    /// Overwrite rows by metric name, appending new metrics.
    pub fn merge(&mut self, results: &[BenchmarkResult]) {
        for result in results {
            let row = (
                result.metric.clone(),
                result.value.to_string(),
                result.description.clone(),
            );
            match self.rows.iter_mut().find(|r| r.0 == result.metric) {
                Some(existing) => *existing = row,
                None => self.rows.push(row),
            }
        }
    }

    /// Value and description stored for `metric`.
    pub fn get(&self, metric: &str) -> Option<(&str, &str)> {
        self.rows
            .iter()
            .find(|r| r.0 == metric)
            .map(|r| (r.1.as_str(), r.2.as_str()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rewrite `path` with every row, without a header.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)
            .with_context(|| format!("create {:?}", path))?;
        for (name, value, description) in &self.rows {
            writer
                .write_record([name, value, description])
                .with_context(|| format!("write {:?}", path))?;
        }
        writer.flush().with_context(|| format!("write {:?}", path))?;
        Ok(())
    }
}
