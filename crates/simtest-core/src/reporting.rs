//! Rendering of statistics snapshots: text tables, the summary block,
//! JUnit XML files and the JSON report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use serde::{Deserialize, Serialize};

use crate::model::{RunRecord, RunStatus, Target, Testset};
use crate::stats::{AggregateCounters, StatsReport, TestStats, TestsetStats};

/// Schema version of the JSON report.
pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Render the `tests` listing: one row per testset and test with the
/// targets its runs would use.
pub fn render_tests(forest: &[Testset], active_targets: &[String]) -> String {
    let mut rows = vec![["Name".to_string(), "Path".to_string(), "Targets".to_string()]];
    let root = vec![Target::default()];
    for testset in forest {
        collect_test_rows(testset, "", &root, active_targets, &mut rows);
    }
    render_rows(&rows)
}

fn collect_test_rows(
    testset: &Testset,
    indent: &str,
    inherited: &[Target],
    active: &[String],
    rows: &mut Vec<[String; 3]>,
) {
    let targets = testset.effective_targets(inherited, active);
    let joined = targets.iter().map(Target::name).collect::<Vec<_>>().join(", ");
    let mut indent = indent.to_string();
    if let Some(name) = testset.name() {
        let mut label = format!("{indent}{name}");
        if testset.load_error().is_some() {
            label.push_str(" (load error)");
        }
        rows.push([label, testset.full_name().unwrap_or_default(), joined.clone()]);
        indent.push_str("  ");
    }
    for child in testset.testsets() {
        collect_test_rows(child, &indent, &targets, active, rows);
    }
    for test in testset.tests() {
        rows.push([format!("{indent}{}", test.name()), test.full_name().to_string(), joined.clone()]);
    }
}

fn render_rows<const N: usize>(rows: &[[String; N]]) -> String {
    let mut widths = [0usize; N];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for (r, row) in rows.iter().enumerate() {
        let line = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
        if r == 0 {
            let total = widths.iter().sum::<usize>() + 2 * N.saturating_sub(1);
            out.push_str(&"-".repeat(total));
            out.push('\n');
        }
    }
    out
}

fn table_row(name: &str, config: &str, counters: &AggregateCounters) -> [String; 7] {
    let blank_zero = |n: u64| if n == 0 { String::new() } else { n.to_string() };
    [
        name.to_string(),
        config.to_string(),
        format!("{:.2}", counters.duration_secs),
        format!("{}/{}", counters.passed, counters.executed()),
        blank_zero(counters.failed),
        blank_zero(counters.skipped),
        blank_zero(counters.excluded),
    ]
}

fn run_counters(run: &RunRecord) -> AggregateCounters {
    let mut counters = AggregateCounters::default();
    counters.add_run(run);
    counters
}

/// Render the results table. Only rows with failures are shown unless
/// `dump_all` is set.
pub fn render_table(report: &StatsReport, dump_all: bool) -> String {
    let mut rows = vec![[
        "Test".to_string(),
        "Config".to_string(),
        "Time".to_string(),
        "Passed/total".to_string(),
        "Failed".to_string(),
        "Skipped".to_string(),
        "Excluded".to_string(),
    ]];
    for testset in &report.testsets {
        collect_table_rows(testset, dump_all, &mut rows);
    }
    render_rows(&rows)
}

fn collect_table_rows(stats: &TestsetStats, dump_all: bool, rows: &mut Vec<[String; 7]>) {
    if stats.counters.total() == 0 && stats.load_error.is_none() {
        return;
    }
    if let Some(full_name) = &stats.full_name {
        if stats.counters.failed > 0 || stats.load_error.is_some() || dump_all {
            rows.push(table_row(full_name, "", &stats.counters));
        }
    }
    for test in &stats.tests {
        collect_test_table_rows(test, dump_all, rows);
    }
    for child in &stats.testsets {
        collect_table_rows(child, dump_all, rows);
    }
}

fn collect_test_table_rows(test: &TestStats, dump_all: bool, rows: &mut Vec<[String; 7]>) {
    match test.runs.as_slice() {
        [] => {}
        [run] => {
            if run.status == RunStatus::Failed || dump_all {
                rows.push(table_row(&test.full_name, &run.config, &run_counters(run)));
            }
        }
        runs => {
            if test.counters.failed > 0 || dump_all {
                rows.push(table_row(&test.full_name, "", &test.counters));
            }
            for run in runs {
                if run.status == RunStatus::Failed || dump_all {
                    rows.push(table_row("", &run.config, &run_counters(run)));
                }
            }
        }
    }
}

/// Render the summary block and final verdict line.
pub fn render_summary(report: &StatsReport) -> String {
    let totals = &report.totals;
    let total = totals.executed();
    let mut out = String::new();
    out.push_str("Test Summary\n");
    out.push_str(&format!("  Total     {total:>6}\n"));
    out.push_str(&format!("  Passed    {:>6}\n", totals.passed));
    out.push_str(&format!("  Failed    {:>6}\n", totals.failed));
    out.push_str(&format!("  Skipped   {:>6}\n", totals.skipped));
    out.push_str(&format!("  Excluded  {:>6}\n", totals.excluded));

    let load_errors: Vec<(&str, &str)> =
        report.testsets.iter().flat_map(|ts| ts.load_errors()).collect();
    for (name, error) in &load_errors {
        out.push_str(&format!("  Load error in {name}: {error}\n"));
    }

    if totals.passed == total {
        out.push_str("All tests passed\n");
    } else {
        let percent = (totals.passed * 100).checked_div(total).unwrap_or(0);
        out.push_str(&format!("{}/{} tests passed ({}%).\n", totals.passed, total, percent));
    }
    out
}

/// JUnit `classname` and `name` for a run.
fn junit_names(full_name: &str, target: &str) -> (String, String) {
    let parts: Vec<&str> = full_name.splitn(3, ':').collect();
    match parts.as_slice() {
        [name] => (target.to_string(), (*name).to_string()),
        [suite, name] => (format!("{target}.{suite}"), (*name).to_string()),
        [_, suite, name] => (format!("{target}.{suite}"), (*name).to_string()),
        _ => (target.to_string(), full_name.to_string()),
    }
}

/// Build the JUnit report of a top-level testset. Excluded runs are left
/// out; skipped runs are reported as skipped test cases.
pub fn junit_report(stats: &TestsetStats) -> Report {
    let mut suite = TestSuite::new(stats.name.as_str());
    for test in stats.all_tests() {
        for run in &test.runs {
            let status = match run.status {
                RunStatus::Excluded => continue,
                RunStatus::Passed => TestCaseStatus::success(),
                RunStatus::Skipped => {
                    let mut status = TestCaseStatus::skipped();
                    if let Some(message) = &run.message {
                        status.set_message(message.as_str());
                    }
                    status
                }
                RunStatus::Failed => {
                    let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                    status.set_message(run.message.as_deref().unwrap_or("failed"));
                    status
                }
            };
            let (classname, name) = junit_names(&test.full_name, &run.target);
            let mut case = TestCase::new(name, status);
            case.set_classname(classname)
                .set_time(Duration::from_secs_f64(run.duration_secs.max(0.0)));
            if !run.output.is_empty() {
                case.set_system_out(run.output.as_str());
            }
            suite.add_test_case(case);
        }
    }
    let mut report = Report::new(stats.name.as_str());
    report.set_time(Duration::from_secs_f64(stats.counters.duration_secs.max(0.0)));
    report.add_test_suite(suite);
    report
}

/// Render one JUnit document for a top-level testset.
pub fn render_junit(stats: &TestsetStats) -> Result<String> {
    junit_report(stats)
        .to_string()
        .with_context(|| format!("serialize JUnit report for {}", stats.name))
}

/// Write `TEST-<testset>.xml` for every top-level testset under `dir`.
pub fn write_junit_files(report: &StatsReport, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let mut written = Vec::with_capacity(report.testsets.len());
    for stats in &report.testsets {
        let file_stem: String = stats
            .name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = dir.join(format!("TEST-{file_stem}.xml"));
        std::fs::write(&path, render_junit(stats)?).with_context(|| format!("write {:?}", path))?;
        written.push(path);
    }
    Ok(written)
}

/// Machine-readable dump of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub passed: bool,
    pub report: StatsReport,
}

impl JsonReport {
    pub fn new(report: StatsReport) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            passed: !report.has_failures(),
            report,
        }
    }
}

/// Write the JSON report in pretty format.
pub fn write_json_report(path: &Path, report: &JsonReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
