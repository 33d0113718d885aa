//! simtest core library
//!
//! Testset tree model, per-directory configuration discovery, handler
//! module resolution, definition loading, run statistics and report
//! rendering. Process execution lives in `simtest-runner`.

pub mod config;
pub mod definition;
pub mod error;
pub mod model;
pub mod obs;
pub mod reporting;
pub mod resolve;
pub mod stats;
pub mod telemetry;

pub use config::{ConfigFragment, ConfigResolver, ResolvedSearchPath, CONFIG_FILENAME};

pub use definition::{
    BuildContext, BuildEnv, DefinitionLoader, DefinitionModule, LoadFailure, YamlDefinition,
    DEFINITION_FILENAME,
};

pub use error::{ConfigError, LoadError, ResolveError, Result, SystemError};

pub use model::{
    render_scalar, BenchmarkRule, Command, HandlerRef, RunRecord, RunStatus, Target, TargetConfig,
    Test, TestLocation, Testset, DEFAULT_TARGET,
};

pub use reporting::{
    junit_report, render_junit, render_summary, render_table, render_tests, write_json_report,
    write_junit_files, JsonReport,
};

pub use resolve::{
    Handler, HandlerOutcome, Invocation, ModuleResolver, ResolveWindow, SpawnedProcesses,
    BUILTIN_MODULE,
};

pub use stats::{
    extract_benchmarks, AggregateCounters, BenchCsv, BenchValue, BenchmarkResult,
    GlobalBenchRule, StatsAggregator, StatsReport, TestStats, TestsetStats,
    DEFAULT_BENCH_PATTERN,
};

/// Crate version, reported by `simtest --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
