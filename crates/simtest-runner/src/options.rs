//! Run-wide options consumed by expansion, scheduling and supervision.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use simtest_core::{BuildEnv, DEFAULT_TARGET};

/// Default load-average ceiling (fraction of CPU count).
pub const DEFAULT_LOAD_AVERAGE: f64 = 0.9;

/// Default execution platform exposed to definitions.
pub const DEFAULT_PLATFORM: &str = "gvsoc";

/// Options controlling one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerOptions {
    /// Targets selected with `--target`.
    pub active_targets: Vec<String>,

    /// Label of runs on the implicit default target (`--config`).
    pub config: String,

    /// Worker count; 0 means one per available CPU.
    pub threads: usize,

    /// Load ceiling as a fraction of CPU count; 1.0 or more disables
    /// throttling.
    pub load_average: f64,

    /// Global timeout cap in seconds. Negative or absent means none.
    pub max_timeout: Option<f64>,

    /// `--test` prefixes; empty selects everything.
    pub test_filters: Vec<String>,

    /// `--skip` prefixes.
    pub skip_filters: Vec<String>,

    /// `--cmd`: only these command names run.
    pub commands: Vec<String>,

    /// `--cmd-exclude`: these command names never run.
    pub commands_exclude: Vec<String>,

    /// `--flags`, joined into the `{flags}` placeholder.
    pub flags: Vec<String>,

    /// `--property name=value`.
    pub properties: BTreeMap<String, String>,

    pub platform: String,

    /// Shared root for the build directories of preset tests.
    pub build_root: Option<PathBuf>,

    /// Cap on stored output bytes per run.
    pub max_output_len: Option<usize>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            active_targets: vec![DEFAULT_TARGET.to_string()],
            config: DEFAULT_TARGET.to_string(),
            threads: 0,
            load_average: DEFAULT_LOAD_AVERAGE,
            max_timeout: None,
            test_filters: Vec::new(),
            skip_filters: Vec::new(),
            commands: Vec::new(),
            commands_exclude: Vec::new(),
            flags: Vec::new(),
            properties: BTreeMap::new(),
            platform: DEFAULT_PLATFORM.to_string(),
            build_root: None,
            max_output_len: None,
        }
    }
}

impl RunnerOptions {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Global timeout cap, if any.
    pub fn max_timeout(&self) -> Option<Duration> {
        self.max_timeout
            .filter(|t| *t >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Effective timeout of a run on a target declaring `target_timeout`.
    pub fn effective_timeout(&self, target_timeout: Option<f64>) -> Option<Duration> {
        let target = target_timeout
            .filter(|t| *t >= 0.0)
            .map(Duration::from_secs_f64);
        match (target, self.max_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether `full_name` passes the `--test` selection.
    pub fn is_selected(&self, full_name: &str) -> bool {
        self.test_filters.is_empty() || self.test_filters.iter().any(|p| full_name.starts_with(p.as_str()))
    }

    /// Whether `full_name` matches a `--skip` pattern.
    pub fn is_skipped(&self, full_name: &str) -> bool {
        self.skip_filters.iter().any(|p| full_name.starts_with(p.as_str()))
    }

    /// Whether a command with this name runs.
    pub fn command_enabled(&self, name: &str) -> bool {
        (self.commands.is_empty() || self.commands.iter().any(|c| c == name))
            && !self.commands_exclude.iter().any(|c| c == name)
    }

    /// Flags joined with spaces, for the `{flags}` placeholder.
    pub fn flags_string(&self) -> String {
        self.flags.join(" ")
    }

    /// Values visible to definitions while they build.
    pub fn build_env(&self) -> BuildEnv {
        BuildEnv {
            properties: self.properties.clone(),
            platform: self.platform.clone(),
            build_root: self.build_root.clone(),
        }
    }

    /// Parse one `name=value` property.
    pub fn parse_property(raw: &str) -> anyhow::Result<(String, String)> {
        match raw.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => anyhow::bail!("invalid property '{}', expected name=value", raw),
        }
    }
}
