//! Expansion of a loaded testset forest into runs.
//!
//! Every (test, effective target) pair becomes exactly one run. Runs that
//! must not execute are turned into finished records right away; the rest
//! are queued for the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use simtest_core::{
    Command, RunRecord, RunStatus, Target, Test, TestLocation, Testset, DEFAULT_TARGET,
};
use tracing::debug;
use uuid::Uuid;

use crate::options::RunnerOptions;

/// Message of runs skipped through `--skip`.
pub const SKIPPED_FROM_COMMAND_LINE: &str = "skipped from command line";

/// Message of runs filtered out by `--test`.
pub const NOT_SELECTED: &str = "not selected";

/// A test bound to one target, ready for the supervisor.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub location: TestLocation,
    pub test: Arc<Test>,
    pub target: Target,
    /// Label shown next to the test name in banners and tables.
    pub config: String,
    /// Commands left after `--cmd`/`--cmd-exclude` filtering, in order.
    pub commands: Vec<Command>,
    pub timeout: Option<Duration>,
    placeholders: BTreeMap<String, String>,
}

impl Run {
    pub fn full_name(&self) -> &str {
        self.test.full_name()
    }

    /// Expand `{name}` placeholders of a shell command line.
    pub fn render(&self, cmd: &str) -> String {
        format_placeholders(cmd, &self.placeholders)
    }

    /// Values substituted for `{name}` placeholders in shell commands.
    pub fn placeholders(&self) -> &BTreeMap<String, String> {
        &self.placeholders
    }
}

/// Result of expanding a forest.
#[derive(Debug, Default)]
pub struct RunPlan {
    /// Runs to hand to the scheduler, in tree order.
    pub queued: Vec<Run>,
    /// Runs already settled as skipped or excluded.
    pub bypassed: Vec<RunRecord>,
}

impl RunPlan {
    /// Expand every test of `forest` into one run per effective target, in tree order.
    pub fn expand(forest: &[Testset], options: &RunnerOptions) -> Self {
        let mut plan = RunPlan::default();
        let root_targets = vec![Target::default()];
        for (idx, testset) in forest.iter().enumerate() {
            plan.expand_testset(testset, vec![idx], &root_targets, None, options);
        }
        debug!(
            queued = plan.queued.len(),
            bypassed = plan.bypassed.len(),
            "expanded run plan"
        );
        plan
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.bypassed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expand_testset(
        &mut self,
        testset: &Testset,
        path: Vec<usize>,
        inherited: &[Target],
        inherited_error: Option<&str>,
        options: &RunnerOptions,
    ) {
        let load_error = testset.load_error().or(inherited_error);
        let targets = testset.effective_targets(inherited, &options.active_targets);

        for (child_idx, child) in testset.testsets().iter().enumerate() {
            let mut child_path = path.clone();
            child_path.push(child_idx);
            self.expand_testset(child, child_path, &targets, load_error, options);
        }

        for (test_idx, test) in testset.tests().iter().enumerate() {
            let location = TestLocation {
                testset_path: path.clone(),
                test_index: test_idx,
            };
            for target in &targets {
                self.expand_run(test, target, location.clone(), load_error, options);
            }
        }
    }

    fn expand_run(
        &mut self,
        test: &Arc<Test>,
        target: &Target,
        location: TestLocation,
        load_error: Option<&str>,
        options: &RunnerOptions,
    ) {
        let run_id = Uuid::new_v4().to_string();
        let full_name = test.full_name();
        let config = if target.name == DEFAULT_TARGET {
            options.config.clone()
        } else {
            target.name.clone()
        };

        let bypass = if let Some(error) = load_error {
            Some((RunStatus::Excluded, error.to_string()))
        } else if options.is_skipped(full_name) {
            Some((RunStatus::Skipped, SKIPPED_FROM_COMMAND_LINE.to_string()))
        } else if let Some(reason) = test.skip_reason() {
            Some((RunStatus::Skipped, reason.to_string()))
        } else if let Some(reason) = &target.config.skip {
            Some((RunStatus::Skipped, reason.clone()))
        } else if !options.is_selected(full_name) {
            Some((RunStatus::Excluded, NOT_SELECTED.to_string()))
        } else {
            None
        };

        if let Some((status, message)) = bypass {
            self.bypassed.push(RunRecord::bypassed(
                run_id,
                location,
                full_name,
                &target.name,
                &config,
                status,
                message,
            ));
            return;
        }

        let commands = test
            .commands()
            .iter()
            .filter(|c| options.command_enabled(c.name()))
            .cloned()
            .collect();

        self.queued.push(Run {
            id: run_id,
            location,
            test: Arc::clone(test),
            target: target.clone(),
            config: config.clone(),
            commands,
            timeout: options.effective_timeout(target.config.timeout),
            placeholders: placeholders(target, &config, options),
        });
    }
}

/// Placeholder values, highest priority last inserted.
fn placeholders(target: &Target, config: &str, options: &RunnerOptions) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    values.insert("target".to_string(), target.name.clone());
    values.insert("config".to_string(), config.to_string());
    values.insert("platform".to_string(), options.platform.clone());
    values.insert("flags".to_string(), options.flags_string());
    for (name, value) in &options.properties {
        values.insert(name.clone(), value.clone());
    }
    for name in target.config.properties.keys() {
        if let Some(value) = target.property(name) {
            values.insert(name.clone(), value);
        }
    }
    values
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Replace `{name}` with known values. Unknown names, `${...}` shell
/// expansions and anything that is not a plain name are left verbatim.
pub fn format_placeholders(cmd: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(cmd.len());
    let mut rest = cmd;
    while let Some(open) = rest.find('{') {
        let shell_expansion = rest[..open].ends_with('$');
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match values.get(name) {
                    Some(value) if !shell_expansion && is_placeholder_name(name) => out.push_str(value),
                    _ => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
