//! Building testset trees from definition files.
//!
//! A definition file is evaluated inside a resolution window holding the
//! search path merged from every `simtest.yaml` above it. The window is
//! closed when the build returns, whatever the outcome. Imports open a
//! nested window for the imported file's own configuration.
//!
//! The build entry point is the [`DefinitionModule`] trait. The built-in
//! implementation, [`YamlDefinition`], interprets the following format:
//!
//! ```yaml
//! name: soc
//! targets:
//!   - name: rv32
//!     env: { ARCH: rv32 }
//!     properties: { chip: pulp }
//! imports: [drivers/testset.yaml]
//! testsets:
//!   - name: cluster
//!     tests: [...]
//! tests:
//!   - name: hello
//!     commands:
//!       - { kind: shell, name: run, cmd: "make run chip={chip}" }
//!       - { kind: check, handler: "checks::has_ok", args: ["OK"] }
//!     benchmarks:
//!       - { pattern: 'Cycles: (\d+)', metric: cycles, description: "total cycles" }
//!   - name: fft
//!     kind: make
//!     flags: "CHIP=pulp"
//!     checker: "checks::has_ok"
//! ```
//!
//! A test's `kind` selects a command preset. `make`, `gvrun`, `sdk` and
//! `sdk_netlist_power` generate clean, build and run shell commands around
//! a per-test build directory; `retval` applies to the run step and
//! `checker` is appended after it. Explicit `commands` follow the preset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{normalize, ConfigResolver, ResolvedSearchPath};
use crate::error::{LoadError, Result};
use crate::model::{Command, HandlerRef, TargetConfig, Testset};
use crate::obs::emit_load_failed;
use crate::resolve::{ModuleResolver, ResolveWindow};

/// Conventional definition file name.
pub const DEFINITION_FILENAME: &str = "testset.yaml";

/// Run-wide values visible to definitions while they build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnv {
    pub properties: BTreeMap<String, String>,
    pub platform: String,
    /// Shared root for preset build directories. When unset, each test
    /// builds below its own directory.
    pub build_root: Option<PathBuf>,
}

impl Default for BuildEnv {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            platform: "gvsoc".to_string(),
            build_root: None,
        }
    }
}

/// Build entry point of a definition module.
pub trait DefinitionModule {
    /// Populate `testset`, which is fresh and empty on entry.
    fn build(&self, testset: &mut Testset, ctx: &mut BuildContext<'_, '_>) -> Result<()>;
}

/// Services available to a definition while it builds.
pub struct BuildContext<'a, 'w> {
    loader: &'a DefinitionLoader,
    window: &'a mut ResolveWindow<'w>,
    definition: PathBuf,
}

impl BuildContext<'_, '_> {
    /// Value passed with `--property name=value`.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.loader.env.properties.get(name).map(String::as_str)
    }

    /// Platform selected with `--platform`.
    pub fn platform(&self) -> &str {
        &self.loader.env.platform
    }

    pub fn build_root(&self) -> Option<&Path> {
        self.loader.env.build_root.as_deref()
    }

    /// Definition file being built.
    pub fn definition(&self) -> &Path {
        &self.definition
    }

    /// Resolve a `module::handler` reference through the open window.
    pub fn resolve(&self, reference: &str) -> Result<HandlerRef> {
        let handler = self.window.resolve(reference).map_err(|source| LoadError::Resolve {
            definition: self.definition.clone(),
            source,
        })?;
        Ok(HandlerRef {
            reference: reference.to_string(),
            handler,
        })
    }

    /// Build the definition at `path` (relative to `parent`'s directory)
    /// and attach it as a child. A failing import is recorded on the child
    /// and does not fail the caller.
    pub fn import_testset(&mut self, parent: &mut Testset, path: &str) {
        let file = normalize(&parent.path().join(path));
        let loader = self.loader;
        match loader.evaluate_file(&mut *self.window, &file, Some(&*parent)) {
            Ok(child) => {
                parent.push_testset(child);
            }
            Err(failure) => {
                let LoadFailure { error, mut partial } = failure;
                emit_load_failed(&file, &error);
                partial.set_load_error(error.to_string());
                parent.push_testset(partial);
            }
        }
    }
}

/// A build that did not complete. `partial` holds whatever was added
/// before the error.
#[derive(Debug)]
pub struct LoadFailure {
    pub error: LoadError,
    pub partial: Testset,
}

/// Evaluates definition files into testset trees.
#[derive(Debug, Clone, Default)]
pub struct DefinitionLoader {
    config: ConfigResolver,
    env: BuildEnv,
}

impl DefinitionLoader {
    pub fn new(config: ConfigResolver, env: BuildEnv) -> Self {
        Self { config, env }
    }

    pub fn env(&self) -> &BuildEnv {
        &self.env
    }

    /// Load a top-level definition file. Never fails: a broken build is
    /// returned with its load error set so its subtree can be excluded.
    pub fn load(&self, resolver: &mut ModuleResolver, file: &Path) -> Testset {
        let mut outer = resolver.open_window(&ResolvedSearchPath::default());
        match self.evaluate_file(&mut outer, file, None) {
            Ok(testset) => testset,
            Err(LoadFailure { error, mut partial }) => {
                emit_load_failed(file, &error);
                partial.set_load_error(error.to_string());
                partial
            }
        }
    }

    /// Run `module`'s build entry point with `search` appended to the
    /// resolver's search order for exactly the duration of the call.
    pub fn build_module(
        &self,
        resolver: &mut ModuleResolver,
        search: &ResolvedSearchPath,
        dir: &Path,
        module: &dyn DefinitionModule,
    ) -> std::result::Result<Testset, LoadFailure> {
        let mut window = resolver.open_window(search);
        let mut testset = Testset::new(dir);
        let mut ctx = BuildContext {
            loader: self,
            window: &mut window,
            definition: dir.to_path_buf(),
        };
        match module.build(&mut testset, &mut ctx) {
            Ok(()) => Ok(testset),
            Err(error) => Err(LoadFailure {
                error,
                partial: testset,
            }),
        }
    }

    fn evaluate_file(
        &self,
        window: &mut ResolveWindow<'_>,
        file: &Path,
        parent: Option<&Testset>,
    ) -> std::result::Result<Testset, LoadFailure> {
        let dir = file.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
        let mut testset = match parent {
            Some(parent) => Testset::child_of(parent, dir.clone()),
            None => Testset::new(dir.clone()),
        };
        testset.set_source(file);

        debug!(file = %file.display(), "parsing test definition");

        let search = match self.config.resolve(&dir) {
            Ok(search) => search,
            Err(source) => {
                return Err(LoadFailure {
                    error: LoadError::Config {
                        definition: file.to_path_buf(),
                        source,
                    },
                    partial: testset,
                })
            }
        };

        let mut inner = window.nest(&search);

        let module = match YamlDefinition::load(file) {
            Ok(module) => module,
            Err(error) => {
                return Err(LoadFailure {
                    error,
                    partial: testset,
                })
            }
        };

        let mut ctx = BuildContext {
            loader: self,
            window: &mut inner,
            definition: file.to_path_buf(),
        };
        match module.build(&mut testset, &mut ctx) {
            Ok(()) => Ok(testset),
            Err(error) => Err(LoadFailure {
                error,
                partial: testset,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// YAML definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Condition {
    #[serde(default)]
    platforms: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl Condition {
    fn holds(&self, ctx: &BuildContext<'_, '_>) -> bool {
        let platform_ok =
            self.platforms.is_empty() || self.platforms.iter().any(|p| p == ctx.platform());
        platform_ok
            && self
                .properties
                .iter()
                .all(|(name, value)| ctx.property(name) == Some(value.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSpec {
    name: String,
    #[serde(default)]
    sourceme: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    skip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CommandSpec {
    Shell {
        #[serde(default)]
        name: Option<String>,
        cmd: String,
        #[serde(default)]
        retval: i32,
    },
    Call {
        #[serde(default)]
        name: Option<String>,
        handler: String,
    },
    Check {
        #[serde(default)]
        name: Option<String>,
        handler: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: BTreeMap<String, Value>,
    },
}

/// Command preset of a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TestKind {
    #[default]
    Commands,
    Make,
    Gvrun,
    Sdk,
    SdkNetlistPower,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BenchSpec {
    pattern: String,
    metric: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestSpec {
    name: String,
    #[serde(default)]
    kind: TestKind,
    #[serde(default)]
    flags: Option<String>,
    #[serde(default)]
    checker: Option<String>,
    #[serde(default)]
    retval: i32,
    #[serde(default)]
    when: Option<Condition>,
    #[serde(default)]
    skip: Option<String>,
    #[serde(default)]
    commands: Vec<CommandSpec>,
    #[serde(default)]
    benchmarks: Vec<BenchSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestsetSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Option<Condition>,
    #[serde(default)]
    targets: Vec<TargetSpec>,
    #[serde(default)]
    testsets: Vec<TestsetSpec>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    tests: Vec<TestSpec>,
}

/// Definition interpreted from a `testset.yaml` file.
#[derive(Debug, Clone)]
pub struct YamlDefinition {
    spec: TestsetSpec,
}

impl YamlDefinition {
    pub fn parse(text: &str, file: &Path) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self {
                spec: TestsetSpec::default(),
            });
        }
        let spec = serde_yaml::from_str(text).map_err(|e| {
            let location = e.location();
            LoadError::Syntax {
                path: file.to_path_buf(),
                line: location.as_ref().map(|l| l.line()),
                column: location.as_ref().map(|l| l.column()),
                message: e.to_string(),
            }
        })?;
        Ok(Self { spec })
    }

    pub fn load(file: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(file).map_err(|source| LoadError::Open {
            path: file.to_path_buf(),
            source,
        })?;
        Self::parse(&text, file)
    }
}

impl DefinitionModule for YamlDefinition {
    fn build(&self, testset: &mut Testset, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
        build_spec(&self.spec, testset, ctx)
    }
}

fn build_spec(spec: &TestsetSpec, testset: &mut Testset, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
    if let Some(name) = &spec.name {
        testset.set_name(name.clone());
    }

    for target in &spec.targets {
        let sourceme = target.sourceme.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                normalize(&testset.path().join(p))
            }
        });
        testset.add_target(
            target.name.clone(),
            TargetConfig {
                sourceme,
                env: target.env.clone(),
                properties: target.properties.clone(),
                timeout: target.timeout,
                skip: target.skip.clone(),
            },
        );
    }

    for nested in &spec.testsets {
        if !nested.when.as_ref().map_or(true, |c| c.holds(ctx)) {
            continue;
        }
        let mut child = Testset::child_of(testset, testset.path().to_path_buf());
        if let Some(source) = testset.source() {
            child.set_source(source);
        }
        let child = testset.push_testset(child);
        build_spec(nested, child, ctx)?;
    }

    for import in &spec.imports {
        ctx.import_testset(testset, import);
    }

    for test_spec in &spec.tests {
        if !test_spec.when.as_ref().map_or(true, |c| c.holds(ctx)) {
            debug!(test = %test_spec.name, "test condition not met, not declared");
            continue;
        }
        build_test(test_spec, testset, ctx)?;
    }

    Ok(())
}

/// Shell commands generated for a preset `kind`. `{flags}`, `{platform}`,
/// `{config}` and `{target}` are left for per-run substitution.
fn preset_commands(spec: &TestSpec, testset: &Testset, build_root: Option<&Path>) -> Vec<Command> {
    let tree_path = match testset.full_name() {
        Some(parent) => format!("{}/{}", parent.replace(':', "/"), spec.name),
        None => spec.name.clone(),
    };
    let mut flags: Vec<String> = spec.flags.iter().cloned().collect();
    flags.push("{flags}".to_string());

    let steps = |program: &str, flags: &[String]| {
        let flags = flags.join(" ");
        vec![
            Command::shell("clean", format!("{program} clean {flags}")),
            Command::shell("build", format!("{program} build {flags}")),
            Command::shell_with_retval("run", format!("{program} run {flags}"), spec.retval),
        ]
    };

    match spec.kind {
        TestKind::Commands => Vec::new(),
        TestKind::Make => {
            let build = match build_root {
                Some(root) => format!("{}/tests/{tree_path}", root.display()),
                None => format!("{}/build/{{config}}/{}", testset.path().display(), spec.name),
            };
            flags.push("platform={platform}".to_string());
            flags.push(format!("build={build}"));
            steps("make", &flags)
        }
        TestKind::Gvrun => {
            let build = match build_root {
                Some(root) => format!("{}/tests/{tree_path}/{{target}}", root.display()),
                None => format!("build/{{target}}/{}", spec.name),
            };
            flags.push("--platform={platform}".to_string());
            flags.push(format!("--build-dir={build}"));
            let flags = flags.join(" ");
            vec![
                Command::shell("clean", format!("gvrun --target {{target}} {flags} clean")),
                Command::shell("build", format!("gvrun --target {{target}} {flags} build")),
                Command::shell_with_retval("run", format!("gvrun --target {{target}} {flags} run"), spec.retval),
            ]
        }
        TestKind::Sdk | TestKind::SdkNetlistPower => {
            flags.push("--platform={platform}".to_string());
            flags.push(format!("--build=build/{{config}}/{}", spec.name));
            let mut commands = steps("posbuild", &flags);
            if spec.kind == TestKind::SdkNetlistPower {
                let flags = flags.join(" ");
                commands.push(Command::shell("power_gen", format!("make power_gen {flags}")));
                commands.push(Command::shell("power_copy", format!("make power_copy {flags}")));
            }
            commands
        }
    }
}

fn build_test(spec: &TestSpec, testset: &mut Testset, ctx: &mut BuildContext<'_, '_>) -> Result<()> {
    if spec.kind == TestKind::Commands && (spec.flags.is_some() || spec.retval != 0) {
        return Err(LoadError::Build {
            definition: ctx.definition().to_path_buf(),
            message: format!("test '{}': 'flags' and 'retval' need a preset 'kind'", spec.name),
        });
    }

    // Resolve everything first so a failing test is not half-declared.
    let mut commands = preset_commands(spec, testset, ctx.build_root());
    if let Some(checker) = &spec.checker {
        commands.push(Command::Checker {
            name: "check".to_string(),
            handler: ctx.resolve(checker)?,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        });
    }
    for command in &spec.commands {
        commands.push(match command {
            CommandSpec::Shell { name, cmd, retval } => Command::Shell {
                name: name.clone().unwrap_or_else(|| "shell".to_string()),
                cmd: cmd.clone(),
                retval: *retval,
            },
            CommandSpec::Call { name, handler } => Command::Call {
                name: name.clone().unwrap_or_else(|| "call".to_string()),
                handler: ctx.resolve(handler)?,
            },
            CommandSpec::Check {
                name,
                handler,
                args,
                kwargs,
            } => Command::Checker {
                name: name.clone().unwrap_or_else(|| "check".to_string()),
                handler: ctx.resolve(handler)?,
                args: args.clone(),
                kwargs: kwargs.clone(),
            },
        });
    }

    let definition = ctx.definition().to_path_buf();
    let mut rules = Vec::with_capacity(spec.benchmarks.len());
    for bench in &spec.benchmarks {
        regex::Regex::new(&bench.pattern).map_err(|source| LoadError::BenchPattern {
            definition: definition.clone(),
            pattern: bench.pattern.clone(),
            source,
        })?;
        rules.push(bench);
    }

    let test = testset.new_test(&spec.name);
    for command in commands {
        test.add_command(command);
    }
    for bench in rules {
        test.add_benchmark(&bench.pattern, &bench.metric, &bench.description)
            .map_err(|source| LoadError::BenchPattern {
                definition: definition.clone(),
                pattern: bench.pattern.clone(),
                source,
            })?;
    }
    if let Some(reason) = &spec.skip {
        test.skip(reason.clone());
    }
    Ok(())
}
