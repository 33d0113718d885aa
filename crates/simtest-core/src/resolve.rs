//! Handler resolution through an explicit, time-boxed search order.
//!
//! Definition files name their callbacks as `module::handler`. Modules are
//! looked up in three places, in order: the always-present `builtin`
//! module, native modules registered by the embedding program, and
//! `<dir>/<module>.yaml` files found along the search order.
//!
//! The search order only grows through [`ModuleResolver::open_window`]. The
//! returned [`ResolveWindow`] truncates it back when dropped, so paths
//! contributed by a definition's config files are visible while that
//! definition builds and never afterwards. Handlers resolved inside the
//! window are plain `Arc` values and keep working once it closes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{normalize, ResolvedSearchPath};
use crate::error::ResolveError;
use crate::model::{render_scalar, Target};

/// Name of the module that is always resolvable.
pub const BUILTIN_MODULE: &str = "builtin";

/// Everything a Call/Checker handler can observe about its run.
#[derive(Debug)]
pub struct Invocation<'a> {
    /// Output captured so far in the run.
    pub output: &'a str,
    /// The test's working directory.
    pub workdir: &'a Path,
    pub target: &'a Target,
    pub args: &'a [Value],
    pub kwargs: &'a BTreeMap<String, Value>,
    /// Processes started by the handler. Each one leads its own process
    /// group and is terminated with the run.
    pub spawned: &'a SpawnedProcesses,
}

/// Pids of processes a handler started for one invocation.
#[derive(Debug, Clone, Default)]
pub struct SpawnedProcesses {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl SpawnedProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid`. It must be the leader of a fresh process group.
    pub fn register(&self, pid: u32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).push(pid);
    }

    /// Registered pids, oldest first.
    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Verdict returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub passed: bool,
    /// Appended to the run's output when present.
    pub message: Option<String>,
}

impl HandlerOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
        }
    }
}

/// A callback usable from Call and Checker commands.
///
/// Handlers run on a blocking thread and may do synchronous work.
pub trait Handler: Send + Sync {
    fn invoke(&self, invocation: &Invocation<'_>) -> anyhow::Result<HandlerOutcome>;
}

impl<F> Handler for F
where
    F: Fn(&Invocation<'_>) -> anyhow::Result<HandlerOutcome> + Send + Sync,
{
    fn invoke(&self, invocation: &Invocation<'_>) -> anyhow::Result<HandlerOutcome> {
        self(invocation)
    }
}

// ---------------------------------------------------------------------------
// Builtin handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinKind {
    Pass,
    Fail,
    OutputContains,
    OutputLacks,
    OutputMatches,
    FileExists,
}

impl BuiltinKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "pass" => Some(BuiltinKind::Pass),
            "fail" => Some(BuiltinKind::Fail),
            "output_contains" => Some(BuiltinKind::OutputContains),
            "output_lacks" => Some(BuiltinKind::OutputLacks),
            "output_matches" => Some(BuiltinKind::OutputMatches),
            "file_exists" => Some(BuiltinKind::FileExists),
            _ => None,
        }
    }

    /// Parameter filled by the first positional argument.
    fn primary_param(&self) -> Option<&'static str> {
        match self {
            BuiltinKind::Pass => None,
            BuiltinKind::Fail => Some("message"),
            BuiltinKind::OutputContains | BuiltinKind::OutputLacks => Some("text"),
            BuiltinKind::OutputMatches => Some("pattern"),
            BuiltinKind::FileExists => Some("path"),
        }
    }
}

struct BuiltinHandler {
    name: String,
    kind: BuiltinKind,
    params: BTreeMap<String, Value>,
}

impl BuiltinHandler {
    fn new(name: &str, params: BTreeMap<String, Value>) -> Result<Self, ResolveError> {
        let kind = BuiltinKind::parse(name).ok_or_else(|| ResolveError::UnknownBuiltin(name.to_string()))?;

        if kind == BuiltinKind::OutputMatches {
            if let Some(pattern) = params.get("pattern") {
                Regex::new(&render_scalar(pattern)).map_err(|e| ResolveError::InvalidParams {
                    handler: name.to_string(),
                    message: e.to_string(),
                })?;
            }
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            params,
        })
    }

    /// Bound params, overridden by kwargs, with the first positional
    /// argument filling the primary parameter.
    fn param(&self, key: &str, invocation: &Invocation<'_>) -> Option<String> {
        if let Some(value) = invocation.kwargs.get(key) {
            return Some(render_scalar(value));
        }
        if self.kind.primary_param() == Some(key) {
            if let Some(first) = invocation.args.first() {
                return Some(render_scalar(first));
            }
        }
        self.params.get(key).map(render_scalar)
    }

    fn required(&self, key: &str, invocation: &Invocation<'_>) -> anyhow::Result<String> {
        self.param(key, invocation)
            .with_context(|| format!("builtin::{} requires parameter '{key}'", self.name))
    }
}

impl Handler for BuiltinHandler {
    fn invoke(&self, invocation: &Invocation<'_>) -> anyhow::Result<HandlerOutcome> {
        let outcome = match self.kind {
            BuiltinKind::Pass => HandlerOutcome::pass(),
            BuiltinKind::Fail => HandlerOutcome::fail(
                self.param("message", invocation)
                    .unwrap_or_else(|| "failed by builtin::fail".to_string()),
            ),
            BuiltinKind::OutputContains => {
                let text = self.required("text", invocation)?;
                if invocation.output.contains(&text) {
                    HandlerOutcome::pass()
                } else {
                    HandlerOutcome::fail(format!("output does not contain '{text}'\n"))
                }
            }
            BuiltinKind::OutputLacks => {
                let text = self.required("text", invocation)?;
                if invocation.output.contains(&text) {
                    HandlerOutcome::fail(format!("output unexpectedly contains '{text}'\n"))
                } else {
                    HandlerOutcome::pass()
                }
            }
            BuiltinKind::OutputMatches => {
                let pattern = self.required("pattern", invocation)?;
                let re = Regex::new(&pattern).with_context(|| format!("invalid pattern '{pattern}'"))?;
                if re.is_match(invocation.output) {
                    HandlerOutcome::pass()
                } else {
                    HandlerOutcome::fail(format!("output does not match /{pattern}/\n"))
                }
            }
            BuiltinKind::FileExists => {
                let path = self.required("path", invocation)?;
                let full = invocation.workdir.join(&path);
                if full.exists() {
                    HandlerOutcome::pass()
                } else {
                    HandlerOutcome::fail(format!("missing file {}\n", full.display()))
                }
            }
        };
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Script handlers
// ---------------------------------------------------------------------------

/// Runs an external program: captured output on stdin, positional args as
/// argv, kwargs as `SIMTEST_ARG_<KEY>` variables. Exit 0 passes.
struct ScriptHandler {
    program: PathBuf,
}

impl Handler for ScriptHandler {
    fn invoke(&self, invocation: &Invocation<'_>) -> anyhow::Result<HandlerOutcome> {
        let mut command = std::process::Command::new(&self.program);
        command
            .args(invocation.args.iter().map(render_scalar))
            .current_dir(invocation.workdir)
            .env("SIMTEST_TARGET", invocation.target.name())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in invocation.kwargs {
            command.env(format!("SIMTEST_ARG_{}", key.to_uppercase()), render_scalar(value));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn handler script {}", self.program.display()))?;
        invocation.spawned.register(child.id());

        if let Some(mut stdin) = child.stdin.take() {
            let payload = invocation.output.as_bytes().to_vec();
            // A script that never reads stdin must not block us on a full pipe.
            std::thread::spawn(move || {
                let _ = stdin.write_all(&payload);
            });
        }

        let output = child.wait_with_output()?;
        let mut message = String::from_utf8_lossy(&output.stdout).into_owned();
        message.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(HandlerOutcome {
            passed: output.status.success(),
            message: (!message.is_empty()).then_some(message),
        })
    }
}

// ---------------------------------------------------------------------------
// Module files
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleFile {
    #[serde(default)]
    handlers: BTreeMap<String, HandlerSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HandlerSpec {
    #[serde(default)]
    builtin: Option<String>,
    #[serde(default)]
    script: Option<PathBuf>,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

fn load_module_handler(file: &Path, handler: &str) -> Result<Arc<dyn Handler>, ResolveError> {
    let invalid = |line: Option<usize>, column: Option<usize>, message: String| ResolveError::InvalidModule {
        path: file.to_path_buf(),
        line,
        column,
        message,
    };

    let text = std::fs::read_to_string(file).map_err(|e| invalid(None, None, e.to_string()))?;
    let module: ModuleFile = if text.trim().is_empty() {
        ModuleFile {
            handlers: BTreeMap::new(),
        }
    } else {
        serde_yaml::from_str(&text).map_err(|e| {
            let location = e.location();
            invalid(
                location.as_ref().map(|l| l.line()),
                location.as_ref().map(|l| l.column()),
                e.to_string(),
            )
        })?
    };

    let module_name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let spec = module
        .handlers
        .get(handler)
        .ok_or_else(|| ResolveError::HandlerNotFound {
            module: module_name,
            handler: handler.to_string(),
        })?;

    match (&spec.builtin, &spec.script) {
        (Some(builtin), None) => Ok(Arc::new(BuiltinHandler::new(builtin, spec.params.clone())?)),
        (None, Some(script)) => {
            let base = file.parent().unwrap_or_else(|| Path::new("/"));
            let program = if script.is_absolute() {
                script.clone()
            } else {
                normalize(&base.join(script))
            };
            Ok(Arc::new(ScriptHandler { program }))
        }
        _ => Err(invalid(
            None,
            None,
            format!("handler '{handler}' must set exactly one of 'builtin' or 'script'"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Parsed `module::handler` reference.
fn split_reference(reference: &str) -> Result<(&str, &str), ResolveError> {
    match reference.split_once("::") {
        Some((module, handler)) if !module.is_empty() && !handler.is_empty() => Ok((module, handler)),
        _ => Err(ResolveError::MalformedReference(reference.to_string())),
    }
}

/// Owner of the search order and the native module registry.
#[derive(Default)]
pub struct ModuleResolver {
    search_order: Vec<PathBuf>,
    natives: BTreeMap<String, BTreeMap<String, Arc<dyn Handler>>>,
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver whose permanent search order is `base`.
    pub fn with_base(base: Vec<PathBuf>) -> Self {
        Self {
            search_order: base,
            natives: BTreeMap::new(),
        }
    }

    /// Current search order, base entries first.
    pub fn search_order(&self) -> &[PathBuf] {
        &self.search_order
    }

    /// Make `module::name` resolvable regardless of the search order.
    pub fn register_native(&mut self, module: &str, name: &str, handler: Arc<dyn Handler>) {
        self.natives
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), handler);
    }

    /// Append `path` to the search order until the returned guard drops.
    pub fn open_window(&mut self, path: &ResolvedSearchPath) -> ResolveWindow<'_> {
        let restore_len = self.search_order.len();
        self.search_order.extend(path.dirs().iter().cloned());
        debug!(added = path.len(), total = self.search_order.len(), "opened resolution window");
        ResolveWindow {
            resolver: self,
            restore_len,
        }
    }

    /// Resolve a handler against the current search order.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn Handler>, ResolveError> {
        let (module, handler) = split_reference(reference)?;

        if module == BUILTIN_MODULE {
            return Ok(Arc::new(BuiltinHandler::new(handler, BTreeMap::new())?));
        }

        if let Some(native) = self.natives.get(module) {
            return native
                .get(handler)
                .cloned()
                .ok_or_else(|| ResolveError::HandlerNotFound {
                    module: module.to_string(),
                    handler: handler.to_string(),
                });
        }

        let relative = format!("{}.yaml", module.replace('.', "/"));
        let file = self
            .search_order
            .iter()
            .map(|dir| dir.join(&relative))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ResolveError::ModuleNotFound {
                module: module.to_string(),
                searched: self.search_order.len(),
            })?;

        debug!(reference = %reference, module = %file.display(), "resolved handler module");
        load_module_handler(&file, handler)
    }
}

/// Guard for a temporarily extended search order.
pub struct ResolveWindow<'a> {
    resolver: &'a mut ModuleResolver,
    restore_len: usize,
}

impl ResolveWindow<'_> {
    /// Resolve against the search order as extended by this window.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn Handler>, ResolveError> {
        self.resolver.resolve(reference)
    }

    /// Search order seen by handlers resolved through this window.
    pub fn search_order(&self) -> &[PathBuf] {
        self.resolver.search_order()
    }

    /// Open an inner window on top of this one.
    pub fn nest(&mut self, path: &ResolvedSearchPath) -> ResolveWindow<'_> {
        self.resolver.open_window(path)
    }
}

impl Drop for ResolveWindow<'_> {
    fn drop(&mut self) {
        self.resolver.search_order.truncate(self.restore_len);
        debug!(total = self.restore_len, "closed resolution window");
    }
}
