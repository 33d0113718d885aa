//! Execution of one run's commands under a deadline.
//!
//! Shell commands run through `sh -c` in their own process group with
//! stderr folded into stdout. Output is read line by line and forwarded to
//! the observer as it arrives. When the deadline passes or the session is
//! interrupted, the shell's process group and every descendant found by a
//! tree walk get SIGTERM, then SIGKILL after a grace period. Signalling the
//! group reaches processes that were reparented away from the shell; the
//! tree walk reaches those that left the group. Scripts started by Call and
//! Checker handlers lead their own groups and are terminated the same way.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use simtest_core::obs::{emit_run_finished, emit_run_started, run_span};
use simtest_core::{Command, HandlerOutcome, Invocation, RunRecord, RunStatus, SpawnedProcesses};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

use crate::observer::RunObserver;
use crate::plan::Run;

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Appended once when stored output hits the length cap.
pub const TRUNCATION_MARKER: &str = "--- Output truncated ---\n";

/// Appended to a run's output when its deadline passes.
pub const TIMEOUT_BANNER: &str = "--- Timeout reached ---\n";

/// Errors starting a command. Reported inside the run's output; the run
/// fails but the session continues.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn shell for command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read output: {0}")]
    Output(#[source] std::io::Error),

    #[error("handler '{reference}' failed: {message}")]
    Handler { reference: String, message: String },
}

/// Captured output with an optional byte cap.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append `chunk`, cutting it at the cap on a character boundary.
    pub fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        let Some(limit) = self.limit else {
            self.text.push_str(chunk);
            return;
        };
        let room = limit.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Stored text and whether it was truncated.
    pub fn into_parts(self) -> (String, bool) {
        (self.text, self.truncated)
    }
}

/// How one command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepOutcome {
    Passed,
    Failed { exit_code: Option<i32>, message: Option<String> },
    TimedOut,
    Interrupted,
}

/// Resolves once the cancellation flag is raised. Never resolves if the
/// sender is gone without raising it.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn deadline_reached(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Runs commands and terminates process trees.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    max_output_len: Option<usize>,
    grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProcessSupervisor {
    /// Supervisor storing at most `max_output_len` bytes of output per run.
    pub fn new(max_output_len: Option<usize>) -> Self {
        Self {
            max_output_len,
            grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Time allowed between SIGTERM and SIGKILL.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Execute every command of `run` in order, stopping at the first
    /// failure, timeout or interrupt.
    pub async fn execute(
        &self,
        run: &Run,
        observer: &dyn RunObserver,
        mut cancel: watch::Receiver<bool>,
    ) -> RunRecord {
        let span = run_span(&run.id, run.full_name(), &run.config);
        self.execute_inner(run, observer, &mut cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        run: &Run,
        observer: &dyn RunObserver,
        cancel: &mut watch::Receiver<bool>,
    ) -> RunRecord {
        emit_run_started(&run.id, run.full_name(), &run.config);

        let start = Instant::now();
        let deadline = run.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut output = OutputBuffer::new(self.max_output_len);
        let mut outcome = StepOutcome::Passed;

        for command in &run.commands {
            debug!(command = %command.name(), kind = command.kind(), "executing command");
            outcome = match command {
                Command::Shell { cmd, retval, .. } => {
                    let cmd = run.render(cmd);
                    self.emit(run, observer, &mut output, &format!("--- Shell command: {cmd} ---\n"));
                    self.run_shell(run, &cmd, *retval, deadline, cancel, observer, &mut output)
                        .await
                }
                Command::Call { handler, .. } => {
                    self.emit(run, observer, &mut output, "--- Call command ---\n");
                    self.run_handler(run, handler, &[], &Default::default(), deadline, cancel, observer, &mut output)
                        .await
                }
                Command::Checker {
                    handler,
                    args,
                    kwargs,
                    ..
                } => {
                    self.emit(run, observer, &mut output, "--- Checker command ---\n");
                    self.run_handler(run, handler, args, kwargs, deadline, cancel, observer, &mut output)
                        .await
                }
            };
            if outcome != StepOutcome::Passed {
                break;
            }
        }

        let mut exit_code = None;
        let mut message = None;
        let mut timed_out = false;
        let status = match outcome {
            StepOutcome::Passed => {
                exit_code = Some(0);
                RunStatus::Passed
            }
            StepOutcome::Failed {
                exit_code: code,
                message: msg,
            } => {
                exit_code = code;
                message = msg;
                RunStatus::Failed
            }
            StepOutcome::TimedOut => {
                self.emit(run, observer, &mut output, TIMEOUT_BANNER);
                timed_out = true;
                message = Some("timeout reached".to_string());
                RunStatus::Failed
            }
            StepOutcome::Interrupted => {
                message = Some("interrupted".to_string());
                RunStatus::Failed
            }
        };

        let duration = start.elapsed();
        emit_run_finished(&run.id, status, duration.as_millis() as u64, timed_out);

        let (output, truncated) = output.into_parts();
        RunRecord {
            run_id: run.id.clone(),
            location: run.location.clone(),
            test_name: run.full_name().to_string(),
            target: run.target.name.clone(),
            config: run.config.clone(),
            status,
            duration_secs: duration.as_secs_f64(),
            output,
            exit_code,
            timed_out,
            truncated,
            message,
            benchmarks: Vec::new(),
        }
    }

    fn emit(&self, run: &Run, observer: &dyn RunObserver, output: &mut OutputBuffer, text: &str) {
        for line in text.lines() {
            observer.on_output_line(run, line);
        }
        output.push(text);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_shell(
        &self,
        run: &Run,
        cmd: &str,
        retval: i32,
        deadline: Option<tokio::time::Instant>,
        cancel: &mut watch::Receiver<bool>,
        observer: &dyn RunObserver,
        output: &mut OutputBuffer,
    ) -> StepOutcome {
        let mut script = String::from("exec 2>&1\n");
        if let Some(sourceme) = &run.target.config.sourceme {
            script.push_str(&format!(". {}\n", shell_quote(sourceme)));
        }
        script.push_str(cmd);

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .current_dir(run.test.path())
            .envs(&run.target.config.env)
            .env("SIMTEST_TARGET", &run.target.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    command: cmd.to_string(),
                    source,
                };
                self.emit(run, observer, output, &format!("{err}\n"));
                return StepOutcome::Failed {
                    exit_code: None,
                    message: Some(err.to_string()),
                };
            }
        };

        let Some(stdout) = child.stdout.take() else {
            self.terminate_child(&mut child).await;
            return StepOutcome::Failed {
                exit_code: None,
                message: Some("child stdout unavailable".to_string()),
            };
        };
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        buf.clear();
                        observer.on_output_line(run, line.trim_end_matches(['\n', '\r']));
                        output.push(&line);
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading command output");
                        self.emit(run, observer, output, &format!("{}\n", SupervisorError::Output(e)));
                        break;
                    }
                },
                _ = deadline_reached(deadline) => {
                    self.terminate_child(&mut child).await;
                    return StepOutcome::TimedOut;
                }
                _ = cancelled(cancel) => {
                    self.terminate_child(&mut child).await;
                    return StepOutcome::Interrupted;
                }
            }
        }

        // Output closed; the shell itself may still be running.
        let status = tokio::select! {
            status = child.wait() => status,
            _ = deadline_reached(deadline) => {
                self.terminate_child(&mut child).await;
                return StepOutcome::TimedOut;
            }
            _ = cancelled(cancel) => {
                self.terminate_child(&mut child).await;
                return StepOutcome::Interrupted;
            }
        };

        match status {
            Ok(status) => {
                let code = exit_code_of(&status);
                if code == retval {
                    StepOutcome::Passed
                } else {
                    StepOutcome::Failed {
                        exit_code: Some(code),
                        message: Some(format!("exit code {code}, expected {retval}")),
                    }
                }
            }
            Err(e) => StepOutcome::Failed {
                exit_code: None,
                message: Some(format!("failed to wait for command: {e}")),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_handler(
        &self,
        run: &Run,
        handler: &simtest_core::HandlerRef,
        args: &[serde_json::Value],
        kwargs: &std::collections::BTreeMap<String, serde_json::Value>,
        deadline: Option<tokio::time::Instant>,
        cancel: &mut watch::Receiver<bool>,
        observer: &dyn RunObserver,
        output: &mut OutputBuffer,
    ) -> StepOutcome {
        let callable = handler.handler.clone();
        let captured = output.as_str().to_string();
        let workdir = run.test.path().to_path_buf();
        let target = run.target.clone();
        let args = args.to_vec();
        let kwargs = kwargs.clone();
        let spawned = SpawnedProcesses::new();
        let registry = spawned.clone();

        let mut task = tokio::task::spawn_blocking(move || {
            callable.invoke(&Invocation {
                output: &captured,
                workdir: &workdir,
                target: &target,
                args: &args,
                kwargs: &kwargs,
                spawned: &registry,
            })
        });

        let stopped = tokio::select! {
            joined = &mut task => Ok(joined),
            _ = deadline_reached(deadline) => Err(StepOutcome::TimedOut),
            _ = cancelled(cancel) => Err(StepOutcome::Interrupted),
        };
        let joined = match stopped {
            Ok(joined) => joined,
            Err(step) => {
                let leaders = spawned.pids();
                warn!(handler = %handler.reference, processes = leaders.len(), "stopping unfinished handler");
                if !leaders.is_empty() {
                    self.terminate(&leaders, async {
                        let _ = task.await;
                    })
                    .await;
                }
                return step;
            }
        };

        let outcome: Result<HandlerOutcome, SupervisorError> = match joined {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(SupervisorError::Handler {
                reference: handler.reference.clone(),
                message: format!("{e:#}"),
            }),
            Err(e) => Err(SupervisorError::Handler {
                reference: handler.reference.clone(),
                message: format!("handler task aborted: {e}"),
            }),
        };

        match outcome {
            Ok(outcome) => {
                if let Some(message) = &outcome.message {
                    let mut text = message.clone();
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                    self.emit(run, observer, output, &text);
                }
                if outcome.passed {
                    StepOutcome::Passed
                } else {
                    StepOutcome::Failed {
                        exit_code: None,
                        message: outcome.message,
                    }
                }
            }
            Err(err) => {
                self.emit(run, observer, output, &format!("{err}\n"));
                StepOutcome::Failed {
                    exit_code: None,
                    message: Some(err.to_string()),
                }
            }
        }
    }

    /// Terminate `child` and everything it spawned.
    async fn terminate_child(&self, child: &mut tokio::process::Child) {
        let Some(pid) = child.id() else {
            return;
        };
        self.terminate(&[pid], async {
            let _ = child.wait().await;
        })
        .await;
    }

    /// Terminate each process group led by `leaders`, along with every
    /// descendant of the leaders. `exited` resolves once the caller's own
    /// process is gone.
    async fn terminate(&self, leaders: &[u32], exited: impl Future<Output = ()>) {
        tokio::pin!(exited);
        let mut doomed = Vec::new();
        for &leader in leaders {
            doomed.extend(process_tree(leader));
        }
        debug!(?leaders, processes = doomed.len(), "terminating process groups");

        signal_groups(leaders, GroupSignal::Term);
        signal_pids(&doomed, sysinfo::Signal::Term);
        let gone = tokio::time::timeout(self.grace, &mut exited).await.is_ok();
        if !gone {
            debug!(?leaders, "grace period expired");
        }

        // Anything forked during the grace period is killed as well. A
        // reaped leader's pid may already be reused, so it is not walked.
        if !gone {
            for &leader in leaders {
                for late in process_tree(leader) {
                    if !doomed.contains(&late) {
                        doomed.push(late);
                    }
                }
            }
        }
        signal_groups(leaders, GroupSignal::Kill);
        signal_pids(&doomed, sysinfo::Signal::Kill);

        if !gone && tokio::time::timeout(self.grace, &mut exited).await.is_err() {
            warn!(?leaders, "process did not exit after SIGKILL");
        }
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// `pid` followed by every process below it, parents before children.
fn process_tree(pid: u32) -> Vec<sysinfo::Pid> {
    let root = sysinfo::Pid::from_u32(pid);
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let mut children_map: HashMap<sysinfo::Pid, Vec<sysinfo::Pid>> = HashMap::new();
    for (p, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children_map.entry(parent).or_default().push(*p);
        }
    }

    let mut out = vec![root];
    let mut next = 0;
    while next < out.len() {
        if let Some(children) = children_map.get(&out[next]) {
            out.extend(children.iter().copied());
        }
        next += 1;
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupSignal {
    Term,
    Kill,
}

/// Send `signal` to every process group led by `leaders`. Groups that no
/// longer exist are ignored.
#[cfg(unix)]
fn signal_groups(leaders: &[u32], signal: GroupSignal) {
    let signo = match signal {
        GroupSignal::Term => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    for &leader in leaders {
        let Ok(pgid) = libc::pid_t::try_from(leader) else {
            continue;
        };
        if pgid <= 1 {
            continue;
        }
        // SAFETY: killpg takes plain integers and touches no memory.
        if unsafe { libc::killpg(pgid, signo) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, error = %err, "failed to signal process group");
            }
        }
    }
}

#[cfg(not(unix))]
fn signal_groups(_leaders: &[u32], _signal: GroupSignal) {}

/// Signal `pids`, deepest first. Processes that already exited are ignored.
fn signal_pids(pids: &[sysinfo::Pid], signal: sysinfo::Signal) {
    if pids.is_empty() {
        return;
    }
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(pids), true);
    for pid in pids.iter().rev() {
        if let Some(process) = sys.process(*pid) {
            if process.kill_with(signal) != Some(true) && signal == sysinfo::Signal::Kill {
                let _ = process.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_unbounded() {
        let mut buf = OutputBuffer::new(None);
        buf.push("a\n");
        buf.push("b\n");
        assert_eq!(buf.as_str(), "a\nb\n");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_output_buffer_truncates_once() {
        let mut buf = OutputBuffer::new(Some(4));
        buf.push("abc\n");
        buf.push("def\n");
        buf.push("ghi\n");
        let (text, truncated) = buf.into_parts();
        assert!(truncated);
        assert_eq!(text, format!("abc\n{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_output_buffer_respects_char_boundaries() {
        let mut buf = OutputBuffer::new(Some(2));
        buf.push("éé");
        assert!(buf.as_str().starts_with('é'));
        assert!(buf.is_truncated());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(Path::new("/a b/c'd")), r"'/a b/c'\''d'");
    }

    #[test]
    fn test_process_tree_starts_with_root() {
        let me = std::process::id();
        let tree = process_tree(me);
        assert_eq!(tree.first(), Some(&sysinfo::Pid::from_u32(me)));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_when_flag_raised() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { cancelled(&mut rx).await });
        tx.send(true).expect("receiver alive");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("resolved in time")
            .expect("task ok");
    }

    #[tokio::test]
    async fn test_cancelled_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let res = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(res.is_err());
    }
}
