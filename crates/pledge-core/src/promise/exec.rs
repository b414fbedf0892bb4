//! Process-execution promises: exec, pipe and spipe evaluation.
//!
//! An exec spawns a subprocess with the context's working directory,
//! environment and credential, and captures stdout/stderr into the shared
//! context buffers through two reader threads that are joined before the
//! node returns, so captures are always complete. A watchdog thread logs a
//! warning when a child runs longer than five minutes; it never kills.

use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::args::Argument;
use super::eval::{EvalFatal, EvalResult};
use super::ExecKind;
use crate::context::{Capture, Context};
use crate::report::Reporter;
use crate::text::collapse_blank_lines;

/// How long a child may run before the watchdog logs a warning.
const WATCHDOG_AFTER: Duration = Duration::from_secs(5 * 60);

/// A single process-execution promise; `args[0]` is the command, the rest
/// the argv tail.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecPromise {
    pub kind: ExecKind,
    pub args: Vec<Argument>,
}

impl ExecPromise {
    /// Render the exec for logging/debug output.
    #[must_use]
    pub fn describe(&self, frame: &[String]) -> String {
        if self.args.is_empty() {
            return format!("({})", self.kind);
        }
        let vars = super::Variables::new();
        let cmd = self.args[0].value(frame, &vars);
        let tail: Vec<String> = self.args[1..].iter().map(|a| a.value(frame, &vars)).collect();
        format!("({} <{cmd} [{}] >)", self.kind, tail.join(", "))
    }

    /// Build the command and its display string from the current frame and
    /// context.
    fn build_command(&self, frame: &[String], ctx: &Context) -> (Command, String) {
        let program = self.args[0].value(frame, &ctx.vars);
        let tail: Vec<String> = self.args[1..]
            .iter()
            .map(|a| a.value(frame, &ctx.vars))
            .collect();

        let mut resolved = PathBuf::from(&program);
        let mut cmd = if let Some(dir) = &ctx.in_dir {
            // The in-dir scope also participates in command lookup: a
            // matching executable inside it shadows the bare command name.
            let candidate = dir.join(&program);
            if is_executable(&candidate) {
                resolved = candidate;
            }
            let mut cmd = Command::new(&resolved);
            cmd.current_dir(dir);
            cmd
        } else {
            Command::new(&resolved)
        };

        cmd.args(&tail);
        cmd.envs(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(cred) = &ctx.credential {
            cmd.uid(cred.uid);
            cmd.gid(cred.gid);
        }

        let mut display = resolved.display().to_string();
        for arg in &tail {
            display.push(' ');
            display.push_str(arg);
        }
        (cmd, display)
    }

    /// Run the subprocess, capture its output, and report per the logging
    /// rule (verbose or change kind).
    ///
    /// # Errors
    ///
    /// Spawn and wait failures are fatal; a non-zero exit is the regular
    /// `Ok(false)` outcome.
    pub fn eval(&self, frame: &[String], ctx: &mut Context, stack: &str) -> EvalResult {
        let (mut cmd, display) = self.build_command(frame, ctx);
        let _watchdog = Watchdog::start(ctx.reporter.clone(), stack.to_string());

        ctx.reset_capture();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| EvalFatal::resolution(format!("start {display:?}: {e}")))?;
        let readers = CaptureReaders::start(&mut child, &ctx.capture)?;

        let status = child
            .wait()
            .map_err(|e| EvalFatal::resolution(format!("wait {display:?}: {e}")))?;
        readers.join();
        let ret = status.success();

        if ctx.verbose || self.kind == ExecKind::Change {
            ctx.reporter.info(stack);
            ctx.reporter
                .info(&format!("[{} {display}] -> {ret}", self.kind));
            report_captured(ctx);
        }

        bump_counter(&ctx.reporter, self.kind);
        Ok(ret)
    }
}

/// Evaluate a pipe or spipe: wire `cmd[i].stdout -> cmd[i+1].stdin`, start
/// the first n-1, run the last with captured output, wait on all.
///
/// `pre_increment` selects spipe counter semantics: every child counter is
/// bumped while the commands are built, before anything starts. Pipes bump
/// each child after its successful start instead.
pub(crate) fn eval_pipe(
    execs: &[ExecPromise],
    pre_increment: bool,
    frame: &[String],
    ctx: &mut Context,
    stack: &str,
) -> EvalResult {
    let _watchdog = Watchdog::start(ctx.reporter.clone(), stack.to_string());

    let mut commands = Vec::with_capacity(execs.len());
    let mut displays = Vec::with_capacity(execs.len());
    let mut contains_change = false;
    for exec in execs {
        let (cmd, display) = exec.build_command(frame, ctx);
        if pre_increment {
            bump_counter(&ctx.reporter, exec.kind);
        }
        displays.push(format!("[{}] {display}", exec.kind));
        contains_change |= exec.kind == ExecKind::Change;
        commands.push(cmd);
    }

    let n = commands.len();
    let mut running: Vec<Child> = Vec::with_capacity(n - 1);
    let mut prev_stdout: Option<ChildStdout> = None;
    for (i, cmd) in commands.iter_mut().take(n - 1).enumerate() {
        if let Some(prev) = prev_stdout.take() {
            cmd.stdin(Stdio::from(prev));
        }
        cmd.stdout(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| EvalFatal::resolution(format!("start {}: {e}", displays[i])))?;
        if !pre_increment {
            bump_counter(&ctx.reporter, execs[i].kind);
        }
        prev_stdout = child.stdout.take();
        running.push(child);
    }

    let last = &mut commands[n - 1];
    if let Some(prev) = prev_stdout.take() {
        last.stdin(Stdio::from(prev));
    }
    last.stdout(Stdio::piped()).stderr(Stdio::piped());
    ctx.reset_capture();
    let mut last_child = last
        .spawn()
        .map_err(|e| EvalFatal::resolution(format!("start {}: {e}", displays[n - 1])))?;
    if !pre_increment {
        bump_counter(&ctx.reporter, execs[n - 1].kind);
    }
    let readers = CaptureReaders::start(&mut last_child, &ctx.capture)?;

    let status = last_child
        .wait()
        .map_err(|e| EvalFatal::resolution(format!("wait {}: {e}", displays[n - 1])))?;
    readers.join();

    // Earlier children are waited on, but their exit codes are not
    // surfaced; only the final command decides the pipe's outcome.
    for mut child in running {
        let _ = child.wait();
    }

    if ctx.verbose || contains_change {
        ctx.reporter.info(stack);
        ctx.reporter.info(&displays.join(" | "));
        report_captured(ctx);
    }

    Ok(status.success())
}

fn bump_counter(reporter: &Reporter, kind: ExecKind) {
    match kind {
        ExecKind::Change => reporter.bump_change(),
        ExecKind::Test => reporter.bump_test(),
    }
}

/// Report the captured stdout at info level and stderr at error level,
/// with runs of blank lines collapsed.
fn report_captured(ctx: &Context) {
    emit_stream("stdout", &ctx.captured_stdout(), |msg| ctx.reporter.info(msg));
    emit_stream("stderr", &ctx.captured_stderr(), |msg| ctx.reporter.error(msg));
}

fn emit_stream(prefix: &str, raw: &str, emit: impl Fn(&str)) {
    let collapsed = collapse_blank_lines(raw);
    if collapsed.trim().is_empty() {
        return;
    }
    if collapsed.lines().count() > 1 {
        emit(&format!("{prefix}:\n{collapsed}"));
    } else {
        emit(&format!("{prefix}: {collapsed}"));
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// The two reader threads draining a child's stdout and stderr into the
/// shared capture buffers.
struct CaptureReaders {
    handles: Vec<JoinHandle<()>>,
}

impl CaptureReaders {
    fn start(child: &mut Child, capture: &Arc<Mutex<Capture>>) -> Result<Self, EvalFatal> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvalFatal::resolution("child stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EvalFatal::resolution("child stderr pipe missing"))?;

        let out_buf = Arc::clone(capture);
        let err_buf = Arc::clone(capture);
        let handles = vec![
            std::thread::spawn(move || drain(stdout, &out_buf, StreamKind::Stdout)),
            std::thread::spawn(move || drain(stderr, &err_buf, StreamKind::Stderr)),
        ];
        Ok(Self { handles })
    }

    /// Block until both streams hit EOF, so captures are complete before
    /// the exec returns.
    fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

fn drain(mut reader: impl Read, capture: &Arc<Mutex<Capture>>, kind: StreamKind) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut capture = capture.lock();
                let buf = match kind {
                    StreamKind::Stdout => &mut capture.stdout,
                    StreamKind::Stderr => &mut capture.stderr,
                };
                buf.extend_from_slice(&chunk[..n]);
            },
        }
    }
}

/// Logs a warning when the guarded work outlives [`WATCHDOG_AFTER`].
/// Dropping the guard stops the watchdog.
struct Watchdog {
    quit: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn start(reporter: Reporter, stack: String) -> Self {
        let (quit, rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            if matches!(rx.recv_timeout(WATCHDOG_AFTER), Err(RecvTimeoutError::Timeout)) {
                reporter.warn(&format!("{stack} has been running for 5 minutes"));
            }
        });
        Self {
            quit: Some(quit),
            handle: Some(handle),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        drop(self.quit.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
