//! Per-evaluation context.
//!
//! The context carries everything a promise node may read while it
//! evaluates: the variable map, extra environment pairs, the working
//! directory override, the optional POSIX credential, the shared capture
//! buffers, and the reporter.
//!
//! Context mutations are scope-local: every node that changes state clones
//! the context before descending, so a parent's context is unchanged no
//! matter what a child does. The capture buffers and the reporter stay
//! shared across scopes - captured output and counters are
//! evaluation-global.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::compile::{CompileError, PromiseSet};
use crate::promise::Variables;
use crate::report::Reporter;

/// Stdout/stderr bytes captured from the most recent exec.
#[derive(Debug, Default)]
pub struct Capture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A resolved POSIX credential for child processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Home directory of the user, used for `~/` expansion.
    pub home: PathBuf,
}

/// Compilation seam used by the `(eval)` promise to recursively compile
/// promise sources at evaluation time.
pub trait PromiseCompiler: Send + Sync {
    /// Compile every `.cnf` file under the given root directories into a
    /// resolved promise set.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] when walking, reading or parsing fails.
    fn compile(&self, roots: &[PathBuf]) -> Result<PromiseSet, CompileError>;
}

/// The evaluation context. Cloning is cheap enough to do at every scope
/// boundary; the buffers, compiler and reporter are shared handles.
#[derive(Clone)]
pub struct Context {
    /// Capture buffers, reset at the start of each exec.
    pub capture: Arc<Mutex<Capture>>,
    /// Variable bindings visible in the current scope.
    pub vars: Variables,
    /// The argv of this process, exposed to the restart promise.
    pub proc_args: Vec<String>,
    /// Extra `NAME=VALUE` pairs appended to child environments.
    pub env: Vec<(String, String)>,
    /// Working-directory override; `None` means the process cwd.
    pub in_dir: Option<PathBuf>,
    /// Credential applied to child processes when present.
    pub credential: Option<Credential>,
    /// Whether non-change output is reported.
    pub verbose: bool,
    /// Recursive compiler used by the `(eval)` promise.
    pub compiler: Arc<dyn PromiseCompiler>,
    /// Counters and output sink for this evaluation.
    pub reporter: Reporter,
}

impl Context {
    /// Create a fresh context with empty state.
    #[must_use]
    pub fn new(compiler: Arc<dyn PromiseCompiler>, reporter: Reporter) -> Self {
        Self {
            capture: Arc::new(Mutex::new(Capture::default())),
            vars: Variables::new(),
            proc_args: Vec::new(),
            env: Vec::new(),
            in_dir: None,
            credential: None,
            verbose: false,
            compiler,
            reporter,
        }
    }

    /// Clear both capture buffers. Called before each exec starts.
    pub fn reset_capture(&self) {
        let mut capture = self.capture.lock();
        capture.stdout.clear();
        capture.stderr.clear();
    }

    /// The captured stdout of the most recent exec, lossily decoded.
    #[must_use]
    pub fn captured_stdout(&self) -> String {
        String::from_utf8_lossy(&self.capture.lock().stdout).into_owned()
    }

    /// The captured stderr of the most recent exec, lossily decoded.
    #[must_use]
    pub fn captured_stderr(&self) -> String {
        String::from_utf8_lossy(&self.capture.lock().stderr).into_owned()
    }
}

/// A compiler that always fails; useful as a placeholder where the
/// `(eval)` promise cannot occur (tests, decode-only paths).
pub struct NoCompiler;

impl PromiseCompiler for NoCompiler {
    fn compile(&self, _roots: &[PathBuf]) -> Result<PromiseSet, CompileError> {
        Err(CompileError::NoCompiler)
    }
}
