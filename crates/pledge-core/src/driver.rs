//! The evaluation driver.
//!
//! The driver is the boundary around one top-level promise evaluation: it
//! seeds the well-known context variables, runs the tree, emits the summary
//! line, appends the run-log record and resets the counters. Fatal
//! evaluation failures surface here as [`DriverError`] with the message
//! preserved; the regular false outcome is not an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::context::{Context, PromiseCompiler};
use crate::promise::{EvalFatal, Promise};
use crate::report::Reporter;
use crate::runlog::{RunLog, RunRecord};

/// Host-local paths and flags one driver evaluates against.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Working directory, exposed as `work_dir`.
    pub work_dir: PathBuf,
    /// Settings directory, exposed as `settings_dir`.
    pub settings_dir: PathBuf,
    /// Library directory searched by the `(eval)` promise, exposed as
    /// `lib_dir`.
    pub lib_dir: PathBuf,
    /// Path of the running executable, exposed as `executable` and used by
    /// the restart promise.
    pub executable: PathBuf,
    /// Where run records are appended.
    pub runlog_path: PathBuf,
    /// Report non-change output too.
    pub verbose: bool,
}

/// Failure of a driven evaluation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{0}")]
    Fatal(#[from] EvalFatal),
}

/// Drives top-level evaluations.
pub struct Driver {
    settings: DriverSettings,
    compiler: Arc<dyn PromiseCompiler>,
}

impl Driver {
    #[must_use]
    pub fn new(settings: DriverSettings, compiler: Arc<dyn PromiseCompiler>) -> Self {
        Self { settings, compiler }
    }

    #[must_use]
    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Evaluate one promise tree to completion.
    ///
    /// Returns the tree's boolean outcome. The summary line, the run-log
    /// record and the counter reset happen on every path, including fatal
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Fatal`] when the evaluation aborted with a
    /// structural or resolution failure.
    pub fn run(
        &self,
        tree: &Promise,
        reporter: &Reporter,
        proc_args: Vec<String>,
    ) -> Result<bool, DriverError> {
        let mut ctx = Context::new(Arc::clone(&self.compiler), reporter.clone());
        ctx.verbose = self.settings.verbose;
        ctx.proc_args = proc_args;
        ctx.vars.insert(
            "work_dir".to_string(),
            self.settings.work_dir.display().to_string(),
        );
        ctx.vars.insert(
            "settings_dir".to_string(),
            self.settings.settings_dir.display().to_string(),
        );
        ctx.vars.insert(
            "lib_dir".to_string(),
            self.settings.lib_dir.display().to_string(),
        );
        ctx.vars.insert(
            "executable".to_string(),
            self.settings.executable.display().to_string(),
        );

        let started = Instant::now();
        let outcome = tree.eval(&[], &mut ctx, "");
        let elapsed = started.elapsed();

        let counters = reporter.counters();
        reporter.info(&format!(
            "{} changes and {} tests executed in {:.3}s",
            counters.changes,
            counters.tests,
            elapsed.as_secs_f64()
        ));

        let (ok, error) = match &outcome {
            Ok(result) => (*result, None),
            Err(fatal) => {
                reporter.error(&fatal.message);
                (false, Some(fatal.message.clone()))
            },
        };
        let record = RunRecord {
            ok,
            endtime: chrono::Utc::now().timestamp(),
            duration: elapsed.as_secs_f64(),
            changes: counters.changes,
            tests: counters.tests,
            error,
        };
        if let Err(e) = RunLog::new(&self.settings.runlog_path).append(&record) {
            tracing::warn!(
                path = %self.settings.runlog_path.display(),
                error = %e,
                "append run log"
            );
        }

        reporter.reset();
        outcome.map_err(DriverError::from)
    }
}
