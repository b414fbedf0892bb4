//! Evaluation reporter: counters plus a swappable output sink.
//!
//! Every piece of human-facing output produced while a promise tree is
//! evaluated goes through a [`Reporter`], so the server can tee it into the
//! client's back-channel stream. The reporter also owns the four run
//! counters (changes, tests, errors, warnings); the exec, pipe, log and
//! warning paths are the only writers.
//!
//! Unlike a process-global logger, a reporter is evaluation-scoped: the
//! driver creates one per run and resets the counters at the boundary.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Snapshot of the four run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub changes: u64,
    pub tests: u64,
    pub errors: u64,
    pub warnings: u64,
}

struct Inner {
    changes: AtomicU64,
    tests: AtomicU64,
    errors: AtomicU64,
    warnings: AtomicU64,
    sink: Mutex<Box<dyn Write + Send>>,
}

/// Cheaply cloneable handle to one evaluation's counters and output sink.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    /// A reporter writing to the process stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    /// A reporter writing to the given sink.
    #[must_use]
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Inner {
                changes: AtomicU64::new(0),
                tests: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                warnings: AtomicU64::new(0),
                sink: Mutex::new(sink),
            }),
        }
    }

    /// Emit a line at info level.
    pub fn info(&self, msg: &str) {
        self.write_line("info", msg);
    }

    /// Emit a line at warning level and bump the warning counter.
    pub fn warn(&self, msg: &str) {
        self.inner.warnings.fetch_add(1, Ordering::Relaxed);
        self.write_line("warning", msg);
    }

    /// Emit a line at error level and bump the error counter.
    pub fn error(&self, msg: &str) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        self.write_line("error", msg);
    }

    fn write_line(&self, level: &str, msg: &str) {
        let mut sink = self.inner.sink.lock();
        // Output is best effort: a broken client stream must not abort the
        // evaluation on the server.
        let _ = writeln!(sink, "{level}: {msg}");
        let _ = sink.flush();
    }

    /// Record a completed change exec.
    pub fn bump_change(&self) {
        self.inner.changes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed test exec.
    pub fn bump_test(&self) {
        self.inner.tests.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn counters(&self) -> Counters {
        Counters {
            changes: self.inner.changes.load(Ordering::Relaxed),
            tests: self.inner.tests.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            warnings: self.inner.warnings.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero. Called at evaluation boundaries.
    pub fn reset(&self) {
        self.inner.changes.store(0, Ordering::Relaxed);
        self.inner.tests.store(0, Ordering::Relaxed);
        self.inner.errors.store(0, Ordering::Relaxed);
        self.inner.warnings.store(0, Ordering::Relaxed);
    }

    /// Swap the output sink for the duration of `f`, restoring the previous
    /// sink on all exit paths.
    pub fn redirect<T>(&self, sink: Box<dyn Write + Send>, f: impl FnOnce() -> T) -> T {
        let previous = {
            let mut guard = self.inner.sink.lock();
            std::mem::replace(&mut *guard, sink)
        };
        let _restore = SinkRestore {
            reporter: self,
            previous: Some(previous),
        };
        f()
    }

    fn restore_sink(&self, sink: Box<dyn Write + Send>) {
        let mut guard = self.inner.sink.lock();
        *guard = sink;
    }
}

struct SinkRestore<'a> {
    reporter: &'a Reporter,
    previous: Option<Box<dyn Write + Send>>,
}

impl Drop for SinkRestore<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.reporter.restore_sink(previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn counters_bump_and_reset() {
        let reporter = Reporter::with_sink(Box::new(std::io::sink()));
        reporter.bump_change();
        reporter.bump_test();
        reporter.bump_test();
        reporter.error("boom");
        reporter.warn("careful");

        let counters = reporter.counters();
        assert_eq!(counters.changes, 1);
        assert_eq!(counters.tests, 2);
        assert_eq!(counters.errors, 1);
        assert_eq!(counters.warnings, 1);

        reporter.reset();
        assert_eq!(reporter.counters(), Counters::default());
    }

    #[test]
    fn redirect_swaps_and_restores() {
        let base = SharedBuf::default();
        let redirected = SharedBuf::default();
        let reporter = Reporter::with_sink(Box::new(base.clone()));

        reporter.info("before");
        reporter.redirect(Box::new(redirected.clone()), || {
            reporter.info("inside");
        });
        reporter.info("after");

        assert!(base.contents().contains("before"));
        assert!(base.contents().contains("after"));
        assert!(!base.contents().contains("inside"));
        assert!(redirected.contents().contains("inside"));
    }

    #[test]
    fn redirect_restores_on_panic() {
        let base = SharedBuf::default();
        let reporter = Reporter::with_sink(Box::new(base.clone()));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reporter.redirect(Box::new(std::io::sink()), || panic!("boom"));
        }));
        assert!(result.is_err());

        reporter.info("recovered");
        assert!(base.contents().contains("recovered"));
    }
}
