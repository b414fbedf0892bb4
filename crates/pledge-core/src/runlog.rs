//! The append-only run log.
//!
//! One line is appended per top-level evaluation, recording the outcome,
//! wall-clock data and the change/test counters. The format is stable;
//! external tooling greps it.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

/// One run-log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Whether the evaluation completed successfully.
    pub ok: bool,
    /// Unix seconds at completion.
    pub endtime: i64,
    /// Elapsed wall-clock seconds.
    pub duration: f64,
    pub changes: u64,
    pub tests: u64,
    /// The surfaced error message on failure.
    pub error: Option<String>,
}

impl RunRecord {
    /// Render the record in the line format
    /// `<status>, endtime=<unix>, duration=<secs>, c=<changes>, t=<tests>`
    /// with ` -> <errormsg>` appended on failure.
    #[must_use]
    pub fn render(&self) -> String {
        let status = if self.ok { "ok" } else { "error" };
        let mut line = format!(
            "{status}, endtime={}, duration={:.6}, c={}, t={}",
            self.endtime, self.duration, self.changes, self.tests
        );
        if let Some(error) = &self.error {
            line.push_str(" -> ");
            line.push_str(error);
        }
        line
    }
}

/// Append-only file sink for run records.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when the log cannot be opened or
    /// written.
    pub fn append(&self, record: &RunRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", record.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_success_line() {
        let record = RunRecord {
            ok: true,
            endtime: 1700000000,
            duration: 1.25,
            changes: 2,
            tests: 5,
            error: None,
        };
        assert_eq!(
            record.render(),
            "ok, endtime=1700000000, duration=1.250000, c=2, t=5"
        );
    }

    #[test]
    fn renders_failure_with_message() {
        let record = RunRecord {
            ok: false,
            endtime: 1,
            duration: 0.0,
            changes: 0,
            tests: 1,
            error: Some("root promise (done) unknown".to_string()),
        };
        assert!(record.render().starts_with("error, "));
        assert!(record.render().ends_with("-> root promise (done) unknown"));
    }

    #[test]
    fn append_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("run.log"));
        let record = RunRecord {
            ok: true,
            endtime: 7,
            duration: 0.5,
            changes: 0,
            tests: 1,
            error: None,
        };
        log.append(&record).unwrap();
        log.append(&record).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
