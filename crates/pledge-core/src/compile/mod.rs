//! The promise compiler.
//!
//! Compilation takes a list of root directories, walks each concurrently
//! collecting `.cnf` files (following symlinks, with cycle suppression),
//! reads their contents, and hands the sources to a [`Parser`] that returns
//! the resolved map of named promises.

pub mod parse;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

pub use parse::{CnfParser, ParseError};
use thiserror::Error;
use walkdir::WalkDir;

use crate::context::PromiseCompiler;
use crate::promise::Promise;

/// Filename suffix of promise sources.
pub const SOURCE_SUFFIX: &str = ".cnf";

/// The resolved output of one compilation: root-callable named promises by
/// name.
pub type PromiseSet = HashMap<String, Promise>;

/// One ingested promise source file.
#[derive(Debug, Clone)]
pub struct Source {
    pub path: PathBuf,
    pub text: String,
}

/// Binding seam between the compiler and the surface-syntax parser.
pub trait Parser: Send + Sync {
    /// Parse the given sources into a resolved promise set.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] on syntax errors, structural violations
    /// or unresolvable references.
    fn parse(&self, sources: &[Source]) -> Result<PromiseSet, CompileError>;
}

/// Compilation failure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no compiler is available in this context")]
    NoCompiler,
}

/// Walk every root concurrently, ingest all `.cnf` sources, and parse them.
///
/// Each root gets its own walker thread feeding a shared channel; a single
/// consumer reads file contents. Paths are deduplicated by canonical form so
/// aliasing symlinks cannot ingest a file twice, and sorted so the parse
/// order does not depend on walker interleaving.
///
/// # Errors
///
/// Returns a [`CompileError`] when a source cannot be read or parsing
/// fails. Walk errors (permission, dangling links) are logged and skipped.
pub fn compile(roots: &[PathBuf], parser: &dyn Parser) -> Result<PromiseSet, CompileError> {
    let (tx, rx) = mpsc::channel::<PathBuf>();
    let mut walkers = Vec::with_capacity(roots.len());
    for root in roots {
        let tx = tx.clone();
        let root = root.clone();
        walkers.push(std::thread::spawn(move || walk_root(&root, &tx)));
    }
    drop(tx);

    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    let mut first_err = None;
    for path in rx {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !seen.insert(canonical) {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => sources.push(Source { path, text }),
            Err(source) => {
                if first_err.is_none() {
                    first_err = Some(CompileError::Read { path, source });
                }
            },
        }
    }
    for walker in walkers {
        let _ = walker.join();
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    sources.sort_by(|a, b| a.path.cmp(&b.path));
    parser.parse(&sources)
}

fn walk_root(root: &Path, tx: &mpsc::Sender<PathBuf>) {
    for entry in WalkDir::new(root).follow_links(true) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().ends_with(SOURCE_SUFFIX)
                {
                    // The receiver hangs up on early abort; nothing to do
                    // with the leftovers then.
                    let _ = tx.send(entry.path().to_path_buf());
                }
            },
            Err(err) => {
                if err.loop_ancestor().is_some() {
                    tracing::debug!(root = %root.display(), error = %err, "symlink cycle suppressed");
                } else {
                    tracing::warn!(root = %root.display(), error = %err, "walk files");
                }
            },
        }
    }
}

/// The standard compiler: directory walk plus the `.cnf` parser. This is
/// what the driver installs as the context's [`PromiseCompiler`] so the
/// `(eval)` promise can recurse.
pub struct Compiler {
    parser: Arc<dyn Parser>,
}

impl Compiler {
    #[must_use]
    pub fn new(parser: Arc<dyn Parser>) -> Self {
        Self { parser }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Arc::new(CnfParser))
    }
}

impl PromiseCompiler for Compiler {
    fn compile(&self, roots: &[PathBuf]) -> Result<PromiseSet, CompileError> {
        compile(roots, &*self.parser)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    fn write_cnf(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn compiles_sources_from_multiple_roots() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_cnf(a.path(), "main.cnf", "(done (alias))");
        write_cnf(b.path(), "lib.cnf", "(alias (test \"/bin/true\"))");

        let set = compile(&[a.path().to_path_buf(), b.path().to_path_buf()], &CnfParser).unwrap();
        assert!(set.contains_key("done"));
        assert!(set.contains_key("alias"));
    }

    #[test]
    fn ignores_non_cnf_files() {
        let dir = tempfile::tempdir().unwrap();
        write_cnf(dir.path(), "done.cnf", "(done (test \"/bin/true\"))");
        std::fs::write(dir.path().join("notes.txt"), "(broken").unwrap();

        let set = compile(&[dir.path().to_path_buf()], &CnfParser).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn symlink_cycle_terminates_and_visits_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = a.join("b");
        std::fs::create_dir_all(&b).unwrap();
        write_cnf(&a, "done.cnf", "(done (test \"/bin/true\"))");
        // a/b/loop -> a forms the cycle a -> b -> a.
        symlink(&a, b.join("loop")).unwrap();

        let set = compile(&[dir.path().to_path_buf()], &CnfParser).unwrap();
        assert!(set.contains_key("done"));
    }

    #[test]
    fn aliasing_symlinks_do_not_duplicate_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        write_cnf(&real, "done.cnf", "(done (test \"/bin/true\"))");
        symlink(&real, dir.path().join("alias")).unwrap();

        // Without canonical-path dedup the definition would be ingested
        // twice and the parser would reject the duplicate.
        let set = compile(&[dir.path().to_path_buf()], &CnfParser).unwrap();
        assert!(set.contains_key("done"));
    }
}
