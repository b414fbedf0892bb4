//! Command implementations behind the CLI surface.

pub mod cert;
pub mod client;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use pledge_core::{Compiler, Promise, PromiseCompiler};

use crate::settings::Settings;

/// Compile the library and input directories and resolve the root promise.
pub(crate) fn compile_root(
    settings: &Settings,
    compiler: &Compiler,
    input_dir: PathBuf,
) -> Result<Promise> {
    tracing::info!(
        input = %input_dir.display(),
        lib = %settings.lib_dir.display(),
        "compile promises"
    );
    let set = compiler
        .compile(&[settings.lib_dir.clone(), input_dir])
        .context("compile promises")?;
    set.get(&settings.root_promise)
        .cloned()
        .ok_or_else(|| anyhow!("root promise ({}) unknown", settings.root_promise))
}

/// The standard compiler instance shared by the client commands and the
/// server's `(eval)` recursion.
pub(crate) fn compiler() -> Arc<Compiler> {
    Arc::new(Compiler::default())
}
