//! `client run|test|watch` - compile locally, execute remotely.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pledge_core::{Compiler, Promise};
use pledge_daemon::{client_config, CertStore, CertificateSource};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::client::Client;
use crate::settings::{Role, Settings};
use crate::watch::watch_loop;
use crate::GlobalArgs;

/// Compile the input folder, dial the server, send the tree and await the
/// terminal response.
pub async fn run(global: &GlobalArgs, input_folder: Option<PathBuf>) -> Result<()> {
    info!("exec: client run");
    let settings = Settings::load(global, Role::Client)?;
    let compiler = super::compiler();
    let tree = super::compile_root(&settings, &compiler, settings.input_dir(input_folder))?;

    let mut store = settings.open_store()?;
    let outcome = send_guarded(&settings, &store, tree).await;
    store.close();
    outcome
}

/// Compile only; success means the sources compile and the root resolves.
pub fn test(global: &GlobalArgs, input_folder: Option<PathBuf>) -> Result<()> {
    info!("exec: client test");
    let settings = Settings::load(global, Role::Client)?;
    let compiler = super::compiler();
    let tree = super::compile_root(&settings, &compiler, settings.input_dir(input_folder))?;
    info!("promise ({}) compiles: {}", settings.root_promise, tree.describe(&[]));
    Ok(())
}

/// Send once, then recompile and resend on every coalesced change burst
/// under the input folder.
pub async fn watch(global: &GlobalArgs, input_folder: Option<PathBuf>) -> Result<()> {
    info!("exec: client watch");
    let settings = Settings::load(global, Role::Client)?;
    let compiler = super::compiler();
    let input = settings.input_dir(input_folder);

    let mut store = settings.open_store()?;
    let outcome = watch_guarded(&settings, &store, &compiler, input).await;
    store.close();
    outcome
}

/// Run `send` with SIGTERM/SIGINT aborting the wait, so the caller can
/// close the store before exiting.
async fn send_guarded(settings: &Settings, store: &CertStore, tree: Promise) -> Result<()> {
    let client = build_client(settings, store)?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = client.send(tree, settings.verbose, settings.debug) => result,
        _ = sigterm.recv() => bail!("SIGTERM received"),
        _ = sigint.recv() => bail!("SIGINT received"),
    }
}

async fn watch_guarded(
    settings: &Settings,
    store: &CertStore,
    compiler: &Arc<Compiler>,
    input: PathBuf,
) -> Result<()> {
    let client = Arc::new(build_client(settings, store)?);

    // Evaluate once up front; subsequent runs are change-driven.
    let tree = super::compile_root(settings, compiler, input.clone())?;
    client.send(tree, settings.verbose, settings.debug).await?;

    let handle = tokio::runtime::Handle::current();
    let watch_settings = settings.clone();
    let watch_compiler = Arc::clone(compiler);
    let watch_client = Arc::clone(&client);
    let watcher = tokio::task::spawn_blocking(move || {
        watch_loop(&input, || {
            let tree =
                super::compile_root(&watch_settings, &watch_compiler, input.clone())?;
            handle.block_on(watch_client.send(
                tree,
                watch_settings.verbose,
                watch_settings.debug,
            ))
        })
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        result = watcher => result.context("watcher task")??,
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }
    Ok(())
}

fn build_client(settings: &Settings, store: &CertStore) -> Result<Client> {
    let identity = settings
        .certificate_source()
        .identity()
        .context("load client TLS material")?;
    let pool = store.pool().context("materialize pinned-server pool")?;
    let config = client_config(identity, pool)?;
    Ok(Client::new(config, settings.host.clone(), settings.port))
}
