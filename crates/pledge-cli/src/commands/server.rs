//! `server run` - evaluate trees received from pinned clients.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use pledge_core::{Compiler, Driver, Promise, PromiseCompiler, Reporter};
use pledge_daemon::{server_config, CertificateSource, RequestHandler, Server, ServerSettings};
use tracing::info;

use crate::settings::{Role, Settings};
use crate::GlobalArgs;

/// Start the server with live-upgrade support.
pub async fn run(global: &GlobalArgs, no_redirect: bool) -> Result<()> {
    info!("exec: server run");
    let settings = Settings::load(global, Role::Server)?;

    let store = settings.open_store()?;
    let identity = settings
        .certificate_source()
        .identity()
        .context("load server TLS material")?;
    let pool = store.pool().context("materialize pinned-client pool")?;
    let tls = server_config(identity, pool)?;

    let handler = Arc::new(DriverHandler {
        settings: settings.clone(),
        compiler: super::compiler(),
        proc_args: std::env::args().skip(1).collect(),
    });
    let server = Server::new(
        ServerSettings {
            host: settings.host.clone(),
            port: settings.port,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            no_redirect,
        },
        tls,
        handler,
    );

    // The store's exclusive lock must be released before the replacement
    // process is spawned, or the child cannot open it.
    let store = Arc::new(Mutex::new(store));
    let pre_fork_store = Arc::clone(&store);
    let outcome = server
        .serve(move || {
            if let Ok(mut store) = pre_fork_store.lock() {
                store.close();
            }
        })
        .await;

    if let Ok(mut store) = store.lock() {
        store.close();
    }
    outcome.context("server")
}

/// Dispatches decoded trees into the evaluation driver, with the reporter
/// sink handed in by the transport (the client tee or local stdout).
struct DriverHandler {
    settings: Settings,
    compiler: Arc<Compiler>,
    proc_args: Vec<String>,
}

impl RequestHandler for DriverHandler {
    fn handle(
        &self,
        tree: Promise,
        verbose: bool,
        debug: bool,
        sink: Box<dyn Write + Send>,
    ) -> Result<(), String> {
        if debug {
            tracing::debug!("request carries the debug flag");
        }
        let reporter = Reporter::with_sink(sink);
        let driver = Driver::new(
            self.settings
                .driver_settings(verbose || self.settings.verbose),
            Arc::clone(&self.compiler) as Arc<dyn PromiseCompiler>,
        );
        match driver.run(&tree, &reporter, self.proc_args.clone()) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}
