//! `client cert` / `server cert` - manage the pinned-peer store.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::settings::{Role, Settings};
use crate::GlobalArgs;

/// Pin a peer certificate under an id.
pub fn add(global: &GlobalArgs, role: Role, id: &str, path: &Path) -> Result<()> {
    info!("add {} cert", role.peer());
    if id.is_empty() {
        bail!("no {} id provided", role.peer());
    }
    if !path.exists() {
        bail!("{} certificate file does not exist", role.peer());
    }

    let settings = Settings::load(global, role)?;
    let mut store = settings.open_store()?;
    let result = store.store(id, path).context("store certificate");
    store.close();
    result
}

/// Remove a pinned peer certificate.
pub fn remove(global: &GlobalArgs, role: Role, id: &str) -> Result<()> {
    info!("remove {} cert", role.peer());
    if id.is_empty() {
        bail!("no {} id provided", role.peer());
    }

    let settings = Settings::load(global, role)?;
    let mut store = settings.open_store()?;
    let result = store.remove(id).context("remove certificate");
    store.close();
    result
}
