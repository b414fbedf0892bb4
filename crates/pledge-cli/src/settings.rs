//! Settings-directory bootstrap and role-local paths.
//!
//! Persistent state lives under `$HOME/.pledge/`:
//!
//! - `cert/{client,server}.{privkey,cert}.pem` - role-local TLS material
//! - `store/{client,server}.store.db` - pinned-peer certificate store
//! - `lib/` - library directory searched by the `(eval)` promise
//!
//! When `HOME` is unset (daemon mode) it falls back to the working
//! directory, and the fallback is written back into the environment so
//! child processes agree.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pledge_core::DriverSettings;
use pledge_daemon::{CertStore, PemFileSource};
use tracing::{info, warn};

use crate::GlobalArgs;

/// Which side of the link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// This role's name, used in file names.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    /// The role of the peers this side pins: a client pins servers and
    /// vice versa.
    pub const fn peer(self) -> &'static str {
        match self {
            Self::Client => "server",
            Self::Server => "client",
        }
    }

    const fn default_host(self) -> &'static str {
        match self {
            Self::Client => "localhost",
            Self::Server => "0.0.0.0",
        }
    }
}

/// Resolved per-invocation settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub root_promise: String,
    pub verbose: bool,
    pub debug: bool,
    pub work_dir: PathBuf,
    pub settings_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub store_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub runlog_path: PathBuf,
}

impl Settings {
    /// Resolve settings for one role, bootstrapping the settings
    /// directory tree.
    ///
    /// # Errors
    ///
    /// Fails when the working directory is unavailable or the settings
    /// directories cannot be created.
    pub fn load(global: &GlobalArgs, role: Role) -> Result<Self> {
        let work_dir = std::env::current_dir().context("get working directory")?;

        // When run as a daemon the home folder is not set.
        let home = match std::env::var("HOME") {
            Ok(home) if !home.is_empty() => PathBuf::from(home),
            _ => {
                std::env::set_var("HOME", &work_dir);
                work_dir.clone()
            },
        };

        let settings_dir = home.join(".pledge");
        let cert_dir = settings_dir.join("cert");
        let store_dir = settings_dir.join("store");
        let lib_dir = settings_dir.join("lib");
        create_dir(&settings_dir, 0o755)?;
        create_dir(&cert_dir, 0o700)?;
        create_dir(&store_dir, 0o700)?;
        create_dir(&lib_dir, 0o755)?;

        let runlog_path = global
            .runlog_path
            .clone()
            .unwrap_or_else(|| work_dir.join("run.log"));

        Ok(Self {
            role,
            host: global
                .host
                .clone()
                .unwrap_or_else(|| role.default_host().to_string()),
            port: global.port,
            root_promise: global.promise.clone(),
            verbose: global.verbose,
            debug: global.debug,
            work_dir,
            settings_dir,
            cert_dir,
            store_dir,
            lib_dir,
            runlog_path,
        })
    }

    /// The role-local TLS material under the cert directory.
    #[must_use]
    pub fn certificate_source(&self) -> PemFileSource {
        let name = self.role.name();
        PemFileSource::new(
            self.cert_dir.join(format!("{name}.cert.pem")),
            self.cert_dir.join(format!("{name}.privkey.pem")),
        )
    }

    /// Open this role's pinned-peer certificate store.
    ///
    /// # Errors
    ///
    /// Fails when the store file cannot be opened or is locked by another
    /// process.
    pub fn open_store(&self) -> Result<CertStore> {
        let path = self
            .store_dir
            .join(format!("{}.store.db", self.role.name()));
        CertStore::open(path, self.role.peer()).context("open certificate store")
    }

    /// Resolve the input folder for compilation: explicit flag, falling
    /// back to the working directory when absent or missing.
    #[must_use]
    pub fn input_dir(&self, input_folder: Option<PathBuf>) -> PathBuf {
        let dir = match input_folder {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => self.work_dir.join(dir),
            None => self.work_dir.clone(),
        };
        if dir.exists() {
            info!(input = %dir.display(), "using input folder");
            dir
        } else {
            warn!(input = %dir.display(), "input folder does not exist, using working directory");
            self.work_dir.clone()
        }
    }

    /// Driver settings for evaluating on this host.
    #[must_use]
    pub fn driver_settings(&self, verbose: bool) -> DriverSettings {
        DriverSettings {
            work_dir: self.work_dir.clone(),
            settings_dir: self.settings_dir.clone(),
            lib_dir: self.lib_dir.clone(),
            executable: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pledge")),
            runlog_path: self.runlog_path.clone(),
            verbose,
        }
    }
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> GlobalArgs {
        GlobalArgs {
            host: None,
            port: 9954,
            promise: "done".to_string(),
            verbose: false,
            debug: false,
            syslog: false,
            runlog_path: None,
        }
    }

    // One test: these all mutate the process-global HOME variable and
    // must not interleave.
    #[test]
    fn bootstrap_and_role_defaults() {
        let home = tempfile::tempdir().unwrap();
        std::env::set_var("HOME", home.path());

        let client = Settings::load(&global(), Role::Client).unwrap();
        assert!(client.settings_dir.is_dir());
        assert!(client.cert_dir.is_dir());
        assert!(client.store_dir.is_dir());
        assert!(client.lib_dir.is_dir());
        assert_eq!(client.host, "localhost");
        assert_eq!(client.role.peer(), "server");

        let server = Settings::load(&global(), Role::Server).unwrap();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.role.peer(), "client");

        // A missing input folder falls back to the working directory.
        let resolved = client.input_dir(Some(PathBuf::from("/no/such/input-42")));
        assert_eq!(resolved, client.work_dir);
    }
}
