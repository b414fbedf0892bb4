//! Persistent certificate store with per-peer pinning.
//!
//! One store file maps peer ids to PEM certificate bytes for a single role:
//! the client's store pins server ids, the server's store pins client ids.
//! The backing SQLite database is opened in exclusive locking mode and the
//! lock is taken eagerly, so a second process cannot open the same store.
//! That exclusivity is load-bearing for live upgrade: the store must be
//! closed before the replacement process is spawned, and reopened there.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};
use rustls::RootCertStore;
use thiserror::Error;
use tracing::{debug, error, info};

/// Certificate-store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open store {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("store is closed")]
    Closed,

    #[error("load {role} cert file {path:?}: {source}")]
    ReadPem {
        role: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("certificate for {role} id {id:?} already stored")]
    AlreadyStored { role: String, id: String },

    #[error("certificate for {role} id {id:?} not available")]
    NotStored { role: String, id: String },

    #[error("no {role} certificates stored")]
    EmptyPool { role: String },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// A pinned-peer certificate store for one role.
pub struct CertStore {
    conn: Option<Connection>,
    role: String,
    path: PathBuf,
}

impl CertStore {
    /// Open (creating if needed) the store file at `path`, pinning peers of
    /// the given role. Takes the exclusive file lock immediately; a second
    /// open of the same file fails.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] when the database cannot be opened or
    /// the lock cannot be acquired.
    pub fn open(path: impl Into<PathBuf>, role: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        let role = role.into();

        let open = |path: &Path| -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "locking_mode", "exclusive")?;
            // The exclusive lock is only taken on the first write; do one
            // now so a stale second process fails at open, not mid-run.
            conn.execute_batch(
                "BEGIN EXCLUSIVE;
                 CREATE TABLE IF NOT EXISTS certs (
                     id  TEXT PRIMARY KEY,
                     pem BLOB NOT NULL
                 );
                 COMMIT;",
            )?;
            Ok(conn)
        };

        let conn = open(&path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), role, "certificate store opened");
        Ok(Self {
            conn: Some(conn),
            role,
            path,
        })
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    /// The role of the peers this store pins.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// The store file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pin the PEM file at `pem_path` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyStored`] when the id is present,
    /// [`StoreError::ReadPem`] when the file cannot be read.
    pub fn store(&self, id: &str, pem_path: &Path) -> Result<(), StoreError> {
        let pem = std::fs::read(pem_path).map_err(|source| StoreError::ReadPem {
            role: self.role.clone(),
            path: pem_path.to_path_buf(),
            source,
        })?;

        let conn = self.conn()?;
        if self.lookup(id)?.is_some() {
            return Err(StoreError::AlreadyStored {
                role: self.role.clone(),
                id: id.to_string(),
            });
        }
        conn.execute("INSERT INTO certs (id, pem) VALUES (?1, ?2)", (id, &pem))?;
        info!(role = %self.role, id, "certificate pinned");
        Ok(())
    }

    /// Remove the certificate pinned under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotStored`] when the id is absent.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM certs WHERE id = ?1", (id,))?;
        if removed == 0 {
            return Err(StoreError::NotStored {
                role: self.role.clone(),
                id: id.to_string(),
            });
        }
        info!(role = %self.role, id, "certificate unpinned");
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT pem FROM certs WHERE id = ?1", (id,), |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Materialize every pinned certificate into a fresh root pool.
    /// Entries that fail to parse are logged and skipped; an empty
    /// resulting pool is an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmptyPool`] when nothing usable is pinned.
    pub fn pool(&self) -> Result<RootCertStore, StoreError> {
        let conn = self.conn()?;
        let mut pool = RootCertStore::empty();

        let mut stmt = conn.prepare("SELECT id, pem FROM certs ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (id, pem) = row?;
            let mut added_any = false;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                match cert {
                    Ok(der) => {
                        if let Err(e) = pool.add(der) {
                            error!(
                                role = %self.role,
                                id,
                                error = %e,
                                "unable to add certificate to pool"
                            );
                        } else {
                            added_any = true;
                        }
                    },
                    Err(e) => {
                        error!(role = %self.role, id, error = %e, "unable to parse certificate");
                    },
                }
            }
            if !added_any {
                error!(role = %self.role, id, "entry contributed no certificates");
            }
        }

        if pool.is_empty() {
            return Err(StoreError::EmptyPool {
                role: self.role.clone(),
            });
        }
        Ok(pool)
    }

    /// Release the backing database handle and its exclusive lock.
    /// Idempotent; every other operation fails with [`StoreError::Closed`]
    /// afterwards.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_conn, e)) = conn.close() {
                error!(path = %self.path.display(), error = %e, "close certificate store");
            } else {
                debug!(path = %self.path.display(), "certificate store closed");
            }
        }
    }
}

impl Drop for CertStore {
    fn drop(&mut self) {
        self.close();
    }
}
