//! Database connection management.
//!
//! The [`KeyStore`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation.  The connection is
//! kept behind a mutex so the store can be shared across tasks.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{KeyStoreError, Result};
use crate::migrations;

/// Durable local store of per-conversation symmetric keys.
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    /// Open (or create) the default application key database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/talkwave/keys.db`
    /// - macOS:   `~/Library/Application Support/com.talkwave.talkwave/keys.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\talkwave\talkwave\data\keys.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "talkwave", "talkwave").ok_or(KeyStoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("keys.db");

        tracing::info!(path = %db_path.display(), "opening key store");

        Self::open_at(&db_path)
    }

    /// Open (or create) a key database at an explicit path.
    ///
    /// Useful for tests and for embedding the store inside custom directory
    /// layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock and return the underlying connection.
    ///
    /// Callers should prefer the typed helpers in [`crate::keys`]; direct
    /// access is occasionally needed for ad-hoc queries.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn().path().map(PathBuf::from)
    }
}
