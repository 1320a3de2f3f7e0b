use thiserror::Error;

/// Errors produced by the key store.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A persisted key was not valid hex-encoded 32-byte material.
    #[error("Corrupt key material for conversation {0}")]
    CorruptKey(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KeyStoreError>;
