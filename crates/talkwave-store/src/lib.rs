//! # talkwave-store
//!
//! Device-local persistence for per-conversation encryption keys, backed by
//! SQLite.
//!
//! Keys are generated at conversation creation, stored hex-encoded keyed by
//! conversation id, never rotated, and never transmitted to the remote
//! store.  The table is shared process-wide state with no cross-process
//! locking: concurrent writers (two app instances on one device) race and
//! the last write wins, a documented limitation of the source system.

pub mod database;
pub mod keys;
pub mod migrations;

mod error;

pub use database::KeyStore;
pub use error::KeyStoreError;
