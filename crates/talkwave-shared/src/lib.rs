//! # talkwave-shared
//!
//! Domain model types, message-body encryption, and constants shared by the
//! TalkWave synchronization crates.
//!
//! The remote document store is the source of truth for all of these types;
//! local copies are mirrors, never authoritative.

pub mod constants;
pub mod crypto;
pub mod types;

mod error;

pub use error::CryptoError;
pub use types::*;
