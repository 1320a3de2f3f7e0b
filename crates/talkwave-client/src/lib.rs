//! # talkwave-client
//!
//! Embedding-facing half of the TalkWave sync core: the [`SyncEngine`]
//! orchestrator, its [`ChatState`] mirror, the injected [`AuthContext`]
//! identity feed, and the [`EngineEvent`] side-effect stream.
//!
//! The engine is the single mutator of the mirror.  An embedding UI reads
//! state snapshots, drives the engine through its async methods, and
//! optionally drains the event stream for presentation effects.

pub mod auth;
pub mod engine;
pub mod events;
pub mod state;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use auth::AuthContext;
pub use engine::SyncEngine;
pub use error::{EngineError, SendError};
pub use events::{EngineEvent, EngineEvents};
pub use state::ChatState;

/// Install the global tracing subscriber.  Call once at process start.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("talkwave_client=debug,talkwave_remote=debug,talkwave_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
