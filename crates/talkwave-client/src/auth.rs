//! Injected identity feed.
//!
//! The sync core never authenticates anyone; the embedding layer owns the
//! session and pushes the signed-in profile through an [`AuthContext`]
//! constructed once at startup.  Consumers either read the current value or
//! watch for sign-in / sign-out transitions.

use std::sync::Arc;

use tokio::sync::watch;

use talkwave_shared::UserProfile;

/// Shared handle to the current signed-in identity, `None` when signed out.
#[derive(Clone)]
pub struct AuthContext {
    tx: Arc<watch::Sender<Option<UserProfile>>>,
}

impl AuthContext {
    /// A signed-out context.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// A context that starts signed in, for tests and tools.
    pub fn signed_in(profile: UserProfile) -> Self {
        let ctx = Self::new();
        ctx.set(profile);
        ctx
    }

    pub fn set(&self, profile: UserProfile) {
        self.tx.send_replace(Some(profile));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<UserProfile> {
        self.tx.borrow().clone()
    }

    /// Watch for identity changes.  The receiver sees the value at
    /// subscription time plus every subsequent transition.
    pub fn watch(&self) -> watch::Receiver<Option<UserProfile>> {
        self.tx.subscribe()
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::new()
    }
}
