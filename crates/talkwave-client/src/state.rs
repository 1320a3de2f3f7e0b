//! The in-memory mirror handed to the embedding layer.

use std::collections::HashMap;

use serde::Serialize;

use talkwave_shared::{Conversation, ConversationId, Message};

/// Snapshot of everything a chat UI renders.
///
/// The remote store is the source of truth; this mirror is replaced
/// wholesale from live-query snapshots (last writer wins) and only ever
/// mutated by the [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatState {
    /// The signed-in user's conversations, most recently active first.
    pub conversations: Vec<Conversation>,

    /// Decrypted message history per opened conversation, oldest first.
    /// Entries appear on `open_messages` and persist after close.
    pub messages: HashMap<ConversationId, Vec<Message>>,

    /// The conversation currently shown, if any.
    pub active_conversation: Option<ConversationId>,

    /// Whether a one-shot conversation load is in flight.
    pub loading: bool,

    /// Human-readable description of the most recent failure, cleared when
    /// the next operation starts.
    pub error: Option<String>,
}
