//! Side-effect stream for the presentation layer.
//!
//! Sounds, badges, and toasts in the embedding UI hang off these events;
//! nothing in the sync core depends on anyone draining them, and a dropped
//! receiver is silently tolerated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use talkwave_shared::{ConversationId, MessageId, UserId};

/// Receiving half of the engine's event stream.
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Another participant's message arrived in an opened conversation.
    /// Fired once per history growth, never for read-receipt churn and
    /// never for the opening snapshot.
    MessageReceived {
        conversation_id: ConversationId,
        message_id: MessageId,
        sender_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// A locally drafted message was durably appended.
    MessageSent {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}
