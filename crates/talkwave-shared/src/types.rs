//! Domain model structs mirrored from the remote document store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to an embedding UI layer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque user identifier assigned by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque conversation identifier assigned by the remote store at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque message identifier assigned by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// A user identity record, owned by the identity provider and mirrored
/// read-only by the sync core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    /// Human-readable display name.  Required in remote documents.
    pub display_name: String,
    /// Optional avatar image URI.
    pub avatar_url: Option<String>,
    /// Whether the user currently has an active session.
    /// Defaults to `false` when absent in a remote document.
    pub is_online: bool,
    /// Last time the user was seen online.
    /// Defaults to the mapping time when absent in a remote document.
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Denormalized summary of the most recent message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub sender_id: UserId,
    /// Plaintext preview, truncated to [`crate::constants::PREVIEW_MAX_CHARS`].
    pub preview: String,
    pub sent_at: DateTime<Utc>,
}

/// A channel between exactly two participants.
///
/// At most one conversation exists per unordered participant pair; this is
/// enforced by the create-or-find operation, not by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Exactly two unique participant ids.
    pub participants: Vec<UserId>,
    /// Resolved identity records for `participants`, in the same order.
    pub participant_profiles: Vec<UserProfile>,
    /// `None` until the first message is appended.
    pub last_message: Option<LastMessage>,
    pub last_message_at: DateTime<Utc>,
    /// Unread message count per participant.  Non-negative; every
    /// participant is present as a key in freshly created conversations.
    pub unread_count: HashMap<UserId, u32>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// The participant other than `me`, if any.
    pub fn peer_of(&self, me: &UserId) -> Option<&UserId> {
        self.participants.iter().find(|p| *p != me)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Content classification for a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl MessageKind {
    /// Classify an attachment by its declared MIME type.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Reference to an uploaded binary object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    /// Public URI returned by the object store.
    pub url: String,
    /// Original file name.
    pub file_name: String,
    /// Size in bytes.
    pub file_size: u64,
    /// Declared MIME type.
    pub mime_type: String,
}

/// One chat entry within a conversation.
///
/// Content is plaintext in memory and ciphertext at rest whenever
/// `is_encrypted` is set.  Messages are never edited in content and never
/// deleted; the only permitted mutation is growing `read_by`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    /// Sender display name snapshot taken at send time.
    pub sender_name: String,
    /// Sender avatar snapshot taken at send time.
    pub sender_avatar_url: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    /// Participants who have read this message.  Defaults to empty when
    /// absent in a remote document.
    pub read_by: Vec<UserId>,
    /// Whether the content field is stored encrypted at rest.
    pub is_encrypted: bool,
    /// Server-assigned creation time.  Non-decreasing within a conversation
    /// under the ordering the message log exposes.
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}
